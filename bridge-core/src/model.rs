//! Model loading and management
//!
//! Loads Llama-family safetensors weights, their `config.json` and
//! `tokenizer.json` from local storage.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Files making up a model on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub weights: PathBuf,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Resolve the model files for `path`.
    ///
    /// `path` is either the weights file itself or a directory holding
    /// `model.safetensors`. The config and tokenizer sit next to the weights.
    pub fn locate(path: &Path) -> Result<Self> {
        let weights = if path.is_dir() {
            path.join(WEIGHTS_FILE)
        } else {
            path.to_path_buf()
        };
        if !weights.is_file() {
            bail!("no model weights at {}", weights.display());
        }

        let dir = weights.parent().unwrap_or_else(|| Path::new("."));
        let config = dir.join(CONFIG_FILE);
        let tokenizer = dir.join(TOKENIZER_FILE);
        for companion in [&config, &tokenizer] {
            if !companion.is_file() {
                bail!("missing {} next to model weights", companion.display());
            }
        }

        Ok(Self { weights, config, tokenizer })
    }
}

/// Loaded model ready for inference
pub struct LoadedModel {
    pub model: Llama,
    pub cache: Cache,
    pub tokenizer: Tokenizer,
    pub config: Config,
    pub device: Device,
    pub dtype: DType,
    pub eos_token_id: Option<LlamaEosToks>,
}

impl LoadedModel {
    /// Run one forward pass, returning logits for the last position
    pub fn forward(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor> {
        Ok(self.model.forward(input, index_pos, &mut self.cache)?)
    }

    /// Drop all cached keys/values so a new sequence can start at position 0
    pub fn clear_kv_cache(&mut self) -> Result<()> {
        self.cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(())
    }

    pub fn is_eos(&self, token: u32) -> bool {
        match &self.eos_token_id {
            Some(LlamaEosToks::Single(id)) => *id == token,
            Some(LlamaEosToks::Multiple(ids)) => ids.contains(&token),
            None => false,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.config.num_hidden_layers
    }
}

/// Load a model from local files
pub fn load_model(files: &ModelFiles, dtype: DType, use_flash_attn: bool, device: &Device) -> Result<LoadedModel> {
    info!("Loading model: {}", files.weights.display());

    info!("Loading tokenizer...");
    let tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

    info!("Loading model config...");
    let raw = std::fs::read(&files.config)
        .with_context(|| format!("reading {}", files.config.display()))?;
    let llama_config: LlamaConfig = serde_json::from_slice(&raw)?;
    let config = llama_config.into_config(use_flash_attn);

    let eos_token_id = config.eos_token_id.clone().or_else(|| {
        tokenizer.token_to_id("</s>").map(LlamaEosToks::Single)
    });

    info!("Loading model weights...");
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, device)? };
    let model = Llama::load(vb, &config).map_err(|e| anyhow!("Failed to load model: {}", e))?;
    let cache = Cache::new(true, dtype, &config, device)?;

    info!("Model loaded successfully!");
    info!("  - Vocab size: {}", config.vocab_size);
    info!("  - Hidden size: {}", config.hidden_size);
    info!("  - Layers: {}", config.num_hidden_layers);

    Ok(LoadedModel {
        model,
        cache,
        tokenizer,
        config,
        device: device.clone(),
        dtype,
        eos_token_id,
    })
}

/// Tokenize a prompt; a prompt with no tokens cannot be prefilled
pub fn encode_prompt(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>> {
    let tokens = tokenizer
        .encode(prompt, true)
        .map_err(|e| anyhow!("Tokenization error: {}", e))?
        .get_ids()
        .to_vec();
    if tokens.is_empty() {
        bail!("prompt produced no tokens");
    }
    Ok(tokens)
}

/// Token output stream for incremental decoding
pub struct TokenOutputStream {
    tokenizer: Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Decode error: {}", e))
    }

    /// Push a token, returning any text that became printable
    pub fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.chars().last().map_or(false, |c| c.is_alphanumeric()) {
            let (_, fresh) = text.split_at(prev_text.len());
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh.to_string()))
        } else {
            Ok(None)
        }
    }

    /// Flush whatever text is still pending
    pub fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(Some(text.split_at(prev_text.len()).1.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_all(&self) -> Result<String> {
        self.decode(&self.tokens)
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}

/// Create a logits processor for the session's sampling options
pub fn create_logits_processor(seed: u64, temperature: f64, top_k: usize) -> LogitsProcessor {
    let sampling = if temperature <= 0. {
        Sampling::ArgMax
    } else {
        Sampling::TopK { k: top_k, temperature }
    };
    LogitsProcessor::from_sampling(seed, sampling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_locate_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("gemma-2b.safetensors");
        fs::write(&weights, b"").unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"{}").unwrap();
        fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();

        let files = ModelFiles::locate(&weights).unwrap();
        assert_eq!(files.weights, weights);
        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
        assert_eq!(files.tokenizer, dir.path().join(TOKENIZER_FILE));
    }

    #[test]
    fn test_locate_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"{}").unwrap();
        fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();

        let files = ModelFiles::locate(dir.path()).unwrap();
        assert_eq!(files.weights, dir.path().join(WEIGHTS_FILE));
    }

    #[test]
    fn test_locate_missing_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join(WEIGHTS_FILE);
        fs::write(&weights, b"").unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"{}").unwrap();

        let err = ModelFiles::locate(&weights).unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));
    }

    #[test]
    fn test_locate_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::locate(dir.path()).is_err());
    }

    const WORD_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": { "[UNK]": 0, "hello": 1, "world": 2 },
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn test_encode_prompt() {
        let tokenizer = Tokenizer::from_bytes(WORD_TOKENIZER).unwrap();
        assert_eq!(encode_prompt(&tokenizer, "hello world").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_encode_empty_prompt() {
        let tokenizer = Tokenizer::from_bytes(WORD_TOKENIZER).unwrap();
        let err = encode_prompt(&tokenizer, "").unwrap_err();
        assert!(err.to_string().contains("no tokens"));
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let logits = Tensor::new(&[0.1f32, 2.5, 0.3, 1.0], &Device::Cpu).unwrap();
        let mut processor = create_logits_processor(42, 0.0, 40);
        assert_eq!(processor.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn test_top_one_is_greedy() {
        let logits = Tensor::new(&[0.1f32, 0.2, 3.0, 1.0], &Device::Cpu).unwrap();
        let mut processor = create_logits_processor(7, 0.7, 1);
        for _ in 0..5 {
            assert_eq!(processor.sample(&logits).unwrap(), 2);
        }
    }
}

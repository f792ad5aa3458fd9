//! Inference engine seam and the bundled candle backend
//!
//! The bridge only talks to an engine through [`LlmEngine`] and builds one
//! through [`EngineFactory`]. [`CandleEngine`] is the backend shipped with
//! the crate; tests and other hosts can plug in their own.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{create_logits_processor, encode_prompt, load_model, LoadedModel, ModelFiles, TokenOutputStream};
use crate::options::InferenceOptions;

/// Callback receiving each streamed fragment and whether it is the last
pub type ResultListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// A live inference session
pub trait LlmEngine: Send + Sync {
    /// Blocking single-shot generation. `None` means the engine produced nothing.
    fn generate_response(&self, prompt: &str) -> Result<Option<String>>;

    /// Streaming generation; fragments go to the listener the engine was built with.
    fn generate_response_async(&self, prompt: &str) -> Result<()>;

    /// Snapshot of the loaded model, for engines that can describe it
    fn stats(&self) -> Option<EngineStats> {
        None
    }
}

/// Builds engines from options
pub trait EngineFactory: Send + Sync {
    fn create(&self, options: &InferenceOptions, listener: ResultListener) -> Result<Arc<dyn LlmEngine>>;
}

/// Configuration for the candle backend
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data type for model weights
    pub dtype: DType,
    /// Whether to use flash attention
    pub use_flash_attn: bool,
    /// Repeat penalty (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Context size for repeat penalty
    pub repeat_last_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            use_flash_attn: false,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub device: String,
    pub model_path: PathBuf,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dtype: String,
    pub max_tokens: usize,
}

/// Inference engine that performs actual model execution
pub struct CandleEngine {
    config: EngineConfig,
    options: InferenceOptions,
    device: Device,
    model: Mutex<LoadedModel>,
    listener: ResultListener,
}

impl CandleEngine {
    pub fn new(
        config: EngineConfig,
        options: InferenceOptions,
        device: Device,
        listener: ResultListener,
    ) -> Result<Self> {
        info!("Initializing inference engine...");
        options.validate()?;
        let files = ModelFiles::locate(&options.model_path)?;
        let model = load_model(&files, config.dtype, config.use_flash_attn, &device)?;

        Ok(Self {
            config,
            options,
            device,
            model: Mutex::new(model),
            listener,
        })
    }

    fn penalize(&self, logits: Tensor, tokens: &[u32]) -> Result<Tensor> {
        if self.config.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start_at = tokens.len().saturating_sub(self.config.repeat_last_n);
        Ok(candle_transformers::utils::apply_repeat_penalty(
            &logits,
            self.config.repeat_penalty,
            &tokens[start_at..],
        )?)
    }

    /// Run prefill and decode, handing each new token to `on_token`.
    ///
    /// The model lock is held for the whole generation.
    fn run<F>(&self, prompt: &str, mut on_token: F) -> Result<TokenOutputStream>
    where
        F: FnMut(&mut TokenOutputStream, u32) -> Result<()>,
    {
        let mut logits_processor = create_logits_processor(
            self.options.random_seed,
            self.options.temperature as f64,
            self.options.top_k,
        );

        let mut model = self.model.lock();
        let mut tokens = encode_prompt(&model.tokenizer, prompt)?;
        let mut stream = TokenOutputStream::new(model.tokenizer.clone());
        model.clear_kv_cache()?;

        let start_time = std::time::Instant::now();
        let mut index_pos = 0;

        for i in 0..self.options.max_tokens {
            let ctxt = if i == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, index_pos)?.squeeze(0)?;
            let logits = self.penalize(logits, &tokens)?;
            index_pos += ctxt.len();

            let next_token = logits_processor.sample(&logits)?;
            if model.is_eos(next_token) {
                break;
            }

            tokens.push(next_token);
            on_token(&mut stream, next_token)?;
        }

        let generated = stream.tokens().len();
        debug!(
            "Generated {} tokens at {:.2} tok/s",
            generated,
            generated as f64 / start_time.elapsed().as_secs_f64()
        );
        Ok(stream)
    }

    fn describe(&self) -> EngineStats {
        let model = self.model.lock();
        EngineStats {
            device: format!("{:?}", self.device),
            model_path: self.options.model_path.clone(),
            vocab_size: model.vocab_size(),
            hidden_size: model.hidden_size(),
            num_layers: model.num_layers(),
            dtype: format!("{:?}", model.dtype),
            max_tokens: self.options.max_tokens,
        }
    }
}

impl LlmEngine for CandleEngine {
    fn generate_response(&self, prompt: &str) -> Result<Option<String>> {
        let stream = self.run(prompt, |stream, token| {
            stream.next_token(token)?;
            Ok(())
        })?;
        let text = stream.decode_all()?;
        Ok((!text.is_empty()).then_some(text))
    }

    fn generate_response_async(&self, prompt: &str) -> Result<()> {
        let listener = self.listener.clone();
        let stream = self.run(prompt, |stream, token| {
            if let Some(text) = stream.next_token(token)? {
                listener(&text, false);
            }
            Ok(())
        })?;
        let rest = stream.decode_rest()?.unwrap_or_default();
        listener(&rest, true);
        Ok(())
    }

    fn stats(&self) -> Option<EngineStats> {
        Some(self.describe())
    }
}

/// Builds [`CandleEngine`]s on a fixed device
#[derive(Debug, Clone)]
pub struct CandleEngineFactory {
    config: EngineConfig,
    device: Device,
}

impl CandleEngineFactory {
    pub fn new(config: EngineConfig, device: Device) -> Self {
        Self { config, device }
    }

    pub fn cpu() -> Self {
        Self::new(EngineConfig::default(), Device::Cpu)
    }

    /// Create with Metal backend (macOS)
    #[cfg(feature = "metal")]
    pub fn metal() -> Result<Self> {
        Ok(Self::new(EngineConfig::default(), Device::new_metal(0)?))
    }

    /// Create with CUDA backend
    #[cfg(feature = "cuda")]
    pub fn cuda(device_id: usize) -> Result<Self> {
        let config = EngineConfig {
            dtype: DType::F16,
            ..Default::default()
        };
        Ok(Self::new(config, Device::new_cuda(device_id)?))
    }
}

impl EngineFactory for CandleEngineFactory {
    fn create(&self, options: &InferenceOptions, listener: ResultListener) -> Result<Arc<dyn LlmEngine>> {
        let engine = CandleEngine::new(self.config.clone(), options.clone(), self.device.clone(), listener)?;
        Ok(Arc::new(engine))
    }
}

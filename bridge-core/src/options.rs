//! Inference options accepted by `initialize`
//!
//! Every optional call argument has an explicit default here. Options are
//! validated once, before the engine is constructed.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_TOKENS: usize = 50;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_RANDOM_SEED: u64 = 42;
pub const DEFAULT_TOP_K: usize = 40;

/// Options used to construct an inference session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Path to the model weights on local storage
    pub model_path: PathBuf,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Sampling temperature (0 = greedy)
    pub temperature: f32,
    /// Seed for the sampler
    pub random_seed: u64,
    /// Number of candidates kept for top-k sampling
    pub top_k: usize,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            random_seed: DEFAULT_RANDOM_SEED,
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl InferenceOptions {
    pub fn builder() -> InferenceOptionsBuilder {
        InferenceOptionsBuilder::default()
    }

    pub fn with_model(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Reject option values no engine can run with
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            bail!("model path is empty");
        }
        if self.max_tokens == 0 {
            bail!("max_tokens must be at least 1");
        }
        if self.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            bail!("temperature must be a finite, non-negative number (got {})", self.temperature);
        }
        Ok(())
    }
}

/// Builder mirroring the engine's option surface
#[derive(Debug, Clone, Default)]
pub struct InferenceOptionsBuilder {
    options: InferenceOptions,
}

impl InferenceOptionsBuilder {
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.model_path = path.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.options.random_seed = seed;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.options.top_k = top_k;
        self
    }

    /// Finish the builder, validating the collected options
    pub fn build(self) -> Result<InferenceOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

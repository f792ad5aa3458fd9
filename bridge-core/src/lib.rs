//! Bridge Core - method-call bridge for on-device LLM inference
//!
//! This crate implements:
//! - Inference options with defaults and validation
//! - The engine seam plus a candle-backed Llama engine loaded from local files
//! - A latest-value channel for streamed partial results
//! - The bridge that maps `initialize` / `generateResponse` /
//!   `generateResponseAsync` calls to engine calls and error codes

pub mod options;
pub mod model;
pub mod engine;
pub mod partial;
pub mod error;
pub mod bridge;

pub use options::{InferenceOptions, InferenceOptionsBuilder};
pub use model::{encode_prompt, load_model, LoadedModel, ModelFiles, TokenOutputStream};
pub use engine::{CandleEngine, CandleEngineFactory, EngineConfig, EngineFactory, EngineStats, LlmEngine, ResultListener};
pub use partial::{spawn_partial_result_logger, PartialResult, PartialResultSender, PartialResults};
pub use error::{BridgeError, ErrorCode};
pub use bridge::{Bridge, Method, MethodCall, MethodResponse, ASYNC_STARTED_MESSAGE, INITIALIZED_MESSAGE};

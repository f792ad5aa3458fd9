//! Method-call bridge
//!
//! Turns named method calls with loosely typed arguments into engine calls,
//! and engine outcomes into success / error / not-implemented responses.
//! Nothing an engine does, including panicking, escapes past [`Bridge::handle`].

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineFactory, EngineStats, LlmEngine, ResultListener};
use crate::error::{panic_message, BridgeError, ErrorCode};
use crate::options::InferenceOptions;
use crate::partial::{PartialResultSender, PartialResults};

pub const INITIALIZED_MESSAGE: &str = "Model initialized successfully";
pub const ASYNC_STARTED_MESSAGE: &str = "Async response generation started";

/// Operations the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Initialize,
    GenerateResponse,
    GenerateResponseAsync,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Method::Initialize),
            "generateResponse" => Some(Method::GenerateResponse),
            "generateResponseAsync" => Some(Method::GenerateResponseAsync),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::GenerateResponse => "generateResponse",
            Method::GenerateResponseAsync => "generateResponseAsync",
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Method::Initialize => ErrorCode::Init,
            Method::GenerateResponse => ErrorCode::Gen,
            Method::GenerateResponseAsync => ErrorCode::AsyncGen,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An incoming call: method name plus a JSON object of arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Outcome of a call as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MethodResponse {
    Success { result: Value },
    Error {
        code: String,
        message: String,
        details: Option<Value>,
    },
    NotImplemented,
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, MethodResponse::Success { .. })
    }
}

impl From<Result<String, BridgeError>> for MethodResponse {
    fn from(outcome: Result<String, BridgeError>) -> Self {
        match outcome {
            Ok(text) => MethodResponse::Success {
                result: Value::String(text),
            },
            Err(err) => MethodResponse::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                details: None,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeArgs {
    model_path: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f64>,
    random_seed: Option<i64>,
    top_k: Option<usize>,
}

impl InitializeArgs {
    fn into_options(self) -> InferenceOptions {
        let defaults = InferenceOptions::default();
        InferenceOptions {
            model_path: self.model_path.unwrap_or_default().into(),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.map(|t| t as f32).unwrap_or(defaults.temperature),
            // Callers send a signed int; the sampler only needs its bits
            random_seed: self.random_seed.map(|seed| seed as u64).unwrap_or(defaults.random_seed),
            top_k: self.top_k.unwrap_or(defaults.top_k),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PromptArgs {
    prompt: Option<String>,
}

fn parse_args<T: DeserializeOwned + Default>(method: Method, arguments: Value) -> Result<T, BridgeError> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments).map_err(|e| BridgeError::InvalidArguments {
        method,
        reason: e.to_string(),
    })
}

/// Owns the inference session and answers method calls against it
pub struct Bridge {
    factory: Arc<dyn EngineFactory>,
    session: RwLock<Option<Arc<dyn LlmEngine>>>,
    partial_results: PartialResultSender,
    runtime: Option<Handle>,
}

impl Bridge {
    /// Create a bridge; picks up the ambient tokio runtime if there is one
    pub fn new<F: EngineFactory + 'static>(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            session: RwLock::new(None),
            partial_results: PartialResultSender::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Run streaming generation on `handle` instead of the ambient runtime
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.session.read().is_some()
    }

    /// Subscribe to streamed partial results from `generateResponseAsync`
    pub fn subscribe_partial_results(&self) -> PartialResults {
        self.partial_results.subscribe()
    }

    fn session(&self) -> Option<Arc<dyn LlmEngine>> {
        self.session.read().clone()
    }

    /// Statistics of the current session, if the engine reports any
    pub fn engine_stats(&self) -> Option<EngineStats> {
        self.session().and_then(|engine| engine.stats())
    }

    /// Dispatch a call by name. Unknown names get `NotImplemented`.
    pub fn handle(&self, call: MethodCall) -> MethodResponse {
        let Some(method) = Method::from_name(&call.method) else {
            debug!("Unknown method: {}", call.method);
            return MethodResponse::NotImplemented;
        };

        let outcome = self.dispatch(method, call.arguments);
        if let Err(err) = &outcome {
            warn!("{} failed: {}", method, err);
        }
        outcome.into()
    }

    fn dispatch(&self, method: Method, arguments: Value) -> Result<String, BridgeError> {
        match method {
            Method::Initialize => {
                let args: InitializeArgs = parse_args(method, arguments)?;
                self.initialize(args.into_options())
            }
            Method::GenerateResponse => {
                let args: PromptArgs = parse_args(method, arguments)?;
                self.generate_response(&args.prompt.unwrap_or_default())
            }
            Method::GenerateResponseAsync => {
                let args: PromptArgs = parse_args(method, arguments)?;
                self.generate_response_async(&args.prompt.unwrap_or_default())
            }
        }
    }

    /// Build a new session, replacing any existing one on success
    pub fn initialize(&self, options: InferenceOptions) -> Result<String, BridgeError> {
        if !options.model_path.exists() {
            return Err(BridgeError::ModelNotFound {
                path: options.model_path,
            });
        }
        options
            .validate()
            .map_err(|e| BridgeError::InitFailed(format!("{:#}", e)))?;

        let partial_results = self.partial_results.clone();
        let listener: ResultListener = Arc::new(move |text: &str, done: bool| {
            partial_results.emit(text, done);
        });

        let engine = catch_unwind(AssertUnwindSafe(|| self.factory.create(&options, listener)))
            .map_err(|payload| BridgeError::InitFailed(panic_message(payload)))?
            .map_err(|e| BridgeError::InitFailed(format!("{:#}", e)))?;

        let replaced = self.session.write().replace(engine).is_some();
        info!(
            "Inference session ready: model={} max_tokens={} temperature={} seed={} top_k={} replaced={}",
            options.model_path.display(),
            options.max_tokens,
            options.temperature,
            options.random_seed,
            options.top_k,
            replaced
        );
        Ok(INITIALIZED_MESSAGE.to_string())
    }

    /// Blocking generation on the caller's thread
    pub fn generate_response(&self, prompt: &str) -> Result<String, BridgeError> {
        let Some(engine) = self.session() else {
            warn!("generateResponse called before initialize");
            return Err(BridgeError::NoResult);
        };

        match catch_unwind(AssertUnwindSafe(|| engine.generate_response(prompt))) {
            Ok(Ok(Some(text))) if !text.is_empty() => Ok(text),
            Ok(Ok(_)) => Err(BridgeError::NoResult),
            Ok(Err(e)) => Err(BridgeError::Generation(format!("{:#}", e))),
            Err(payload) => Err(BridgeError::Generation(panic_message(payload))),
        }
    }

    /// Start streaming generation on a blocking worker and return immediately.
    ///
    /// Failures after launch are logged only; fragments arrive through
    /// [`Bridge::subscribe_partial_results`].
    pub fn generate_response_async(&self, prompt: &str) -> Result<String, BridgeError> {
        let engine = self
            .session()
            .ok_or_else(|| BridgeError::AsyncLaunch("inference session not initialized".to_string()))?;
        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| BridgeError::AsyncLaunch("no async runtime available".to_string()))?;

        let prompt = prompt.to_string();
        runtime.spawn_blocking(move || {
            match catch_unwind(AssertUnwindSafe(|| engine.generate_response_async(&prompt))) {
                Ok(Ok(())) => debug!("Async generation finished"),
                Ok(Err(e)) => error!("Async generation failed: {:#}", e),
                Err(payload) => error!("Async generation panicked: {}", panic_message(payload)),
            }
        });

        Ok(ASYNC_STARTED_MESSAGE.to_string())
    }
}

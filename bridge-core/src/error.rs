//! Errors reported across the bridge boundary

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use crate::bridge::Method;

/// Error code sent back to the caller alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Init,
    Gen,
    AsyncGen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Init => "INIT_ERROR",
            ErrorCode::Gen => "GEN_ERROR",
            ErrorCode::AsyncGen => "ASYNC_GEN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Model not found at path: {}", .path.display())]
    ModelNotFound { path: PathBuf },
    #[error("Failed to initialize: {0}")]
    InitFailed(String),
    #[error("Failed to generate response")]
    NoResult,
    #[error("Error generating response: {0}")]
    Generation(String),
    #[error("Error starting async generation: {0}")]
    AsyncLaunch(String),
    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: Method, reason: String },
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::ModelNotFound { .. } | BridgeError::InitFailed(_) => ErrorCode::Init,
            BridgeError::NoResult | BridgeError::Generation(_) => ErrorCode::Gen,
            BridgeError::AsyncLaunch(_) => ErrorCode::AsyncGen,
            BridgeError::InvalidArguments { method, .. } => method.error_code(),
        }
    }
}

/// Message text carried by a panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(BridgeError::ModelNotFound { path: "/x".into() }.code().as_str(), "INIT_ERROR");
        assert_eq!(BridgeError::InitFailed("bad".into()).code().as_str(), "INIT_ERROR");
        assert_eq!(BridgeError::NoResult.code().as_str(), "GEN_ERROR");
        assert_eq!(BridgeError::Generation("oops".into()).code().as_str(), "GEN_ERROR");
        assert_eq!(BridgeError::AsyncLaunch("no".into()).code().as_str(), "ASYNC_GEN_ERROR");
        let invalid = BridgeError::InvalidArguments {
            method: Method::GenerateResponseAsync,
            reason: "prompt must be a string".into(),
        };
        assert_eq!(invalid.code(), ErrorCode::AsyncGen);
    }

    #[test]
    fn test_messages() {
        let err = BridgeError::ModelNotFound { path: "/models/missing.bin".into() };
        assert_eq!(err.to_string(), "Model not found at path: /models/missing.bin");
        assert_eq!(BridgeError::NoResult.to_string(), "Failed to generate response");
        assert_eq!(
            BridgeError::Generation("boom".into()).to_string(),
            "Error generating response: boom"
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(3u8)), "engine panicked");
    }
}

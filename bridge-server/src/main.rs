//! Bridge Server - HTTP host delivering method calls to the inference bridge
//!
//! `POST /inference/{method}` with a JSON object of arguments; the reply is the
//! bridge's success / error / notImplemented envelope.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bridge_core::{
    spawn_partial_result_logger, Bridge, CandleEngineFactory, EngineStats, InferenceOptions, MethodCall, MethodResponse,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    bridge: Arc<Bridge>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    initialized: bool,
    engine: Option<EngineStats>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

/// An empty body means "no arguments"
fn parse_arguments(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        initialized: state.bridge.is_initialized(),
        engine: state.bridge.engine_stats(),
    })
}

async fn invoke(
    State(state): State<AppState>,
    Path(method): Path<String>,
    body: Bytes,
) -> Result<Json<MethodResponse>, ApiError> {
    let arguments = parse_arguments(&body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    info!("Method call: {}", method);

    // generateResponse blocks until the engine is done
    let bridge = state.bridge.clone();
    let response = tokio::task::spawn_blocking(move || bridge.handle(MethodCall::new(method, arguments)))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(response))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/inference/:method", post(invoke))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bridge = Arc::new(Bridge::new(CandleEngineFactory::cpu()));

    // Lives as long as the server; partial results only go to the log
    spawn_partial_result_logger(bridge.subscribe_partial_results());

    if let Ok(model_path) = std::env::var("BRIDGE_MODEL_PATH") {
        info!("Initializing model from BRIDGE_MODEL_PATH: {}", model_path);
        let startup = bridge.clone();
        let outcome = tokio::task::spawn_blocking(move || startup.initialize(InferenceOptions::with_model(model_path))).await?;
        match outcome {
            Ok(message) => info!("{}", message),
            Err(e) => warn!("Startup initialization failed ({}): {}", e.code(), e),
        }
    }

    let app = router(AppState { bridge });

    let port = std::env::var("BRIDGE_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::Body;
    use axum::http::Request;
    use bridge_core::{EngineFactory, LlmEngine, ResultListener};
    use serde_json::json;
    use tower::ServiceExt;

    struct EchoEngine;

    impl LlmEngine for EchoEngine {
        fn generate_response(&self, prompt: &str) -> Result<Option<String>> {
            Ok(Some(format!("echo: {}", prompt)))
        }

        fn generate_response_async(&self, _prompt: &str) -> Result<()> {
            Ok(())
        }
    }

    struct EchoFactory;

    impl EngineFactory for EchoFactory {
        fn create(&self, _options: &InferenceOptions, _listener: ResultListener) -> Result<Arc<dyn LlmEngine>> {
            Ok(Arc::new(EchoEngine))
        }
    }

    fn test_state() -> AppState {
        AppState {
            bridge: Arc::new(Bridge::new(EchoFactory)),
        }
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn post(method: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/inference/{}", method))
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    fn health() -> Request<Body> {
        Request::builder().uri("/health").body(Body::empty()).unwrap()
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(b"").unwrap(), Value::Null);
        assert_eq!(parse_arguments(b"  \n").unwrap(), Value::Null);
        assert_eq!(parse_arguments(br#"{"prompt":"hi"}"#).unwrap(), json!({ "prompt": "hi" }));
        assert!(parse_arguments(b"{not json").is_err());
    }

    #[tokio::test]
    async fn test_initialize_and_generate_over_http() {
        let state = test_state();
        let model = tempfile::NamedTempFile::new().unwrap();

        let (status, body) = send(&state, health()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "initialized": false, "engine": null }));

        let args = json!({ "modelPath": model.path().to_str().unwrap() }).to_string();
        let (status, body) = send(&state, post("initialize", args)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "success", "result": "Model initialized successfully" }));

        let (_, body) = send(&state, health()).await;
        assert_eq!(body["initialized"], json!(true));

        let args = json!({ "prompt": "hi" }).to_string();
        let (status, body) = send(&state, post("generateResponse", args)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "success", "result": "echo: hi" }));

        let (_, body) = send(&state, post("generateResponse", Body::empty())).await;
        assert_eq!(body, json!({ "status": "success", "result": "echo: " }));

        let args = json!({ "prompt": "stream" }).to_string();
        let (_, body) = send(&state, post("generateResponseAsync", args)).await;
        assert_eq!(body, json!({ "status": "success", "result": "Async response generation started" }));
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let state = test_state();

        let args = json!({ "modelPath": "/no/such/model.bin" }).to_string();
        let (status, body) = send(&state, post("initialize", args)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "status": "error",
                "code": "INIT_ERROR",
                "message": "Model not found at path: /no/such/model.bin",
                "details": null
            })
        );

        let args = json!({ "prompt": "hi" }).to_string();
        let (_, body) = send(&state, post("generateResponse", args)).await;
        assert_eq!(body["code"], json!("GEN_ERROR"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let state = test_state();
        let (status, body) = send(&state, post("dispose", "{}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "notImplemented" }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let state = test_state();
        let (status, body) = send(&state, post("generateResponse", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }
}

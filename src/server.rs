use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::pipeline::{ConversationContext, PipelineOutput, SalesPipeline, build_pipeline};
use crate::telemetry::{EventFields, TelemetryEvent, TelemetrySink};

pub const SERVER_AUTH_TOKEN_ENV: &str = "SALES_SERVER_AUTH_TOKEN";

#[derive(Clone)]
pub struct ChatServerState {
    pub cfg: RuntimeConfig,
    pub pipeline: SalesPipeline,
    pub telemetry: TelemetrySink,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub model: String,
    pub tool_transport: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub initial_context_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatEndpointResponse {
    pub response: PipelineOutput,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(
    state: &ChatServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ChatServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        model: state.cfg.llm_model.clone(),
        tool_transport: format!("{:?}", state.cfg.tool_transport).to_ascii_lowercase(),
    })
}

pub async fn handle_chat(
    State(state): State<Arc<ChatServerState>>,
    headers: axum::http::HeaderMap,
    Query(params): Query<ChatQuery>,
) -> ApiResult<ChatEndpointResponse> {
    check_server_auth(&state, &headers)?;
    let started_at = Instant::now();

    let query = params.query.unwrap_or_default().trim().to_string();
    if query.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "query cannot be empty for /chat",
        ));
    }
    if query.chars().count() > state.cfg.max_query_chars {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "query cannot be longer than {} characters",
                state.cfg.max_query_chars
            ),
        ));
    }

    let context = ConversationContext::from_json(
        params.initial_context_data.as_deref().unwrap_or_default(),
    )
    .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let output = state.pipeline.run(&query, &context).await;

    state.telemetry.emit(
        TelemetryEvent::ChatCompleted,
        EventFields::conversation(&context.conversation_id)
            .elapsed(started_at.elapsed())
            .detail("total_tokens", output.token_usage.total_tokens),
    );

    Ok(Json(ChatEndpointResponse { response: output }))
}

pub fn build_server_router(state: Arc<ChatServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/chat", get(handle_chat))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let pipeline = build_pipeline(&cfg, telemetry).await?;

    let state = Arc::new(ChatServerState {
        cfg: cfg.clone(),
        pipeline,
        telemetry: telemetry.clone(),
        auth_token: std::env::var(SERVER_AUTH_TOKEN_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    });

    telemetry.emit(
        TelemetryEvent::ChatServerStarted,
        EventFields::default()
            .detail("host", host.as_str())
            .detail("port", port)
            .detail("profile", cfg.profile.as_str())
            .detail("model", cfg.llm_model.as_str())
            .detail(
                "tool_transport",
                format!("{:?}", cfg.tool_transport).to_ascii_lowercase(),
            ),
    );

    println!(
        "Chat server listening on http://{} (health: /healthz, chat: /chat?query=...)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}

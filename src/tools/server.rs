use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router as AxumRouter};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::{StreamableHttpServerConfig, StreamableHttpService};
use rmcp::{ErrorData, RoleServer, ServerHandler};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;
use crate::server::shutdown_signal;
use crate::telemetry::{EventFields, TelemetryEvent, TelemetrySink};

use super::{LocalToolBackend, ToolBackend, ToolOutcome, build_local_backend, tool_definitions};

/// Path the MCP streamable-HTTP endpoint is mounted on.
pub const MCP_PATH: &str = "/mcp";

const SERVER_INSTRUCTIONS: &str = "Sales tools: look up stock and price with get_product_info, \
    persist orders with create_order and read them back with get_order. Every result is a JSON \
    text block with a `status` of `success` or `error`.";

/// MCP server exposing the local order and catalog tools.
#[derive(Clone)]
pub struct SalesToolService {
    backend: Arc<LocalToolBackend>,
    telemetry: TelemetrySink,
}

impl SalesToolService {
    pub fn new(backend: Arc<LocalToolBackend>, telemetry: TelemetrySink) -> Self {
        Self { backend, telemetry }
    }

    pub fn backend(&self) -> &LocalToolBackend {
        &self.backend
    }

    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolOutcome {
        tracing::info!(tool = name, "tool call received");
        let outcome = self.backend.call(name, arguments).await;

        let fields = EventFields::default().tool(name, "mcp");
        match &outcome {
            ToolOutcome::Success { .. } => {
                tracing::info!(tool = name, "tool call succeeded");
                self.telemetry.emit(TelemetryEvent::ToolServed, fields);
            }
            ToolOutcome::Error(err) => {
                tracing::warn!(tool = name, kind = err.kind.label(), error = %err.message, "tool call failed");
                self.telemetry.emit(
                    TelemetryEvent::ToolServed,
                    fields.failure(err.kind.label(), err.message.clone()),
                );
            }
        }
        outcome
    }
}

pub fn mcp_tools() -> Vec<Tool> {
    tool_definitions()
        .into_iter()
        .map(|definition| {
            let schema = match definition.parameters {
                Value::Object(schema) => schema,
                _ => Map::new(),
            };
            Tool::new(definition.name, definition.description, Arc::new(schema))
        })
        .collect()
}

/// Tool results travel as one text block holding the serialized `ToolOutcome`.
pub fn outcome_to_call_result(outcome: &ToolOutcome) -> CallToolResult {
    let content = vec![Content::text(outcome.to_model_text())];
    if outcome.is_success() {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    }
}

impl ServerHandler for SalesToolService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::default()
            },
            instructions: Some(SERVER_INSTRUCTIONS.to_string()),
            ..ServerInfo::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(mcp_tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let arguments = request
            .arguments
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let outcome = self.dispatch(&request.name, arguments).await;
        Ok(outcome_to_call_result(&outcome))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        mcp_tools().into_iter().find(|tool| tool.name == name)
    }
}

#[derive(Debug, Serialize)]
pub struct ToolServerHealthResponse {
    pub status: &'static str,
    pub catalog_backend: &'static str,
    pub orders_dir: String,
    pub mcp_path: &'static str,
}

pub async fn handle_tool_health(
    State(service): State<Arc<SalesToolService>>,
) -> Json<ToolServerHealthResponse> {
    Json(ToolServerHealthResponse {
        status: "ok",
        catalog_backend: service.backend().catalog().backend_name(),
        orders_dir: service.backend().orders().dir().display().to_string(),
        mcp_path: MCP_PATH,
    })
}

pub fn build_tool_router(
    service: SalesToolService,
    config: StreamableHttpServerConfig,
) -> AxumRouter {
    let mcp: StreamableHttpService<SalesToolService, LocalSessionManager> = {
        let service = service.clone();
        StreamableHttpService::new(
            move || Ok(service.clone()),
            Arc::new(LocalSessionManager::default()),
            config,
        )
    };

    AxumRouter::new()
        .route("/healthz", get(handle_tool_health))
        .with_state(Arc::new(service))
        .nest_service(MCP_PATH, mcp)
}

pub async fn run_tool_server(
    cfg: &RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid tool server bind address '{}:{}'", host, port))?;
    let backend = Arc::new(build_local_backend(cfg).await?);
    let catalog_backend = backend.catalog().backend_name();
    let service = SalesToolService::new(backend, telemetry.clone());

    telemetry.emit(
        TelemetryEvent::ToolServerStarted,
        EventFields::default()
            .detail("host", host.as_str())
            .detail("port", port)
            .detail("catalog_backend", catalog_backend)
            .detail("orders_dir", cfg.orders_dir.as_str()),
    );
    tracing::info!(%addr, catalog_backend, orders_dir = %cfg.orders_dir, "tool server starting");
    println!("Tool server listening on http://{addr} (MCP: {MCP_PATH}, health: /healthz)");

    let config = StreamableHttpServerConfig::default();
    let sessions = config.cancellation_token.clone();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind tool server listener")?;
    axum::serve(listener, build_tool_router(service, config))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            sessions.cancel();
        })
        .await
        .context("tool server runtime failed")
}

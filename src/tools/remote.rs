use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Tool};
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{Peer, RoleClient, ServiceExt};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ToolError;

use super::server::MCP_PATH;
use super::{ToolBackend, ToolDefinition, ToolOutcome};

type McpSession = RunningService<RoleClient, ()>;

/// MCP client for a tool server started with `sales-crew tools serve`.
///
/// One session is opened lazily and reused; a transport failure drops it so the
/// next call reconnects.
#[derive(Clone)]
pub struct RemoteToolClient {
    base_url: String,
    endpoint: String,
    timeout: Duration,
    session: Arc<Mutex<Option<McpSession>>>,
}

impl RemoteToolClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "tool server url '{base_url}' must start with http:// or https://"
            ));
        }
        let endpoint = if base_url.ends_with(MCP_PATH) {
            base_url.clone()
        } else {
            format!("{base_url}{MCP_PATH}")
        };
        Ok(Self {
            base_url,
            endpoint,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            session: Arc::new(Mutex::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn with_timeout<T, E>(&self, what: &str, fut: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{what} timed out after {}s at {}",
                    self.timeout.as_secs(),
                    self.endpoint
                )
            })?
            .with_context(|| format!("{what} failed at {}", self.endpoint))
    }

    async fn peer(&self) -> Result<Peer<RoleClient>> {
        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref()
            && !active.is_transport_closed()
        {
            return Ok(active.peer().clone());
        }

        let transport = StreamableHttpClientTransport::from_uri(self.endpoint.as_str());
        let connected = self
            .with_timeout("MCP session setup", ().serve(transport))
            .await?;
        tracing::debug!(endpoint = %self.endpoint, "MCP session opened");
        let peer = connected.peer().clone();
        *session = Some(connected);
        Ok(peer)
    }

    async fn reset(&self) {
        self.session.lock().await.take();
    }

    pub async fn fetch_definitions(&self) -> Result<Vec<ToolDefinition>> {
        let peer = self.peer().await?;
        let tools = match self.with_timeout("tool listing", peer.list_all_tools()).await {
            Ok(tools) => tools,
            Err(err) => {
                self.reset().await;
                return Err(err);
            }
        };
        Ok(tools.into_iter().map(definition_from_tool).collect())
    }

    /// Opens a session and lists tools; returns how many the server exposes.
    pub async fn health(&self) -> Result<usize> {
        let definitions = self.fetch_definitions().await?;
        if definitions.is_empty() {
            return Err(anyhow::anyhow!(
                "tool server at {} exposes no tools",
                self.endpoint
            ));
        }
        Ok(definitions.len())
    }
}

pub fn definition_from_tool(tool: Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.into_owned(),
        description: tool
            .description
            .map(|description| description.into_owned())
            .unwrap_or_default(),
        parameters: Value::Object(tool.input_schema.as_ref().clone()),
    }
}

/// Reads a `ToolOutcome` back out of the first text block of a tool result.
/// Results from servers that do not speak that shape are wrapped as-is.
pub fn outcome_from_call_result(name: &str, result: &CallToolResult) -> ToolOutcome {
    let text = result
        .content
        .iter()
        .find_map(|content| content.as_text().map(|text| text.text.as_str()));

    if let Some(outcome) = text.and_then(|text| serde_json::from_str::<ToolOutcome>(text).ok()) {
        return outcome;
    }

    let body = text
        .map(|text| serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::from(text)))
        .or_else(|| result.structured_content.clone())
        .unwrap_or(Value::Null);

    if result.is_error.unwrap_or(false) {
        ToolOutcome::Error(ToolError::unavailable(format!(
            "tool server reported an error for '{name}': {body}"
        )))
    } else {
        ToolOutcome::success(body)
    }
}

#[async_trait]
impl ToolBackend for RemoteToolClient {
    fn transport_name(&self) -> &'static str {
        "mcp"
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolOutcome {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return ToolOutcome::Error(ToolError::invalid_input(format!(
                    "arguments for '{name}' must be a JSON object, received {other}"
                )));
            }
        };

        let peer = match self.peer().await {
            Ok(peer) => peer,
            Err(err) => {
                tracing::error!(tool = name, endpoint = %self.endpoint, error = %err, "tool server connection failed");
                return ToolOutcome::Error(ToolError::unavailable(format!(
                    "failed to reach tool server for '{name}': {err:#}"
                )));
            }
        };

        let request = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        match self.with_timeout("tool call", peer.call_tool(request)).await {
            Ok(result) => outcome_from_call_result(name, &result),
            Err(err) => {
                tracing::error!(tool = name, endpoint = %self.endpoint, error = %err, "tool call transport failed");
                self.reset().await;
                ToolOutcome::Error(ToolError::unavailable(format!(
                    "tool server call for '{name}' failed: {err:#}"
                )))
            }
        }
    }
}

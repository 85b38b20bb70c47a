pub mod catalog;
pub mod orders;
pub mod remote;
pub mod server;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};

use crate::cli::ToolTransport;
use crate::config::RuntimeConfig;
use crate::error::{ToolError, ToolErrorKind};

use self::catalog::{ProductQuery, ProductStore, build_product_store};
use self::orders::OrderStore;
use self::remote::RemoteToolClient;

pub const CREATE_ORDER_TOOL_NAME: &str = "create_order";
pub const GET_ORDER_TOOL_NAME: &str = "get_order";
pub const GET_PRODUCT_INFO_TOOL_NAME: &str = "get_product_info";

/// Result of one tool invocation, as seen by agents and remote callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { data: Value },
    Error(ToolError),
}

impl ToolOutcome {
    pub fn success(data: Value) -> Self {
        ToolOutcome::Success { data }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match self {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Error(err) => Some(err.kind),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutcome::Success { data } => Some(data),
            ToolOutcome::Error(_) => None,
        }
    }

    /// Rendering handed back to the model as the tool message content.
    pub fn to_model_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                "{{\"status\":\"error\",\"kind\":\"storage\",\"message\":\"unserializable tool result: {err}\"}}"
            )
        })
    }
}

impl From<Result<Value, ToolError>> for ToolOutcome {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(data) => ToolOutcome::Success { data },
            Err(err) => ToolOutcome::Error(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: GET_PRODUCT_INFO_TOOL_NAME.to_string(),
            description: "Retrieves inventory details (stock quantity and price) from the product \
                          catalog. Matching is a case-insensitive substring match on product name, \
                          and optionally storage and color."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "product": {
                        "type": "string",
                        "description": "Name of the product (e.g. 'iPhone 15 Pro Max')"
                    },
                    "storage": {
                        "type": "string",
                        "description": "Storage capacity (e.g. '256GB')"
                    },
                    "color": {
                        "type": "string",
                        "description": "Color of the product (e.g. 'Natural Titanium')"
                    }
                },
                "required": ["product"]
            }),
        },
        ToolDefinition {
            name: CREATE_ORDER_TOOL_NAME.to_string(),
            description: "Saves an order to the order log with a standardized format. Requires \
                          order_id, product, quantity, total_price and customer_info \
                          (customer_name, conversation_id)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "order_details": {
                        "type": "object",
                        "description": "The order to persist.",
                        "properties": {
                            "order_id": { "type": "string" },
                            "product": { "type": "string" },
                            "color": { "type": "string" },
                            "storage": { "type": "string" },
                            "quantity": { "type": "integer", "minimum": 1 },
                            "total_price": { "type": "number" },
                            "customer_info": {
                                "type": "object",
                                "properties": {
                                    "customer_name": { "type": "string" },
                                    "conversation_id": { "type": "string" }
                                }
                            },
                            "message": { "type": "string" }
                        },
                        "required": ["order_id", "product", "quantity", "total_price", "customer_info"]
                    }
                },
                "required": ["order_details"]
            }),
        },
        ToolDefinition {
            name: GET_ORDER_TOOL_NAME.to_string(),
            description: "Returns the stored file content of an order by its exact order_id."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "order_id": { "type": "string" }
                },
                "required": ["order_id"]
            }),
        },
    ]
}

pub fn tool_definitions_for(names: &[&str]) -> Vec<ToolDefinition> {
    tool_definitions()
        .into_iter()
        .filter(|definition| names.contains(&definition.name.as_str()))
        .collect()
}

/// Seam between agents and the tool implementations, local or remote.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn transport_name(&self) -> &'static str;
    async fn call(&self, name: &str, arguments: Value) -> ToolOutcome;
}

pub struct LocalToolBackend {
    orders: OrderStore,
    catalog: Arc<dyn ProductStore>,
}

impl LocalToolBackend {
    pub fn new(orders: OrderStore, catalog: Arc<dyn ProductStore>) -> Self {
        Self { orders, catalog }
    }

    pub fn orders(&self) -> &OrderStore {
        &self.orders
    }

    pub fn catalog(&self) -> &Arc<dyn ProductStore> {
        &self.catalog
    }

    pub async fn get_product_info(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = ProductQuery::from_arguments(arguments)?;
        let products = self.catalog.find_products(&query).await.map_err(|err| {
            tracing::error!(error = %err, "catalog query failed");
            ToolError::unavailable(format!("error retrieving product info: {err:#}"))
        })?;

        if products.is_empty() {
            tracing::warn!(query = %query.describe(), "no product found");
            return Err(ToolError::not_found(format!(
                "no product found matching {}",
                query.describe()
            )));
        }

        tracing::debug!(matches = products.len(), "catalog query matched");
        Ok(json!({ "products": products }))
    }
}

#[async_trait]
impl ToolBackend for LocalToolBackend {
    fn transport_name(&self) -> &'static str {
        "local"
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolOutcome {
        match name {
            CREATE_ORDER_TOOL_NAME => self.orders.create_order(&arguments).await.into(),
            GET_ORDER_TOOL_NAME => {
                let order_id = value_as_text(arguments.get("order_id")).unwrap_or_default();
                self.orders
                    .get_order(&order_id)
                    .map(|stored| {
                        json!({
                            "path": stored.path.display().to_string(),
                            "file_content": stored.file_content,
                        })
                    })
                    .into()
            }
            GET_PRODUCT_INFO_TOOL_NAME => self.get_product_info(&arguments).await.into(),
            other => ToolOutcome::Error(ToolError::new(
                ToolErrorKind::UnknownTool,
                format!("unknown tool '{other}'"),
            )),
        }
    }
}

pub async fn build_local_backend(cfg: &RuntimeConfig) -> Result<LocalToolBackend> {
    let catalog = build_product_store(cfg).await?;
    Ok(LocalToolBackend::new(
        OrderStore::new(&cfg.orders_dir),
        catalog,
    ))
}

pub async fn build_tool_backend(cfg: &RuntimeConfig) -> Result<Arc<dyn ToolBackend>> {
    match cfg.tool_transport {
        ToolTransport::Local => Ok(Arc::new(build_local_backend(cfg).await?)),
        ToolTransport::Remote => Ok(Arc::new(RemoteToolClient::new(
            &cfg.tool_server_url,
            cfg.tool_timeout_secs,
        )?)),
    }
}

pub async fn run_tools_list(cfg: &RuntimeConfig) -> Result<()> {
    let definitions = match cfg.tool_transport {
        ToolTransport::Local => tool_definitions(),
        ToolTransport::Remote => {
            RemoteToolClient::new(&cfg.tool_server_url, cfg.tool_timeout_secs)?
                .fetch_definitions()
                .await?
        }
    };

    println!(
        "Tools available over {:?} transport:",
        cfg.tool_transport
    );
    for definition in definitions {
        println!("- {}: {}", definition.name, definition.description);
    }
    Ok(())
}

pub async fn run_tools_call(cfg: &RuntimeConfig, name: &str, raw_args: &str) -> Result<()> {
    let arguments = serde_json::from_str::<Value>(raw_args)
        .map_err(|err| anyhow::anyhow!("invalid JSON for --args: {err}"))?;
    let backend = build_tool_backend(cfg).await?;
    let outcome = backend.call(name, arguments).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let ToolOutcome::Error(err) = outcome {
        return Err(anyhow::anyhow!("tool '{}' failed: {}", name, err));
    }
    Ok(())
}

/// Accepts strings and numbers; anything else is treated as absent.
pub fn value_as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn value_as_number(value: Option<&Value>) -> Option<Number> {
    match value? {
        Value::Number(number) => Some(number.clone()),
        Value::String(text) => serde_json::from_str::<Number>(text.trim()).ok(),
        _ => None,
    }
}

pub fn value_as_i64(value: Option<&Value>) -> Option<i64> {
    let number = value_as_number(value)?;
    if let Some(int) = number.as_i64() {
        return Some(int);
    }
    let float = number.as_f64()?;
    (float.fract() == 0.0 && float.abs() < 9.0e15).then_some(float as i64)
}

pub fn number_from_f64(value: f64) -> Number {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Number::from(value as i64)
    } else {
        Number::from_f64(value).unwrap_or_else(|| Number::from(0))
    }
}

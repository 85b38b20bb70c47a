use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use crate::config::RuntimeConfig;
use crate::error::ToolError;

use super::{value_as_i64, value_as_number, value_as_text};

pub const REQUIRED_ORDER_FIELDS: [&str; 5] = [
    "order_id",
    "product",
    "quantity",
    "total_price",
    "customer_info",
];

pub const DEFAULT_COLOR: &str = "Unknown Color";
pub const DEFAULT_STORAGE: &str = "Unknown Storage";
pub const DEFAULT_CUSTOMER_NAME: &str = "Guest";
pub const DEFAULT_ORDER_MESSAGE: &str = "Order has been created.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub customer_name: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order_id: String,
    pub product: String,
    pub color: String,
    pub storage: String,
    pub quantity: u64,
    pub total_price: Number,
    pub customer_info: CustomerInfo,
}

/// On-disk shape of one order file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_details: OrderDetails,
    pub message: String,
}

impl OrderRecord {
    pub fn file_name(&self) -> String {
        order_file_name(
            &self.order_details.order_id,
            &self.order_details.customer_info.conversation_id,
        )
    }
}

pub fn order_file_name(order_id: &str, conversation_id: &str) -> String {
    format!("order_{order_id}_{conversation_id}.json")
}

#[derive(Debug, Clone)]
pub struct StoredOrder {
    pub path: PathBuf,
    pub file_content: String,
    pub record: OrderRecord,
}

#[derive(Debug, Clone)]
pub struct OrderStore {
    dir: PathBuf,
}

impl OrderStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validates, normalizes and persists one order. Returns the saved record and path.
    pub async fn create_order(&self, payload: &Value) -> Result<Value, ToolError> {
        let fields = normalize_order_payload(payload)?;
        let record = build_order_record(&fields)?;

        let store = self.clone();
        let to_write = record.clone();
        let path = tokio::task::spawn_blocking(move || store.write_record(&to_write))
            .await
            .map_err(|err| ToolError::storage(format!("order write task failed: {err}")))??;

        tracing::info!(
            order_id = %record.order_details.order_id,
            conversation_id = %record.order_details.customer_info.conversation_id,
            path = %path.display(),
            "order saved"
        );

        Ok(json!({
            "message": format!("order data saved to file: {}", path.display()),
            "path": path.display().to_string(),
            "order_id": record.order_details.order_id,
            "conversation_id": record.order_details.customer_info.conversation_id,
            "order": record,
        }))
    }

    pub fn get_order(&self, order_id: &str) -> Result<StoredOrder, ToolError> {
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Err(ToolError::invalid_input("order_id is required"));
        }

        if !self.dir.exists() {
            return Err(not_found_order(order_id));
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|err| {
            ToolError::storage(format!(
                "error reading orders directory '{}': {err}",
                self.dir.display()
            ))
        })?;

        let mut names = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<String>>();
        names.sort();

        let prefix = format!("order_{order_id}_");
        let mut unreadable: Option<(PathBuf, serde_json::Error)> = None;
        for name in names
            .into_iter()
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
        {
            let path = self.dir.join(&name);
            let file_content = std::fs::read_to_string(&path).map_err(|err| {
                ToolError::storage(format!(
                    "error reading order file '{}': {err}",
                    path.display()
                ))
            })?;
            let record = match serde_json::from_str::<OrderRecord>(&file_content) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable order file");
                    unreadable.get_or_insert((path, err));
                    continue;
                }
            };
            if record.order_details.order_id == order_id {
                return Ok(StoredOrder {
                    path,
                    file_content,
                    record,
                });
            }
        }

        // An unparsable candidate outranks not-found.
        if let Some((path, err)) = unreadable {
            return Err(ToolError::storage(format!(
                "order file '{}' is not a valid order: {err}",
                path.display()
            )));
        }

        Err(not_found_order(order_id))
    }

    fn write_record(&self, record: &OrderRecord) -> Result<PathBuf, ToolError> {
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            ToolError::storage(format!(
                "error creating orders directory '{}': {err}",
                self.dir.display()
            ))
        })?;

        let path = self.dir.join(record.file_name());
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", record.file_name(), uuid::Uuid::new_v4()));

        let body = render_order_json(record)
            .map_err(|err| ToolError::storage(format!("error serializing order: {err}")))?;

        let write_result = std::fs::File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&body)?;
                file.sync_all()
            })
            .and_then(|_| std::fs::rename(&tmp_path, &path));

        if let Err(err) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ToolError::storage(format!(
                "error saving order to file '{}': {err}",
                path.display()
            )));
        }

        Ok(path)
    }
}

fn not_found_order(order_id: &str) -> ToolError {
    ToolError::not_found(format!("order file with id '{order_id}' not found"))
}

/// Pretty JSON with a four-space indent, non-ASCII kept as-is.
pub fn render_order_json(record: &OrderRecord) -> serde_json::Result<Vec<u8>> {
    let mut body = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut body, formatter);
    record.serialize(&mut serializer)?;
    body.push(b'\n');
    Ok(body)
}

fn decode_json_string(value: &Value) -> Result<Value, ToolError> {
    match value {
        Value::String(text) => serde_json::from_str::<Value>(text).map_err(|err| {
            ToolError::invalid_input(format!("order_details is not valid JSON: {err}"))
        }),
        other => Ok(other.clone()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Peels `order_details` wrappers (objects or JSON strings) until the order fields are reached.
pub fn normalize_order_payload(payload: &Value) -> Result<Map<String, Value>, ToolError> {
    let mut current = decode_json_string(payload)?;
    loop {
        let map = match current {
            Value::Object(map) => map,
            other => {
                return Err(ToolError::invalid_input(format!(
                    "order_details must be a JSON object, received {}",
                    json_kind(&other)
                )));
            }
        };

        let next = match map.get("order_details") {
            Some(inner) if !map.contains_key("order_id") => decode_json_string(inner)?,
            _ => return Ok(map),
        };
        current = next;
    }
}

fn missing_order_fields(fields: &Map<String, Value>) -> Vec<String> {
    REQUIRED_ORDER_FIELDS
        .iter()
        .filter(|name| fields.get(**name).is_none_or(Value::is_null))
        .map(|name| name.to_string())
        .collect()
}

fn is_safe_file_component(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.contains("..")
        && !value
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | ':') || ch.is_control())
}

fn optional_text(fields: &Map<String, Value>, key: &str, default: &str) -> String {
    value_as_text(fields.get(key))
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn build_order_record(fields: &Map<String, Value>) -> Result<OrderRecord, ToolError> {
    let missing = missing_order_fields(fields);
    if !missing.is_empty() {
        return Err(ToolError::missing_fields(missing));
    }

    let order_id = value_as_text(fields.get("order_id"))
        .filter(|id| is_safe_file_component(id))
        .ok_or_else(|| {
            ToolError::invalid_input("order_id must be a non-empty string usable as a file name")
        })?;

    let product = value_as_text(fields.get("product"))
        .filter(|product| !product.is_empty())
        .ok_or_else(|| ToolError::invalid_input("product must be a non-empty string"))?;

    let quantity = value_as_i64(fields.get("quantity"))
        .filter(|quantity| *quantity >= 1)
        .ok_or_else(|| ToolError::invalid_input("quantity must be a positive integer"))?
        as u64;

    let total_price = value_as_number(fields.get("total_price"))
        .ok_or_else(|| ToolError::invalid_input("total_price must be a number"))?;

    let Some(customer) = fields.get("customer_info").and_then(Value::as_object) else {
        return Err(ToolError::invalid_input("customer_info must be an object"));
    };

    let conversation_id = value_as_text(customer.get("conversation_id"))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if !is_safe_file_component(&conversation_id) {
        return Err(ToolError::invalid_input(
            "customer_info.conversation_id must be usable as a file name",
        ));
    }

    let message = match fields.get("message") {
        Some(Value::String(message)) => message.clone(),
        _ => DEFAULT_ORDER_MESSAGE.to_string(),
    };

    Ok(OrderRecord {
        order_details: OrderDetails {
            order_id,
            product,
            color: optional_text(fields, "color", DEFAULT_COLOR),
            storage: optional_text(fields, "storage", DEFAULT_STORAGE),
            quantity,
            total_price,
            customer_info: CustomerInfo {
                customer_name: optional_text(customer, "customer_name", DEFAULT_CUSTOMER_NAME),
                conversation_id,
            },
        },
        message,
    })
}

pub fn run_orders_show(cfg: &RuntimeConfig, order_id: &str) -> anyhow::Result<()> {
    let stored = OrderStore::new(&cfg.orders_dir)
        .get_order(order_id)
        .map_err(|err| anyhow::anyhow!("order lookup failed: {err}"))?;
    println!("{}", stored.path.display());
    print!("{}", stored.file_content);
    Ok(())
}

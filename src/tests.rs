use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use clap::Parser;
use rmcp::model::{CallToolResult, Content};
use rmcp::transport::StreamableHttpServerConfig;
use serde_json::{Number, Value, json};
use tempfile::tempdir;

use crate::agents::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::pipeline::*;
use crate::provider::*;
use crate::server::*;
use crate::telemetry::*;
use crate::tools::catalog::*;
use crate::tools::orders::*;
use crate::tools::remote::*;
use crate::tools::server::*;
use crate::tools::*;

fn base_cfg(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".sales-crew/config.toml".to_string(),
        llm_base_url: "http://127.0.0.1:9/v1".to_string(),
        llm_model: "test-model".to_string(),
        temperature: 0.5,
        top_p: 0.95,
        seed: 42,
        max_tokens: None,
        llm_timeout_secs: 5,
        agent_max_iterations: 8,
        tool_transport: ToolTransport::Local,
        tool_server_url: DEFAULT_TOOL_SERVER_URL.to_string(),
        tool_timeout_secs: 5,
        orders_dir: dir.join("orders").to_string_lossy().to_string(),
        catalog_backend: CatalogBackend::Memory,
        catalog_path: dir.join("inventory.json").to_string_lossy().to_string(),
        catalog_db_url: format!("sqlite://{}", dir.join("catalog.db").to_string_lossy()),
        conversation_id: None,
        customer_name: None,
        previous_interactions: None,
        show_sensitive_config: false,
        telemetry_enabled: false,
        telemetry_path: dir.join("events.jsonl").to_string_lossy().to_string(),
        max_query_chars: 8_000,
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        llm_base_url: None,
        llm_model: None,
        temperature: None,
        top_p: None,
        seed: None,
        max_tokens: None,
        llm_timeout_secs: None,
        agent_max_iterations: None,
        tool_transport: None,
        tool_server_url: None,
        tool_timeout_secs: None,
        orders_dir: None,
        catalog_backend: None,
        catalog_path: None,
        catalog_db_url: None,
        conversation_id: None,
        customer_name: None,
        previous_interactions: None,
        show_sensitive_config: false,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

fn product(product_id: &str, name: &str, storage: &str, color: &str, price: u64) -> Product {
    Product {
        id: None,
        product_id: product_id.to_string(),
        product: name.to_string(),
        storage: storage.to_string(),
        color: color.to_string(),
        price: Number::from(price),
        quantity: 12,
    }
}

fn sample_products() -> Vec<Product> {
    vec![
        product("IP15PM-256-NT", "iPhone 15 Pro Max", "256GB", "Titan tự nhiên", 32_990_000),
        product("IP15PM-512-NT", "iPhone 15 Pro Max", "512GB", "Titan tự nhiên", 38_990_000),
        product("IP15PM-256-BL", "iPhone 15 Pro Max", "256GB", "Titan xanh", 32_990_000),
        product("SS-S24-256-BK", "Galaxy S24", "256GB", "Đen", 22_990_000),
    ]
}

fn memory_backend(dir: &Path) -> LocalToolBackend {
    LocalToolBackend::new(
        OrderStore::new(dir.join("orders")),
        Arc::new(MemoryProductStore::with_products(sample_products())),
    )
}

fn sample_order_payload() -> Value {
    json!({
        "order_id": "A1",
        "product": "iPhone 15 Pro Max",
        "quantity": 1,
        "total_price": 32_990_000,
        "customer_info": {
            "customer_name": "Nguyễn Văn A",
            "conversation_id": "12345"
        }
    })
}

fn test_usage() -> TokenUsage {
    TokenUsage {
        total_tokens: 15,
        prompt_tokens: 10,
        cached_prompt_tokens: 2,
        completion_tokens: 5,
        successful_requests: 1,
    }
}

fn text_reply(text: &str) -> Result<ChatResponse, String> {
    Ok(ChatResponse {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: test_usage(),
    })
}

fn tool_reply(id: &str, name: &str, arguments: Value) -> Result<ChatResponse, String> {
    Ok(ChatResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }],
        usage: test_usage(),
    })
}

struct ScriptedModel {
    script: Mutex<VecDeque<Result<ChatResponse, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    fn new(script: Vec<Result<ChatResponse, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.requests.lock().expect("requests lock").push(request);
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("scripted model exhausted")),
        }
    }
}

struct RecordingBackend {
    inner: Option<LocalToolBackend>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingBackend {
    fn new(inner: Option<LocalToolBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ToolBackend for RecordingBackend {
    fn transport_name(&self) -> &'static str {
        "recording"
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolOutcome {
        self.calls
            .lock()
            .expect("calls lock")
            .push((name.to_string(), arguments.clone()));
        match &self.inner {
            Some(inner) => inner.call(name, arguments).await,
            None => ToolOutcome::success(json!({ "ok": true })),
        }
    }
}

fn tool_names(request: &ChatRequest) -> Vec<String> {
    request.tools.iter().map(|tool| tool.name.clone()).collect()
}

fn user_prompt(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .find(|message| message.role == ChatRole::User)
        .and_then(|message| message.content.clone())
        .unwrap_or_default()
}

async fn spawn_router(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

// ---------------------------------------------------------------------------
// orders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_order_fills_defaults_and_writes_indented_file() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path().join("orders"));

    let data = store
        .create_order(&sample_order_payload())
        .await
        .expect("order should save");

    let path = dir.path().join("orders").join("order_A1_12345.json");
    assert_eq!(data["order_id"], "A1");
    assert_eq!(data["conversation_id"], "12345");
    assert_eq!(data["path"], path.display().to_string());

    let content = std::fs::read_to_string(&path).expect("order file should exist");
    assert!(content.starts_with("{\n    \"order_details\": {\n        \"order_id\": \"A1\""));
    assert!(content.contains("Nguyễn Văn A"));

    let record = serde_json::from_str::<OrderRecord>(&content).expect("record should parse");
    assert_eq!(record.order_details.color, DEFAULT_COLOR);
    assert_eq!(record.order_details.storage, DEFAULT_STORAGE);
    assert_eq!(record.order_details.quantity, 1);
    assert_eq!(record.order_details.total_price, Number::from(32_990_000u64));
    assert_eq!(record.message, DEFAULT_ORDER_MESSAGE);
}

#[tokio::test]
async fn create_order_generates_conversation_id_and_guest_name_when_absent() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path());
    let mut payload = sample_order_payload();
    payload["customer_info"] = json!({});

    let data = store
        .create_order(&payload)
        .await
        .expect("order should save");
    let conversation_id = data["conversation_id"]
        .as_str()
        .expect("conversation id should be a string");
    assert_eq!(conversation_id.len(), 36);
    assert_eq!(data["order"]["order_details"]["customer_info"]["customer_name"], "Guest");
    assert!(
        dir.path()
            .join(order_file_name("A1", conversation_id))
            .exists()
    );
}

#[tokio::test]
async fn create_order_reports_exactly_the_missing_required_fields() {
    let dir = tempdir().expect("temp directory should create");
    let orders_dir = dir.path().join("orders");
    let store = OrderStore::new(&orders_dir);

    for mask in 1u32..(1 << REQUIRED_ORDER_FIELDS.len()) {
        let removed = REQUIRED_ORDER_FIELDS
            .iter()
            .enumerate()
            .filter(|(index, _)| mask & (1 << index) != 0)
            .map(|(_, name)| name.to_string())
            .collect::<Vec<String>>();

        let mut payload = sample_order_payload();
        let fields = payload.as_object_mut().expect("payload is an object");
        for name in &removed {
            fields.remove(name);
        }

        let err = store
            .create_order(&payload)
            .await
            .expect_err("incomplete order should fail");
        assert_eq!(err.kind, ToolErrorKind::MissingFields, "mask {mask}");
        assert_eq!(err.fields, removed, "mask {mask}");
    }

    assert!(!orders_dir.exists());
}

#[tokio::test]
async fn null_required_field_counts_as_missing() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path());
    let mut payload = sample_order_payload();
    payload["total_price"] = Value::Null;

    let err = store
        .create_order(&payload)
        .await
        .expect_err("null price should fail");
    assert_eq!(err.kind, ToolErrorKind::MissingFields);
    assert_eq!(err.fields, vec!["total_price".to_string()]);
}

#[tokio::test]
async fn double_wrapped_and_string_payloads_match_unwrapped_file() {
    let dir = tempdir().expect("temp directory should create");
    let plain = OrderStore::new(dir.path().join("plain"));
    let wrapped = OrderStore::new(dir.path().join("wrapped"));
    let encoded = OrderStore::new(dir.path().join("encoded"));

    plain
        .create_order(&sample_order_payload())
        .await
        .expect("plain order should save");
    wrapped
        .create_order(&json!({ "order_details": { "order_details": sample_order_payload() } }))
        .await
        .expect("wrapped order should save");
    encoded
        .create_order(&json!({
            "order_details": serde_json::to_string(&sample_order_payload()).expect("encode")
        }))
        .await
        .expect("encoded order should save");

    let read = |store: &OrderStore| {
        std::fs::read(store.dir().join("order_A1_12345.json")).expect("order file should exist")
    };
    assert_eq!(read(&plain), read(&wrapped));
    assert_eq!(read(&plain), read(&encoded));
}

#[tokio::test]
async fn create_order_rejects_unsafe_ids_and_bad_values() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path());

    for bad_id in ["../evil", "a/b", ".hidden"] {
        let mut payload = sample_order_payload();
        payload["order_id"] = json!(bad_id);
        let err = store
            .create_order(&payload)
            .await
            .expect_err("unsafe id should fail");
        assert_eq!(err.kind, ToolErrorKind::InvalidInput, "{bad_id}");
    }

    let mut payload = sample_order_payload();
    payload["quantity"] = json!(0);
    let err = store
        .create_order(&payload)
        .await
        .expect_err("zero quantity should fail");
    assert_eq!(err.kind, ToolErrorKind::InvalidInput);

    let err = store
        .create_order(&json!([1, 2, 3]))
        .await
        .expect_err("array payload should fail");
    assert_eq!(err.kind, ToolErrorKind::InvalidInput);
    assert!(err.message.contains("array"));
}

#[tokio::test]
async fn get_order_matches_exact_ids_only() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path().join("orders"));

    let err = store.get_order("A1").expect_err("missing directory is not found");
    assert_eq!(err.kind, ToolErrorKind::NotFound);

    let mut payload = sample_order_payload();
    payload["order_id"] = json!("A1_x");
    store
        .create_order(&payload)
        .await
        .expect("order should save");

    let err = store.get_order("A1").expect_err("prefix id should not match");
    assert_eq!(err.kind, ToolErrorKind::NotFound);

    let stored = store.get_order("A1_x").expect("exact id should match");
    assert_eq!(stored.record.order_details.order_id, "A1_x");
    assert_eq!(
        stored.file_content,
        std::fs::read_to_string(&stored.path).expect("order file should read")
    );

    let err = store.get_order("  ").expect_err("blank id should fail");
    assert_eq!(err.kind, ToolErrorKind::InvalidInput);
}

#[tokio::test]
async fn get_order_reports_unparsable_candidate_as_storage_error() {
    let dir = tempdir().expect("temp directory should create");
    let store = OrderStore::new(dir.path());
    let broken = dir.path().join("order_A1_c.json");
    std::fs::write(&broken, "{not json").expect("broken order should write");

    let err = store.get_order("A1").expect_err("broken candidate should fail");
    assert_eq!(err.kind, ToolErrorKind::Storage);
    assert!(err.message.contains(&broken.display().to_string()));

    store
        .create_order(&sample_order_payload())
        .await
        .expect("order should save");
    let stored = store.get_order("A1").expect("parsable match should win");
    assert_eq!(stored.path, dir.path().join("order_A1_12345.json"));
}

#[test]
fn normalize_order_payload_keeps_inner_fields_when_order_id_is_present() {
    let payload = json!({
        "order_id": "A1",
        "order_details": "kept as data",
    });
    let fields = normalize_order_payload(&payload).expect("payload should normalize");
    assert_eq!(fields.get("order_id"), Some(&json!("A1")));
}

// ---------------------------------------------------------------------------
// catalog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn product_lookup_is_case_insensitive() {
    let dir = tempdir().expect("temp directory should create");
    let backend = memory_backend(dir.path());

    let outcome = backend
        .call(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "iphone" }))
        .await;
    let products = outcome.data().expect("lookup should succeed")["products"]
        .as_array()
        .expect("products should be an array")
        .len();
    assert_eq!(products, 3);

    let outcome = backend
        .call(
            GET_PRODUCT_INFO_TOOL_NAME,
            json!({ "product": "IPHONE 15", "color": "TITAN TỰ NHIÊN" }),
        )
        .await;
    assert_eq!(
        outcome.data().expect("lookup should succeed")["products"]
            .as_array()
            .map(Vec::len),
        Some(2)
    );
}

#[tokio::test]
async fn product_lookup_with_all_filters_returns_the_single_match() {
    let dir = tempdir().expect("temp directory should create");
    let backend = memory_backend(dir.path());

    let outcome = backend
        .call(
            GET_PRODUCT_INFO_TOOL_NAME,
            json!({ "product": "iPhone 15 Pro Max", "storage": "256GB", "color": "Titan tự nhiên" }),
        )
        .await;

    let products = outcome.data().expect("lookup should succeed")["products"].clone();
    let products = products.as_array().expect("products should be an array");
    assert_eq!(products.len(), 1);
    assert_eq!(products[0]["product_id"], "IP15PM-256-NT");
    assert_eq!(products[0]["_id"], "mem-1");
    assert_eq!(products[0]["price"], 32_990_000);
}

#[tokio::test]
async fn product_lookup_errors_are_tagged() {
    let dir = tempdir().expect("temp directory should create");
    let backend = memory_backend(dir.path());

    let outcome = backend
        .call(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "Pixel 9" }))
        .await;
    let ToolOutcome::Error(err) = outcome else {
        panic!("unknown product should not succeed");
    };
    assert_eq!(err.kind, ToolErrorKind::NotFound);
    assert!(err.message.contains("product='Pixel 9', storage='any', color='any'"));

    let outcome = backend
        .call(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": " ", "storage": "256GB" }))
        .await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::InvalidInput));

    let outcome = backend.call("delete_everything", json!({})).await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::UnknownTool));
}

#[test]
fn product_from_value_requires_all_named_fields() {
    let err = Product::from_value(&json!({ "product": "iPhone", "price": 10 }))
        .expect_err("incomplete product should fail");
    assert_eq!(err.kind, ToolErrorKind::MissingFields);
    assert_eq!(
        err.fields,
        vec!["product_id", "storage", "color", "quantity"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<String>>()
    );

    let parsed = Product::from_value(&json!({
        "product_id": "X1",
        "product": "iPad Air",
        "storage": "128GB",
        "color": "Xanh",
        "price": "16990000",
        "quantity": "4"
    }))
    .expect("string numbers should parse");
    assert_eq!(parsed.price, Number::from(16_990_000u64));
    assert_eq!(parsed.quantity, 4);
}

#[tokio::test]
async fn sqlite_catalog_seeds_and_searches() {
    let dir = tempdir().expect("temp directory should create");
    let seed_path = dir.path().join("inventory.json");
    std::fs::write(
        &seed_path,
        serde_json::to_string(&json!([
            {
                "product_id": "IP15PM-256-NT",
                "product": "iPhone 15 Pro Max",
                "storage": "256GB",
                "color": "Titan tự nhiên",
                "price": 32990000,
                "quantity": 12
            },
            {
                "product_id": "SS-S24-256-BK",
                "product": "Galaxy S24",
                "storage": "256GB",
                "color": "Đen",
                "price": 22990000.5,
                "quantity": 3
            },
            { "product": "Broken entry" }
        ]))
        .expect("seed should encode"),
    )
    .expect("seed file should write");

    let db_url = format!("sqlite://{}", dir.path().join("nested/catalog.db").to_string_lossy());
    let store = SqliteProductStore::open(&db_url)
        .await
        .expect("sqlite catalog should open");

    let report = seed_catalog(&store, &seed_path)
        .await
        .expect("seed should run");
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].starts_with("Broken entry:"));
    assert_eq!(store.count_products().await.expect("count"), 2);

    let found = store
        .find_products(&ProductQuery::new("IPHONE", Some("256gb"), Some("TITAN TỰ NHIÊN")))
        .await
        .expect("query should run");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_deref(), Some("1"));
    assert_eq!(found[0].price, Number::from(32_990_000));

    let found = store
        .find_products(&ProductQuery::new("galaxy", None, None))
        .await
        .expect("query should run");
    assert_eq!(found[0].price.as_f64(), Some(22_990_000.5));

    let reopened = SqliteProductStore::open(&db_url)
        .await
        .expect("sqlite catalog should reopen");
    assert_eq!(reopened.count_products().await.expect("count"), 2);
}

#[test]
fn memory_catalog_load_tolerates_missing_file_and_skips_invalid_entries() {
    let dir = tempdir().expect("temp directory should create");
    let missing = MemoryProductStore::load(&dir.path().join("missing.json"))
        .expect("missing file should load empty");
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build");
    assert_eq!(rt.block_on(missing.count_products()).expect("count"), 0);

    let path = dir.path().join("inventory.json");
    std::fs::write(
        &path,
        r#"[{"product_id":"A","product":"iPad","storage":"64GB","color":"Bạc","price":9990000,"quantity":1},{"product":"no id"}]"#,
    )
    .expect("catalog should write");
    let loaded = MemoryProductStore::load(&path).expect("catalog should load");
    assert_eq!(rt.block_on(loaded.count_products()).expect("count"), 1);
}

#[test]
fn sqlite_path_from_url_handles_params_and_memory() {
    assert_eq!(
        sqlite_path_from_url("sqlite://data/catalog.db?mode=rwc"),
        Some(Path::new("data/catalog.db").to_path_buf())
    );
    assert_eq!(sqlite_path_from_url("sqlite://:memory:"), None);
    assert_eq!(sqlite_path_from_url("postgres://x"), None);
}

// ---------------------------------------------------------------------------
// tool results and definitions
// ---------------------------------------------------------------------------

#[test]
fn tool_outcome_serializes_as_tagged_union() {
    let success = ToolOutcome::success(json!({ "path": "orders/x.json" }));
    assert_eq!(
        serde_json::to_value(&success).expect("encode"),
        json!({ "status": "success", "data": { "path": "orders/x.json" } })
    );

    let failure = ToolOutcome::Error(ToolError::missing_fields(vec![
        "order_id".to_string(),
        "quantity".to_string(),
    ]));
    let encoded = serde_json::to_value(&failure).expect("encode");
    assert_eq!(
        encoded,
        json!({
            "status": "error",
            "kind": "missing_fields",
            "message": "missing required fields: order_id, quantity",
            "fields": ["order_id", "quantity"]
        })
    );
    assert_eq!(
        serde_json::from_value::<ToolOutcome>(encoded).expect("decode"),
        failure
    );

    let not_found = ToolOutcome::Error(ToolError::not_found("nothing"));
    assert_eq!(
        serde_json::to_value(&not_found).expect("encode"),
        json!({ "status": "error", "kind": "not_found", "message": "nothing" })
    );
}

#[test]
fn tool_definitions_filter_by_name() {
    let all = tool_definitions();
    assert_eq!(all.len(), 3);
    for definition in &all {
        assert_eq!(definition.parameters["type"], "object");
    }

    let bound = tool_definitions_for(&[CREATE_ORDER_TOOL_NAME]);
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].name, CREATE_ORDER_TOOL_NAME);
    assert!(tool_definitions_for(&[]).is_empty());
}

#[test]
fn value_helpers_accept_numeric_strings() {
    assert_eq!(value_as_i64(Some(&json!("3"))), Some(3));
    assert_eq!(value_as_i64(Some(&json!(2.0))), Some(2));
    assert_eq!(value_as_i64(Some(&json!(2.5))), None);
    assert_eq!(value_as_text(Some(&json!(true))), None);
    assert_eq!(number_from_f64(5.0), Number::from(5));
}

// ---------------------------------------------------------------------------
// agents and pipeline
// ---------------------------------------------------------------------------

#[test]
fn agent_roles_bind_their_own_tools() {
    assert!(AgentProfile::consultant(0.5).tools.is_empty());
    assert_eq!(
        AgentProfile::inventory(0.5).tools,
        vec![GET_PRODUCT_INFO_TOOL_NAME]
    );
    assert_eq!(AgentProfile::order(0.5).tools, vec![CREATE_ORDER_TOOL_NAME]);
    assert!(
        AgentProfile::order(0.5)
            .system_prompt()
            .contains("Create orders based on customer requests")
    );
}

#[test]
fn parse_tool_arguments_handles_empty_and_invalid_input() {
    assert_eq!(parse_tool_arguments("  ").expect("empty is ok"), json!({}));
    assert_eq!(
        parse_tool_arguments(r#"{"product":"iPhone"}"#).expect("valid json"),
        json!({ "product": "iPhone" })
    );
    let err = parse_tool_arguments("{not json").expect_err("invalid json should fail");
    assert_eq!(err.kind, ToolErrorKind::InvalidInput);
}

#[tokio::test]
async fn executor_refuses_tools_not_bound_to_the_agent() {
    let model = ScriptedModel::new(vec![
        tool_reply("call-9", CREATE_ORDER_TOOL_NAME, sample_order_payload()),
        text_reply("no order for you"),
    ]);
    let backend = RecordingBackend::new(None);
    let executor = AgentExecutor::new(model.clone(), backend.clone(), TelemetrySink::disabled(), 8);
    let task = TaskPrompt {
        description: "Answer the customer".to_string(),
        expected_output: "A reply".to_string(),
        context: Vec::new(),
    };

    let mut usage = TokenUsage::default();
    let answer = executor
        .execute(&AgentProfile::consultant(0.5), &task, &mut usage)
        .await
        .expect("agent should finish");

    assert_eq!(answer, "no order for you");
    assert!(backend.calls().is_empty());
    assert_eq!(usage.successful_requests, 2);

    let requests = model.requests();
    let tool_message = requests[1]
        .messages
        .last()
        .expect("tool result should be appended");
    assert_eq!(tool_message.role, ChatRole::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call-9"));
    assert!(
        tool_message
            .content
            .as_deref()
            .unwrap_or_default()
            .contains("\"kind\":\"unknown_tool\"")
    );
}

#[tokio::test]
async fn executor_tags_tool_telemetry_with_conversation_and_stage() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path());
    cfg.telemetry_enabled = true;
    let telemetry = TelemetrySink::new(&cfg, "ask".to_string());

    let model = ScriptedModel::new(vec![
        tool_reply("c1", GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "Pixel" })),
        text_reply(r#"{"stock_status":"not_checked"}"#),
    ]);
    let backend = RecordingBackend::new(Some(memory_backend(dir.path())));
    let executor = AgentExecutor::new(model, backend, telemetry, 4);
    let task = TaskPrompt {
        description: "Check stock".to_string(),
        expected_output: "JSON".to_string(),
        context: Vec::new(),
    };

    let mut usage = TokenUsage::default();
    let scope = EventFields::conversation("conv-3").stage(2, "inventory");
    executor
        .execute_scoped(&AgentProfile::inventory(0.5), &task, &mut usage, &scope)
        .await
        .expect("agent should finish");

    let records = std::fs::read_to_string(&cfg.telemetry_path)
        .expect("telemetry should be written")
        .lines()
        .map(|line| serde_json::from_str::<TelemetryRecord>(line).expect("record should parse"))
        .collect::<Vec<TelemetryRecord>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event, "tool.requested");
    assert_eq!(records[1].event, "tool.failed");
    for record in &records {
        assert_eq!(record.fields.conversation_id.as_deref(), Some("conv-3"));
        assert_eq!(record.fields.stage, Some(2));
        assert_eq!(record.fields.tool.as_deref(), Some(GET_PRODUCT_INFO_TOOL_NAME));
        assert_eq!(record.fields.transport.as_deref(), Some("recording"));
    }
    assert_eq!(records[1].fields.error_kind.as_deref(), Some("not_found"));
}

#[tokio::test]
async fn executor_stops_after_max_iterations_and_keeps_usage() {
    let model = ScriptedModel::new(vec![
        tool_reply("c1", GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "iPhone" })),
        tool_reply("c2", GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "iPhone" })),
        tool_reply("c3", GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "iPhone" })),
    ]);
    let backend = RecordingBackend::new(None);
    let executor = AgentExecutor::new(model, backend.clone(), TelemetrySink::disabled(), 2);
    let task = TaskPrompt {
        description: "Check stock".to_string(),
        expected_output: "JSON".to_string(),
        context: Vec::new(),
    };

    let mut usage = TokenUsage::default();
    let err = executor
        .execute(&AgentProfile::inventory(0.5), &task, &mut usage)
        .await
        .expect_err("loop should stop");
    assert!(err.to_string().contains("exceeded 2 model iterations"));
    assert_eq!(usage.successful_requests, 2);
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn executor_rejects_empty_answers() {
    let model = ScriptedModel::new(vec![text_reply("   ")]);
    let executor = AgentExecutor::new(
        model,
        RecordingBackend::new(None),
        TelemetrySink::disabled(),
        4,
    );
    let task = TaskPrompt {
        description: "Reply".to_string(),
        expected_output: "Text".to_string(),
        context: Vec::new(),
    };
    let mut usage = TokenUsage::default();
    let err = executor
        .execute(&AgentProfile::consultant(0.5), &task, &mut usage)
        .await
        .expect_err("empty answer should fail");
    assert!(err.to_string().contains("empty answer"));
}

#[tokio::test]
async fn pipeline_runs_four_stages_in_order_with_context_and_tools() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    let stage1 = r#"{"product_details":"iPhone 15 Pro Max 256GB Titan tự nhiên","customer_intent":"place_order","original_query":"...","requires_inventory_check":true,"requires_order_placement":true}"#;
    let stage2 = r#"{"product_name":"iPhone 15 Pro Max","stock_status":"in_stock","price":32990000,"message":"available"}"#;
    let stage3 = r#"{"order_created":true,"order_details":{"order_id":"ORD-1"},"message":"Order has been created."}"#;
    let final_text = "Chào anh Nguyễn Văn A, đơn hàng ORD-1 đã được tạo.";

    let model = ScriptedModel::new(vec![
        text_reply(stage1),
        tool_reply(
            "call-1",
            GET_PRODUCT_INFO_TOOL_NAME,
            json!({ "product": "iPhone 15 Pro Max", "storage": "256GB", "color": "Titan tự nhiên" }),
        ),
        text_reply(stage2),
        tool_reply(
            "call-2",
            CREATE_ORDER_TOOL_NAME,
            json!({
                "order_details": {
                    "order_id": "ORD-1",
                    "product": "iPhone 15 Pro Max",
                    "storage": "256GB",
                    "color": "Titan tự nhiên",
                    "quantity": 1,
                    "total_price": 32990000,
                    "customer_info": { "customer_name": "Nguyễn Văn A", "conversation_id": "12345" }
                }
            }),
        ),
        text_reply(stage3),
        text_reply(final_text),
    ]);
    let backend = RecordingBackend::new(Some(memory_backend(dir.path())));
    let pipeline = SalesPipeline::new(model.clone(), backend.clone(), &cfg, TelemetrySink::disabled());
    let context = ConversationContext::new(
        Some("12345".to_string()),
        Some("Nguyễn Văn A".to_string()),
        Some("Asked about the iPad Air.".to_string()),
    );

    let output = pipeline
        .run(
            "Tôi muốn mua iPhone 15 Pro Max 256GB màu Titan tự nhiên",
            &context,
        )
        .await;

    assert_eq!(output.task1_output, stage1);
    assert_eq!(output.task2_output, stage2);
    assert_eq!(output.task3_output, stage3);
    assert_eq!(output.customer_response, final_text);
    assert_eq!(output.token_usage.successful_requests, 6);
    assert_eq!(output.token_usage.total_tokens, 90);
    assert_eq!(output.token_usage.cached_prompt_tokens, 12);

    let requests = model.requests();
    assert_eq!(requests.len(), 6);
    let bound = requests.iter().map(tool_names).collect::<Vec<Vec<String>>>();
    assert_eq!(
        bound,
        vec![
            vec![],
            vec![GET_PRODUCT_INFO_TOOL_NAME.to_string()],
            vec![GET_PRODUCT_INFO_TOOL_NAME.to_string()],
            vec![CREATE_ORDER_TOOL_NAME.to_string()],
            vec![CREATE_ORDER_TOOL_NAME.to_string()],
            vec![],
        ]
    );
    assert!((requests[0].temperature - 0.5).abs() < f32::EPSILON);

    assert!(user_prompt(&requests[0]).contains("Nguyễn Văn A"));
    for stage_request in [0, 1, 3, 5] {
        assert!(
            user_prompt(&requests[stage_request]).contains("\"conversation_id\":\"12345\""),
            "stage request {stage_request} should carry the conversation context"
        );
    }
    assert!(user_prompt(&requests[1]).contains(stage1));
    assert!(!user_prompt(&requests[1]).contains(stage2));
    assert!(user_prompt(&requests[3]).contains(stage1));
    assert!(user_prompt(&requests[3]).contains(stage2));
    assert!(user_prompt(&requests[5]).contains(stage3));
    assert!(
        requests[1].messages[0]
            .content
            .as_deref()
            .unwrap_or_default()
            .contains("Inventory checker")
    );

    let lookup_result = requests[2]
        .messages
        .last()
        .and_then(|message| message.content.clone())
        .unwrap_or_default();
    assert!(lookup_result.contains("\"status\":\"success\""));
    assert!(lookup_result.contains("IP15PM-256-NT"));
    assert!(!lookup_result.contains("IP15PM-512-NT"));

    let calls = backend
        .calls()
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<String>>();
    assert_eq!(calls, vec![GET_PRODUCT_INFO_TOOL_NAME, CREATE_ORDER_TOOL_NAME]);
    assert!(
        dir.path()
            .join("orders")
            .join("order_ORD-1_12345.json")
            .exists()
    );
}

#[tokio::test]
async fn pipeline_degrades_failed_stages_to_placeholders() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path());
    cfg.telemetry_enabled = true;
    let telemetry = TelemetrySink::new(&cfg, "ask".to_string());

    let model = ScriptedModel::new(vec![
        text_reply(r#"{"requires_inventory_check":true}"#),
        Err("upstream returned 503".to_string()),
        text_reply(r#"{"order_created":false,"message":"no stock data"}"#),
        text_reply("Sorry, we could not check stock right now."),
    ]);
    let pipeline = SalesPipeline::new(model.clone(), RecordingBackend::new(None), &cfg, telemetry);
    let context = ConversationContext::new(Some("conv-7".to_string()), None, None);

    let output = pipeline.run("Is the Galaxy S24 in stock?", &context).await;

    assert!(output.task2_output.starts_with("Task 2 failed:"));
    assert!(output.task2_output.contains("upstream returned 503"));
    assert_eq!(output.customer_response, "Sorry, we could not check stock right now.");
    assert!(user_prompt(&model.requests()[2]).contains("Task 2 failed:"));
    assert_eq!(output.token_usage.successful_requests, 3);

    let lines = std::fs::read_to_string(&cfg.telemetry_path)
        .expect("telemetry should be written")
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.stages_completed(), 3);
    assert_eq!(summary.stages_failed(), 1);
    assert_eq!(summary.pipelines_completed, 1);
    assert_eq!(summary.stages[&2].agent, "inventory");
    assert_eq!(summary.stages[&2].failed, 1);
    assert_eq!(summary.stages[&4].completed, 1);
    assert!(summary.unique_conversations.contains("conv-7"));
}

#[tokio::test]
async fn pipeline_without_final_stage_uses_fallback_response() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    let model = ScriptedModel::new(vec![
        text_reply("{}"),
        text_reply("{}"),
        text_reply("{}"),
        Err("timeout".to_string()),
    ]);
    let pipeline = SalesPipeline::new(model, RecordingBackend::new(None), &cfg, TelemetrySink::disabled());

    let output = pipeline
        .run("hello", &ConversationContext::new(None, None, None))
        .await;
    assert_eq!(output.customer_response, MISSING_FINAL_RESPONSE);
    assert_eq!(output.task3_output, "{}");
}

#[test]
fn conversation_context_defaults_and_parsing() {
    let context = ConversationContext::new(None, Some("  ".to_string()), None);
    assert_eq!(context.customer_name, DEFAULT_CUSTOMER_NAME);
    assert_eq!(context.previous_interactions, "");
    assert_eq!(context.conversation_id.len(), 36);

    let parsed = ConversationContext::from_json(
        r#"{"conversation_id": 12345, "customer_name": "Nguyễn Văn A", "channel": "web"}"#,
    )
    .expect("context should parse");
    assert_eq!(parsed.conversation_id, "12345");
    assert_eq!(parsed.customer_name, "Nguyễn Văn A");

    assert!(ConversationContext::from_json("{broken").is_err());
    assert_eq!(
        ConversationContext::from_json("")
            .expect("empty context is allowed")
            .customer_name,
        DEFAULT_CUSTOMER_NAME
    );
}

#[test]
fn parse_stage_json_strips_fences_and_think_blocks() {
    assert_eq!(
        parse_stage_json("```json\n{\"a\": 1}\n```"),
        Some(json!({ "a": 1 }))
    );
    assert_eq!(
        parse_stage_json("<think>\nmaybe {\"draft\": true}\n</think>\n{\"order_created\": false}"),
        Some(json!({ "order_created": false }))
    );
    assert_eq!(
        parse_stage_json("Here you go: {\"msg\": \"brace } inside\", \"n\": {\"x\": 2}} thanks"),
        Some(json!({ "msg": "brace } inside", "n": { "x": 2 } }))
    );
    assert_eq!(parse_stage_json("no json here"), None);
    assert_eq!(parse_stage_json("[1, 2]"), None);
}

// ---------------------------------------------------------------------------
// HTTP surfaces
// ---------------------------------------------------------------------------

fn chat_state(dir: &Path, script: Vec<Result<ChatResponse, String>>) -> Arc<ChatServerState> {
    let cfg = base_cfg(dir);
    let pipeline = SalesPipeline::new(
        ScriptedModel::new(script),
        RecordingBackend::new(None),
        &cfg,
        TelemetrySink::disabled(),
    );
    Arc::new(ChatServerState {
        cfg,
        pipeline,
        telemetry: TelemetrySink::disabled(),
        auth_token: None,
    })
}

#[tokio::test]
async fn chat_handler_validates_query_and_context() {
    let dir = tempdir().expect("temp directory should create");
    let state = chat_state(dir.path(), Vec::new());

    let result = handle_chat(
        State(state.clone()),
        HeaderMap::new(),
        Query(ChatQuery {
            query: Some("   ".to_string()),
            initial_context_data: None,
        }),
    )
    .await;
    let Err((status, Json(body))) = result else {
        panic!("empty query should be rejected");
    };
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap_or_default().contains("query"));

    let result = handle_chat(
        State(state.clone()),
        HeaderMap::new(),
        Query(ChatQuery {
            query: Some("price?".to_string()),
            initial_context_data: Some("{not json".to_string()),
        }),
    )
    .await;
    let Err((status, Json(body))) = result else {
        panic!("invalid context should be rejected");
    };
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]
            .as_str()
            .unwrap_or_default()
            .contains("initial_context_data")
    );

    let result = handle_chat(
        State(state),
        HeaderMap::new(),
        Query(ChatQuery {
            query: Some("x".repeat(8_001)),
            initial_context_data: None,
        }),
    )
    .await;
    let Err((status, _)) = result else {
        panic!("over-long query should be rejected");
    };
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_handler_returns_pipeline_output() {
    let dir = tempdir().expect("temp directory should create");
    let state = chat_state(
        dir.path(),
        vec![
            text_reply("{\"customer_intent\":\"general_query\"}"),
            text_reply("{\"stock_status\":\"not_checked\"}"),
            text_reply("{\"order_created\":false}"),
            text_reply("Hello Jane, how can I help?"),
        ],
    );

    let result = handle_chat(
        State(state),
        HeaderMap::new(),
        Query(ChatQuery {
            query: Some("hello".to_string()),
            initial_context_data: Some(r#"{"customer_name":"Jane"}"#.to_string()),
        }),
    )
    .await;
    let Ok(Json(body)) = result else {
        panic!("chat should succeed");
    };
    assert_eq!(body.response.customer_response, "Hello Jane, how can I help?");
    assert_eq!(body.response.task2_output, "{\"stock_status\":\"not_checked\"}");
    assert_eq!(body.response.token_usage.successful_requests, 4);

    let encoded = serde_json::to_value(&body).expect("encode");
    for key in [
        "customer_response",
        "task1_output",
        "task2_output",
        "task3_output",
        "token_usage",
    ] {
        assert!(encoded["response"].get(key).is_some(), "{key}");
    }
}

#[test]
fn server_auth_requires_matching_bearer_token() {
    let dir = tempdir().expect("temp directory should create");
    let state = chat_state(dir.path(), Vec::new());
    let mut secured = (*state).clone();
    secured.auth_token = Some("secret".to_string());

    assert!(check_server_auth(&state, &HeaderMap::new()).is_ok());
    let Err((status, _)) = check_server_auth(&secured, &HeaderMap::new()) else {
        panic!("missing token should be rejected");
    };
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_static("Bearer secret"),
    );
    assert!(check_server_auth(&secured, &headers).is_ok());
}

#[tokio::test]
async fn sales_tool_service_wraps_outcomes_as_mcp_results() {
    let dir = tempdir().expect("temp directory should create");
    let service = SalesToolService::new(
        Arc::new(memory_backend(dir.path())),
        TelemetrySink::disabled(),
    );

    let tools = mcp_tools();
    let names = tools
        .iter()
        .map(|tool| tool.name.to_string())
        .collect::<Vec<String>>();
    assert_eq!(
        names,
        vec![
            GET_PRODUCT_INFO_TOOL_NAME.to_string(),
            CREATE_ORDER_TOOL_NAME.to_string(),
            GET_ORDER_TOOL_NAME.to_string(),
        ]
    );
    assert_eq!(tools[0].input_schema["required"], json!(["product"]));

    let outcome = service.dispatch("drop_tables", json!({})).await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::UnknownTool));
    let result = outcome_to_call_result(&outcome);
    assert_eq!(result.is_error, Some(true));
    assert_eq!(outcome_from_call_result("drop_tables", &result), outcome);

    let outcome = service
        .dispatch(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "galaxy" }))
        .await;
    assert!(outcome.is_success());
    let result = outcome_to_call_result(&outcome);
    assert_eq!(result.is_error, Some(false));
    let text = result.content[0]
        .as_text()
        .map(|text| text.text.clone())
        .unwrap_or_default();
    assert!(text.starts_with("{\"status\":\"success\""));
    assert!(text.contains("SS-S24-256-BK"));
}

#[test]
fn foreign_mcp_results_are_wrapped_without_the_outcome_envelope() {
    let plain = CallToolResult::success(vec![Content::text(r#"{"temperature":21}"#)]);
    assert_eq!(
        outcome_from_call_result("weather", &plain),
        ToolOutcome::success(json!({ "temperature": 21 }))
    );

    let text = CallToolResult::success(vec![Content::text("done")]);
    assert_eq!(
        outcome_from_call_result("weather", &text),
        ToolOutcome::success(json!("done"))
    );

    let failed = CallToolResult::error(vec![Content::text("quota exceeded")]);
    let outcome = outcome_from_call_result("weather", &failed);
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::Unavailable));
    let ToolOutcome::Error(err) = outcome else {
        panic!("expected an error outcome");
    };
    assert!(err.message.contains("quota exceeded"));
}

#[tokio::test]
async fn remote_tool_client_round_trips_through_mcp_server() {
    let dir = tempdir().expect("temp directory should create");
    let service = SalesToolService::new(
        Arc::new(memory_backend(dir.path())),
        TelemetrySink::disabled(),
    );
    let addr = spawn_router(build_tool_router(
        service,
        StreamableHttpServerConfig::default(),
    ))
    .await;

    let health = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("health endpoint should answer")
        .json::<Value>()
        .await
        .expect("health body should be JSON");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mcp_path"], MCP_PATH);

    let client = RemoteToolClient::new(&format!("http://{addr}/"), 5).expect("client should build");
    assert_eq!(client.base_url(), format!("http://{addr}"));
    assert_eq!(client.endpoint(), format!("http://{addr}/mcp"));
    assert_eq!(client.health().await.expect("health should pass"), 3);

    let definitions = client
        .fetch_definitions()
        .await
        .expect("definitions should load");
    assert_eq!(definitions, tool_definitions());

    let outcome = client
        .call(CREATE_ORDER_TOOL_NAME, json!({ "order_details": sample_order_payload() }))
        .await;
    assert!(outcome.is_success());
    assert!(
        dir.path()
            .join("orders")
            .join("order_A1_12345.json")
            .exists()
    );

    let outcome = client
        .call(GET_ORDER_TOOL_NAME, json!({ "order_id": "A1" }))
        .await;
    let file_content = outcome.data().expect("order should be found")["file_content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert!(file_content.contains("\"order_id\": \"A1\""));

    let outcome = client
        .call(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "Nokia" }))
        .await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::NotFound));

    let outcome = client.call("format_disk", json!({})).await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::UnknownTool));

    let outcome = client
        .call(CREATE_ORDER_TOOL_NAME, json!([1, 2, 3]))
        .await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::InvalidInput));
}

#[tokio::test]
async fn remote_tool_client_reports_unreachable_server_as_unavailable() {
    assert!(RemoteToolClient::new("127.0.0.1:8000", 2).is_err());

    let client = RemoteToolClient::new("http://127.0.0.1:1/mcp", 2).expect("client should build");
    assert_eq!(client.endpoint(), "http://127.0.0.1:1/mcp");
    let outcome = client
        .call(GET_PRODUCT_INFO_TOOL_NAME, json!({ "product": "iPhone" }))
        .await;
    assert_eq!(outcome.error_kind(), Some(ToolErrorKind::Unavailable));
    assert!(client.health().await.is_err());
}

async fn mock_completion(
    State(seen): State<Arc<Mutex<Vec<Value>>>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    seen.lock().expect("seen lock").push(body);
    Json(json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_abc",
                    "type": "function",
                    "function": { "name": "get_product_info", "arguments": "{\"product\":\"iPhone\"}" }
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {
            "prompt_tokens": 20,
            "completion_tokens": 7,
            "total_tokens": 27,
            "prompt_tokens_details": { "cached_tokens": 3 }
        }
    }))
}

#[tokio::test]
async fn openai_compatible_model_sends_tools_and_parses_tool_calls() {
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let router = axum::Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(mock_completion),
        )
        .route(
            "/bad/chat/completions",
            axum::routing::post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": { "message": "invalid api key" } })),
                )
            }),
        )
        .with_state(seen.clone());
    let addr = spawn_router(router).await;

    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path());
    cfg.llm_base_url = format!("http://{addr}/v1");
    cfg.max_tokens = Some(512);
    let model = OpenAiCompatibleModel::new("test-key", &cfg).expect("model should build");

    let response = model
        .complete(ChatRequest {
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            tools: tool_definitions_for(&[GET_PRODUCT_INFO_TOOL_NAME]),
            temperature: 0.5,
        })
        .await
        .expect("completion should succeed");

    assert_eq!(response.content, None);
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].function.name, "get_product_info");
    assert_eq!(response.usage.total_tokens, 27);
    assert_eq!(response.usage.cached_prompt_tokens, 3);
    assert_eq!(response.usage.successful_requests, 1);

    let body = seen.lock().expect("seen lock")[0].clone();
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["seed"], 42);
    assert_eq!(body["max_tokens"], 512);
    assert_eq!(body["tool_choice"], "auto");
    assert_eq!(body["tools"][0]["type"], "function");
    assert_eq!(body["tools"][0]["function"]["name"], "get_product_info");
    assert_eq!(body["messages"][1], json!({ "role": "user", "content": "hi" }));

    cfg.llm_base_url = format!("http://{addr}/bad");
    let failing = OpenAiCompatibleModel::new("test-key", &cfg).expect("model should build");
    let err = failing
        .complete(ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            temperature: 0.5,
        })
        .await
        .expect_err("401 should fail");
    let text = err.to_string();
    assert!(text.contains("401"));
    assert!(text.contains("invalid api key"));
    assert_eq!(categorize_error(&err), ErrorCategory::Provider);
}

#[test]
fn request_body_omits_tools_when_none_are_bound() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    let model = OpenAiCompatibleModel::new("", &cfg).expect("model should build");
    let body = model.request_body(&ChatRequest {
        messages: vec![ChatMessage::user("hi")],
        tools: Vec::new(),
        temperature: 0.2,
    });
    assert!(body.get("tools").is_none());
    assert!(body.get("tool_choice").is_none());
    assert!(body.get("max_tokens").is_none());
}

// ---------------------------------------------------------------------------
// config, errors, telemetry
// ---------------------------------------------------------------------------

#[test]
fn runtime_config_defaults_without_profile_file() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("missing.toml");
    let config_path = config_path.to_string_lossy();
    let profiles = load_profiles(&config_path).expect("missing file loads empty");
    let mut cli = test_cli(&config_path, "default");
    cli.llm_base_url = Some("http://localhost:8001/v1/".to_string());

    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");
    assert_eq!(cfg.llm_base_url, "http://localhost:8001/v1");
    assert_eq!(cfg.llm_model, DEFAULT_LLM_MODEL);
    assert!((cfg.temperature - 0.5).abs() < f32::EPSILON);
    assert!((cfg.top_p - 0.95).abs() < f32::EPSILON);
    assert_eq!(cfg.seed, 42);
    assert_eq!(cfg.agent_max_iterations, 8);
    assert_eq!(cfg.tool_transport, ToolTransport::Remote);
    assert_eq!(cfg.catalog_backend, CatalogBackend::Memory);
    assert_eq!(cfg.orders_dir, "orders");
    assert!(cfg.telemetry_enabled);
}

#[test]
fn runtime_config_prefers_cli_over_profile_over_default() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[profiles.staging]
llm_model = "qwen3-8b"
temperature = 0.2
orders_dir = "profile-orders"
tool_transport = "local"
catalog_backend = "sqlite"
customer_name = "Profile Customer"
"#,
    )
    .expect("config should write");
    let config_path = config_path.to_string_lossy().to_string();
    let profiles = load_profiles(&config_path).expect("profiles should load");

    let mut cli = test_cli(&config_path, "staging");
    cli.orders_dir = Some("cli-orders".to_string());
    cli.temperature = Some(9.0);
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config should resolve");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.llm_model, "qwen3-8b");
    assert_eq!(cfg.orders_dir, "cli-orders");
    assert!((cfg.temperature - 2.0).abs() < f32::EPSILON);
    assert_eq!(cfg.tool_transport, ToolTransport::Local);
    assert_eq!(cfg.catalog_backend, CatalogBackend::Sqlite);
    assert_eq!(cfg.customer_name.as_deref(), Some("Profile Customer"));

    let err = resolve_runtime_config(&test_cli(&config_path, "prod"), &profiles)
        .expect_err("unknown profile should fail");
    assert!(err.to_string().contains("Available profiles: staging"));
    assert_eq!(categorize_error(&err), ErrorCategory::Input);
}

#[test]
fn profile_file_rejects_unknown_fields() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[profiles.default]\nprovider = \"gemini\"\n")
        .expect("config should write");
    assert!(load_profiles(&config_path.to_string_lossy()).is_err());
}

#[test]
fn cli_parses_commands_and_labels_them() {
    let cli = Cli::try_parse_from([
        "sales-crew",
        "--tool-transport",
        "local",
        "ask",
        "is",
        "it",
        "in",
        "stock?",
    ])
    .expect("cli should parse");
    assert_eq!(cli.tool_transport, Some(ToolTransport::Local));
    assert_eq!(command_label(&cli.command), "ask");
    let Commands::Ask { message } = cli.command else {
        panic!("expected ask command");
    };
    assert_eq!(message.join(" "), "is it in stock?");

    let cli = Cli::try_parse_from(["sales-crew", "tools", "call", "get_order", "--args", "{}"])
        .expect("cli should parse");
    assert_eq!(command_label(&cli.command), "tools.call");

    assert!(Cli::try_parse_from(["sales-crew", "ask"]).is_err());
}

#[test]
fn errors_are_categorized_and_redacted() {
    let cases = [
        (
            anyhow::anyhow!("SALES_LLM_API_KEY (or OPENAI_API_KEY) is required"),
            ErrorCategory::Provider,
        ),
        (
            anyhow::anyhow!("invalid JSON for --args: expected value"),
            ErrorCategory::Input,
        ),
        (
            anyhow::anyhow!("failed to open sqlite catalog database"),
            ErrorCategory::Catalog,
        ),
        (
            anyhow::anyhow!("tool server unreachable at http://127.0.0.1:8000/healthz"),
            ErrorCategory::Tooling,
        ),
        (anyhow::anyhow!("something odd"), ErrorCategory::Internal),
    ];
    for (err, expected) in cases {
        assert_eq!(categorize_error(&err), expected, "{err}");
    }

    let err = anyhow::anyhow!("connect sqlite:///var/data/catalog.db failed with Bearer abc123");
    let rendered = format_cli_error(&err, false);
    assert!(rendered.starts_with("[CATALOG]"));
    assert!(rendered.contains("sqlite://[REDACTED]"));
    assert!(rendered.contains("Bearer [REDACTED]"));
    assert!(!rendered.contains("abc123"));
    assert!(rendered.contains("Hint:"));

    let revealed = format_cli_error(&err, true);
    assert!(revealed.contains("/var/data/catalog.db"));
}

#[test]
fn tool_error_display_includes_kind() {
    let err = ToolError::not_found("order file with id 'Z' not found");
    assert_eq!(err.to_string(), "[not_found] order file with id 'Z' not found");

    let wrapped = anyhow::Error::new(err.clone()).context("order lookup failed");
    assert_eq!(
        format!("{wrapped:#}"),
        "order lookup failed: [not_found] order file with id 'Z' not found"
    );
    assert_eq!(wrapped.downcast_ref::<ToolError>(), Some(&err));
}

#[test]
fn telemetry_sink_appends_typed_jsonl_records() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path());
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("nested/events.jsonl")
        .to_string_lossy()
        .to_string();
    let sink = TelemetrySink::new(&cfg, "tools.call".to_string());

    let scope = EventFields::conversation("c1").stage(2, "inventory");
    sink.emit(
        TelemetryEvent::ToolRequested,
        scope.clone().tool(GET_ORDER_TOOL_NAME, "local"),
    );
    sink.emit(
        TelemetryEvent::ToolFailed,
        scope
            .tool(GET_ORDER_TOOL_NAME, "local")
            .failure("not_found", "order file with id 'Z' not found"),
    );
    TelemetrySink::disabled().emit(TelemetryEvent::ToolRequested, EventFields::default());

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry should exist");
    let lines = content.lines().map(str::to_string).collect::<Vec<String>>();
    assert_eq!(lines.len(), 2);
    let first = serde_json::from_str::<Value>(&lines[0]).expect("line should parse");
    assert_eq!(first["event"], "tool.requested");
    assert_eq!(first["command"], "tools.call");
    assert_eq!(first["run_id"], sink.run_id);
    assert_eq!(first["conversation_id"], "c1");
    assert_eq!(first["stage"], 2);
    assert_eq!(first["tool"], GET_ORDER_TOOL_NAME);
    assert!(first.get("error_kind").is_none());
    assert!(first.get("details").is_none());

    let second = serde_json::from_str::<TelemetryRecord>(&lines[1]).expect("record should parse");
    assert_eq!(second.fields.error_kind.as_deref(), Some("not_found"));
    assert_eq!(second.fields.agent.as_deref(), Some("inventory"));

    let mut with_noise = lines.clone();
    with_noise.push("not json".to_string());
    let summary = summarize_telemetry_lines(with_noise, 100);
    assert_eq!(summary.parsed_events, 2);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.unique_runs.len(), 1);
    assert!(summary.unique_conversations.contains("c1"));
    assert_eq!(summary.command_counts.get("tools.call"), Some(&2));

    let stats = &summary.tools[GET_ORDER_TOOL_NAME];
    assert_eq!(stats.requested, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 0);
    assert_eq!(stats.failure_kinds.get("not_found"), Some(&1));
}

#[test]
fn telemetry_report_breaks_down_stages_and_tools() {
    let record = |event: TelemetryEvent, fields: EventFields| {
        serde_json::to_string(&TelemetryRecord {
            ts_unix_ms: 1_700_000_000_000,
            event: event.name().to_string(),
            run_id: "run-1".to_string(),
            command: "ask".to_string(),
            fields,
        })
        .expect("record should serialize")
    };
    let scope = |stage: usize, agent: &str| EventFields::conversation("conv-9").stage(stage, agent);

    let lines = vec![
        record(TelemetryEvent::PipelineStarted, EventFields::conversation("conv-9")),
        record(
            TelemetryEvent::StageCompleted,
            scope(1, "consultant").elapsed(Duration::from_millis(40)),
        ),
        record(
            TelemetryEvent::StageCompleted,
            scope(1, "consultant").elapsed(Duration::from_millis(60)),
        ),
        record(
            TelemetryEvent::StageFailed,
            scope(2, "inventory").failure("stage_error", "model call failed"),
        ),
        record(
            TelemetryEvent::ToolSucceeded,
            scope(3, "order").tool(CREATE_ORDER_TOOL_NAME, "mcp"),
        ),
        json!({ "ts_unix_ms": 1, "event": "custom.event", "run_id": "run-2", "command": "ask" })
            .to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parsed_events, 6);
    assert_eq!(summary.pipelines_started, 1);
    assert_eq!(summary.stages_completed(), 2);
    assert_eq!(summary.stages_failed(), 1);
    assert_eq!(summary.stages[&1].average_elapsed_ms(), Some(50));
    assert_eq!(summary.stages[&2].average_elapsed_ms(), None);
    assert_eq!(summary.tools[CREATE_ORDER_TOOL_NAME].succeeded, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.last_event_ts_unix_ms, Some(1_700_000_000_000));

    let report = render_telemetry_report("events.jsonl", &summary);
    assert!(report.contains("- stage 1 (consultant): completed=2 failed=0 avg=50ms"));
    assert!(report.contains("- stage 2 (inventory): completed=0 failed=1 avg=-"));
    assert!(report.contains("- create_order: requested=0 succeeded=1 failed=0 served=0"));
    assert!(report.contains("- ask: 6"));
}

#[test]
fn telemetry_event_names_round_trip() {
    for event in TelemetryEvent::ALL {
        assert_eq!(TelemetryEvent::from_name(event.name()), Some(event));
    }
    assert_eq!(TelemetryEvent::from_name("custom.event"), None);
}

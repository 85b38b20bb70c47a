use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::{AgentExecutor, AgentProfile, TaskPrompt};
use crate::config::RuntimeConfig;
use crate::provider::{ChatModel, TokenUsage, resolve_model};
use crate::telemetry::{EventFields, TelemetryEvent, TelemetrySink};
use crate::tools::orders::DEFAULT_CUSTOMER_NAME;
use crate::tools::{ToolBackend, build_tool_backend};

pub const MISSING_FINAL_RESPONSE: &str = "Could not extract a final response from the pipeline.";
pub const STAGE_COUNT: usize = 4;

const JSON_ONLY_RULES: &str = "IMPORTANT:\n\
    - Your reply MUST be a plain JSON object. Do NOT wrap it in markdown such as ```json or ```.\n\
    - Return only the JSON object with the fields described, with no text before or after it.";

/// Caller-supplied conversation facts, fixed for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub customer_name: String,
    pub previous_interactions: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawConversationContext {
    #[serde(default)]
    conversation_id: Option<Value>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    previous_interactions: Option<String>,
}

impl ConversationContext {
    pub fn new(
        conversation_id: Option<String>,
        customer_name: Option<String>,
        previous_interactions: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            customer_name: customer_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_CUSTOMER_NAME.to_string()),
            previous_interactions: previous_interactions.unwrap_or_default(),
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(
            cfg.conversation_id.clone(),
            cfg.customer_name.clone(),
            cfg.previous_interactions.clone(),
        )
    }

    /// Parses the `initial_context_data` JSON object. Unknown keys are ignored.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::new(None, None, None));
        }
        let parsed = serde_json::from_str::<RawConversationContext>(raw)
            .map_err(|err| anyhow::anyhow!("invalid JSON for initial_context_data: {err}"))?;
        let conversation_id = match parsed.conversation_id {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        Ok(Self::new(
            conversation_id,
            parsed.customer_name,
            parsed.previous_interactions,
        ))
    }

    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub customer_response: String,
    pub task1_output: String,
    pub task2_output: String,
    pub task3_output: String,
    pub token_usage: TokenUsage,
}

pub fn stage_failure_placeholder(stage: usize, err: &anyhow::Error) -> String {
    format!("Task {stage} failed: {err:#}")
}

fn analyze_request_task(customer_input: &str, context_json: &str) -> TaskPrompt {
    TaskPrompt {
        description: format!(
            "Carefully analyze the customer's request: '{customer_input}'.\n\
             Identify the key information:\n\
             1. The product or product type the customer is interested in.\n\
             2. The customer's main intent (asking for information, checking stock, asking the \
             price, wanting to place an order).\n\
             3. Any other specific details (color, storage capacity, etc.).\n\n\
             Based on the analysis, prepare a clear summary.\n\
             Combine it with the conversation context when present: {context_json}\n\
             - If the customer says \"want to buy\", \"order\", \"purchase\" or similar, treat it \
             as an intent to place an order (requires_order_placement=true).\n\n\
             {JSON_ONLY_RULES}"
        ),
        expected_output: "A plain JSON object (not wrapped in markdown) containing: \
             'product_details': (string) the product the customer is interested in \
             (e.g. 'iPhone 13 128GB blue'), \
             'customer_intent': (string) the intent (e.g. 'check_inventory_price', 'place_order', \
             'general_query'), \
             'original_query': (string) the customer's original message, \
             'requires_inventory_check': (boolean) whether stock or price must be checked, \
             'requires_order_placement': (boolean) whether the customer wants to place an order."
            .to_string(),
        context: Vec::new(),
    }
}

fn check_inventory_task(context_json: &str, context: Vec<String>) -> TaskPrompt {
    TaskPrompt {
        description: format!(
            "Based on the analysis from Task 1 (especially 'product_details' and \
             'requires_inventory_check'):\n\
             - If 'requires_inventory_check' is true and 'product_details' has information:\n  \
             use the get_product_info tool to check the stock and price of the product, \
             providing:\n  \
             - product: the product name from Task 1 (e.g. 'iPhone 15 Pro Max').\n  \
             - storage: the storage capacity, if mentioned (e.g. '256GB').\n  \
             - color: the color, if mentioned (e.g. 'Titan tự nhiên').\n\
             - If 'requires_inventory_check' is false or there is no clear product information:\n  \
             report that no inventory check was needed or that information was insufficient, \
             with stock_status 'not_checked'.\n\
             Conversation context: {context_json}\n\n\
             {JSON_ONLY_RULES}"
        ),
        expected_output: "A plain JSON object (not wrapped in markdown) containing: \
             'product_name': (string) the product that was checked, \
             'stock_status': (string) 'in_stock', 'out_of_stock', 'low_stock' or 'not_checked', \
             'price': (number) the product price (if checked), \
             'message': (string) an additional note (e.g. 'Not enough information to check')."
            .to_string(),
        context,
    }
}

fn place_order_task(context_json: &str, context: Vec<String>) -> TaskPrompt {
    TaskPrompt {
        description: format!(
            "Based on the analysis from Task 1 ('customer_intent', 'requires_order_placement', \
             'product_details') and the inventory check from Task 2 ('stock_status', 'price'):\n\
             - If 'requires_order_placement' is true, the product is available ('in_stock' or \
             'low_stock') and there is enough information:\n  \
             1. Generate a unique `order_id` for the order (for example a UUID string).\n  \
             2. Build a JSON object for the order containing:\n     \
             - `order_id`: (string) the generated id.\n     \
             - `product`: (string) the product name from Task 2.\n     \
             - `quantity`: (number) 1 by default, or what the customer asked for.\n     \
             - `total_price`: (number) the price from Task 2 multiplied by the quantity.\n     \
             - `customer_info`: an object with `customer_name` and `conversation_id` taken from \
             the conversation context: {context_json}\n  \
             3. Call the create_order tool with that object as `order_details`.\n  \
             4. Set `order_created` to true.\n\
             - If the order cannot be placed (the customer does not want to order, the product \
             is out of stock, information is missing):\n  \
             set `order_created` to false and explain why in `message`.\n\n\
             {JSON_ONLY_RULES}"
        ),
        expected_output: "A plain JSON object (not wrapped in markdown) containing: \
             'order_created': (boolean) whether the order was created, \
             'order_details': (object) the order details if it was created, \
             'message': (string) a note about the order status. \
             Example: {\"order_created\": true, \"order_details\": {\"order_id\": \
             \"a1b2c3d4-e5f6-7890-1234-567890abcdef\", \"product\": \"iPhone 15 Pro Max 256GB \
             Natural Titanium\", \"quantity\": 1, \"total_price\": 32990000, \"customer_info\": \
             {\"conversation_id\": \"12345\", \"customer_name\": \"Nguyen Van A\"}}, \
             \"message\": \"Order has been created.\"}"
            .to_string(),
        context,
    }
}

fn final_response_task(
    customer_input: &str,
    context_json: &str,
    context: Vec<String>,
) -> TaskPrompt {
    TaskPrompt {
        description: format!(
            "Combine everything from the previous steps into the final answer for the customer.\n\
             - Using Task 1 ('customer_intent', 'product_details'), Task 2 ('stock_status', \
             'price') and Task 3 ('order_created', 'message'):\n  \
             1. If the order was created ('order_created' is true): confirm the order with the \
             product, the price and any details from Task 3.\n  \
             2. If no order was placed: explain why (out of stock, missing information, the \
             customer did not want to order, ...) based on Task 3's 'message' or earlier tasks.\n  \
             3. If the customer only asked for information or a price: answer clearly about the \
             product, its stock status and price (from Task 2).\n\
             - Keep the answer friendly, easy to understand and suited to the customer.\n\
             - Use the conversation context to personalize the answer (for example, address the \
             customer by name): {context_json}\n\n\
             Write a complete, friendly and accurate reply to the customer's original message: \
             '{customer_input}'.\n\
             If anything is unclear, explain it politely. Reply in the customer's language."
        ),
        expected_output: "A single natural-language string: the final reply to send to the \
             customer."
            .to_string(),
        context,
    }
}

/// Runs the four sales stages in order: analyze, check inventory, place order, respond.
#[derive(Clone)]
pub struct SalesPipeline {
    executor: AgentExecutor,
    consultant: AgentProfile,
    inventory: AgentProfile,
    order: AgentProfile,
    telemetry: TelemetrySink,
}

impl SalesPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<dyn ToolBackend>,
        cfg: &RuntimeConfig,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            executor: AgentExecutor::new(
                model,
                tools,
                telemetry.clone(),
                cfg.agent_max_iterations,
            ),
            consultant: AgentProfile::consultant(cfg.temperature),
            inventory: AgentProfile::inventory(cfg.temperature),
            order: AgentProfile::order(cfg.temperature),
            telemetry,
        }
    }

    pub async fn run(&self, customer_input: &str, context: &ConversationContext) -> PipelineOutput {
        let started = Instant::now();
        let context_json = context.to_prompt_json();
        let mut usage = TokenUsage::default();
        let mut outputs: Vec<String> = Vec::with_capacity(STAGE_COUNT);
        let mut failed_stages = 0usize;

        tracing::info!(
            conversation_id = %context.conversation_id,
            customer = %context.customer_name,
            model = self.executor.model_name(),
            tool_transport = self.executor.tool_transport(),
            "pipeline started"
        );
        self.telemetry.emit(
            TelemetryEvent::PipelineStarted,
            EventFields::conversation(&context.conversation_id)
                .detail("query_chars", customer_input.chars().count()),
        );

        let mut final_response = None;
        for stage in 1..=STAGE_COUNT {
            let (agent, task) = match stage {
                1 => (
                    &self.consultant,
                    analyze_request_task(customer_input, &context_json),
                ),
                2 => (
                    &self.inventory,
                    check_inventory_task(&context_json, outputs.clone()),
                ),
                3 => (&self.order, place_order_task(&context_json, outputs.clone())),
                _ => (
                    &self.consultant,
                    final_response_task(customer_input, &context_json, outputs.clone()),
                ),
            };

            let stage_started = Instant::now();
            let scope =
                EventFields::conversation(&context.conversation_id).stage(stage, agent.role.name());
            match self
                .executor
                .execute_scoped(agent, &task, &mut usage, &scope)
                .await
            {
                Ok(text) => {
                    let parsed = parse_stage_json(&text);
                    if stage < STAGE_COUNT && parsed.is_none() {
                        tracing::warn!(stage, agent = agent.role.name(), "stage output is not a JSON object");
                    }
                    tracing::info!(
                        stage,
                        agent = agent.role.name(),
                        elapsed_ms = stage_started.elapsed().as_millis() as u64,
                        "pipeline stage completed"
                    );
                    self.telemetry.emit(
                        TelemetryEvent::StageCompleted,
                        scope
                            .elapsed(stage_started.elapsed())
                            .detail("parsed_json", parsed.is_some()),
                    );
                    if stage == STAGE_COUNT {
                        final_response = Some(text);
                    } else {
                        outputs.push(text);
                    }
                }
                Err(err) => {
                    failed_stages += 1;
                    tracing::error!(stage, agent = agent.role.name(), error = %err, "pipeline stage failed");
                    self.telemetry.emit(
                        TelemetryEvent::StageFailed,
                        scope
                            .elapsed(stage_started.elapsed())
                            .failure("stage_error", format!("{err:#}")),
                    );
                    if stage < STAGE_COUNT {
                        outputs.push(stage_failure_placeholder(stage, &err));
                    }
                }
            }
        }

        let customer_response = final_response
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| {
                tracing::warn!("no final response produced");
                MISSING_FINAL_RESPONSE.to_string()
            });

        let mut stage_outputs = outputs.into_iter();
        let output = PipelineOutput {
            customer_response,
            task1_output: stage_outputs.next().unwrap_or_default(),
            task2_output: stage_outputs.next().unwrap_or_default(),
            task3_output: stage_outputs.next().unwrap_or_default(),
            token_usage: usage,
        };

        tracing::info!(
            conversation_id = %context.conversation_id,
            failed_stages,
            total_tokens = usage.total_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        self.telemetry.emit(
            TelemetryEvent::PipelineCompleted,
            EventFields::conversation(&context.conversation_id)
                .elapsed(started.elapsed())
                .detail("failed_stages", failed_stages)
                .detail("total_tokens", usage.total_tokens)
                .detail("successful_requests", usage.successful_requests),
        );

        output
    }
}

fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (idx, &byte) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=idx];
                        if serde_json::from_str::<Value>(candidate).is_ok() {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// Best-effort extraction of the JSON object a stage was asked to return.
pub fn parse_stage_json(text: &str) -> Option<Value> {
    let cleaned = strip_think_blocks(text);
    let cleaned = cleaned
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }

    first_json_object(cleaned).and_then(|candidate| serde_json::from_str::<Value>(candidate).ok())
}

pub async fn build_pipeline(cfg: &RuntimeConfig, telemetry: &TelemetrySink) -> Result<SalesPipeline> {
    let model = resolve_model(cfg)?;
    let tools = build_tool_backend(cfg).await?;
    Ok(SalesPipeline::new(model, tools, cfg, telemetry.clone()))
}

pub async fn run_ask(cfg: &RuntimeConfig, message: &str, telemetry: &TelemetrySink) -> Result<()> {
    let message = message.trim();
    if message.is_empty() {
        return Err(anyhow::anyhow!("message cannot be empty"));
    }
    if message.chars().count() > cfg.max_query_chars {
        return Err(anyhow::anyhow!(
            "message cannot be longer than {} characters",
            cfg.max_query_chars
        ));
    }

    let pipeline = build_pipeline(cfg, telemetry).await?;
    let context = ConversationContext::from_config(cfg);
    let output = pipeline.run(message, &context).await;

    println!("Conversation: {}", context.conversation_id);
    println!("\n[task 1: analyze request]\n{}", output.task1_output);
    println!("\n[task 2: check inventory]\n{}", output.task2_output);
    println!("\n[task 3: place order]\n{}", output.task3_output);
    println!("\n[response]\n{}", output.customer_response);
    println!(
        "\nTokens: total={} prompt={} cached={} completion={} requests={}",
        output.token_usage.total_tokens,
        output.token_usage.prompt_tokens,
        output.token_usage.cached_prompt_tokens,
        output.token_usage.completion_tokens,
        output.token_usage.successful_requests
    );
    Ok(())
}

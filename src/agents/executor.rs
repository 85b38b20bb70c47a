use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::error::{ToolError, ToolErrorKind};
use crate::provider::{ChatMessage, ChatModel, ChatRequest, TokenUsage, ToolCall};
use crate::telemetry::{EventFields, TelemetryEvent, TelemetrySink};
use crate::tools::{ToolBackend, ToolOutcome, tool_definitions_for};

use super::roles::AgentProfile;

/// Prompt for one unit of agent work.
#[derive(Debug, Clone)]
pub struct TaskPrompt {
    pub description: String,
    pub expected_output: String,
    pub context: Vec<String>,
}

impl TaskPrompt {
    pub fn render(&self) -> String {
        let mut prompt = format!(
            "Current task: {}\n\nThis is the expected criteria for your final answer: {}\n\
             You MUST return the actual complete content as the final answer, not a summary.",
            self.description.trim(),
            self.expected_output.trim()
        );

        if !self.context.is_empty() {
            prompt.push_str(
                "\n\nThis is the context you're working with (outputs of previous tasks):\n",
            );
            prompt.push_str(&self.context.join("\n\n----------\n\n"));
        }

        prompt.push_str("\n\nBegin! This is VERY important to you, use the tools available and give your best Final Answer.");
        prompt
    }
}

/// Runs the model/tool loop for one agent on one task.
#[derive(Clone)]
pub struct AgentExecutor {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolBackend>,
    telemetry: TelemetrySink,
    max_iterations: usize,
}

impl AgentExecutor {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<dyn ToolBackend>,
        telemetry: TelemetrySink,
        max_iterations: usize,
    ) -> Self {
        Self {
            model,
            tools,
            telemetry,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn tool_transport(&self) -> &'static str {
        self.tools.transport_name()
    }

    /// Returns the agent's final text. Token usage is added to `usage` even when the run fails.
    pub async fn execute(
        &self,
        agent: &AgentProfile,
        task: &TaskPrompt,
        usage: &mut TokenUsage,
    ) -> Result<String> {
        self.execute_scoped(agent, task, usage, &EventFields::default()).await
    }

    /// Like `execute`, tagging tool telemetry with `scope` (conversation and stage).
    pub async fn execute_scoped(
        &self,
        agent: &AgentProfile,
        task: &TaskPrompt,
        usage: &mut TokenUsage,
        scope: &EventFields,
    ) -> Result<String> {
        let mut messages = vec![
            ChatMessage::system(agent.system_prompt()),
            ChatMessage::user(task.render()),
        ];
        let definitions = tool_definitions_for(&agent.tools);

        for iteration in 1..=self.max_iterations {
            let response = self
                .model
                .complete(ChatRequest {
                    messages: messages.clone(),
                    tools: definitions.clone(),
                    temperature: agent.temperature,
                })
                .await
                .with_context(|| format!("{} agent model call failed", agent.role.name()))?;
            usage.add(&response.usage);

            if response.tool_calls.is_empty() {
                let text = response.content.unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    return Err(anyhow::anyhow!(
                        "{} agent returned an empty answer",
                        agent.role.name()
                    ));
                }
                tracing::debug!(agent = agent.role.name(), iteration, "agent produced final answer");
                return Ok(text);
            }

            messages.push(ChatMessage::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let outcome = self.dispatch_tool_call(agent, call, scope).await;
                messages.push(ChatMessage::tool_result(&call.id, outcome.to_model_text()));
            }
        }

        Err(anyhow::anyhow!(
            "{} agent exceeded {} model iterations without a final answer",
            agent.role.name(),
            self.max_iterations
        ))
    }

    async fn dispatch_tool_call(
        &self,
        agent: &AgentProfile,
        call: &ToolCall,
        scope: &EventFields,
    ) -> ToolOutcome {
        let tool = call.function.name.as_str();
        let fields = scope
            .clone()
            .agent(agent.role.name())
            .tool(tool, self.tool_transport());
        self.telemetry.emit(TelemetryEvent::ToolRequested, fields.clone());

        let outcome = if !agent.is_bound(tool) {
            ToolOutcome::Error(ToolError::new(
                ToolErrorKind::UnknownTool,
                format!("tool '{tool}' is not available to the {} agent", agent.role.name()),
            ))
        } else {
            match parse_tool_arguments(&call.function.arguments) {
                Ok(arguments) => self.tools.call(tool, arguments).await,
                Err(err) => ToolOutcome::Error(err),
            }
        };

        match &outcome {
            ToolOutcome::Success { .. } => {
                tracing::info!(agent = agent.role.name(), tool, "tool call succeeded");
                self.telemetry.emit(TelemetryEvent::ToolSucceeded, fields);
            }
            ToolOutcome::Error(err) => {
                tracing::warn!(
                    agent = agent.role.name(),
                    tool,
                    kind = err.kind.label(),
                    error = %err.message,
                    "tool call failed"
                );
                self.telemetry.emit(
                    TelemetryEvent::ToolFailed,
                    fields.failure(err.kind.label(), err.message.clone()),
                );
            }
        }

        outcome
    }
}

/// Tool arguments arrive as a JSON string; an empty string means no arguments.
pub fn parse_tool_arguments(raw: &str) -> Result<Value, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str::<Value>(raw)
        .map_err(|err| ToolError::invalid_input(format!("tool arguments are not valid JSON: {err}")))
}

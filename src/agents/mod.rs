//! Sales agents.
//!
//! - `roles`: the consultant, inventory and order roles and the tools bound to each
//! - `executor`: the model/tool-calling loop that runs one agent on one task

pub mod executor;
pub mod roles;

pub use executor::{AgentExecutor, TaskPrompt, parse_tool_arguments};
pub use roles::{AgentProfile, AgentRole, DEFAULT_AGENT_TEMPERATURE};

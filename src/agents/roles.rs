use crate::tools::{CREATE_ORDER_TOOL_NAME, GET_PRODUCT_INFO_TOOL_NAME};

pub const DEFAULT_AGENT_TEMPERATURE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Consultant,
    Inventory,
    Order,
}

impl AgentRole {
    pub fn name(self) -> &'static str {
        match self {
            AgentRole::Consultant => "consultant",
            AgentRole::Inventory => "inventory",
            AgentRole::Order => "order",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            AgentRole::Consultant => "Customer consultant",
            AgentRole::Inventory => "Inventory checker",
            AgentRole::Order => "Order placement",
        }
    }

    pub fn goal(self) -> &'static str {
        match self {
            AgentRole::Consultant => {
                "Answer customer questions and provide product information"
            }
            AgentRole::Inventory => "Check stock levels and prices of products",
            AgentRole::Order => "Create orders based on customer requests",
        }
    }

    pub fn backstory(self) -> &'static str {
        match self {
            AgentRole::Consultant => {
                "You are a dedicated sales assistant who always gives customers the best support."
            }
            AgentRole::Inventory => {
                "You are an inventory specialist who provides accurate stock information."
            }
            AgentRole::Order => "You process orders quickly and accurately.",
        }
    }

    pub fn default_tools(self) -> &'static [&'static str] {
        match self {
            AgentRole::Consultant => &[],
            AgentRole::Inventory => &[GET_PRODUCT_INFO_TOOL_NAME],
            AgentRole::Order => &[CREATE_ORDER_TOOL_NAME],
        }
    }
}

/// One configured agent: a role, its sampling temperature and the tools it may call.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub temperature: f32,
    pub tools: Vec<&'static str>,
}

impl AgentProfile {
    pub fn new(role: AgentRole, temperature: f32) -> Self {
        Self {
            role,
            temperature,
            tools: role.default_tools().to_vec(),
        }
    }

    pub fn consultant(temperature: f32) -> Self {
        Self::new(AgentRole::Consultant, temperature)
    }

    pub fn inventory(temperature: f32) -> Self {
        Self::new(AgentRole::Inventory, temperature)
    }

    pub fn order(temperature: f32) -> Self {
        Self::new(AgentRole::Order, temperature)
    }

    pub fn is_bound(&self, tool_name: &str) -> bool {
        self.tools.contains(&tool_name)
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "You are {}. {}\n\nYour personal goal is: {}\n\n\
             Use only the tools you have been given, and only when the task calls for them. \
             When you have the final answer, reply with it directly.",
            self.role.title(),
            self.role.backstory(),
            self.role.goal()
        )
    }
}

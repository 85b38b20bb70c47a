use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolTransport {
    Remote,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum ServerCommands {
    #[command(about = "Run the HTTP chat endpoint (GET /chat, GET /healthz)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 2206)]
        port: u16,
    },
}

#[derive(Debug, Subcommand)]
pub enum ToolCommands {
    #[command(about = "Run the tool server (create_order, get_order, get_product_info)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    #[command(about = "List tool definitions exposed by the configured transport")]
    List,
    #[command(about = "Invoke a tool directly with JSON arguments")]
    Call {
        name: String,
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommands {
    #[command(about = "Insert products from a JSON array file into the catalog")]
    Seed {
        #[arg(long, default_value = "storage/inventory.json")]
        path: String,
    },
    #[command(about = "Search the catalog by case-insensitive substring")]
    Search {
        product: String,
        #[arg(long)]
        storage: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum OrderCommands {
    #[command(about = "Print a persisted order file by order id")]
    Show { order_id: String },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  sales-crew tools serve --port 8000\n\
  sales-crew ask \"I want to buy an iPhone 15 Pro Max 256GB, is it in stock?\"\n\
  sales-crew --customer-name \"Jane Doe\" --conversation-id 12345 ask \"How much is the iPad Air?\"\n\
  sales-crew --tool-transport local ask \"Order one Galaxy S24 please\"\n\
  sales-crew server serve --port 2206\n\
  sales-crew catalog seed --path storage/inventory.json\n\
  sales-crew catalog search iphone --storage 256GB\n\
  sales-crew tools call get_product_info --args '{\"product\":\"iPhone\"}'\n\
  sales-crew orders show a1b2c3d4\n\
  sales-crew telemetry report --limit 2000";

#[derive(Debug, Parser)]
#[command(name = "sales-crew")]
#[command(about = "Sequential multi-agent sales assistant: inventory, orders and replies")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "SALES_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "SALES_CONFIG", default_value = ".sales-crew/config.toml")]
    pub config_path: String,

    #[arg(long, env = "SALES_LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    #[arg(long, env = "SALES_LLM_MODEL")]
    pub llm_model: Option<String>,

    #[arg(long, env = "SALES_TEMPERATURE")]
    pub temperature: Option<f32>,

    #[arg(long, env = "SALES_TOP_P")]
    pub top_p: Option<f32>,

    #[arg(long, env = "SALES_SEED")]
    pub seed: Option<u64>,

    #[arg(long, env = "SALES_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    #[arg(long, env = "SALES_LLM_TIMEOUT_SECS")]
    pub llm_timeout_secs: Option<u64>,

    #[arg(long, env = "SALES_AGENT_MAX_ITERATIONS")]
    pub agent_max_iterations: Option<usize>,

    #[arg(long, env = "SALES_TOOL_TRANSPORT", value_enum)]
    pub tool_transport: Option<ToolTransport>,

    #[arg(long, env = "SALES_TOOL_SERVER_URL")]
    pub tool_server_url: Option<String>,

    #[arg(long, env = "SALES_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "SALES_ORDERS_DIR")]
    pub orders_dir: Option<String>,

    #[arg(long, env = "SALES_CATALOG_BACKEND", value_enum)]
    pub catalog_backend: Option<CatalogBackend>,

    #[arg(long, env = "SALES_CATALOG_PATH")]
    pub catalog_path: Option<String>,

    #[arg(long, env = "SALES_CATALOG_DB_URL")]
    pub catalog_db_url: Option<String>,

    #[arg(long, env = "SALES_CONVERSATION_ID")]
    pub conversation_id: Option<String>,

    #[arg(long, env = "SALES_CUSTOMER_NAME")]
    pub customer_name: Option<String>,

    #[arg(long, env = "SALES_PREVIOUS_INTERACTIONS")]
    pub previous_interactions: Option<String>,

    #[arg(long, env = "SALES_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "SALES_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "SALES_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the four-stage pipeline for one customer message")]
    Ask {
        #[arg(required = true)]
        message: Vec<String>,
    },
    #[command(about = "HTTP chat endpoint")]
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
    #[command(about = "Tool server and direct tool invocation")]
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },
    #[command(about = "Product catalog maintenance")]
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
    #[command(about = "Inspect persisted orders")]
    Orders {
        #[command(subcommand)]
        command: OrderCommands,
    },
    #[command(about = "Validate LLM, tool transport and catalog configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Server { command } => match command {
            ServerCommands::Serve { .. } => "server.serve".to_string(),
        },
        Commands::Tools { command } => match command {
            ToolCommands::Serve { .. } => "tools.serve".to_string(),
            ToolCommands::List => "tools.list".to_string(),
            ToolCommands::Call { .. } => "tools.call".to_string(),
        },
        Commands::Catalog { command } => match command {
            CatalogCommands::Seed { .. } => "catalog.seed".to_string(),
            CatalogCommands::Search { .. } => "catalog.search".to_string(),
        },
        Commands::Orders { command } => match command {
            OrderCommands::Show { .. } => "orders.show".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use sales_crew::cli::{
    CatalogCommands, Cli, Commands, OrderCommands, ProfileCommands, ServerCommands,
    TelemetryCommands, ToolCommands, command_label,
};
use sales_crew::config::{
    load_profiles, resolve_runtime_config, run_profiles_list, run_profiles_show,
};
use sales_crew::doctor::run_doctor;
use sales_crew::error::{categorize_error, format_cli_error};
use sales_crew::pipeline::run_ask;
use sales_crew::server::run_server;
use sales_crew::telemetry::{
    EventFields, TelemetryEvent, TelemetrySink, run_telemetry_report,
};
use sales_crew::tools::catalog::{run_catalog_search, run_catalog_seed};
use sales_crew::tools::orders::run_orders_show;
use sales_crew::tools::server::run_tool_server;
use sales_crew::tools::{run_tools_call, run_tools_list};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let label = command_label(&cli.command);
    let telemetry = TelemetrySink::new(&cfg, label.clone());
    let started_at = Instant::now();

    let result = match cli.command {
        Commands::Ask { message } => run_ask(&cfg, &message.join(" "), &telemetry).await,
        Commands::Server { command } => match command {
            ServerCommands::Serve { host, port } => {
                run_server(cfg.clone(), host, port, &telemetry).await
            }
        },
        Commands::Tools { command } => match command {
            ToolCommands::Serve { host, port } => {
                run_tool_server(&cfg, host, port, &telemetry).await
            }
            ToolCommands::List => run_tools_list(&cfg).await,
            ToolCommands::Call { name, args } => run_tools_call(&cfg, &name, &args).await,
        },
        Commands::Catalog { command } => match command {
            CatalogCommands::Seed { path } => run_catalog_seed(&cfg, &path).await,
            CatalogCommands::Search {
                product,
                storage,
                color,
            } => {
                run_catalog_search(&cfg, &product, storage.as_deref(), color.as_deref()).await
            }
        },
        Commands::Orders { command } => match command {
            OrderCommands::Show { order_id } => run_orders_show(&cfg, &order_id),
        },
        Commands::Doctor => run_doctor(&cfg).await,
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg),
            ProfileCommands::Show => run_profiles_show(&cfg),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)
            }
        },
    };

    let fields = EventFields::conversation(cfg.conversation_id.clone().unwrap_or_default())
        .elapsed(started_at.elapsed());
    match &result {
        Ok(()) => telemetry.emit(TelemetryEvent::CommandCompleted, fields),
        Err(err) => telemetry.emit(
            TelemetryEvent::CommandFailed,
            fields.failure(categorize_error(err).code(), format!("{err:#}")),
        ),
    }

    result
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

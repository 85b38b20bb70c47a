use std::path::Path;

use anyhow::Result;

use crate::cli::{CatalogBackend, ToolTransport};
use crate::config::{DEFAULT_LLM_BASE_URL, RuntimeConfig, display_catalog_db_url};
use crate::provider::{API_KEY_ENV_VARS, env_present};
use crate::tools::catalog::build_product_store;
use crate::tools::remote::RemoteToolClient;

fn count_order_files(dir: &Path) -> Option<usize> {
    let entries = std::fs::read_dir(dir).ok()?;
    Some(
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("order_") && name.ends_with(".json"))
            .count(),
    )
}

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    println!("LLM environment check:");
    for key in API_KEY_ENV_VARS {
        let status = if env_present(key) { "set" } else { "missing" };
        println!("- {key}: {status}");
    }
    let key_present = API_KEY_ENV_VARS.iter().any(|key| env_present(key));
    if !key_present && cfg.llm_base_url == DEFAULT_LLM_BASE_URL {
        println!("Tip: export SALES_LLM_API_KEY or point --llm-base-url at a self-hosted server");
    }

    println!(
        "Model: {} at {} (temperature={}, top_p={}, seed={}, timeout_secs={}, max_iterations={})",
        cfg.llm_model,
        cfg.llm_base_url,
        cfg.temperature,
        cfg.top_p,
        cfg.seed,
        cfg.llm_timeout_secs,
        cfg.agent_max_iterations
    );

    match cfg.tool_transport {
        ToolTransport::Local => println!("Tools: local (in-process)"),
        ToolTransport::Remote => {
            let client = RemoteToolClient::new(&cfg.tool_server_url, cfg.tool_timeout_secs)?;
            match client.health().await {
                Ok(tools) => println!(
                    "Tools: MCP server ok ({}, {tools} tools)",
                    client.endpoint()
                ),
                Err(err) => {
                    println!("Tools: MCP server unreachable ({}): {err:#}", client.endpoint());
                    println!("Tip: start it with `sales-crew tools serve` or use --tool-transport local");
                }
            }
        }
    }

    let store = build_product_store(cfg).await?;
    let products = store.count_products().await?;
    match cfg.catalog_backend {
        CatalogBackend::Memory => println!(
            "Catalog: memory, {} product(s) loaded from {}",
            products, cfg.catalog_path
        ),
        CatalogBackend::Sqlite => println!(
            "Catalog: sqlite, {} product(s) in {}",
            products,
            display_catalog_db_url(cfg)
        ),
    }

    match count_order_files(Path::new(&cfg.orders_dir)) {
        Some(count) => println!("Orders: {} order file(s) in {}", count, cfg.orders_dir),
        None => println!(
            "Orders: directory {} does not exist yet (created on first order)",
            cfg.orders_dir
        ),
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}

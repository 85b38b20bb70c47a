use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::DEFAULT_AGENT_TEMPERATURE;
use crate::cli::*;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TOOL_SERVER_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
    pub max_tokens: Option<u32>,
    pub llm_timeout_secs: u64,
    pub agent_max_iterations: usize,
    pub tool_transport: ToolTransport,
    pub tool_server_url: String,
    pub tool_timeout_secs: u64,
    pub orders_dir: String,
    pub catalog_backend: CatalogBackend,
    pub catalog_path: String,
    pub catalog_db_url: String,
    pub conversation_id: Option<String>,
    pub customer_name: Option<String>,
    pub previous_interactions: Option<String>,
    pub show_sensitive_config: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub max_query_chars: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub max_tokens: Option<u32>,
    pub llm_timeout_secs: Option<u64>,
    pub agent_max_iterations: Option<usize>,
    pub tool_transport: Option<ToolTransport>,
    pub tool_server_url: Option<String>,
    pub tool_timeout_secs: Option<u64>,
    pub orders_dir: Option<String>,
    pub catalog_backend: Option<CatalogBackend>,
    pub catalog_path: Option<String>,
    pub catalog_db_url: Option<String>,
    pub customer_name: Option<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check transport/catalog values and field names.",
            path.display()
        )
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        llm_base_url: non_empty(cli.llm_base_url.clone())
            .or(profile.llm_base_url)
            .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        llm_model: non_empty(cli.llm_model.clone())
            .or(profile.llm_model)
            .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        temperature: cli
            .temperature
            .or(profile.temperature)
            .unwrap_or(DEFAULT_AGENT_TEMPERATURE)
            .clamp(0.0, 2.0),
        top_p: cli.top_p.or(profile.top_p).unwrap_or(0.95).clamp(0.0, 1.0),
        seed: cli.seed.or(profile.seed).unwrap_or(42),
        max_tokens: cli.max_tokens.or(profile.max_tokens),
        llm_timeout_secs: cli
            .llm_timeout_secs
            .or(profile.llm_timeout_secs)
            .unwrap_or(120)
            .max(1),
        agent_max_iterations: cli
            .agent_max_iterations
            .or(profile.agent_max_iterations)
            .unwrap_or(8)
            .max(1),
        tool_transport: cli
            .tool_transport
            .or(profile.tool_transport)
            .unwrap_or(ToolTransport::Remote),
        tool_server_url: non_empty(cli.tool_server_url.clone())
            .or(profile.tool_server_url)
            .unwrap_or_else(|| DEFAULT_TOOL_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(30)
            .max(1),
        orders_dir: non_empty(cli.orders_dir.clone())
            .or(profile.orders_dir)
            .unwrap_or_else(|| "orders".to_string()),
        catalog_backend: cli
            .catalog_backend
            .or(profile.catalog_backend)
            .unwrap_or(CatalogBackend::Memory),
        catalog_path: non_empty(cli.catalog_path.clone())
            .or(profile.catalog_path)
            .unwrap_or_else(|| "storage/inventory.json".to_string()),
        catalog_db_url: non_empty(cli.catalog_db_url.clone())
            .or(profile.catalog_db_url)
            .unwrap_or_else(|| "sqlite://.sales-crew/catalog.db".to_string()),
        conversation_id: non_empty(cli.conversation_id.clone()),
        customer_name: non_empty(cli.customer_name.clone()).or(profile.customer_name),
        previous_interactions: non_empty(cli.previous_interactions.clone()),
        show_sensitive_config: cli.show_sensitive_config,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: non_empty(cli.telemetry_path.clone())
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".sales-crew/telemetry/events.jsonl".to_string()),
        max_query_chars: 8_000,
    })
}

pub fn display_catalog_db_url(cfg: &RuntimeConfig) -> String {
    if cfg.show_sensitive_config {
        cfg.catalog_db_url.clone()
    } else {
        format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_sqlite_url_value(&cfg.catalog_db_url)
        )
    }
}

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("LLM: base_url={} model={}", cfg.llm_base_url, cfg.llm_model);
    println!(
        "Sampling: temperature={} top_p={} seed={} max_tokens={}",
        cfg.temperature,
        cfg.top_p,
        cfg.seed,
        cfg.max_tokens
            .map(|tokens| tokens.to_string())
            .unwrap_or_else(|| "<provider-default>".to_string())
    );
    println!(
        "Agents: max_iterations={} llm_timeout_secs={}",
        cfg.agent_max_iterations, cfg.llm_timeout_secs
    );
    println!(
        "Tools: transport={:?} server_url={} timeout_secs={}",
        cfg.tool_transport, cfg.tool_server_url, cfg.tool_timeout_secs
    );
    println!("Orders dir: {}", cfg.orders_dir);
    println!(
        "Catalog: backend={:?} path={} db_url={}",
        cfg.catalog_backend,
        cfg.catalog_path,
        display_catalog_db_url(cfg)
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    Ok(())
}

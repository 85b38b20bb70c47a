use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    CommandCompleted,
    CommandFailed,
    PipelineStarted,
    PipelineCompleted,
    StageCompleted,
    StageFailed,
    ToolRequested,
    ToolSucceeded,
    ToolFailed,
    ToolServed,
    ToolServerStarted,
    ChatServerStarted,
    ChatCompleted,
}

impl TelemetryEvent {
    pub const ALL: [TelemetryEvent; 13] = [
        TelemetryEvent::CommandCompleted,
        TelemetryEvent::CommandFailed,
        TelemetryEvent::PipelineStarted,
        TelemetryEvent::PipelineCompleted,
        TelemetryEvent::StageCompleted,
        TelemetryEvent::StageFailed,
        TelemetryEvent::ToolRequested,
        TelemetryEvent::ToolSucceeded,
        TelemetryEvent::ToolFailed,
        TelemetryEvent::ToolServed,
        TelemetryEvent::ToolServerStarted,
        TelemetryEvent::ChatServerStarted,
        TelemetryEvent::ChatCompleted,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TelemetryEvent::CommandCompleted => "command.completed",
            TelemetryEvent::CommandFailed => "command.failed",
            TelemetryEvent::PipelineStarted => "pipeline.started",
            TelemetryEvent::PipelineCompleted => "pipeline.completed",
            TelemetryEvent::StageCompleted => "pipeline.stage.completed",
            TelemetryEvent::StageFailed => "pipeline.stage.failed",
            TelemetryEvent::ToolRequested => "tool.requested",
            TelemetryEvent::ToolSucceeded => "tool.succeeded",
            TelemetryEvent::ToolFailed => "tool.failed",
            TelemetryEvent::ToolServed => "tool.served",
            TelemetryEvent::ToolServerStarted => "tools.server.started",
            TelemetryEvent::ChatServerStarted => "server.started",
            TelemetryEvent::ChatCompleted => "server.chat.completed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }
}

/// Domain fields carried by an event. Everything else goes into `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl EventFields {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self::default().with_conversation(conversation_id)
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        if !conversation_id.is_empty() {
            self.conversation_id = Some(conversation_id);
        }
        self
    }

    pub fn stage(mut self, stage: usize, agent: &str) -> Self {
        self.stage = Some(stage);
        self.agent = Some(agent.to_string());
        self
    }

    pub fn agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn tool(mut self, tool: &str, transport: &str) -> Self {
        self.tool = Some(tool.to_string());
        self.transport = Some(transport.to_string());
        self
    }

    pub fn failure(mut self, kind: &str, error: impl Into<String>) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error = Some(error.into());
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// One line of the JSONL telemetry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub ts_unix_ms: u64,
    pub event: String,
    pub run_id: String,
    pub command: String,
    #[serde(flatten)]
    pub fields: EventFields,
}

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id: format!("run-{}-{}", unix_ms_now(), std::process::id()),
            command,
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            run_id: String::new(),
            command: String::new(),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn emit(&self, event: TelemetryEvent, fields: EventFields) {
        if !self.enabled {
            return;
        }

        let record = TelemetryRecord {
            ts_unix_ms: unix_ms_now(),
            event: event.name().to_string(),
            run_id: self.run_id.clone(),
            command: self.command.clone(),
            fields,
        };
        if let Err(err) = self.append(&record) {
            tracing::warn!(
                event = event.name(),
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    fn append(&self, record: &TelemetryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create telemetry directory '{}'", parent.display())
            })?;
        }

        let mut line = serde_json::to_vec(record)
            .with_context(|| format!("failed to serialize telemetry event '{}'", record.event))?;
        line.push(b'\n');

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to telemetry file '{}'", self.path.display()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageStats {
    pub agent: String,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_ms_total: u64,
}

impl StageStats {
    pub fn average_elapsed_ms(&self) -> Option<u64> {
        (self.completed > 0).then(|| self.elapsed_ms_total / self.completed as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolStats {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub served: usize,
    pub failure_kinds: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub unique_conversations: BTreeSet<String>,
    pub command_counts: BTreeMap<String, usize>,
    pub command_completed: usize,
    pub command_failed: usize,
    pub pipelines_started: usize,
    pub pipelines_completed: usize,
    pub chats_served: usize,
    pub stages: BTreeMap<usize, StageStats>,
    pub tools: BTreeMap<String, ToolStats>,
    pub last_event_ts_unix_ms: Option<u64>,
}

impl TelemetrySummary {
    pub fn stages_completed(&self) -> usize {
        self.stages.values().map(|stats| stats.completed).sum()
    }

    pub fn stages_failed(&self) -> usize {
        self.stages.values().map(|stats| stats.failed).sum()
    }

    fn record(&mut self, record: TelemetryRecord) {
        self.parsed_events += 1;
        let TelemetryRecord {
            ts_unix_ms,
            event,
            run_id,
            command,
            fields,
        } = record;

        if !run_id.is_empty() {
            self.unique_runs.insert(run_id);
        }
        if !command.is_empty() {
            *self.command_counts.entry(command).or_insert(0) += 1;
        }
        if let Some(conversation_id) = fields.conversation_id.filter(|id| !id.is_empty()) {
            self.unique_conversations.insert(conversation_id);
        }
        self.last_event_ts_unix_ms = Some(
            self.last_event_ts_unix_ms
                .map_or(ts_unix_ms, |last| last.max(ts_unix_ms)),
        );

        let Some(event) = TelemetryEvent::from_name(&event) else {
            return;
        };
        match event {
            TelemetryEvent::CommandCompleted => self.command_completed += 1,
            TelemetryEvent::CommandFailed => self.command_failed += 1,
            TelemetryEvent::PipelineStarted => self.pipelines_started += 1,
            TelemetryEvent::PipelineCompleted => self.pipelines_completed += 1,
            TelemetryEvent::ChatCompleted => self.chats_served += 1,
            TelemetryEvent::StageCompleted | TelemetryEvent::StageFailed => {
                let Some(stage) = fields.stage else {
                    return;
                };
                let stats = self.stages.entry(stage).or_default();
                if let Some(agent) = fields.agent {
                    stats.agent = agent;
                }
                if event == TelemetryEvent::StageCompleted {
                    stats.completed += 1;
                    stats.elapsed_ms_total += fields.elapsed_ms.unwrap_or_default();
                } else {
                    stats.failed += 1;
                }
            }
            TelemetryEvent::ToolRequested
            | TelemetryEvent::ToolSucceeded
            | TelemetryEvent::ToolFailed
            | TelemetryEvent::ToolServed => {
                let Some(tool) = fields.tool else {
                    return;
                };
                let stats = self.tools.entry(tool).or_default();
                match event {
                    TelemetryEvent::ToolRequested => stats.requested += 1,
                    TelemetryEvent::ToolSucceeded => stats.succeeded += 1,
                    TelemetryEvent::ToolFailed => stats.failed += 1,
                    _ => stats.served += 1,
                }
                if let Some(kind) = fields.error_kind {
                    *stats.failure_kinds.entry(kind).or_insert(0) += 1;
                }
            }
            TelemetryEvent::ToolServerStarted | TelemetryEvent::ChatServerStarted => {}
        }
    }
}

/// Folds the newest `limit` lines into per-stage and per-tool counters.
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };

    for line in lines.into_iter().rev().take(limit.max(1)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryRecord>(line) {
            Ok(record) => summary.record(record),
            Err(_) => summary.parse_errors += 1,
        }
    }

    summary
}

pub fn render_telemetry_report(path: &str, summary: &TelemetrySummary) -> String {
    let mut out = vec![
        "Telemetry report".to_string(),
        format!("Path: {path}"),
        format!("Lines in file: {}", summary.total_lines),
        format!(
            "Events analyzed: {} (parse_errors={})",
            summary.parsed_events, summary.parse_errors
        ),
        format!(
            "Unique runs: {} conversations: {}",
            summary.unique_runs.len(),
            summary.unique_conversations.len()
        ),
        format!(
            "Command outcomes: completed={} failed={}",
            summary.command_completed, summary.command_failed
        ),
        format!(
            "Pipelines: started={} completed={} chats_served={}",
            summary.pipelines_started, summary.pipelines_completed, summary.chats_served
        ),
    ];

    if !summary.stages.is_empty() {
        out.push("Stages:".to_string());
        for (stage, stats) in &summary.stages {
            let avg = stats
                .average_elapsed_ms()
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            out.push(format!(
                "- stage {stage} ({}): completed={} failed={} avg={avg}",
                if stats.agent.is_empty() { "?" } else { stats.agent.as_str() },
                stats.completed,
                stats.failed,
            ));
        }
    }

    if !summary.tools.is_empty() {
        out.push("Tools:".to_string());
        for (tool, stats) in &summary.tools {
            let mut line = format!(
                "- {tool}: requested={} succeeded={} failed={} served={}",
                stats.requested, stats.succeeded, stats.failed, stats.served
            );
            if !stats.failure_kinds.is_empty() {
                let kinds = stats
                    .failure_kinds
                    .iter()
                    .map(|(kind, count)| format!("{kind}={count}"))
                    .collect::<Vec<String>>()
                    .join(",");
                line.push_str(&format!(" errors[{kinds}]"));
            }
            out.push(line);
        }
    }

    let mut commands = summary.command_counts.iter().collect::<Vec<_>>();
    commands.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));
    if !commands.is_empty() {
        out.push("Top commands:".to_string());
        for (name, count) in commands.into_iter().take(5) {
            out.push(format!("- {name}: {count}"));
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        out.push(format!("Last event ts_unix_ms: {last_ts}"));
    }

    out.join("\n")
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let lines = io::BufReader::new(file)
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    println!("{}", render_telemetry_report(&path.display().to_string(), &summary));
    Ok(())
}

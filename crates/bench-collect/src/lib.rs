use anyhow::{Context, Result};
use bench_core::{
    atomic_write_bytes, Message, Role, TaskManifest, TASK_MANIFEST_FILE, TASK_MESSAGES_FILE,
    TASK_RESULT_FILE,
};
use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("experiment mismatch: expected {expected}, got {found}")]
    ExperimentMismatch { expected: String, found: String },
    #[error("malformed {file} in {}: {detail}", .dir.display())]
    Malformed {
        dir: PathBuf,
        file: &'static str,
        detail: String,
    },
}

fn malformed(dir: &Path, file: &'static str, detail: impl ToString) -> CollectError {
    CollectError::Malformed {
        dir: dir.to_path_buf(),
        file,
        detail: detail.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn total_prompt_tokens(&self) -> u64 {
        self.prompt_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }

    /// `prompt_total/completion`, the compact form shown in tables.
    pub fn summary(&self) -> String {
        format!("{}/{}", self.total_prompt_tokens(), self.completion_tokens)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatAnalytics {
    pub chat_depth: usize,
    pub usage: TokenUsage,
    pub tool_usage: BTreeMap<String, u64>,
}

pub fn chat_analytics(messages: &[Message]) -> ChatAnalytics {
    let mut analytics = ChatAnalytics::default();
    for message in messages.iter().filter(|m| m.role == Role::Assistant) {
        analytics.chat_depth += 1;
        if let Some(usage) = &message.usage {
            analytics.usage.prompt_tokens += usage.prompt_tokens;
            analytics.usage.completion_tokens += usage.completion_tokens;
            analytics.usage.cache_read_input_tokens += usage.cache_read_input_tokens.unwrap_or(0);
            analytics.usage.cache_creation_input_tokens +=
                usage.cache_creation_input_tokens.unwrap_or(0);
        }
        for call in message.tool_calls.iter().flatten() {
            if call.kind != "function" {
                warn!(kind = %call.kind, "unknown tool call type");
                continue;
            }
            *analytics
                .tool_usage
                .entry(call.function.name.clone())
                .or_insert(0) += 1;
        }
    }
    analytics
}

/// Returns the largest parseable JSON object embedded in `content`.
///
/// Verification output may carry log noise around the payload, so candidate
/// spans are tried from the outermost braces inward.
pub fn largest_json_object(content: &str) -> Option<Map<String, Value>> {
    let opening: Vec<usize> = content.match_indices('{').map(|(i, _)| i).collect();
    let closing: Vec<usize> = content.match_indices('}').map(|(i, _)| i).collect();
    for &start in &opening {
        for &end in closing.iter().rev() {
            if end <= start {
                break;
            }
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&content[start..=end]) {
                return Some(map);
            }
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub domain: String,
    pub task_name: String,
    pub model: String,
    pub backend_version: String,
    pub execution_time: String,
    pub date: String,
    pub chat_max_depth: usize,
    pub worked: bool,
    pub details: Value,
    pub tokens: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub chat_depth: usize,
    pub tool_usage: BTreeMap<String, u64>,
}

pub const RECORD_COLUMNS: [&str; 16] = [
    "domain",
    "task_name",
    "model",
    "backend_version",
    "execution_time",
    "date",
    "chat_max_depth",
    "worked",
    "details",
    "tokens",
    "prompt_tokens",
    "completion_tokens",
    "cache_read_input_tokens",
    "cache_creation_input_tokens",
    "chat_depth",
    "tool_usage",
];

pub fn read_manifest(task_dir: &Path) -> Result<TaskManifest, CollectError> {
    let raw = fs::read_to_string(task_dir.join(TASK_MANIFEST_FILE))
        .map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))?;
    let value: Value =
        serde_json::from_str(&raw).map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))?;
    bench_schemas::validate_value(bench_schemas::MANIFEST_SCHEMA, &value)
        .map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))?;
    serde_json::from_value(value).map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))
}

/// Builds the table row for one task directory.
///
/// The experiment tag is checked before anything else, so directories from
/// other experiments are reported as mismatches even when incomplete.
pub fn collect_task_results(task_dir: &Path, experiment: &str) -> Result<TaskRecord, CollectError> {
    let manifest = read_manifest(task_dir)?;
    if manifest.experiment != experiment {
        return Err(CollectError::ExperimentMismatch {
            expected: experiment.to_string(),
            found: manifest.experiment,
        });
    }

    let started = DateTime::parse_from_rfc3339(&manifest.started_at)
        .map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))?;
    let ended = DateTime::parse_from_rfc3339(&manifest.ended_at)
        .map_err(|e| malformed(task_dir, TASK_MANIFEST_FILE, e))?;
    let execution_secs = (ended - started).num_milliseconds() as f64 / 1000.0;

    let result_raw = fs::read_to_string(task_dir.join(TASK_RESULT_FILE))
        .map_err(|e| malformed(task_dir, TASK_RESULT_FILE, e))?;
    let mut details = largest_json_object(&result_raw)
        .ok_or_else(|| malformed(task_dir, TASK_RESULT_FILE, "no JSON object found"))?;
    let worked = match details.remove("worked") {
        Some(Value::String(flag)) => flag == "YES",
        Some(other) => {
            return Err(malformed(
                task_dir,
                TASK_RESULT_FILE,
                format!("`worked` must be a string, got {}", other),
            ))
        }
        None => return Err(malformed(task_dir, TASK_RESULT_FILE, "missing `worked`")),
    };

    let messages_raw = fs::read_to_string(task_dir.join(TASK_MESSAGES_FILE))
        .map_err(|e| malformed(task_dir, TASK_MESSAGES_FILE, e))?;
    let messages: Vec<Message> = serde_json::from_str(&messages_raw)
        .map_err(|e| malformed(task_dir, TASK_MESSAGES_FILE, e))?;
    let analytics = chat_analytics(&messages);

    let commit_prefix: String = manifest.backend_commit.chars().take(7).collect();
    Ok(TaskRecord {
        domain: manifest.domain,
        task_name: manifest.task_name,
        model: manifest.model,
        backend_version: format!("{}/{}", manifest.backend_version, commit_prefix),
        execution_time: format!("{:.1}", execution_secs),
        date: ended.format("%Y-%m-%d %H:%M:%S").to_string(),
        chat_max_depth: manifest.chat_max_depth,
        worked,
        details: Value::Object(details),
        tokens: analytics.usage.summary(),
        prompt_tokens: analytics.usage.prompt_tokens,
        completion_tokens: analytics.usage.completion_tokens,
        cache_read_input_tokens: analytics.usage.cache_read_input_tokens,
        cache_creation_input_tokens: analytics.usage.cache_creation_input_tokens,
        chat_depth: analytics.chat_depth,
        tool_usage: analytics.tool_usage,
    })
}

/// True when `task_dir` already holds a complete result for `experiment`.
pub fn is_collected(task_dir: &Path, experiment: &str) -> bool {
    collect_task_results(task_dir, experiment).is_ok()
}

#[derive(Debug, Default)]
pub struct CollectSummary {
    pub records: Vec<TaskRecord>,
    pub skipped: usize,
    pub malformed: Vec<CollectError>,
}

pub fn collect_table(workspace_dir: &Path, experiment: &str, strict: bool) -> Result<CollectSummary> {
    let mut entries: Vec<PathBuf> = fs::read_dir(workspace_dir)
        .with_context(|| format!("failed to list {}", workspace_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();

    let mut summary = CollectSummary::default();
    for task_dir in entries {
        match collect_task_results(&task_dir, experiment) {
            Ok(record) => summary.records.push(record),
            Err(err @ CollectError::ExperimentMismatch { .. }) => {
                debug!(dir = %task_dir.display(), "skipping: {}", err);
                summary.skipped += 1;
            }
            Err(err) => {
                error!("{}", err);
                if strict {
                    return Err(err.into());
                }
                summary.malformed.push(err);
            }
        }
    }
    if summary.skipped > 0 {
        info!("skipped {} tasks from other experiments", summary.skipped);
    }
    Ok(summary)
}

pub fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_json_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

pub fn render_csv(records: &[TaskRecord]) -> Result<String> {
    let mut out = RECORD_COLUMNS.join(",");
    out.push('\n');
    for record in records {
        let row = serde_json::to_value(record)?;
        let line = RECORD_COLUMNS
            .iter()
            .map(|column| csv_escape(&render_json_cell(&row[*column])))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

pub fn render_jsonl(records: &[TaskRecord]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

/// Writes `<out_dir>/<experiment>.csv` and `<out_dir>/<experiment>.jsonl`.
pub fn export_results(out_dir: &Path, experiment: &str, records: &[TaskRecord]) -> Result<Vec<PathBuf>> {
    let csv_path = out_dir.join(format!("{}.csv", experiment));
    let jsonl_path = out_dir.join(format!("{}.jsonl", experiment));
    atomic_write_bytes(&csv_path, render_csv(records)?.as_bytes())?;
    atomic_write_bytes(&jsonl_path, render_jsonl(records)?.as_bytes())?;
    Ok(vec![csv_path, jsonl_path])
}

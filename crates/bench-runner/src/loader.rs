use anyhow::{Context, Result};
use bench_collect::is_collected;
use bench_core::{BenchError, TaskSpec, VerificationMode};
use bench_schemas::{validate_value, TASK_SCHEMA};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// A validated task definition and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedTask {
    pub spec: TaskSpec,
    pub source: PathBuf,
    /// Relative file references in `spec` resolve against this directory.
    pub source_dir: PathBuf,
}

impl LoadedTask {
    pub fn name(&self) -> String {
        self.spec.task_name()
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub experiment: String,
    pub experiment_dir: PathBuf,
    pub rerun_all: bool,
    pub amount: Option<usize>,
}

fn is_task_file(path: &Path) -> bool {
    let yaml = path.extension().map(|ext| ext == "yaml").unwrap_or(false);
    let hidden = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with('_'))
        .unwrap_or(true);
    yaml && !hidden
}

/// Task files under `path`, sorted. A file path is returned as is.
pub fn discover_task_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(BenchError::Setup(format!("task path not found: {}", path.display())).into());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file() && is_task_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn yaml_to_json(raw: &str) -> Result<serde_json::Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(raw)?;
    Ok(serde_json::to_value(yaml)?)
}

fn check_referenced_files(spec: &TaskSpec, source_dir: &Path) -> Result<()> {
    let mut referenced: Vec<(&str, &str)> = Vec::new();
    if let VerificationMode::Script { script, .. } = spec.verification.mode()? {
        referenced.push(("verification script", script));
    }
    let optional = [
        ("dockerfile", &spec.dockerfile),
        ("integrations_yaml", &spec.integrations_yaml),
        ("privacy_yaml", &spec.privacy_yaml),
        ("indexing_yaml", &spec.indexing_yaml),
    ];
    for (label, value) in optional {
        if let Some(rel) = value {
            referenced.push((label, rel.as_str()));
        }
    }
    for (label, rel) in referenced {
        let path = source_dir.join(rel);
        if !path.exists() {
            return Err(BenchError::Setup(format!(
                "{} {} does not exist",
                label,
                path.display()
            ))
            .into());
        }
    }
    Ok(())
}

pub fn load_task_file(path: &Path) -> Result<LoadedTask> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read task {}", path.display()))?;
    let value = yaml_to_json(&raw)
        .with_context(|| format!("invalid yaml in {}", path.display()))?;
    validate_value(TASK_SCHEMA, &value)
        .map_err(|e| BenchError::Setup(format!("{}: {:#}", path.display(), e)))?;
    let spec: TaskSpec = serde_json::from_value(value)
        .with_context(|| format!("failed to decode task {}", path.display()))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = spec.task_name();
    if stem != name {
        return Err(BenchError::Setup(format!(
            "{}: file name must match task name {}",
            path.display(),
            name
        ))
        .into());
    }

    let source_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    check_referenced_files(&spec, &source_dir)
        .with_context(|| format!("task {}", path.display()))?;
    Ok(LoadedTask {
        spec,
        source: path.to_path_buf(),
        source_dir,
    })
}

/// Loads every task under `path`, dropping those already collected for the
/// experiment unless `rerun_all`, and keeping at most `amount`.
pub fn load_tasks(path: &Path, options: &LoadOptions) -> Result<Vec<LoadedTask>> {
    let mut tasks = Vec::new();
    for file in discover_task_files(path)? {
        let task = load_task_file(&file)?;
        let task_dir = options.experiment_dir.join(task.name());
        if !options.rerun_all && is_collected(&task_dir, &options.experiment) {
            debug!(task = %task.name(), "already collected, skipping");
            continue;
        }
        tasks.push(task);
        if options.amount.map(|n| tasks.len() >= n).unwrap_or(false) {
            break;
        }
    }
    info!(count = tasks.len(), path = %path.display(), "loaded tasks");
    Ok(tasks)
}

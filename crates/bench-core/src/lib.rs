use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod error;
pub mod message;
pub mod task;

pub use error::{BenchError, ErrorKind};
pub use message::{
    AdvisoryKind, ContentPart, FunctionCall, Message, MessageContent, Role, ToolCall, Usage,
};
pub use task::{
    normalize_identity_part, TaskSpec, Verification, VerificationMode, EMPTY_REPO_DIR,
};

pub const TASK_MANIFEST_FILE: &str = "manifest.json";
pub const TASK_TRANSCRIPT_FILE: &str = "task.transcript.jsonl";
pub const TASK_MESSAGES_FILE: &str = "task.json";
pub const VERIFY_TRANSCRIPT_FILE: &str = "verify.transcript.jsonl";
pub const VERIFY_MESSAGES_FILE: &str = "verify.json";
pub const TASK_RESULT_FILE: &str = "result.json";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const VERIFY_SCRIPT_FILE: &str = "verify.py";
pub const BACKEND_LOG_FILE: &str = "backend.log";
pub const BACKEND_CONTAINER_LOG_FILE: &str = "backend-container.log";
pub const BACKEND_INTEGRATIONS_FILE: &str = "integrations.yaml";

pub const TASK_MANIFEST_SCHEMA_VERSION: &str = "task_manifest_v1";

/// Run metadata written next to the transcript once the conversation ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub schema_version: String,
    pub domain: String,
    pub task_name: String,
    pub experiment: String,
    pub model: String,
    pub backend_version: String,
    pub backend_commit: String,
    pub started_at: String,
    pub ended_at: String,
    pub chat_max_depth: usize,
    #[serde(default)]
    pub boost_thinking: bool,
    pub session_id: String,
    #[serde(default)]
    pub task_digest: String,
    #[serde(default)]
    pub task: Value,
}

/// Layout of one task's directory inside the experiment workspace.
#[derive(Debug, Clone)]
pub struct TaskHostPaths {
    pub root: PathBuf,
    pub repo: PathBuf,
    pub artifacts: PathBuf,
    pub manifest: PathBuf,
    pub transcript: PathBuf,
    pub messages: PathBuf,
    pub verify_transcript: PathBuf,
    pub verify_messages: PathBuf,
    pub result: PathBuf,
    pub verify_script: PathBuf,
    pub backend_log: PathBuf,
    pub backend_container_log: PathBuf,
    pub backend_integrations: PathBuf,
}

pub fn task_host_paths(task_dir: &Path, repo_dir_name: &str) -> TaskHostPaths {
    TaskHostPaths {
        root: task_dir.to_path_buf(),
        repo: task_dir.join(repo_dir_name),
        artifacts: task_dir.join(ARTIFACTS_DIR),
        manifest: task_dir.join(TASK_MANIFEST_FILE),
        transcript: task_dir.join(TASK_TRANSCRIPT_FILE),
        messages: task_dir.join(TASK_MESSAGES_FILE),
        verify_transcript: task_dir.join(VERIFY_TRANSCRIPT_FILE),
        verify_messages: task_dir.join(VERIFY_MESSAGES_FILE),
        result: task_dir.join(TASK_RESULT_FILE),
        verify_script: task_dir.join(VERIFY_SCRIPT_FILE),
        backend_log: task_dir.join(BACKEND_LOG_FILE),
        backend_container_log: task_dir.join(BACKEND_CONTAINER_LOG_FILE),
        backend_integrations: task_dir.join(BACKEND_INTEGRATIONS_FILE),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", ks, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(label: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time should be monotonic")
                .as_nanos();
            let path = std::env::temp_dir().join(format!("bench_core_{}_{}", label, nanos));
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        let b = json!({"a": {"c": null, "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let root = TempDirGuard::new("atomic");
        let path = root.path.join("nested").join("manifest.json");
        atomic_write_json_pretty(&path, &json!({"v": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"v": 2})).expect("second write");
        let value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(value["v"], 2);
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1, "temp file should be renamed away");
    }

    #[test]
    fn task_paths_hang_off_the_task_dir() {
        let paths = task_host_paths(Path::new("/ws/topic-repo-test-name"), "org_repo");
        assert_eq!(paths.repo, PathBuf::from("/ws/topic-repo-test-name/org_repo"));
        assert_eq!(
            paths.transcript,
            PathBuf::from("/ws/topic-repo-test-name/task.transcript.jsonl")
        );
        assert_eq!(
            paths.artifacts,
            PathBuf::from("/ws/topic-repo-test-name/artifacts")
        );
    }
}

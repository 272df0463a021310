use crate::backend::{BuildInfo, ChatRequest, InferenceBackend};
use crate::isolation::{ContainerEngine, ExecOutput, ImageBuild};
use crate::launcher::{BackendFactory, BackendLaunch, BackendSession};
use crate::transcript::TranscriptSink;
use crate::vcs::Vcs;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bench_core::{FunctionCall, Message, ToolCall};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct TempDirGuard {
    pub path: PathBuf,
}

impl TempDirGuard {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "bench_runner_{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Keeps messages in memory instead of a transcript file.
#[derive(Debug, Default)]
pub struct MemoryTranscriptSink {
    pub messages: Vec<Message>,
    pub flushes: usize,
}

impl TranscriptSink for MemoryTranscriptSink {
    fn append_messages(&mut self, messages: &[Message]) -> Result<()> {
        self.messages.extend_from_slice(messages);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

pub fn tool_call_message(names: &[&str]) -> Message {
    let mut message = Message::assistant("");
    message.tool_calls = Some(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ToolCall {
                id: format!("call_{}", i),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: "{}".to_string(),
                },
            })
            .collect(),
    );
    message
}

/// Backend that answers each turn with the next scripted message.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Message>>,
    repeat: Option<Message>,
    requests: Mutex<Vec<ChatRequest>>,
    panics: bool,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            panics: false,
        }
    }

    pub fn repeating(reply: Message) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply),
            requests: Mutex::new(Vec::new()),
            panics: false,
        }
    }

    /// Panics on the first chat request.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn fetch_tools(&self) -> Result<Vec<Value>> {
        Ok(vec![json!({"type": "function", "function": {"name": "cat"}})])
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Vec<Vec<Message>>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if self.panics {
            panic!("scripted backend crashed");
        }
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .or_else(|| self.repeat.clone());
        Ok(match reply {
            Some(reply) => {
                let mut messages = request.messages.clone();
                messages.push(reply);
                vec![messages]
            }
            None => Vec::new(),
        })
    }

    async fn build_info(&self) -> Result<BuildInfo> {
        Ok(BuildInfo {
            version: "0.9.0".to_string(),
            commit: "deadbeefcafe".to_string(),
        })
    }
}

pub struct ScriptedFactory {
    pub backend: Arc<ScriptedBackend>,
    pub fail: bool,
}

#[async_trait]
impl BackendFactory for ScriptedFactory {
    async fn start(&self, _launch: &BackendLaunch<'_>) -> Result<BackendSession> {
        if self.fail {
            return Err(anyhow!("backend refused to start"));
        }
        Ok(BackendSession {
            backend: self.backend.clone(),
            process: None,
        })
    }
}

/// Records every engine call as `"<op> <args>"`.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    images: Mutex<HashSet<String>>,
    exec_results: Mutex<VecDeque<ExecOutput>>,
}

impl FakeEngine {
    pub fn fail_on(&self, op: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(op.to_string());
    }

    pub fn add_image(&self, tag: &str) {
        self.images
            .lock()
            .expect("images lock")
            .insert(tag.to_string());
    }

    pub fn push_exec(&self, output: ExecOutput) {
        self.exec_results
            .lock()
            .expect("exec lock")
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, op: &str, detail: String) -> Result<()> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("{} {}", op, detail));
        if self.failing.lock().expect("failing lock").contains(op) {
            return Err(anyhow!("{} failed", op));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn find_image(&self, tag: &str) -> Result<Option<String>> {
        self.record("find_image", tag.to_string())?;
        let found = self.images.lock().expect("images lock").contains(tag);
        Ok(found.then(|| format!("sha256:{}", tag)))
    }

    async fn build_image(&self, build: &ImageBuild<'_>) -> Result<()> {
        self.record(
            "build_image",
            format!("{} no_cache={}", build.tag, build.no_cache),
        )?;
        self.add_image(build.tag);
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.record("remove_image", image_id.to_string())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.record("remove_container", name.to_string())
    }

    async fn container_logs(&self, name: &str) -> Result<String> {
        self.record("container_logs", name.to_string())?;
        Ok("container log\n".to_string())
    }

    async fn copy_into(&self, container: &str, source: &Path, dest_dir: &str) -> Result<()> {
        self.record(
            "copy_into",
            format!("{} {} {}", container, source.display(), dest_dir),
        )
    }

    async fn exec(&self, container: &str, workdir: &str, argv: &[String]) -> Result<ExecOutput> {
        self.record("exec", format!("{} {} {}", container, workdir, argv.join(" ")))?;
        Ok(self
            .exec_results
            .lock()
            .expect("exec lock")
            .pop_front()
            .unwrap_or_default())
    }

    async fn compose_up(&self, file: &Path) -> Result<()> {
        self.record("compose_up", file.display().to_string())
    }

    async fn compose_down(&self, file: &Path) -> Result<()> {
        self.record("compose_down", file.display().to_string())
    }
}

#[derive(Default)]
pub struct FakeVcs {
    pub checkouts: Mutex<Vec<(String, String, PathBuf)>>,
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn checkout(&self, repo: &str, revision: &str, dest: &Path) -> Result<()> {
        self.checkouts.lock().expect("vcs lock").push((
            repo.to_string(),
            revision.to_string(),
            dest.to_path_buf(),
        ));
        fs::create_dir_all(dest)?;
        fs::write(dest.join("README.md"), "checkout\n")?;
        Ok(())
    }
}

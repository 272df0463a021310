use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bench_core::BenchError;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// `isolation` section of a task's integrations yaml.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IsolationConfig {
    pub docker_image_id: String,
    #[serde(default)]
    pub docker_network: Option<String>,
    pub container_workspace_folder: String,
}

fn read_yaml(path: &Path) -> Result<YamlValue> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).map_err(|e| anyhow!("invalid yaml in {}: {}", path.display(), e))
}

fn scalar_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn load_variables(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if let YamlValue::Mapping(map) = read_yaml(path)? {
        for (key, value) in map {
            if let (Some(key), Some(value)) = (scalar_text(&key), scalar_text(&value)) {
                vars.insert(key, value);
            }
        }
    }
    Ok(vars)
}

/// Replaces `$NAME` in every string of `value`. Longer names go first so
/// `$HOST_PORT` is not eaten by `$HOST`.
pub fn substitute_variables(value: &mut YamlValue, vars: &BTreeMap<String, String>) {
    match value {
        YamlValue::String(text) => {
            let mut names: Vec<&String> = vars.keys().collect();
            names.sort_by_key(|name| std::cmp::Reverse(name.len()));
            for name in names {
                let token = format!("${}", name);
                if text.contains(&token) {
                    *text = text.replace(&token, &vars[name]);
                }
            }
        }
        YamlValue::Sequence(items) => {
            for item in items {
                substitute_variables(item, vars);
            }
        }
        YamlValue::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_variables(item, vars);
            }
        }
        YamlValue::Tagged(tagged) => substitute_variables(&mut tagged.value, vars),
        _ => {}
    }
}

pub fn load_isolation_config(
    integrations_yaml: &Path,
    variables_yaml: Option<&Path>,
) -> Result<IsolationConfig> {
    let vars = match variables_yaml {
        Some(path) => load_variables(path).map_err(|e| BenchError::Isolation(format!("{:#}", e)))?,
        None => BTreeMap::new(),
    };
    let mut integrations =
        read_yaml(integrations_yaml).map_err(|e| BenchError::Isolation(format!("{:#}", e)))?;
    substitute_variables(&mut integrations, &vars);
    let section = integrations.get("isolation").cloned().ok_or_else(|| {
        BenchError::Isolation(format!(
            "{} has no isolation section",
            integrations_yaml.display()
        ))
    })?;
    let config = serde_yaml::from_value(section)
        .map_err(|e| BenchError::Isolation(format!("bad isolation section: {}", e)))?;
    Ok(config)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ImageBuild<'a> {
    pub context: &'a Path,
    pub tag: &'a str,
    pub labels: &'a [(String, String)],
    pub no_cache: bool,
}

/// Narrow view of the container engine the runner drives.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn find_image(&self, tag: &str) -> Result<Option<String>>;
    async fn build_image(&self, build: &ImageBuild<'_>) -> Result<()>;
    async fn remove_image(&self, image_id: &str) -> Result<()>;
    /// Succeeds when the container is already gone.
    async fn remove_container(&self, name: &str) -> Result<()>;
    async fn container_logs(&self, name: &str) -> Result<String>;
    async fn copy_into(&self, container: &str, source: &Path, dest_dir: &str) -> Result<()>;
    async fn exec(&self, container: &str, workdir: &str, argv: &[String]) -> Result<ExecOutput>;
    async fn compose_up(&self, file: &Path) -> Result<()>;
    async fn compose_down(&self, file: &Path) -> Result<()>;
}

/// Drives the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }
}

async fn run_checked_command(mut cmd: Command, step: &str) -> Result<std::process::Output> {
    let out = cmd.output().await.with_context(|| format!("{}: spawn failed", step))?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(anyhow!("{}: {}", step, detail))
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn find_image(&self, tag: &str) -> Result<Option<String>> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", "--format", "{{.Id}}", tag]);
        let out = cmd.output().await.context("docker image inspect: spawn failed")?;
        if !out.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    async fn build_image(&self, build: &ImageBuild<'_>) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["build", "--force-rm", "-t", build.tag]);
        for (key, value) in build.labels {
            cmd.arg("--label").arg(format!("{}={}", key, value));
        }
        if build.no_cache {
            cmd.arg("--no-cache");
        }
        cmd.arg(build.context);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().context("docker build: spawn failed")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("docker build: stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("docker build: stderr not captured"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                debug!(image = build.tag, "{}", line);
            }
        }
        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(anyhow!(
                "docker build {}: {}",
                build.tag,
                stderr_text.trim()
            ));
        }
        for line in stderr_text.lines().filter(|l| !l.trim().is_empty()) {
            debug!(image = build.tag, "{}", line);
        }
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rmi", image_id]);
        run_checked_command(cmd, "docker rmi").await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", name]);
        match run_checked_command(cmd, "docker rm").await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("No such container") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn container_logs(&self, name: &str) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["logs", name]);
        let out = run_checked_command(cmd, "docker logs").await?;
        Ok(merge_log_streams(&out.stdout, &out.stderr))
    }

    async fn copy_into(&self, container: &str, source: &Path, dest_dir: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("cp")
            .arg(source)
            .arg(format!("{}:{}", container, dest_dir));
        run_checked_command(cmd, "docker cp").await?;
        Ok(())
    }

    async fn exec(&self, container: &str, workdir: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut cmd = self.command();
        cmd.args(["exec", "-w", workdir, container]).args(argv);
        let out = cmd.output().await.context("docker exec: spawn failed")?;
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    async fn compose_up(&self, file: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["compose", "-f"]).arg(file).args(["up", "-d"]);
        let out = run_checked_command(cmd, "docker compose up").await?;
        log_tail("compose up", &out.stderr);
        Ok(())
    }

    async fn compose_down(&self, file: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["compose", "-f"]).arg(file).arg("down");
        let out = run_checked_command(cmd, "docker compose down").await?;
        log_tail("compose down", &out.stderr);
        Ok(())
    }
}

/// `docker logs` replays the container's stdout and stderr on its own two
/// streams; keep both, stdout first.
fn merge_log_streams(stdout: &[u8], stderr: &[u8]) -> String {
    let mut merged = String::from_utf8_lossy(stdout).to_string();
    if !stderr.is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&String::from_utf8_lossy(stderr));
    }
    merged
}

fn log_tail(step: &str, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let tail = &lines[lines.len().saturating_sub(5)..];
    if !tail.is_empty() {
        debug!("{}:\n{}", step, tail.join("\n"));
    }
}

/// Something a task acquired that must be given back before it reports.
#[derive(Debug)]
pub enum Resource {
    /// `remove` is false when the image is kept for later tasks.
    Image { id: String, remove: bool },
    ComposeStack { file: PathBuf },
    Container { name: String },
    BackendProcess { child: Child },
}

impl Resource {
    fn describe(&self) -> String {
        match self {
            Resource::Image { id, .. } => format!("image {}", id),
            Resource::ComposeStack { file } => format!("compose stack {}", file.display()),
            Resource::Container { name } => format!("container {}", name),
            Resource::BackendProcess { child } => {
                format!("backend process {}", child.id().unwrap_or_default())
            }
        }
    }

    async fn release(self, engine: &dyn ContainerEngine) -> Result<()> {
        match self {
            Resource::Image { id, remove: false } => {
                debug!(image = %id, "keeping image for reuse");
                Ok(())
            }
            Resource::Image { id, remove: true } => engine.remove_image(&id).await,
            Resource::ComposeStack { file } => engine.compose_down(&file).await,
            Resource::Container { name } => engine.remove_container(&name).await,
            Resource::BackendProcess { mut child } => {
                if child.try_wait()?.is_none() {
                    child.kill().await?;
                }
                Ok(())
            }
        }
    }
}

async fn release_resources(engine: Arc<dyn ContainerEngine>, held: Vec<Resource>) -> usize {
    let mut failures = 0;
    for resource in held.into_iter().rev() {
        let label = resource.describe();
        match resource.release(engine.as_ref()).await {
            Ok(()) => debug!("released {}", label),
            Err(err) => {
                failures += 1;
                warn!("failed to release {}: {:#}", label, err);
            }
        }
    }
    failures
}

/// Resources of one task in acquisition order.
pub struct ResourceLedger {
    engine: Arc<dyn ContainerEngine>,
    held: Vec<Resource>,
}

impl ResourceLedger {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            held: Vec::new(),
        }
    }

    pub fn acquire(&mut self, resource: Resource) {
        debug!("acquired {}", resource.describe());
        self.held.push(resource);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Releases newest first. Each step is isolated: a failure is logged and
    /// counted, and the remaining resources are still released.
    pub async fn release_all(&mut self) -> usize {
        if self.held.is_empty() {
            return 0;
        }
        let held = std::mem::take(&mut self.held);
        let count = held.len();
        let failures = release_resources(self.engine.clone(), held).await;
        info!(
            "released {} of {} task resources",
            count - failures,
            count
        );
        failures
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("{} resources left at drop; releasing in background", held.len());
                let engine = self.engine.clone();
                handle.spawn(async move {
                    release_resources(engine, held).await;
                });
            }
            Err(_) => warn!("{} resources leaked: no runtime to release them", held.len()),
        }
    }
}

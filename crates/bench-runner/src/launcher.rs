use crate::backend::{HttpBackend, InferenceBackend};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bench_core::{BenchError, TaskHostPaths, TaskSpec};
use serde_yaml::Value as YamlValue;
use std::fs::{self, File};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

const LOCAL_HOSTS: [&str; 3] = ["localhost", "0.0.0.0", "127.0.0.1"];

/// Address containers use to reach the host.
pub fn docker_host_alias() -> &'static str {
    if cfg!(target_os = "linux") {
        "172.17.0.1"
    } else {
        "host.docker.internal"
    }
}

/// Everything a backend needs to know about the task it serves.
pub struct BackendLaunch<'a> {
    pub task: &'a TaskSpec,
    pub task_source_dir: &'a Path,
    pub paths: &'a TaskHostPaths,
    pub isolation: bool,
}

pub struct BackendSession {
    pub backend: Arc<dyn InferenceBackend>,
    /// Set when the backend runs as a child process owned by the task.
    pub process: Option<Child>,
}

#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn start(&self, launch: &BackendLaunch<'_>) -> Result<BackendSession>;
}

/// Shares one already running backend between all tasks.
pub struct RemoteBackendFactory {
    base_url: String,
}

impl RemoteBackendFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BackendFactory for RemoteBackendFactory {
    async fn start(&self, _launch: &BackendLaunch<'_>) -> Result<BackendSession> {
        Ok(BackendSession {
            backend: Arc::new(HttpBackend::new(self.base_url.clone())?),
            process: None,
        })
    }
}

/// Spawns a dedicated backend process per task.
#[derive(Debug, Clone)]
pub struct ProcessBackendFactory {
    pub binary: PathBuf,
    pub address_url: String,
    pub api_key: Option<String>,
    pub ready_timeout: Duration,
}

fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    authority.split(':').next().unwrap_or(authority)
}

fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("no free local port")?;
    Ok(listener.local_addr()?.port())
}

impl ProcessBackendFactory {
    /// Command line for one task's backend. In isolation mode with a local
    /// inference address, a rewritten integrations copy points containers at
    /// the docker host instead.
    pub fn backend_args(&self, launch: &BackendLaunch<'_>, port: u16) -> Result<Vec<String>> {
        let source = |rel: &str| launch.task_source_dir.join(rel).to_string_lossy().to_string();
        let project = launch.paths.repo.join(&launch.task.working_dir);
        let mut args = vec![
            "--http-port".to_string(),
            port.to_string(),
            "--workspace-folder".to_string(),
            project.to_string_lossy().to_string(),
        ];

        if let Some(integrations) = &launch.task.integrations_yaml {
            args.push("--integrations-yaml".to_string());
            let host = url_host(&self.address_url);
            if launch.isolation && LOCAL_HOSTS.contains(&host) {
                let rewritten = self.rewrite_integrations(
                    &launch.task_source_dir.join(integrations),
                    &launch.paths.backend_integrations,
                    host,
                )?;
                args.push(rewritten.to_string_lossy().to_string());
            } else {
                args.push(source(integrations.as_str()));
            }
        }
        let optional = [
            ("--variables-yaml", &launch.task.variables_yaml),
            ("--secrets-yaml", &launch.task.secrets_yaml),
            ("--indexing-yaml", &launch.task.indexing_yaml),
            ("--privacy-yaml", &launch.task.privacy_yaml),
        ];
        for (flag, value) in optional {
            if let Some(rel) = value {
                args.push(flag.to_string());
                args.push(source(rel.as_str()));
            }
        }
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            args.push("--address-url".to_string());
            args.push(self.address_url.clone());
            args.push("--api-key".to_string());
            args.push(key.to_string());
        }
        Ok(args)
    }

    fn rewrite_integrations(&self, original: &Path, dest: &Path, host: &str) -> Result<PathBuf> {
        let raw = fs::read_to_string(original)
            .with_context(|| format!("failed to read {}", original.display()))?;
        let mut integrations: YamlValue = serde_yaml::from_str(&raw)?;
        let isolation = integrations
            .get_mut("isolation")
            .and_then(YamlValue::as_mapping_mut)
            .ok_or_else(|| {
                BenchError::Isolation(format!("{} has no isolation section", original.display()))
            })?;
        isolation.insert(
            YamlValue::from("isolation_address_url"),
            YamlValue::from(self.address_url.replacen(host, docker_host_alias(), 1)),
        );
        fs::write(dest, serde_yaml::to_string(&integrations)?)?;
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl BackendFactory for ProcessBackendFactory {
    async fn start(&self, launch: &BackendLaunch<'_>) -> Result<BackendSession> {
        let port = free_local_port().map_err(|e| BenchError::Setup(format!("{:#}", e)))?;
        let args = self.backend_args(launch, port)?;
        let log = File::create(&launch.paths.backend_log)
            .map_err(|e| BenchError::Setup(format!("backend log: {}", e)))?;
        let log_err = log.try_clone()?;

        debug!(binary = %self.binary.display(), ?args, "starting backend");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BenchError::Setup(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        let backend = HttpBackend::new(format!("http://127.0.0.1:{}", port))?;
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BenchError::Setup(format!(
                    "backend exited during startup with {}; see {}",
                    status,
                    launch.paths.backend_log.display()
                ))
                .into());
            }
            if backend.build_info().await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(anyhow!(BenchError::Setup(format!(
                    "backend not ready after {:?}",
                    self.ready_timeout
                ))));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        info!(port, "backend ready");
        Ok(BackendSession {
            backend: Arc::new(backend),
            process: Some(child),
        })
    }
}

use crate::launcher::{BackendFactory, ProcessBackendFactory, RemoteBackendFactory};
use crate::lifecycle::LifecycleOptions;
use crate::loader::LoadOptions;
use anyhow::Result;
use bench_core::BenchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const API_KEY_ENV: &str = "BENCH_API_KEY";
pub const WORKSPACE_ENV: &str = "BENCH_WORKSPACE";
pub const WORKSPACE_DIR_NAME: &str = "bench_workspace";
pub const DEFAULT_EXPERIMENT: &str = "default";
pub const DEFAULT_CHAT_MAX_DEPTH: usize = 30;
pub const DEFAULT_CACHE_LEVEL: i32 = 2;
pub const BACKEND_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Workspace root: explicit flag, then `BENCH_WORKSPACE`, then the nearest
/// ancestor of `cwd` named `bench_workspace`, then `cwd` itself.
pub fn resolve_workspace_root(flag: Option<&Path>, env: Option<&str>, cwd: &Path) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Some(dir) = env.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    cwd.ancestors()
        .find(|dir| dir.file_name().map(|n| n == WORKSPACE_DIR_NAME).unwrap_or(false))
        .unwrap_or(cwd)
        .to_path_buf()
}

pub fn experiment_dir(workspace_root: &Path, experiment: &str) -> PathBuf {
    workspace_root.join(format!("experiment-{}", experiment))
}

/// Everything `bench run` needs, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub task_path: PathBuf,
    pub workspace_root: PathBuf,
    pub experiment: String,
    pub api_key: Option<String>,
    pub amount: Option<usize>,
    pub parallel_jobs: usize,
    pub docker: bool,
    pub rebuild_image: bool,
    pub rerun_all: bool,
    pub backend_url: Option<String>,
    pub backend_bin: Option<PathBuf>,
    pub address_url: String,
    pub cache_level: i32,
    pub ignore_errors: bool,
    pub model: String,
    pub boost_thinking: bool,
    pub chat_max_depth: usize,
    pub script_interpreter: String,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallel_jobs == 0 {
            return Err(BenchError::Setup("--parallel-jobs must be at least 1".into()).into());
        }
        if self.chat_max_depth == 0 {
            return Err(BenchError::Setup("--chat-max-depth must be at least 1".into()).into());
        }
        if self.experiment.trim().is_empty() {
            return Err(BenchError::Setup("experiment name is empty".into()).into());
        }
        match (&self.backend_url, &self.backend_bin) {
            (None, None) => Err(BenchError::Setup(
                "either --backend-url or --backend-bin is required".into(),
            )
            .into()),
            (Some(_), Some(_)) => Err(BenchError::Setup(
                "--backend-url and --backend-bin are mutually exclusive".into(),
            )
            .into()),
            _ => Ok(()),
        }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        experiment_dir(&self.workspace_root, &self.experiment)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            experiment: self.experiment.clone(),
            experiment_dir: self.experiment_dir(),
            rerun_all: self.rerun_all,
            amount: self.amount,
        }
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            experiment: self.experiment.clone(),
            experiment_dir: self.experiment_dir(),
            docker: self.docker,
            rebuild_image: self.rebuild_image,
            cache_level: self.cache_level,
            model: self.model.clone(),
            boost_thinking: self.boost_thinking,
            chat_max_depth: self.chat_max_depth,
            temperature: 0.0,
            script_interpreter: self.script_interpreter.clone(),
        }
    }

    pub fn backend_factory(&self) -> Result<Arc<dyn BackendFactory>> {
        self.validate()?;
        if let Some(binary) = &self.backend_bin {
            return Ok(Arc::new(ProcessBackendFactory {
                binary: binary.clone(),
                address_url: self.address_url.clone(),
                api_key: self.api_key.clone(),
                ready_timeout: BACKEND_READY_TIMEOUT,
            }));
        }
        let url = self.backend_url.clone().unwrap_or_default();
        Ok(Arc::new(RemoteBackendFactory::new(url)))
    }
}

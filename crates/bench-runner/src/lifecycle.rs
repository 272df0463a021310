use crate::backend::InferenceBackend;
use crate::conversation::{run_conversation, ConversationSettings, Termination};
use crate::isolation::{
    load_isolation_config, ContainerEngine, ImageBuild, IsolationConfig, Resource, ResourceLedger,
};
use crate::launcher::{BackendFactory, BackendLaunch};
use crate::loader::LoadedTask;
use crate::scheduler::panic_message;
use crate::transcript::{save_messages, JsonlTranscriptSink};
use crate::vcs::Vcs;
use crate::verification::{run_verification, ScriptTarget, VerificationContext};
use anyhow::{anyhow, Result};
use bench_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    task_host_paths, BenchError, TaskHostPaths, TaskManifest,
    TASK_MANIFEST_SCHEMA_VERSION,
};
use futures_util::FutureExt;
use rand::Rng;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SESSION_ID_PREFIX: &str = "bench-";
pub const CONTAINER_NAME_PREFIX: &str = "agent-";

/// `bench-` followed by ten random lowercase hex digits.
pub fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("{}{}", SESSION_ID_PREFIX, suffix)
}

/// Name of the container the backend creates for a session.
pub fn session_container_name(session_id: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Prepared,
    WorkspaceReady,
    ImageReady,
    DependenciesUp,
    Conversing,
    Verifying,
    Done,
}

/// Batch-wide knobs every task lifecycle reads.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub experiment: String,
    /// `<workspace>/experiment-<name>`; one subdirectory per task.
    pub experiment_dir: PathBuf,
    pub docker: bool,
    pub rebuild_image: bool,
    pub cache_level: i32,
    pub model: String,
    pub boost_thinking: bool,
    pub chat_max_depth: usize,
    pub temperature: f32,
    /// Interpreter for verification scripts run on the host.
    pub script_interpreter: String,
}

impl LifecycleOptions {
    fn keep_image(&self) -> bool {
        self.cache_level > 0
    }

    fn build_without_cache(&self) -> bool {
        self.cache_level < 2
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub backends: Arc<dyn BackendFactory>,
    pub engine: Arc<dyn ContainerEngine>,
    pub vcs: Arc<dyn Vcs>,
}

pub struct ExecutionContext {
    pub session_id: String,
    pub paths: TaskHostPaths,
    pub isolation: Option<IsolationConfig>,
    pub image_id: Option<String>,
}

impl ExecutionContext {
    pub fn container_name(&self) -> String {
        session_container_name(&self.session_id)
    }
}

/// One task's walk from an empty directory to a persisted result.
///
/// Phases can be driven one at a time; [`TaskLifecycle::run`] drives them all
/// and always finishes with [`TaskLifecycle::cleanup`].
pub struct TaskLifecycle<'a> {
    task: &'a LoadedTask,
    options: &'a LifecycleOptions,
    collaborators: &'a Collaborators,
    state: LifecycleState,
    ctx: Option<ExecutionContext>,
    ledger: ResourceLedger,
    backend: Option<Arc<dyn InferenceBackend>>,
}

impl<'a> TaskLifecycle<'a> {
    pub fn new(
        task: &'a LoadedTask,
        options: &'a LifecycleOptions,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            task,
            options,
            collaborators,
            state: LifecycleState::Created,
            ctx: None,
            ledger: ResourceLedger::new(collaborators.engine.clone()),
            backend: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn context(&self) -> Option<&ExecutionContext> {
        self.ctx.as_ref()
    }

    pub fn held_resources(&self) -> usize {
        self.ledger.len()
    }

    fn ctx(&self) -> Result<&ExecutionContext> {
        self.ctx
            .as_ref()
            .ok_or_else(|| BenchError::Setup("task directory not prepared".to_string()).into())
    }

    fn settings(&self, session_id: &str) -> ConversationSettings {
        ConversationSettings {
            model: self.options.model.clone(),
            max_steps: self.options.chat_max_depth,
            boost_thinking: self.options.boost_thinking,
            temperature: self.options.temperature,
            chat_id: session_id.to_string(),
            chat_remote: self.options.docker,
            domain: self.task.spec.domain.clone(),
        }
    }

    pub async fn prepare(&mut self) -> Result<()> {
        let task_dir = self.options.experiment_dir.join(self.task.name());
        ensure_dir(&task_dir).map_err(|e| {
            BenchError::Setup(format!("cannot create {}: {:#}", task_dir.display(), e))
        })?;
        let paths = task_host_paths(&task_dir, &self.task.spec.checkout_dir_name());
        let session_id = new_session_id();
        debug!(%session_id, dir = %task_dir.display(), "task prepared");
        self.ctx = Some(ExecutionContext {
            session_id,
            paths,
            isolation: None,
            image_id: None,
        });
        self.state = LifecycleState::Prepared;
        Ok(())
    }

    pub async fn prepare_workspace(&mut self) -> Result<()> {
        let spec = &self.task.spec;
        let repo_dir = self.ctx()?.paths.repo.clone();
        if spec.has_repo() {
            self.collaborators
                .vcs
                .checkout(&spec.repo, &spec.revision, &repo_dir)
                .await
                .map_err(|e| BenchError::Setup(format!("checkout of {}: {:#}", spec.repo, e)))?;
        } else {
            debug!("task has no repository; using an empty directory");
            ensure_dir(&repo_dir)?;
        }
        self.state = LifecycleState::WorkspaceReady;
        Ok(())
    }

    pub async fn prepare_image(&mut self) -> Result<()> {
        let spec = &self.task.spec;
        let source_dir = &self.task.source_dir;
        let integrations = spec.integrations_yaml.as_ref().ok_or_else(|| {
            BenchError::Isolation("isolated run needs integrations_yaml".to_string())
        })?;
        let variables = spec.variables_yaml.as_ref().map(|rel| source_dir.join(rel));
        let isolation =
            load_isolation_config(&source_dir.join(integrations), variables.as_deref())?;
        let tag = isolation.docker_image_id.clone();
        let engine = self.collaborators.engine.clone();

        let existing = if self.options.rebuild_image {
            None
        } else {
            engine
                .find_image(&tag)
                .await
                .map_err(|e| BenchError::Isolation(format!("{:#}", e)))?
        };
        let image_id = match existing {
            Some(id) => {
                info!(image = %tag, "reusing existing image");
                id
            }
            None => {
                let repo_dir = self.ctx()?.paths.repo.clone();
                let dockerfile = spec.dockerfile.as_ref().ok_or_else(|| {
                    BenchError::Isolation(format!("image {} missing and task has no dockerfile", tag))
                })?;
                fs::copy(source_dir.join(dockerfile), repo_dir.join("Dockerfile")).map_err(|e| {
                    BenchError::Isolation(format!("copying {}: {}", dockerfile, e))
                })?;
                let labels = vec![("task".to_string(), self.task.name())];
                info!(image = %tag, "building image");
                engine
                    .build_image(&ImageBuild {
                        context: &repo_dir,
                        tag: &tag,
                        labels: &labels,
                        no_cache: self.options.build_without_cache(),
                    })
                    .await
                    .map_err(|e| BenchError::Isolation(format!("{:#}", e)))?;
                engine
                    .find_image(&tag)
                    .await
                    .map_err(|e| BenchError::Isolation(format!("{:#}", e)))?
                    .ok_or_else(|| {
                        BenchError::Isolation(format!("image {} not found after build", tag))
                    })?
            }
        };

        self.ledger.acquire(Resource::Image {
            id: image_id.clone(),
            remove: !self.options.keep_image(),
        });
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.isolation = Some(isolation);
            ctx.image_id = Some(image_id);
        }
        self.state = LifecycleState::ImageReady;
        Ok(())
    }

    pub async fn start_dependencies(&mut self) -> Result<()> {
        let Some(compose) = &self.task.spec.docker_compose_dependencies_yaml else {
            return Ok(());
        };
        let file = self.task.source_dir.join(compose);
        // Registered first so a half-started stack is still torn down.
        self.ledger
            .acquire(Resource::ComposeStack { file: file.clone() });
        self.collaborators
            .engine
            .compose_up(&file)
            .await
            .map_err(|e| BenchError::Isolation(format!("{:#}", e)))?;
        self.state = LifecycleState::DependenciesUp;
        Ok(())
    }

    /// Runs the agent conversation and persists manifest and messages.
    pub async fn converse(&mut self) -> Result<Termination> {
        self.state = LifecycleState::Conversing;
        let started_at = chrono::Utc::now().to_rfc3339();
        let (session_id, paths, container) = {
            let ctx = self.ctx()?;
            (ctx.session_id.clone(), ctx.paths.clone(), ctx.container_name())
        };

        let launch = BackendLaunch {
            task: &self.task.spec,
            task_source_dir: &self.task.source_dir,
            paths: &paths,
            isolation: self.options.docker,
        };
        let session = self.collaborators.backends.start(&launch).await?;
        if let Some(child) = session.process {
            self.ledger.acquire(Resource::BackendProcess { child });
        }
        if self.options.docker {
            self.ledger.acquire(Resource::Container {
                name: container.clone(),
            });
        }
        let backend = session.backend;
        self.backend = Some(backend.clone());

        let build = backend
            .build_info()
            .await
            .map_err(|e| BenchError::Protocol(format!("build info: {:#}", e)))?;
        let settings = self.settings(&session_id);
        let conversation = async {
            let mut sink = JsonlTranscriptSink::create(&paths.transcript)?;
            run_conversation(
                backend.as_ref(),
                self.task.spec.task.clone(),
                &settings,
                &mut sink,
            )
            .await
        }
        .await;

        if self.options.docker {
            self.save_container_logs(&container, &paths).await;
        }
        let outcome = conversation?;
        if outcome.messages.is_empty() {
            return Err(BenchError::Protocol("conversation produced no messages".into()).into());
        }

        let task_value = serde_json::to_value(&self.task.spec)?;
        let manifest = TaskManifest {
            schema_version: TASK_MANIFEST_SCHEMA_VERSION.to_string(),
            domain: self.task.spec.domain.clone(),
            task_name: self.task.name(),
            experiment: self.options.experiment.clone(),
            model: self.options.model.clone(),
            backend_version: build.version,
            backend_commit: build.commit,
            started_at,
            ended_at: chrono::Utc::now().to_rfc3339(),
            chat_max_depth: self.options.chat_max_depth,
            boost_thinking: self.options.boost_thinking,
            session_id,
            task_digest: canonical_json_digest(&task_value),
            task: task_value,
        };
        atomic_write_json_pretty(&paths.manifest, &manifest)?;
        save_messages(&paths.root, "task", &outcome.messages)?;
        info!(
            messages = outcome.messages.len(),
            advisories = outcome.advisories,
            "conversation saved"
        );
        Ok(outcome.termination)
    }

    async fn save_container_logs(&self, container: &str, paths: &TaskHostPaths) {
        match self.collaborators.engine.container_logs(container).await {
            Ok(logs) => {
                if let Err(err) = fs::write(&paths.backend_container_log, logs) {
                    warn!("failed to write container logs: {}", err);
                }
            }
            Err(err) => warn!(container, "failed to fetch container logs: {:#}", err),
        }
    }

    pub async fn verify(&mut self) -> Result<String> {
        self.state = LifecycleState::Verifying;
        let backend = self.backend.clone().ok_or_else(|| {
            BenchError::Setup("verification needs a backend session".to_string())
        })?;
        let ctx = self.ctx()?;
        let container = ctx.container_name();
        let settings = self.settings(&ctx.session_id);
        let target = match (&ctx.isolation, self.options.docker) {
            (Some(isolation), true) => ScriptTarget::Container {
                engine: self.collaborators.engine.as_ref(),
                container: &container,
                isolation,
            },
            _ => ScriptTarget::Local {
                interpreter: &self.options.script_interpreter,
            },
        };
        let verification = VerificationContext {
            task: &self.task.spec,
            task_source_dir: &self.task.source_dir,
            paths: &ctx.paths,
            backend: backend.as_ref(),
            settings: &settings,
            target,
        };
        let result = run_verification(&verification).await?;
        atomic_write_bytes(&ctx.paths.result, result.as_bytes())?;
        info!(result = %result.trim(), "verification result saved");
        self.state = LifecycleState::Done;
        Ok(result)
    }

    /// Releases everything acquired so far, newest first. Safe to call more
    /// than once; returns the number of release steps that failed.
    pub async fn cleanup(&mut self) -> usize {
        self.backend = None;
        self.ledger.release_all().await
    }

    async fn run_phases(&mut self) -> Result<()> {
        self.prepare().await?;
        self.prepare_workspace().await?;
        if self.options.docker {
            self.prepare_image().await?;
            self.start_dependencies().await?;
        }
        self.converse().await?;
        self.verify().await?;
        Ok(())
    }

    /// Runs every phase, then releases what was acquired before returning,
    /// also when a phase fails or panics.
    pub async fn run(mut self) -> Result<()> {
        info!("starting task");
        let result = match AssertUnwindSafe(self.run_phases()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(anyhow!(
                "task panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        let failures = self.cleanup().await;
        if failures > 0 {
            warn!(failures, "cleanup finished with failures");
        }
        match &result {
            Ok(()) => info!("finished task"),
            Err(_) => warn!(state = ?self.state, "task stopped early"),
        }
        result
    }
}

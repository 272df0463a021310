use anyhow::Result;
use bench_core::ensure_dir;
use std::sync::Arc;
use tracing::info;

pub mod backend;
pub mod config;
pub mod conversation;
pub mod guard;
pub mod isolation;
pub mod launcher;
pub mod lifecycle;
pub mod loader;
pub mod scheduler;
pub mod transcript;
pub mod vcs;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BuildInfo, ChatRequest, HttpBackend, InferenceBackend};
pub use config::{experiment_dir, resolve_workspace_root, RunConfig};
pub use conversation::{run_conversation, ConversationOutcome, ConversationSettings, Termination};
pub use isolation::{ContainerEngine, DockerCli, IsolationConfig, ResourceLedger};
pub use launcher::{BackendFactory, ProcessBackendFactory, RemoteBackendFactory};
pub use lifecycle::{Collaborators, LifecycleOptions, LifecycleState, TaskLifecycle};
pub use loader::{load_tasks, LoadedTask};
pub use scheduler::{BatchSummary, LifecycleRunner, TaskOutcome, TaskRunner, TaskScheduler};
pub use transcript::{JsonlTranscriptSink, TranscriptSink};
pub use vcs::{GitCli, Vcs};
pub use verification::run_verification;

/// Loads the tasks named by `config` and runs them with docker and git as
/// collaborators.
pub async fn run_batch(config: &RunConfig) -> Result<BatchSummary> {
    let collaborators = Collaborators {
        backends: config.backend_factory()?,
        engine: Arc::new(DockerCli::default()),
        vcs: Arc::new(GitCli::default()),
    };
    run_batch_with(config, collaborators).await
}

pub async fn run_batch_with(config: &RunConfig, collaborators: Collaborators) -> Result<BatchSummary> {
    config.validate()?;
    let experiment_dir = config.experiment_dir();
    ensure_dir(&experiment_dir)?;
    info!(
        experiment = %config.experiment,
        dir = %experiment_dir.display(),
        model = %config.model,
        boost_thinking = config.boost_thinking,
        "preparing batch"
    );

    let tasks = load_tasks(&config.task_path, &config.load_options())?;
    let runner = LifecycleRunner {
        options: config.lifecycle_options(),
        collaborators,
    };
    let scheduler = TaskScheduler::new(config.parallel_jobs, config.ignore_errors);
    let summary = scheduler.run(&tasks, &runner).await;
    summary.log();
    Ok(summary)
}

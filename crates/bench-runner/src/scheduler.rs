use crate::lifecycle::{Collaborators, LifecycleOptions, TaskLifecycle};
use crate::loader::LoadedTask;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug)]
pub enum TaskOutcome {
    Finished,
    Error(anyhow::Error),
    /// Never started because the batch was stopping.
    Skipped,
}

/// Runs one task to completion. Errors are reported, not propagated.
#[async_trait]
pub trait TaskRunner<T: Sync>: Sync {
    fn task_name(&self, task: &T) -> String;
    async fn run_task(&self, task: &T) -> Result<()>;
}

/// Drives tasks through the full lifecycle with shared collaborators.
pub struct LifecycleRunner {
    pub options: LifecycleOptions,
    pub collaborators: Collaborators,
}

#[async_trait]
impl TaskRunner<LoadedTask> for LifecycleRunner {
    fn task_name(&self, task: &LoadedTask) -> String {
        task.name()
    }

    async fn run_task(&self, task: &LoadedTask) -> Result<()> {
        TaskLifecycle::new(task, &self.options, &self.collaborators)
            .run()
            .await
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    /// One entry per input task, in input order.
    pub outcomes: Vec<(String, TaskOutcome)>,
}

impl BatchSummary {
    pub fn finished(&self) -> Vec<&str> {
        self.names(|o| matches!(o, TaskOutcome::Finished))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names(|o| matches!(o, TaskOutcome::Skipped))
    }

    pub fn errors(&self) -> Vec<(&str, &anyhow::Error)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                TaskOutcome::Error(err) => Some((name.as_str(), err)),
                _ => None,
            })
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, o)| matches!(o, TaskOutcome::Error(_)))
    }

    fn names(&self, keep: impl Fn(&TaskOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| keep(outcome))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Logs counts and task names. Error chains are left to the caller,
    /// which prints each one once.
    pub fn log(&self) {
        let finished = self.finished();
        let skipped = self.skipped();
        let errors = self.errors();
        info!(
            finished = finished.len(),
            errors = errors.len(),
            skipped = skipped.len(),
            "batch complete"
        );
        for name in &finished {
            info!("finished: {}", name);
        }
        for name in &skipped {
            warn!("skipped: {}", name);
        }
        for (name, _) in &errors {
            error!("error: {}", name);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskScheduler {
    pub max_concurrency: usize,
    /// Keep starting tasks after a failure.
    pub ignore_errors: bool,
}

impl TaskScheduler {
    pub fn new(max_concurrency: usize, ignore_errors: bool) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ignore_errors,
        }
    }

    /// Runs every task at most `max_concurrency` at a time on the calling
    /// task. After a failure that is not ignored, tasks still waiting for a
    /// permit are skipped; running ones finish.
    pub async fn run<T, R>(&self, tasks: &[T], runner: &R) -> BatchSummary
    where
        T: Sync,
        R: TaskRunner<T> + ?Sized,
    {
        let permits = Semaphore::new(self.max_concurrency.max(1));
        let stop = AtomicBool::new(false);
        info!(
            tasks = tasks.len(),
            parallel = self.max_concurrency,
            "starting batch"
        );

        let units = tasks.iter().map(|task| {
            let permits = &permits;
            let stop = &stop;
            async move {
                let name = runner.task_name(task);
                let _permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (name, TaskOutcome::Skipped),
                };
                if stop.load(Ordering::SeqCst) {
                    return (name, TaskOutcome::Skipped);
                }

                let span = info_span!("task", name = %name);
                let outcome = match AssertUnwindSafe(runner.run_task(task))
                    .catch_unwind()
                    .instrument(span)
                    .await
                {
                    Ok(Ok(())) => TaskOutcome::Finished,
                    Ok(Err(err)) => TaskOutcome::Error(err),
                    Err(payload) => TaskOutcome::Error(anyhow!(
                        "task panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                };
                if let TaskOutcome::Error(err) = &outcome {
                    error!(task = %name, "task failed: {}", err);
                    if !self.ignore_errors && !stop.swap(true, Ordering::SeqCst) {
                        warn!("stopping batch: remaining tasks will be skipped");
                    }
                }
                (name, outcome)
            }
        });

        BatchSummary {
            outcomes: join_all(units).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct ProbeRunner {
        failing: HashSet<&'static str>,
        panicking: HashSet<&'static str>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl TaskRunner<(&'static str, u64)> for ProbeRunner {
        fn task_name(&self, task: &(&'static str, u64)) -> String {
            task.0.to_string()
        }

        async fn run_task(&self, task: &(&'static str, u64)) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms + task.1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panicking.contains(task.0) {
                panic!("probe panic in {}", task.0);
            }
            if self.failing.contains(task.0) {
                return Err(anyhow!("probe failure in {}", task.0));
            }
            Ok(())
        }
    }

    fn tasks(names: &[(&'static str, u64)]) -> Vec<(&'static str, u64)> {
        names.to_vec()
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_limit() {
        let runner = ProbeRunner {
            delay_ms: 5,
            ..ProbeRunner::default()
        };
        let names: Vec<(&'static str, u64)> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|n| (*n, 0))
            .collect();
        let summary = TaskScheduler::new(3, false).run(&names, &runner).await;
        assert_eq!(summary.finished().len(), 8);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
        let order: Vec<&str> = summary.outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e", "f", "g", "h"]);
    }

    #[tokio::test]
    async fn failure_skips_waiting_tasks_and_drains_running_ones() {
        let runner = ProbeRunner {
            failing: HashSet::from(["fail"]),
            ..ProbeRunner::default()
        };
        let batch = tasks(&[("fail", 10), ("slow", 50), ("c", 0), ("d", 0)]);
        let summary = TaskScheduler::new(2, false).run(&batch, &runner).await;

        assert_eq!(summary.finished(), vec!["slow"]);
        assert_eq!(summary.skipped(), vec!["c", "d"]);
        let errors = summary.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "fail");
        assert!(summary.has_errors());
    }

    #[tokio::test]
    async fn ignored_errors_do_not_stop_the_batch() {
        let runner = ProbeRunner {
            failing: HashSet::from(["a"]),
            ..ProbeRunner::default()
        };
        let batch = tasks(&[("a", 0), ("b", 0), ("c", 0)]);
        let summary = TaskScheduler::new(1, true).run(&batch, &runner).await;
        assert_eq!(summary.finished(), vec!["b", "c"]);
        assert!(summary.skipped().is_empty());
        assert_eq!(summary.errors().len(), 1);
    }

    #[tokio::test]
    async fn panic_becomes_an_error_outcome() {
        let runner = ProbeRunner {
            panicking: HashSet::from(["boom"]),
            ..ProbeRunner::default()
        };
        let batch = tasks(&[("boom", 0), ("next", 0)]);
        let summary = TaskScheduler::new(1, false).run(&batch, &runner).await;
        let errors = summary.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.to_string().contains("probe panic in boom"));
        assert_eq!(summary.skipped(), vec!["next"]);
    }
}

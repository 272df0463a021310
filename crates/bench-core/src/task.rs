use crate::message::Message;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_chat: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_python_workdir: Option<String>,
    #[serde(default)]
    pub run_python_params: Vec<String>,
}

/// The resolved, mutually exclusive verification strategy of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationMode<'a> {
    Chat(&'a [Message]),
    Script {
        script: &'a str,
        workdir: Option<&'a str>,
        params: &'a [String],
    },
}

impl Verification {
    pub fn mode(&self) -> Result<VerificationMode<'_>> {
        match (&self.run_chat, &self.run_python) {
            (Some(messages), None) => Ok(VerificationMode::Chat(messages)),
            (None, Some(script)) => Ok(VerificationMode::Script {
                script,
                workdir: self.run_python_workdir.as_deref(),
                params: &self.run_python_params,
            }),
            (Some(_), Some(_)) => Err(anyhow!(
                "verification must use either run_chat or run_python, not both"
            )),
            (None, None) => Err(anyhow!(
                "verification requires one of run_chat or run_python"
            )),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

/// One evaluation task as defined by its YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub domain: String,
    pub topic: String,
    pub train_or_test: String,
    pub task_name: String,

    pub repo: String,
    pub revision: String,

    pub task: Vec<Message>,
    pub verification: Verification,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_also_known_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competency_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_yaml: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_compose_dependencies_yaml: Option<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub ignored_files: Vec<String>,
}

pub const EMPTY_REPO_DIR: &str = "workspace";

pub fn normalize_identity_part(raw: &str) -> String {
    raw.replace(['/', '-', '.'], "_")
}

impl TaskSpec {
    /// Directory name of the checkout inside the task dir.
    pub fn repo_underscores(&self) -> String {
        let repo = self
            .repo_also_known_as
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .unwrap_or(&self.repo);
        normalize_identity_part(repo)
    }

    /// `{topic}-{repo}-{train_or_test}-{task_name}` with each part normalized.
    pub fn task_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            normalize_identity_part(&self.topic),
            self.repo_underscores(),
            normalize_identity_part(&self.train_or_test),
            normalize_identity_part(&self.task_name),
        )
    }

    pub fn has_repo(&self) -> bool {
        !self.repo.is_empty()
    }

    /// Checkout directory name; repo-less tasks get an empty `workspace` dir.
    pub fn checkout_dir_name(&self) -> String {
        let name = self.repo_underscores();
        if name.is_empty() {
            EMPTY_REPO_DIR.to_string()
        } else {
            name
        }
    }
}

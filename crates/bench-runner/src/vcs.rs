use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Checkout of a project at a fixed revision.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clones `repo` into `dest` when it is missing, otherwise resets the
    /// existing checkout; either way `dest` ends at `revision` with no stray files.
    async fn checkout(&self, repo: &str, revision: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

/// Candidate clone URLs: ssh first, https as fallback. Full URLs are used as is.
pub fn clone_urls(repo: &str) -> Vec<String> {
    if repo.starts_with("http://")
        || repo.starts_with("https://")
        || repo.starts_with("git@")
        || repo.starts_with("ssh://")
        || repo.starts_with("file://")
        || repo.starts_with('/')
    {
        return vec![repo.to_string()];
    }
    let short = repo.trim_end_matches(".git");
    vec![
        format!("git@github.com:{}.git", short),
        format!("https://github.com/{}.git", short),
    ]
}

impl GitCli {
    async fn git(&self, cwd: Option<&Path>, args: &[&str], step: &str) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null());
        let out = cmd
            .output()
            .await
            .with_context(|| format!("{}: failed to spawn git", step))?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(anyhow!("{}: {}", step, stderr))
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn checkout(&self, repo: &str, revision: &str, dest: &Path) -> Result<()> {
        if dest.join(".git").exists() {
            debug!(dest = %dest.display(), revision, "resetting existing checkout");
            self.git(Some(dest), &["reset", "--hard", revision], "git reset")
                .await?;
            self.git(Some(dest), &["clean", "-fdx"], "git clean").await?;
            return Ok(());
        }

        let dest_text = dest.to_string_lossy().to_string();
        let mut last_err = None;
        for url in clone_urls(repo) {
            info!(%url, dest = %dest.display(), "cloning");
            match self
                .git(None, &["clone", &url, &dest_text], "git clone")
                .await
            {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("{:#}", err);
                    let _ = tokio::fs::remove_dir_all(dest).await;
                    last_err = Some(err);
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err.context(format!("could not clone {}", repo)));
        }
        if !revision.is_empty() {
            self.git(Some(dest), &["reset", "--hard", revision], "git reset")
                .await?;
        }
        Ok(())
    }
}

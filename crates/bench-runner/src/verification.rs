use crate::backend::InferenceBackend;
use crate::conversation::{run_conversation, ConversationSettings};
use crate::isolation::{ContainerEngine, ExecOutput, IsolationConfig};
use crate::transcript::{save_messages, JsonlTranscriptSink};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bench_core::{ensure_dir, BenchError, Message, TaskHostPaths, TaskSpec, VerificationMode};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

pub const LOGS_BUNDLE_FIELD: &str = "logs_tarball_base64";
pub const SCRIPT_INTERPRETERS: [&str; 2] = ["python3", "python"];
/// Turn budget of a verification conversation, independent of the task's.
pub const VERIFICATION_MAX_STEPS: usize = 50;

/// Where a verification script runs.
pub enum ScriptTarget<'a> {
    Local { interpreter: &'a str },
    Container {
        engine: &'a dyn ContainerEngine,
        container: &'a str,
        isolation: &'a IsolationConfig,
    },
}

pub struct VerificationContext<'a> {
    pub task: &'a TaskSpec,
    /// Directory holding the task definition; script paths resolve against it.
    pub task_source_dir: &'a Path,
    pub paths: &'a TaskHostPaths,
    pub backend: &'a dyn InferenceBackend,
    pub settings: &'a ConversationSettings,
    pub target: ScriptTarget<'a>,
}

/// Runs the task's verification and returns the normalized result text.
pub async fn run_verification(ctx: &VerificationContext<'_>) -> Result<String> {
    match ctx.task.verification.mode()? {
        VerificationMode::Chat(messages) => verify_with_chat(ctx, messages.to_vec()).await,
        VerificationMode::Script {
            script,
            workdir,
            params,
        } => {
            let script_path = ctx.task_source_dir.join(script);
            let source = fs::read_to_string(&script_path).map_err(|e| {
                BenchError::Verification(format!(
                    "failed to read verification script {}: {}",
                    script_path.display(),
                    e
                ))
            })?;
            fs::write(&ctx.paths.verify_script, source).map_err(|e| {
                BenchError::Verification(format!(
                    "failed to write {}: {}",
                    ctx.paths.verify_script.display(),
                    e
                ))
            })?;
            info!(script = %script_path.display(), "running verification script");

            let output = match &ctx.target {
                ScriptTarget::Local { interpreter } => {
                    let mut cwd = ctx.paths.repo.clone();
                    if let Some(sub) = workdir {
                        cwd = cwd.join(sub);
                    }
                    run_local_script(interpreter, &ctx.paths.verify_script, params, &cwd).await?
                }
                ScriptTarget::Container {
                    engine,
                    container,
                    isolation,
                } => {
                    let cwd = match workdir {
                        Some(sub) => container_join(&isolation.container_workspace_folder, sub),
                        None => isolation.container_workspace_folder.clone(),
                    };
                    run_container_script(*engine, container, &ctx.paths.verify_script, params, &cwd)
                        .await?
                }
            };
            if !output.stderr.is_empty() {
                return Err(BenchError::Verification(format!(
                    "verification script wrote to stderr: {}",
                    output.stderr.trim_end()
                ))
                .into());
            }
            Ok(normalize_script_result(output.stdout, &ctx.paths.artifacts))
        }
    }
}

async fn verify_with_chat(ctx: &VerificationContext<'_>, initial: Vec<Message>) -> Result<String> {
    info!("running verification conversation");
    let settings = ConversationSettings {
        max_steps: VERIFICATION_MAX_STEPS,
        ..ctx.settings.clone()
    };
    let mut sink = JsonlTranscriptSink::create(&ctx.paths.verify_transcript)?;
    let outcome = run_conversation(ctx.backend, initial, &settings, &mut sink).await?;
    save_messages(&ctx.paths.root, "verify", &outcome.messages)?;
    outcome
        .messages
        .last()
        .and_then(Message::text)
        .ok_or_else(|| {
            BenchError::Verification("verification conversation ended without content".into())
                .into()
        })
}

fn container_join(base: &str, sub: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), sub.trim_start_matches("./"))
}

pub async fn run_local_script(
    interpreter: &str,
    script: &Path,
    params: &[String],
    cwd: &Path,
) -> Result<ExecOutput> {
    let out = Command::new(interpreter)
        .arg(script)
        .args(params)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run {} {}", interpreter, script.display()))?;
    Ok(ExecOutput {
        exit_code: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out.stdout).to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).to_string(),
    })
}

/// Copies the script into the container and runs it, falling back to the
/// next interpreter name when one exits non-zero.
pub async fn run_container_script(
    engine: &dyn ContainerEngine,
    container: &str,
    script: &Path,
    params: &[String],
    workdir: &str,
) -> Result<ExecOutput> {
    engine
        .copy_into(container, script, workdir)
        .await
        .map_err(|e| BenchError::Isolation(format!("copying verification script: {:#}", e)))?;
    let file_name = script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("script path has no file name: {}", script.display()))?;
    let in_container = container_join(workdir, &file_name);

    let mut last = None;
    for interpreter in SCRIPT_INTERPRETERS {
        let mut argv = vec![interpreter.to_string(), in_container.clone()];
        argv.extend(params.iter().cloned());
        let output = engine.exec(container, workdir, &argv).await?;
        if output.exit_code == 0 {
            return Ok(output);
        }
        warn!(
            interpreter,
            exit_code = output.exit_code,
            "verification interpreter failed: {}",
            output.stderr.trim_end()
        );
        last = Some(output);
    }
    last.ok_or_else(|| anyhow!("no interpreter attempted"))
}

/// Strips an embedded log bundle from a JSON result, unpacking it into
/// `artifacts_dir`. Anything that is not a JSON object passes through unchanged.
pub fn normalize_script_result(stdout: String, artifacts_dir: &Path) -> String {
    let mut parsed: Value = match serde_json::from_str(&stdout) {
        Ok(value) => value,
        Err(err) => {
            warn!("verification output is not JSON, skipping log extraction: {}", err);
            return stdout;
        }
    };
    let Some(bundle) = parsed
        .as_object_mut()
        .and_then(|map| map.remove(LOGS_BUNDLE_FIELD))
    else {
        return stdout;
    };
    match bundle.as_str() {
        Some(encoded) => match extract_logs_bundle(encoded, artifacts_dir) {
            Ok(()) => info!(dir = %artifacts_dir.display(), "extracted verification logs"),
            Err(err) => warn!("failed to extract verification logs: {:#}", err),
        },
        None => warn!("{} is not a string", LOGS_BUNDLE_FIELD),
    }
    serde_json::to_string_pretty(&parsed).unwrap_or(stdout)
}

pub fn extract_logs_bundle(encoded: &str, artifacts_dir: &Path) -> Result<()> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim().as_bytes())
        .context("invalid base64 log bundle")?;
    ensure_dir(artifacts_dir)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    archive
        .unpack(artifacts_dir)
        .with_context(|| format!("failed to unpack logs into {}", artifacts_dir.display()))?;
    Ok(())
}

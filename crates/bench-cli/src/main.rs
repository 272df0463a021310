use anyhow::Result;
use bench_collect::{collect_table, export_results};
use bench_runner::config::{
    API_KEY_ENV, DEFAULT_CACHE_LEVEL, DEFAULT_CHAT_MAX_DEPTH, DEFAULT_EXPERIMENT, WORKSPACE_ENV,
};
use bench_runner::{experiment_dir, resolve_workspace_root, run_batch, BatchSummary, RunConfig};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench", version, about = "Batch runner for coding-agent evaluation tasks")]
struct Cli {
    /// Debug logging; RUST_LOG overrides.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a task yaml or every task under a directory")]
    Run(RunArgs),
    #[command(about = "Collect task results of an experiment into csv and jsonl")]
    Collect {
        #[arg(long)]
        workspace_dir: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_EXPERIMENT)]
        experiment: String,
        #[arg(long, default_value = "results")]
        out: PathBuf,
        /// Fail on the first malformed task directory.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task yaml file or directory searched recursively.
    task: PathBuf,
    #[arg(long)]
    workspace_dir: Option<PathBuf>,
    #[arg(short, long, default_value = DEFAULT_EXPERIMENT)]
    experiment: String,
    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,
    /// Run at most this many tasks.
    #[arg(short = 'n', long)]
    amount: Option<usize>,
    #[arg(short = 'j', long, default_value_t = 1)]
    parallel_jobs: usize,
    #[arg(long)]
    docker: bool,
    #[arg(long)]
    rebuild_image: bool,
    /// Run tasks even when their results are already collected.
    #[arg(long)]
    rerun_all: bool,
    /// Shared backend to talk to.
    #[arg(long)]
    backend_url: Option<String>,
    /// Backend binary to start once per task.
    #[arg(long)]
    backend_bin: Option<PathBuf>,
    /// Inference address handed to per-task backends.
    #[arg(long, default_value = "")]
    address_url: String,
    /// 0 removes images after each task, 1 keeps images, 2 also keeps build cache.
    #[arg(long, default_value_t = DEFAULT_CACHE_LEVEL)]
    cache_level: i32,
    #[arg(long)]
    ignore_errors: bool,
    #[arg(short, long, default_value = "")]
    model: String,
    #[arg(long)]
    boost_thinking: bool,
    #[arg(long, default_value_t = DEFAULT_CHAT_MAX_DEPTH)]
    chat_max_depth: usize,
    /// Interpreter for verification scripts run outside containers.
    #[arg(long, default_value = "python3")]
    python: String,
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn into_config(self, cwd: &Path) -> RunConfig {
        let env_workspace = std::env::var(WORKSPACE_ENV).ok();
        RunConfig {
            task_path: self.task,
            workspace_root: resolve_workspace_root(
                self.workspace_dir.as_deref(),
                env_workspace.as_deref(),
                cwd,
            ),
            experiment: self.experiment,
            api_key: self.api_key.filter(|k| !k.is_empty()),
            amount: self.amount,
            parallel_jobs: self.parallel_jobs,
            docker: self.docker,
            rebuild_image: self.rebuild_image,
            rerun_all: self.rerun_all,
            backend_url: self.backend_url,
            backend_bin: self.backend_bin,
            address_url: self.address_url,
            cache_level: self.cache_level,
            ignore_errors: self.ignore_errors,
            model: self.model,
            boost_thinking: self.boost_thinking,
            chat_max_depth: self.chat_max_depth,
            script_interpreter: self.python,
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Run(args) => {
            let json_mode = args.json;
            let cwd = std::env::current_dir()?;
            let config = args.into_config(&cwd);
            let summary = run_batch(&config).await?;
            if json_mode {
                emit_json(&summary_to_json(&summary));
            } else {
                print_errors(&summary);
            }
            if summary.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Collect {
            workspace_dir,
            experiment,
            out,
            strict,
            json,
        } => {
            let cwd = std::env::current_dir()?;
            let env_workspace = std::env::var(WORKSPACE_ENV).ok();
            let root =
                resolve_workspace_root(workspace_dir.as_deref(), env_workspace.as_deref(), &cwd);
            let dir = experiment_dir(&root, &experiment);
            let table = collect_table(&dir, &experiment, strict)?;
            let written = export_results(&out, &experiment, &table.records)?;
            if json {
                emit_json(&json!({
                    "ok": table.malformed.is_empty(),
                    "command": "collect",
                    "experiment": experiment,
                    "records": table.records.len(),
                    "skipped": table.skipped,
                    "malformed": table.malformed.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                    "written": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                }));
            } else {
                println!(
                    "collected {} tasks ({} from other experiments, {} malformed)",
                    table.records.len(),
                    table.skipped,
                    table.malformed.len()
                );
                for path in written {
                    println!("wrote {}", path.display());
                }
            }
            Ok(())
        }
    }
}

fn summary_to_json(summary: &BatchSummary) -> Value {
    json!({
        "ok": !summary.has_errors(),
        "command": "run",
        "finished": summary.finished(),
        "skipped": summary.skipped(),
        "errors": summary
            .errors()
            .into_iter()
            .map(|(task, err)| json!({
                "task": task,
                "kind": bench_core::BenchError::classify(err).map(|k| k.as_str()),
                "message": format!("{:#}", err),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Full error chain of every failed task; the only place chains are printed.
fn error_report(summary: &BatchSummary) -> String {
    summary
        .errors()
        .into_iter()
        .map(|(task, err)| format!("\n=== {} ===\n{:?}\n", task, err))
        .collect()
}

fn print_errors(summary: &BatchSummary) {
    eprint!("{}", error_report(summary));
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{{\"ok\":false,\"error\":\"failed to serialize JSON payload\"}}"),
    }
}

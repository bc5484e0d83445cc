//! qjs-bridge CLI entry point.
//!
//! Evaluates a script file or an inline expression in a fresh guest machine
//! and prints the result. Guest `print` and `console.*` output goes to stdout.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qjs_bridge_common::ConfigFile;
use qjs_bridge_core::Value;
use qjs_bridge_host::Bridge;

#[derive(Debug, Parser)]
#[command(name = "qjs-bridge", version, about = "Run JavaScript in a sandboxed QuickJS guest")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "QJS_BRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// QuickJS guest module (`.wasm`). Overrides `[guest] path`.
    #[arg(long, env = "QJS_BRIDGE_WASM", global = true)]
    wasm: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a script file. `.mjs` files run as modules.
    Run {
        /// Script to evaluate.
        file: PathBuf,
    },
    /// Evaluate an inline expression.
    Eval {
        /// Source to evaluate.
        expr: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let bridge = load_bridge(&cli)?;
    let runtime = bridge.new_runtime().context("Failed to create guest machine")?;
    runtime
        .set_log_handler(|line| println!("{line}"))
        .context("Failed to install guest output handler")?;
    let ctx = runtime.new_context().context("Failed to create context")?;

    let result = match &cli.command {
        Command::Run { file } => {
            info!(file = %file.display(), "Running script");
            ctx.eval_file(file)
                .with_context(|| format!("Evaluation of {} failed", file.display()))?
        }
        Command::Eval { expr } => ctx.eval(expr).context("Evaluation failed")?,
    };

    let jobs = runtime
        .execute_pending_jobs()
        .context("Pending job failed")?;
    debug!(status = jobs, "Pending jobs drained");
    print_result(&result)?;

    let stats = runtime.stats()?;
    debug!(
        contexts = stats.contexts,
        arena_wraps = stats.arena_wraps,
        callbacks = stats.callbacks_dispatched,
        "Machine finished"
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,qjs_bridge=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries guest output and the result.
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_bridge(cli: &Cli) -> anyhow::Result<Bridge> {
    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };

    Bridge::from_config_file(&file, cli.wasm.as_deref())
        .context("Failed to load guest module (set --wasm or QJS_BRIDGE_WASM)")
}

fn print_result(value: &Value) -> anyhow::Result<()> {
    // Module evaluation yields a promise or undefined; nothing to print.
    if value.is_undefined()? || value.is_promise()? {
        return Ok(());
    }
    let text = value.to_string().context("Failed to convert result")?;
    println!("{text}");
    Ok(())
}

//! jsbridge CLI
//!
//! Evaluate a script file or an expression in a fresh context.

use std::path::PathBuf;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use jsbridge::{Context, Engine, EngineConfig, List, Record, Value};

/// Run JavaScript through the jsbridge host bridge
#[derive(Parser, Debug)]
#[command(name = "jsbridge")]
#[command(about = "Run JavaScript through the jsbridge host bridge", long_about = None)]
struct Args {
    /// Script file to run
    script: Option<PathBuf>,

    /// Evaluate an expression instead of a file
    #[arg(short, long, conflicts_with = "script")]
    eval: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Heap limit in bytes
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Execution time limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Arguments made available to the script as `host.args`
    #[arg(last = true)]
    script_args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = EngineConfig::load(args.config.as_deref())
        .context("failed to load engine configuration")?;
    if let Some(limit) = args.memory_limit {
        config.memory_limit = Some(limit);
    }
    if let Some(timeout) = args.timeout_ms {
        config.execution_timeout_ms = Some(timeout);
    }
    debug!(?config, "engine configuration");

    let (source, origin) = match (&args.script, &args.eval) {
        (Some(path), _) => (
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            path.display().to_string(),
        ),
        (None, Some(expr)) => (expr.clone(), "<cli>".to_string()),
        (None, None) => bail!("nothing to run: pass a script file or --eval"),
    };

    let engine = Engine::with_config(config).map_err(bridge_error)?;
    let context = Context::new(&engine).map_err(bridge_error)?;
    install_host(&context, &args.script_args).map_err(bridge_error)?;

    info!(origin = %origin, "running");
    let result = context
        .evaluate_with_origin(&source, &origin)
        .map_err(bridge_error)?;

    if args.json {
        let json = result.to_json().map_err(bridge_error)?;
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else if !matches!(result, Value::Undefined) {
        println!("{result}");
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jsbridge=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Bridge errors hold guest values and are not `Send`, so only their
/// message travels into `anyhow`.
fn bridge_error(err: jsbridge::Error) -> anyhow::Error {
    match err.guest_exception().and_then(|exception| exception.stack.clone()) {
        Some(stack) => anyhow!("{err}\n{stack}"),
        None => anyhow!("{err}"),
    }
}

fn install_host(context: &Context, script_args: &[String]) -> jsbridge::Result<()> {
    context.expose_global(
        "print",
        Value::function("print", |args| {
            let line = args
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            info!(target: "jsbridge::guest", "{line}");
            Ok(Value::Undefined)
        }),
    )?;

    let host_args: List = script_args.iter().map(|arg| Value::from(arg.as_str())).collect();
    let host = Record::new("Host")
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("args", host_args)
        .frozen();
    context.expose_global("host", Value::object(host))
}

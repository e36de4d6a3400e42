mod cli;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use tokio::signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, RunArgs};
use overlay_supervisor::{
    config::{
        read_script_source, resolve_output_path, Config, ExecutionConfig, KEY_FLAVOR,
        KEY_INTERPRETER, KEY_MAX_RETRIES, KEY_OUTPUT_FILE, KEY_REQUIRED_FIELDS, KEY_RETRY_DELAY,
        KEY_SCRIPT_PATH, KEY_TIMEOUT, USER_ENV_PREFIX,
    },
    fallback,
    validate::validate_output,
    ResultDocument, Supervisor,
};

// Conventional shell codes for death by signal: 128 + signal number.
const EXIT_SIGINT: u8 = 130;
const EXIT_SIGTERM: u8 = 143;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_logging(&args);

    match dispatch(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    // RUST_LOG wins when set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(args.verbose)
        .init();
}

async fn dispatch(args: Cli) -> Result<u8> {
    let config_path = args.config.clone();
    match args.command {
        None => run(config_path.as_deref(), &args.run).await,
        Some(Command::Run(run_args)) => run(config_path.as_deref(), &run_args).await,
        Some(Command::ShowConfig(run_args)) => show_config(config_path.as_deref(), &run_args),
        Some(Command::Validate {
            path,
            require,
            flavor,
        }) => {
            let run_args = RunArgs {
                flavor,
                require,
                ..RunArgs::default()
            };
            validate(config_path.as_deref(), &path, &run_args)
        }
    }
}

fn load_config(path: Option<&Path>, args: &RunArgs) -> Result<Config> {
    let mut cfg = Config::load(path)?;
    apply_overrides(&mut cfg, args);
    Ok(cfg)
}

/// Command-line flags take precedence over the rc file and environment.
fn apply_overrides(cfg: &mut Config, args: &RunArgs) {
    if let Some(flavor) = args.flavor {
        cfg.set(KEY_FLAVOR, flavor.to_string());
    }
    if let Some(script) = &args.script {
        cfg.set(KEY_SCRIPT_PATH, script.to_string_lossy());
    }
    if let Some(output) = &args.output {
        cfg.set(KEY_OUTPUT_FILE, output.to_string_lossy());
    }
    if let Some(timeout) = args.timeout {
        cfg.set(KEY_TIMEOUT, timeout.to_string());
    }
    if let Some(n) = args.max_retries {
        cfg.set(KEY_MAX_RETRIES, n.to_string());
    }
    if let Some(delay) = args.retry_delay {
        cfg.set(KEY_RETRY_DELAY, delay.to_string());
    }
    if let Some(interpreter) = &args.interpreter {
        cfg.set(KEY_INTERPRETER, interpreter.to_string_lossy());
    }
    if !args.require.is_empty() {
        cfg.set(KEY_REQUIRED_FIELDS, args.require.join(","));
    }
    for (k, v) in &args.env {
        cfg.set(format!("{}{}", USER_ENV_PREFIX, k), v.clone());
    }
}

async fn run(config_path: Option<&Path>, args: &RunArgs) -> Result<u8> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let cfg = load_config(config_path, args);
    // Known before anything is validated, so every early failure still
    // leaves an error document for the next bootstrap step.
    let output = match &cfg {
        Ok(cfg) => resolve_output_path(cfg),
        Err(_) => args.output.clone().unwrap_or_else(|| {
            PathBuf::from(args.flavor.unwrap_or_default().default_output_file())
        }),
    };

    let exec = match cfg.and_then(|cfg| prepare(&cfg)) {
        Ok(exec) => exec,
        Err(e) => {
            write_error_document(
                &output,
                format!("Overlay network supervisor could not start: {:#}", e),
            );
            return Err(e);
        }
    };

    // The run future is dropped when a signal wins, which removes the script
    // file and kills the script's process group.
    let finished = tokio::select! {
        report = Supervisor::new(exec).run() => Ok(report?),
        Some(()) = sigterm.recv() => Err(("SIGTERM", EXIT_SIGTERM)),
        Ok(()) = ctrl_c() => Err(("SIGINT", EXIT_SIGINT)),
    };

    match finished {
        Ok(report) => {
            info!(
                status = ?report.status,
                attempts = report.attempts.len(),
                exit_code = report.exit_code(),
                "supervisor finished"
            );
            Ok(report.exit_code())
        }
        Err((name, code)) => {
            warn!(signal = name, "received shutdown signal, abandoning overlay network script");
            write_error_document(
                &output,
                format!("Overlay network script interrupted by {}", name),
            );
            Ok(code)
        }
    }
}

/// Resolve the execution settings, then the script.
fn prepare(cfg: &Config) -> Result<ExecutionConfig> {
    let base = ExecutionConfig::from_config(cfg, String::new())?;
    let script = read_script_source(cfg.get_path(KEY_SCRIPT_PATH).as_deref())?;
    Ok(ExecutionConfig { script, ..base })
}

fn write_error_document(output: &Path, message: String) {
    let doc = ResultDocument::error(message);
    if let Err(e) = fallback::write_document(output, &doc) {
        error!(error = %e, path = %output.display(), "could not write error document");
    }
}

fn show_config(config_path: Option<&Path>, args: &RunArgs) -> Result<u8> {
    let cfg = load_config(config_path, args)?;
    let exec = ExecutionConfig::from_config(&cfg, String::new())?;

    let mut value = exec.redacted_json();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("script_bytes");
        obj.insert("config_file".into(), cfg.config_path.to_string_lossy().into());
        obj.insert(
            "script_path".into(),
            cfg.get(KEY_SCRIPT_PATH).unwrap_or_else(|| "-".into()).into(),
        );
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(0)
}

fn validate(config_path: Option<&Path>, path: &Path, args: &RunArgs) -> Result<u8> {
    let cfg = load_config(config_path, args)?;
    let exec = ExecutionConfig::from_config(&cfg, String::new())?;

    match validate_output(path, &exec.required_fields) {
        Ok(doc) => {
            let pretty = doc
                .to_pretty_json()
                .context("rendering validated document")?;
            println!("{}", pretty);
            info!(path = %path.display(), "document is valid");
            Ok(0)
        }
        Err(failure) => {
            println!("invalid: {}", failure);
            error!(path = %path.display(), kind = failure.kind(), "document is invalid");
            Ok(1)
        }
    }
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use overlay_supervisor::NodeFlavor;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "overlay-supervisor",
    about = "Run a node's overlay network script under a timeout with retries",
    version
)]
pub struct Cli {
    /// Supervisor rc file (KEY=VALUE lines).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log debug detail.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Log warnings and errors only.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,

    // `run` options, also accepted without the subcommand
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Execute the overlay script (default).
    Run(RunArgs),

    /// Check an existing result document against the output contract.
    Validate {
        /// Result document to check.
        path: PathBuf,

        /// Required field; repeat for several. `status` is always required.
        #[arg(long = "require", value_name = "FIELD")]
        require: Vec<String>,

        /// Node flavor whose default required fields apply.
        #[arg(long, value_enum)]
        flavor: Option<NodeFlavor>,
    },

    /// Print the resolved configuration as JSON (secrets redacted).
    ShowConfig(RunArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Node flavor.
    #[arg(long, value_enum)]
    pub flavor: Option<NodeFlavor>,

    /// Script to run; `-` reads it from stdin.
    #[arg(long, value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Where the script writes its result document.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Per-attempt timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Maximum number of attempts.
    #[arg(long = "max-retries", value_name = "N")]
    pub max_retries: Option<u64>,

    /// Delay before the second attempt in seconds; doubles after each retry.
    #[arg(long = "retry-delay", value_name = "SECS")]
    pub retry_delay: Option<u64>,

    /// Interpreter used to run the script.
    #[arg(long, value_name = "PATH")]
    pub interpreter: Option<PathBuf>,

    /// Required output field; repeat for several. `status` is always required.
    #[arg(long = "require", value_name = "FIELD")]
    pub require: Vec<String>,

    /// Extra variable for the script environment.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let k = k.trim();
    if k.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((k.to_string(), v.to_string()))
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

use clap::{Parser, Subcommand, ValueEnum};
use shellgate_terminal::BackendKind;
use std::path::PathBuf;

/// CLI arguments for shellgate
#[derive(Parser, Debug)]
#[command(name = "shellgate")]
#[command(about = "Approval-gated shell sessions for humans and agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (TOML). Defaults to ./shellgate.toml when present
    #[arg(long, short = 'c', global = true, env = "SHELLGATE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Standalone policy file, rewritten when the policy is changed at runtime
    #[arg(long, global = true, env = "SHELLGATE_POLICY_FILE", value_name = "FILE")]
    pub policy_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "shellgate=trace,tower_http=warn"
    #[arg(long, global = true, env = "SHELLGATE_LOG_LEVEL", value_name = "FILTER")]
    pub log_level: Option<String>,

    #[arg(long, global = true, env = "SHELLGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "SHELLGATE_LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP and WebSocket server (default)
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Classify a command against the configured policy and print the verdict
    Classify {
        /// The command line to classify
        command: String,

        /// Classify as if auto-approve mode were on
        #[arg(long)]
        auto_approve: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "SHELLGATE_BIND")]
    pub bind: Option<String>,

    #[arg(long, short = 'p', env = "SHELLGATE_PORT")]
    pub port: Option<u16>,

    /// Execution backend: pty or docker
    #[arg(long, env = "SHELLGATE_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Directory under which session workspaces are created
    #[arg(long, env = "SHELLGATE_WORKSPACE_ROOT", value_name = "DIR")]
    pub workspace_root: Option<PathBuf>,

    /// Serve a web client from this directory under /static
    #[arg(long, env = "SHELLGATE_STATIC_DIR", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,

    /// Run whitelisted commands without confirmation
    #[arg(long)]
    pub auto_approve: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Cli {
    /// The subcommand to run, `serve` when none was given
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Serve(ServeArgs::default()))
    }
}

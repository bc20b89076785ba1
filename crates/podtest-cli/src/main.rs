mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use podtest_core::executor::RunMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "podtest",
    about = "Distributed test runner for container clusters",
    version
)]
struct Cli {
    /// Log level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test job
    Run {
        /// Path to the job file (YAML)
        #[arg(long, short)]
        file: PathBuf,

        /// Execution mode
        #[arg(long, value_enum, default_value_t = Mode::Kubernetes)]
        mode: Mode,

        /// Use the in-cluster service account configuration
        #[arg(long)]
        in_cluster: bool,

        /// Path to the kubeconfig file (ignored with --in-cluster)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target namespace
        #[arg(long, short, default_value = "default")]
        namespace: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Kubernetes,
    Local,
    DryRun,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Kubernetes => write!(f, "kubernetes"),
            Mode::Local => write!(f, "local"),
            Mode::DryRun => write!(f, "dry-run"),
        }
    }
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Kubernetes => RunMode::Kubernetes,
            Mode::Local => RunMode::Local,
            Mode::DryRun => RunMode::DryRun,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let code = match cli.command {
        Commands::Run {
            file,
            mode,
            in_cluster,
            config,
            namespace,
        } => commands::run::run(&file, mode.into(), in_cluster, config, namespace).await,
    };
    std::process::exit(code);
}

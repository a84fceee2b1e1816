use std::path::PathBuf;

use clap::Parser;
use tierfs_core::{Config, TierResult};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tierfsd")]
#[command(about = "Filesystem tiering daemon: evicts cold files to an object store", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "daemon terminated with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> TierResult<()> {
    let config = Config::from_file(&cli.config)?;
    tracing::info!(
        config = %cli.config.display(),
        mount = %config.fs_mount_point.display(),
        "configuration loaded"
    );
    tierfsd::run(config).await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

mod commands;
mod logging;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::logging::init_logging;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(version, about)]
/// cask, flat columnar storage for per-event data.
///
/// cask inspects, merges and compresses stores of scalar and vector
/// event columns.
pub struct Args {
    #[arg(long, env = "CASK_LOG_LEVEL", default_value = "info")]
    /// Set the log level.
    ///
    /// This can filter on various levels, for example `info,cask_fs=warn`
    /// will display all logs at `info` level severity and above, except for log
    /// events that appear within the `cask_fs` crate.
    log_level: String,
    #[arg(long, env = "CASK_LOG_JSON")]
    /// Emit logs in JSON format rather than as plain text.
    log_json: bool,
    #[arg(long, env = "CASK_LOG_NO_ANSI")]
    /// Disable ANSI colour codes being present in the logs.
    ///
    /// ANSI codes can cause rendering issues on various observability platforms
    /// or text file logging due to its escape sequences.
    log_no_ansi: bool,
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args).context("Init logging")?;

    info!("cask v{}", env!("CARGO_PKG_VERSION"));
    args.command.display_startup_message();
    args.command.execute().await
}

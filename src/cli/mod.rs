//! Command-line surface.

mod run;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use self::run::{RunArgs, run_bootstrap_command};
pub use self::status::{run_reset_command, run_status_command};

#[derive(Parser, Debug)]
#[command(name = "launchgate", version, about = "Launch-time bootstrap decision runner")]
pub struct Cli {
    /// TOML config file (defaults to ~/.launchgate/config.toml).
    #[arg(long, global = true, env = "LAUNCHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive one bootstrap and print the terminal state.
    Run(RunArgs),
    /// Print the persisted settings.
    Status,
    /// Clear the persisted settings.
    Reset {
        /// Skip the confirmation check.
        #[arg(long)]
        yes: bool,
    },
}

/// Dispatch a parsed command.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Run(args) => run_bootstrap_command(config, args).await,
        Command::Status => run_status_command(config),
        Command::Reset { yes } => run_reset_command(config, yes),
    }
}

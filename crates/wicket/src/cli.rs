use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wicket", about = "Access-controlled HTTP CONNECT forward proxy")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy until interrupted
    Run(RunArgs),
    /// Validate configuration and smoke-test the server
    Check,
}

#[derive(Args)]
pub struct RunArgs {
    /// Listen address, overriding the configured one
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

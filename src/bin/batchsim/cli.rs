use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "batchsim", about = "Discrete-event simulation of batch-scheduled workflow execution")]
pub struct Cli {
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Run a simulation described by a config file
    Run {
        /// Path to the simulation config (toml or yaml)
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
        /// Stop the simulation at this simulated time instead of running
        /// until no events remain
        #[structopt(long)]
        until: Option<f64>,
        /// Print the delivered-message log after the run
        #[structopt(long)]
        events: bool,
    },
    /// Parse a config file and print the effective configuration
    DumpConfig {
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },
}

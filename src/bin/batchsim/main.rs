use structopt::StructOpt;

use batchsim::utils::prelude::*;

mod cli;
mod commands;

fn main() -> Result<()> {
    batchsim::utils::logging::setup()?;

    let args = cli::Cli::from_args();
    match args.command {
        cli::Command::Run { config, until, events } => commands::run(&config, until, events),
        cli::Command::DumpConfig { config } => commands::dump_config(&config),
    }
}

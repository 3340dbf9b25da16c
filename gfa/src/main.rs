mod run_fit;

use crate::run_fit::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit the GFA model with multi-restart model selection
    Fit(FitArgs),

    /// Simulate group-structured factor data
    Simulate(SimArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            run_gfa_fit(args.clone())?;
        }
        Commands::Simulate(args) => {
            run_gfa_simulate(args.clone())?;
        }
    }

    Ok(())
}

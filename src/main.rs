//! Tangle - CLI for inspecting recorded schedules

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tangle::runtime::schedule::load_file;
use tangle::util::config::load_config;
use tangle::util::logger::{self, LogLevel};
use tangle::{ScheduleStep, ScheduleStore, NAME, VERSION};

/// Inspect schedules recorded by the tangle test harness
#[derive(Parser, Debug)]
#[command(name = "tangle")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the seeds stored in a schedule directory
    List {
        /// Schedule directory
        #[arg(value_name = "DIR", default_value = ".tangle")]
        dir: PathBuf,
    },

    /// Print one schedule
    Show {
        /// Schedule file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the raw JSON instead of one step per line
        #[arg(long)]
        json: bool,
    },

    /// Validate a TOML configuration file
    Config {
        /// Configuration file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level: LogLevel = match args.log_level.parse() {
        Ok(level) => level,
        Err(e) => bail!(e),
    };
    logger::init_with_level(level);

    match args.command {
        Commands::List { dir } => {
            let store = ScheduleStore::new(&dir);
            let seeds = store
                .list_seeds()
                .with_context(|| format!("Failed to list: {}", dir.display()))?;
            for seed in seeds {
                println!("{}", seed);
            }
        }
        Commands::Show { file, json } => {
            let schedule =
                load_file(&file).with_context(|| format!("Failed to read: {}", file.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&schedule)?);
                return Ok(());
            }
            println!("seed {}", schedule.seed());
            for (index, step) in schedule.steps().iter().enumerate() {
                match step {
                    ScheduleStep::Task(id) => println!("{:>5}  {}", index, id),
                    ScheduleStep::Error(msg) => println!("{:>5}  error: {}", index, msg),
                    ScheduleStep::Done => println!("{:>5}  done", index),
                }
            }
        }
        Commands::Config { file } => {
            let config = load_config(&file).with_context(|| format!("Invalid config: {}", file.display()))?;
            println!("{:#?}", config);
        }
    }

    Ok(())
}

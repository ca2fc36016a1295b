//! BranchSync CLI
//!
//! Operator tools for a BranchSync data directory.
//!
//! # Commands
//!
//! - `branches` - List configured branches
//! - `save-config` - Validate and store a branch configuration
//! - `watermarks` - Show the durable watermarks of a branch
//! - `reset` - Clear one entity's watermark so it backfills again
//! - `demo` - Run a sync session against in-memory stores
//! - `run` - Sync configured branches from SQL Server (`mssql` feature)

mod commands;
mod sink;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// BranchSync command-line tools.
#[derive(Parser)]
#[command(name = "branchsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory holding branch configs and watermarks
    #[arg(global = true, short, long, default_value = "branchsync-data")]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured branches
    Branches {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate and store a branch configuration from a JSON file
    SaveConfig {
        /// Path to the JSON configuration
        file: PathBuf,
    },

    /// Show the durable watermarks of a branch
    Watermarks {
        /// Branch identifier
        branch: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear one entity's watermark so its next run backfills
    Reset {
        /// Branch identifier
        branch: String,

        /// Entity kind (attendance_punch, sales_voucher, employee)
        entity: String,
    },

    /// Run a sync session against in-memory source and target stores
    Demo {
        /// Punch rows to seed the source with
        #[arg(short, long, default_value = "250", value_parser = clap::value_parser!(i64).range(1..=40_000))]
        rows: i64,

        /// Rows fetched per page
        #[arg(short, long, default_value = "100")]
        page_size: usize,
    },

    /// Sync configured branches from their SQL Servers until ctrl-c
    #[cfg(feature = "mssql")]
    Run {
        /// Only sync this branch
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Branches { format } => {
            commands::branches::run(&cli.data_dir, &format)?;
        }
        Commands::SaveConfig { file } => {
            commands::save_config::run(&cli.data_dir, &file)?;
        }
        Commands::Watermarks { branch, format } => {
            commands::watermarks::run(&cli.data_dir, &branch, &format)?;
        }
        Commands::Reset { branch, entity } => {
            let entity = entity.parse()?;
            commands::reset::run(&cli.data_dir, &branch, entity)?;
        }
        Commands::Demo { rows, page_size } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::demo::run(rows, page_size))?;
        }
        #[cfg(feature = "mssql")]
        Commands::Run { branch } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::run::run(&cli.data_dir, branch.as_deref()))?;
        }
        Commands::Version => {
            println!("BranchSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

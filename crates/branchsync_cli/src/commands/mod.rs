//! CLI command implementations.

pub mod branches;
pub mod demo;
pub mod reset;
pub mod run;
pub mod save_config;
pub mod watermarks;

use branchsync_core::{BranchConfigStore, SyncLogEvent};
use std::path::{Path, PathBuf};

/// Branch configuration file inside the data directory.
const CONFIG_FILE: &str = "branches.json";

/// Returns the branch config file path for a data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Opens the branch config store of a data directory.
pub fn open_configs(data_dir: &Path) -> Result<BranchConfigStore, Box<dyn std::error::Error>> {
    Ok(BranchConfigStore::open(&config_path(data_dir))?)
}

/// Prints one log event as a single line.
pub fn print_event(event: &SyncLogEvent) {
    let entity = event.entity.map_or("-", |e| e.as_str());
    println!(
        "{} {:<5} {:<16} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        format!("{:?}", event.severity).to_uppercase(),
        entity,
        event.message
    );
}

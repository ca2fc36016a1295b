//! Save-config command implementation.

use super::{config_path, open_configs};
use branchsync_core::BranchConfig;
use std::fs;
use std::path::Path;

/// Runs the save-config command.
///
/// The file holds one branch configuration as JSON. It is validated before
/// anything is written; an existing configuration for the same branch is
/// replaced.
pub fn run(data_dir: &Path, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = save(data_dir, file)?;
    println!(
        "Saved branch {} to {}",
        config.branch,
        config_path(data_dir).display()
    );
    Ok(())
}

/// Validates and stores the configuration in `file`.
pub fn save(data_dir: &Path, file: &Path) -> Result<BranchConfig, Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let config: BranchConfig = serde_json::from_slice(&bytes)?;
    config.validate()?;

    fs::create_dir_all(data_dir)?;
    let store = open_configs(data_dir)?;
    store.put(config.clone())?;

    tracing::info!(branch = %config.branch, "branch config saved");
    Ok(config)
}

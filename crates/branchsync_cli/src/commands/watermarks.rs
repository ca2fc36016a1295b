//! Watermarks command implementation.

use super::open_configs;
use branchsync_core::{BranchId, FileWatermarkStore, Watermark, WatermarkStore};
use std::path::Path;

/// Runs the watermarks command.
pub fn run(
    data_dir: &Path,
    branch: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let marks = read(data_dir, &BranchId::new(branch))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&marks)?),
        _ => {
            println!("Watermarks for {branch}");
            if marks.is_empty() {
                println!("  (none, every entity backfills on next start)");
            }
            for mark in &marks {
                println!(
                    "  {:<18} {:>14}  updated {}",
                    mark.entity.as_str(),
                    mark.position,
                    mark.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

/// Reads every stored watermark of a configured branch.
///
/// Fails with a lock error while a running engine owns the data directory.
pub fn read(
    data_dir: &Path,
    branch: &BranchId,
) -> Result<Vec<Watermark>, Box<dyn std::error::Error>> {
    open_configs(data_dir)?.get(branch)?;
    let store = FileWatermarkStore::open(data_dir)?;
    Ok(store.list(branch)?)
}

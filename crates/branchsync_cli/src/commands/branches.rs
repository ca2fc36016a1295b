//! Branches command implementation.

use super::open_configs;
use serde::Serialize;
use std::path::Path;

/// One row of the branch listing.
#[derive(Debug, Serialize)]
pub struct BranchSummary {
    /// Branch identifier.
    pub branch: String,
    /// Display name.
    pub name: String,
    /// `host[:port][\instance]/database`.
    pub source: String,
    /// Entity kinds in scope.
    pub entities: Vec<String>,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

/// Runs the branches command.
pub fn run(data_dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summaries = list(data_dir)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summaries)?),
        _ => {
            if summaries.is_empty() {
                println!("No branches configured in {}", data_dir.display());
            }
            for s in &summaries {
                println!("{} ({})", s.branch, s.name);
                println!("  Source:   {}", s.source);
                println!("  Entities: {}", s.entities.join(", "));
                println!("  Poll:     {} ms", s.poll_interval_ms);
            }
        }
    }

    Ok(())
}

/// Collects the summaries of every configured branch.
pub fn list(data_dir: &Path) -> Result<Vec<BranchSummary>, Box<dyn std::error::Error>> {
    let configs = open_configs(data_dir)?;
    Ok(configs
        .list()
        .into_iter()
        .map(|config| {
            let mut source = format!("{}:{}", config.host, config.port);
            if let Some(instance) = &config.instance {
                source.push('\\');
                source.push_str(instance);
            }
            source.push('/');
            source.push_str(&config.database);

            BranchSummary {
                branch: config.branch.to_string(),
                name: config.name.clone(),
                source,
                entities: config.entities.iter().map(|e| e.kind.to_string()).collect(),
                poll_interval_ms: config.poll_interval_ms,
            }
        })
        .collect())
}

//! Run command implementation.
//!
//! Starts a sync session for every configured branch (or one of them),
//! prints their log streams and stops them cleanly on shutdown. Records
//! land in JSON-lines files under `<data-dir>/records`.

#![cfg_attr(not(feature = "mssql"), allow(dead_code))]

use super::{open_configs, print_event};
use crate::sink::JsonlTarget;
use branchsync_core::{BranchId, FileWatermarkStore};
use branchsync_engine::{EngineConfig, SourceConnector, SyncController};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory below the data directory that receives delivered records.
const RECORDS_DIR: &str = "records";

/// Returns the record output directory of a data directory.
pub fn records_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(RECORDS_DIR)
}

/// Runs the run command against the branches' SQL Servers until ctrl-c.
#[cfg(feature = "mssql")]
pub async fn run(data_dir: &Path, branch: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let connector = branchsync_engine::MssqlConnector::new()?;
    let only = branch.map(BranchId::new);
    serve(data_dir, connector, only.as_ref(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c, stopping");
        }
    })
    .await
}

/// Syncs branches of `data_dir` through `connector` until `stop` resolves.
///
/// Holds the data directory's watermark lock for the whole run.
pub async fn serve<C, F>(
    data_dir: &Path,
    connector: C,
    only: Option<&BranchId>,
    stop: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    C: SourceConnector,
    F: Future<Output = ()>,
{
    let configs = Arc::new(open_configs(data_dir)?);
    let watermarks = Arc::new(FileWatermarkStore::open(data_dir)?);
    let target = Arc::new(JsonlTarget::new(records_dir(data_dir)));
    let controller = SyncController::new(
        configs,
        watermarks,
        Arc::new(connector),
        target,
        EngineConfig::default(),
    );

    let branches: Vec<BranchId> = controller
        .load_branches()
        .into_iter()
        .map(|config| config.branch)
        .filter(|branch| only.map_or(true, |wanted| wanted == branch))
        .collect();
    if branches.is_empty() {
        return Err(match only {
            Some(branch) => format!("branch {branch} is not configured").into(),
            None => "no branches configured; add one with save-config".into(),
        });
    }

    let mut printers = Vec::with_capacity(branches.len());
    for branch in &branches {
        let mut log = controller.subscribe(branch);
        printers.push(tokio::spawn(async move {
            while let Some(event) = log.recv().await {
                print_event(&event);
            }
        }));
    }

    for branch in &branches {
        controller.start_sync(branch).await?;
        tracing::info!(%branch, "sync started");
    }

    stop.await;
    tracing::info!("stopping sync sessions");
    controller.shutdown(true).await?;

    for printer in printers {
        printer.abort();
    }

    println!();
    for branch in &branches {
        let status = controller.get_status(branch)?;
        println!("{branch}: {:?}", status.state);
        for (entity, entity_status) in &status.entities {
            println!(
                "  {:<18} synced {:>8}  watermark {}",
                entity.as_str(),
                entity_status.records_synced,
                entity_status
                    .last_watermark
                    .map_or_else(|| "-".to_string(), |p| p.to_string())
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_core::{BranchConfig, CredentialRef, EntityKind, EntityScope, SourceRow};
    use branchsync_engine::MemorySource;
    use std::time::Duration;
    use tempfile::tempdir;

    fn employee(id: i64) -> SourceRow {
        SourceRow::new()
            .with("id", id)
            .with("emp_code", format!("E{id:03}"))
            .with("first_name", format!("Employee {id}"))
    }

    fn configure(data: &Path, branch: &str) {
        let credential = CredentialRef::inline("sa", "pw");
        let config = BranchConfig::new(branch, "10.0.0.5", "ZKBioTime", credential)
            .with_entities([EntityScope::new(EntityKind::Employee)])
            .with_poll_interval(Duration::from_millis(50));
        open_configs(data).unwrap().put(config).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serve_writes_records_until_stopped() {
        let dir = tempdir().unwrap();
        configure(dir.path(), "b1");
        let source = MemorySource::new();
        source.insert_many("personnel_employee", (1..=12).map(employee));

        let output = JsonlTarget::new(records_dir(dir.path()));
        let branch = BranchId::new("b1");
        let stop = async {
            for _ in 0..200 {
                let written = output.read(&branch, EntityKind::Employee);
                if written.is_ok_and(|records| records.len() == 12) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        serve(dir.path(), source, None, stop).await.unwrap();

        assert_eq!(output.read(&branch, EntityKind::Employee).unwrap().len(), 12);
    }

    #[tokio::test]
    async fn unknown_branch_is_rejected() {
        let dir = tempdir().unwrap();
        configure(dir.path(), "b1");

        let only = BranchId::new("b2");
        let err = serve(dir.path(), MemorySource::new(), Some(&only), async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("b2"));
    }

    #[tokio::test]
    async fn empty_data_dir_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(serve(dir.path(), MemorySource::new(), None, async {})
            .await
            .is_err());
    }
}

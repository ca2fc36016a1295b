//! Reset command implementation.

use super::open_configs;
use branchsync_core::{BranchId, EntityKind, FileWatermarkStore, WatermarkStore};
use std::path::Path;

/// Runs the reset command.
pub fn run(
    data_dir: &Path,
    branch: &str,
    entity: EntityKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let branch = BranchId::new(branch);
    reset(data_dir, &branch, entity)?;
    println!("Reset {entity} for {branch}; it backfills from the beginning on next start");
    Ok(())
}

/// Clears one entity's watermark.
///
/// The entity must be in the branch's scope. A running engine holds the
/// watermark store's lock, so this only succeeds while the engine is down.
pub fn reset(
    data_dir: &Path,
    branch: &BranchId,
    entity: EntityKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = open_configs(data_dir)?.get(branch)?;
    if config.scope(entity).is_none() {
        return Err(format!("{entity} is not in the scope of branch {branch}").into());
    }

    let store = FileWatermarkStore::open(data_dir)?;
    store.reset(branch, entity)?;

    tracing::info!(%branch, %entity, "watermark reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{open_configs, watermarks};
    use branchsync_core::{BranchConfig, CredentialRef, EntityScope, Position};
    use tempfile::tempdir;

    fn setup(data: &Path) -> BranchId {
        let credential = CredentialRef::inline("sa", "pw");
        let config = BranchConfig::new("b1", "10.0.0.5", "Sales", credential)
            .with_entities([EntityScope::new(EntityKind::SalesVoucher)]);
        open_configs(data).unwrap().put(config).unwrap();
        let store = FileWatermarkStore::open(data).unwrap();
        store
            .advance(&BranchId::new("b1"), EntityKind::SalesVoucher, Position(42))
            .unwrap();
        BranchId::new("b1")
    }

    #[test]
    fn reset_clears_watermark() {
        let dir = tempdir().unwrap();
        let branch = setup(dir.path());

        let marks = watermarks::read(dir.path(), &branch).unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].position, Position(42));

        reset(dir.path(), &branch, EntityKind::SalesVoucher).unwrap();
        assert!(watermarks::read(dir.path(), &branch).unwrap().is_empty());
    }

    #[test]
    fn reset_rejects_entity_out_of_scope() {
        let dir = tempdir().unwrap();
        let branch = setup(dir.path());

        assert!(reset(dir.path(), &branch, EntityKind::Employee).is_err());
        assert_eq!(watermarks::read(dir.path(), &branch).unwrap().len(), 1);
    }

    #[test]
    fn reset_refused_while_store_is_held() {
        let dir = tempdir().unwrap();
        let branch = setup(dir.path());
        let _engine = FileWatermarkStore::open(dir.path()).unwrap();

        assert!(reset(dir.path(), &branch, EntityKind::SalesVoucher).is_err());
    }

    #[test]
    fn unknown_branch_is_an_error() {
        let dir = tempdir().unwrap();
        setup(dir.path());

        assert!(watermarks::read(dir.path(), &BranchId::new("nope")).is_err());
    }
}

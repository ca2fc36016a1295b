//! File-backed watermark store.
//!
//! ```text
//! <root>/
//! ├─ LOCK                              # Advisory lock, one process at a time
//! └─ watermarks/
//!    └─ <branch>/
//!       ├─ attendance_punch.wm         # CBOR-encoded Watermark
//!       └─ sales_voucher.wm
//! ```
//!
//! Each advance rewrites one file with write-then-rename, so a crash at any
//! point leaves the previous or the new watermark on disk, never a partial
//! one. Files are read lazily on first access to a key.

use crate::error::{WatermarkError, WatermarkResult};
use crate::persist;
use crate::types::{BranchId, EntityKind, Position};
use crate::watermark::{next_watermark, Slot, SlotTable, Watermark, WatermarkStore};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const WATERMARK_DIR: &str = "watermarks";
const WATERMARK_EXT: &str = "wm";

/// Watermark store persisting one file per (branch, entity).
///
/// # Thread Safety
///
/// Operations on one key serialize on that key's lock, which is held across
/// the file write. Operations on different keys proceed in parallel.
#[derive(Debug)]
pub struct FileWatermarkStore {
    root: PathBuf,
    slots: SlotTable,
    _lock_file: File,
}

impl FileWatermarkStore {
    /// Opens or creates a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Locked`] if another process holds the store,
    /// or an I/O error if the directory cannot be created.
    pub fn open(root: &Path) -> WatermarkResult<Self> {
        fs::create_dir_all(root.join(WATERMARK_DIR))?;

        let lock_path = root.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(WatermarkError::Locked(lock_path));
        }

        tracing::debug!(root = %root.display(), "opened watermark store");

        Ok(Self {
            root: root.to_path_buf(),
            slots: SlotTable::default(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, branch: &BranchId, entity: EntityKind) -> PathBuf {
        self.root
            .join(WATERMARK_DIR)
            .join(escape_branch(branch))
            .join(format!("{}.{WATERMARK_EXT}", entity.as_str()))
    }

    /// Fills the slot from disk on first use.
    fn ensure_loaded(
        &self,
        slot: &mut Slot,
        branch: &BranchId,
        entity: EntityKind,
    ) -> WatermarkResult<()> {
        if slot.loaded {
            return Ok(());
        }
        let path = self.file_path(branch, entity);
        slot.value = match fs::read(&path) {
            Ok(bytes) => Some(decode(&bytes, branch, entity)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        slot.loaded = true;
        Ok(())
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn get(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<Option<Watermark>> {
        let slot = self.slots.slot(branch, entity);
        let mut slot = slot.lock();
        self.ensure_loaded(&mut slot, branch, entity)?;
        Ok(slot.value.clone())
    }

    fn advance(
        &self,
        branch: &BranchId,
        entity: EntityKind,
        position: Position,
    ) -> WatermarkResult<Watermark> {
        let slot = self.slots.slot(branch, entity);
        let mut slot = slot.lock();
        self.ensure_loaded(&mut slot, branch, entity)?;

        let next = next_watermark(slot.value.as_ref(), branch, entity, position)?;
        if slot.value.as_ref().map(|w| w.position) == Some(position) {
            return Ok(slot.value.clone().unwrap_or(next));
        }

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&next, &mut bytes)
            .map_err(|e| WatermarkError::Codec(e.to_string()))?;
        persist::write_atomic(&self.file_path(branch, entity), &bytes)?;

        slot.value = Some(next.clone());
        Ok(next)
    }

    fn reset(&self, branch: &BranchId, entity: EntityKind) -> WatermarkResult<()> {
        let slot = self.slots.slot(branch, entity);
        let mut slot = slot.lock();
        persist::remove_durable(&self.file_path(branch, entity))?;
        slot.value = None;
        slot.loaded = true;
        Ok(())
    }
}

fn decode(bytes: &[u8], branch: &BranchId, entity: EntityKind) -> WatermarkResult<Watermark> {
    let mark: Watermark =
        ciborium::de::from_reader(bytes).map_err(|e| WatermarkError::Codec(e.to_string()))?;
    if &mark.branch != branch || mark.entity != entity {
        return Err(WatermarkError::Codec(format!(
            "file for {branch}/{entity} holds a watermark for {}/{}",
            mark.branch, mark.entity
        )));
    }
    Ok(mark)
}

/// Maps a branch id to a safe directory name; bytes outside
/// `[A-Za-z0-9_-]` become `%XX`.
fn escape_branch(branch: &BranchId) -> String {
    let mut out = String::with_capacity(branch.as_str().len());
    for byte in branch.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn advance_survives_reopen() {
        let dir = tempdir().unwrap();
        let branch = BranchId::new("b1");
        {
            let store = FileWatermarkStore::open(dir.path()).unwrap();
            store.advance(&branch, EntityKind::SalesVoucher, Position(3)).unwrap();
            store.advance(&branch, EntityKind::SalesVoucher, Position(7)).unwrap();
        }

        let store = FileWatermarkStore::open(dir.path()).unwrap();
        let mark = store.get(&branch, EntityKind::SalesVoucher).unwrap().unwrap();
        assert_eq!(mark.position, Position(7));
        assert!(store.get(&branch, EntityKind::Employee).unwrap().is_none());
    }

    #[test]
    fn monotonicity_checked_against_disk() {
        let dir = tempdir().unwrap();
        let branch = BranchId::new("b1");
        {
            let store = FileWatermarkStore::open(dir.path()).unwrap();
            store.advance(&branch, EntityKind::Employee, Position(50)).unwrap();
        }

        let store = FileWatermarkStore::open(dir.path()).unwrap();
        let err = store
            .advance(&branch, EntityKind::Employee, Position(49))
            .unwrap_err();
        assert!(matches!(err, WatermarkError::Monotonicity { current: Position(50), .. }));
    }

    #[test]
    fn reset_removes_file() {
        let dir = tempdir().unwrap();
        let branch = BranchId::new("b1");
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        store.advance(&branch, EntityKind::AttendancePunch, Position(9)).unwrap();

        store.reset(&branch, EntityKind::AttendancePunch).unwrap();
        assert!(store.get(&branch, EntityKind::AttendancePunch).unwrap().is_none());
        assert!(!store.file_path(&branch, EntityKind::AttendancePunch).exists());

        // Reset of a stream that never advanced is fine.
        store.reset(&branch, EntityKind::Employee).unwrap();
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _store = FileWatermarkStore::open(dir.path()).unwrap();
        let err = FileWatermarkStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, WatermarkError::Locked(_)));
    }

    #[test]
    fn stale_temp_file_is_ignored() {
        let dir = tempdir().unwrap();
        let branch = BranchId::new("b1");
        {
            let store = FileWatermarkStore::open(dir.path()).unwrap();
            store.advance(&branch, EntityKind::SalesVoucher, Position(3)).unwrap();
            // A crash between temp write and rename leaves this behind.
            let path = store.file_path(&branch, EntityKind::SalesVoucher);
            fs::write(path.with_extension("wm.tmp"), b"garbage").unwrap();
        }

        let store = FileWatermarkStore::open(dir.path()).unwrap();
        let mark = store.get(&branch, EntityKind::SalesVoucher).unwrap().unwrap();
        assert_eq!(mark.position, Position(3));
    }

    #[test]
    fn corrupt_file_is_a_codec_error() {
        let dir = tempdir().unwrap();
        let branch = BranchId::new("b1");
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        let path = store.file_path(&branch, EntityKind::Employee);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"\xff\x00").unwrap();

        assert!(matches!(
            store.get(&branch, EntityKind::Employee),
            Err(WatermarkError::Codec(_))
        ));
    }

    #[test]
    fn branch_names_are_escaped() {
        assert_eq!(escape_branch(&BranchId::new("riyadh-3")), "riyadh-3");
        assert_eq!(escape_branch(&BranchId::new("../x y")), "%2E%2E%2Fx%20y");
    }
}

//! JSON-lines target store.
//!
//! Each (branch, entity) stream appends to `<root>/<branch>/<entity>.jsonl`,
//! one canonical record per line. Readers keep the last line per natural
//! key, so a redelivered batch collapses onto the records it already wrote.

use branchsync_core::{BranchId, CanonicalRecord, DeliveryBatch, EntityKind};
use branchsync_engine::{DeliveryError, DeliveryResult, TargetStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Appends delivered batches to JSON-lines files.
#[derive(Debug)]
pub struct JsonlTarget {
    root: PathBuf,
    append: Mutex<()>,
}

impl JsonlTarget {
    /// Creates a target writing below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append: Mutex::new(()),
        }
    }

    /// File holding one stream's records.
    pub fn stream_path(&self, branch: &BranchId, entity: EntityKind) -> PathBuf {
        self.root
            .join(branch.as_str())
            .join(format!("{}.jsonl", entity.as_str()))
    }

    /// Reads a stream back, last line per natural key winning, in key order.
    pub fn read(&self, branch: &BranchId, entity: EntityKind) -> io::Result<Vec<CanonicalRecord>> {
        let file = match File::open(self.stream_path(branch, entity)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut latest = BTreeMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CanonicalRecord = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            latest.insert(record.natural_key.to_string(), record);
        }
        Ok(latest.into_values().collect())
    }

    fn append(&self, path: &Path, lines: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.append.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(lines)?;
        file.sync_data()
    }
}

impl TargetStore for JsonlTarget {
    fn upsert(&self, batch: &DeliveryBatch) -> Result<DeliveryResult, DeliveryError> {
        let mut result = DeliveryResult::default();
        if batch.records.is_empty() {
            return Ok(result);
        }

        let mut lines = Vec::new();
        for record in &batch.records {
            match serde_json::to_vec(record) {
                Ok(line) => {
                    lines.extend_from_slice(&line);
                    lines.push(b'\n');
                    result.accepted += 1;
                }
                Err(e) => result.rejected.push((record.clone(), e.to_string())),
            }
        }

        self.append(&self.stream_path(&batch.branch, batch.entity), &lines)
            .map_err(|e| DeliveryError::retryable(format!("append failed: {e}")))?;
        Ok(result)
    }

    fn ping(&self) -> Result<(), DeliveryError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| DeliveryError::retryable(format!("{}: {e}", self.root.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_core::{EmployeeRecord, NaturalKey, Position, RecordPayload};
    use tempfile::tempdir;

    fn batch(ids: &[(i64, &str)]) -> DeliveryBatch {
        let branch = BranchId::new("b1");
        let records: Vec<CanonicalRecord> = ids
            .iter()
            .map(|(id, name)| CanonicalRecord {
                branch: branch.clone(),
                natural_key: NaturalKey::compose([branch.to_string(), format!("E{id:03}")]),
                position: Position(*id),
                source_timestamp: None,
                payload: RecordPayload::Employee(EmployeeRecord {
                    employee_code: format!("E{id:03}"),
                    first_name: name.to_string(),
                    last_name: None,
                    hired_on: None,
                    active: true,
                }),
            })
            .collect();
        DeliveryBatch {
            branch,
            entity: EntityKind::Employee,
            high_water: Position(ids.last().map_or(0, |(id, _)| *id)),
            source_rows: records.len(),
            records,
        }
    }

    #[test]
    fn redelivered_batch_reads_back_once() {
        let dir = tempdir().unwrap();
        let target = JsonlTarget::new(dir.path());
        let first = batch(&[(1, "Asha"), (2, "Binod")]);

        assert_eq!(target.upsert(&first).unwrap().accepted, 2);
        target.upsert(&first).unwrap();

        let records = target.read(&BranchId::new("b1"), EntityKind::Employee).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn later_line_replaces_earlier_record() {
        let dir = tempdir().unwrap();
        let target = JsonlTarget::new(dir.path());
        target.upsert(&batch(&[(1, "Asha")])).unwrap();
        target.upsert(&batch(&[(1, "Asha Rai")])).unwrap();

        let records = target.read(&BranchId::new("b1"), EntityKind::Employee).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].payload {
            RecordPayload::Employee(e) => assert_eq!(e.first_name, "Asha Rai"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let target = JsonlTarget::new(dir.path());
        target.upsert(&batch(&[])).unwrap();

        assert!(!target
            .stream_path(&BranchId::new("b1"), EntityKind::Employee)
            .exists());
        assert!(target.ping().is_ok());
    }
}

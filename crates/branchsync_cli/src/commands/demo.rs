//! Demo command implementation.
//!
//! Seeds an in-memory source with punches and employees, then drives one
//! sync session through backfill into incremental polling while printing
//! the branch's log stream.

use super::print_event;
use branchsync_core::{
    BranchConfig, BranchConfigStore, BranchId, CredentialRef, EntityKind, EntityScope,
    MemoryWatermarkStore, SourceRow, SourceValue,
};
use branchsync_engine::{
    EngineConfig, EntityState, MemorySource, MemoryTarget, RetryConfig, SyncController,
};
use std::sync::Arc;
use std::time::Duration;

const PUNCHES: &str = "iclock_transaction";
const EMPLOYEES: &str = "personnel_employee";
const EMPLOYEE_COUNT: i64 = 20;
const LATE_PUNCHES: i64 = 5;
const WAIT_LIMIT: Duration = Duration::from_secs(30);
const POLL_STEP: Duration = Duration::from_millis(100);

/// Runs the demo command.
pub async fn run(rows: i64, page_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let branch = BranchId::new("demo");
    let source = MemorySource::new();
    source.insert_many(PUNCHES, (1..=rows).map(punch));
    // One row the mapper has to skip.
    source.insert(PUNCHES, punch(rows + 1).with("punch_state", SourceValue::Null));
    source.insert_many(EMPLOYEES, (1..=EMPLOYEE_COUNT).map(employee));

    let configs = Arc::new(BranchConfigStore::in_memory());
    let target = Arc::new(MemoryTarget::new());
    let controller = SyncController::new(
        Arc::clone(&configs),
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(source.clone()),
        Arc::clone(&target),
        EngineConfig::default()
            .with_page_size(page_size)
            .with_reconnect(RetryConfig::fixed(Duration::from_millis(200))),
    );

    let credential = CredentialRef::inline("sa", "demo");
    controller.save_config(
        BranchConfig::new(branch.clone(), "127.0.0.1", "ZKBioTime", credential)
            .with_name("Demo branch")
            .with_entities([
                EntityScope::new(EntityKind::AttendancePunch),
                EntityScope::new(EntityKind::Employee),
            ])
            .with_poll_interval(Duration::from_millis(250)),
    )?;

    let mut log = controller.subscribe(&branch);
    controller.start_sync(&branch).await?;

    let caught_up = || {
        controller.get_status(&branch).is_ok_and(|status| {
            !status.entities.is_empty()
                && status
                    .entities
                    .values()
                    .all(|e| e.state == EntityState::Incremental)
        })
    };

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    let mut late_inserted = false;
    loop {
        if caught_up() {
            if late_inserted
                && target.records(&branch, EntityKind::AttendancePunch).len() as i64
                    == rows + LATE_PUNCHES
            {
                break;
            }
            if !late_inserted {
                println!("-- caught up, inserting {LATE_PUNCHES} new punches");
                source.insert_many(PUNCHES, (rows + 2..rows + 2 + LATE_PUNCHES).map(punch));
                late_inserted = true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err("demo did not reach incremental mode in time".into());
        }
        match tokio::time::timeout(POLL_STEP, log.recv()).await {
            Ok(Some(event)) => print_event(&event),
            Ok(None) => break,
            Err(_) => {}
        }
    }

    let status = controller.stop_sync(&branch, true).await?;
    while let Some(event) = log.try_recv() {
        print_event(&event);
    }

    println!();
    println!("Session state: {:?}", status.state);
    for (entity, entity_status) in &status.entities {
        println!(
            "  {:<18} synced {:>6}  watermark {}",
            entity.as_str(),
            entity_status.records_synced,
            entity_status
                .last_watermark
                .map_or_else(|| "-".to_string(), |p| p.to_string())
        );
    }
    println!("Target holds {} records", target.len());

    Ok(())
}

fn punch(id: i64) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("emp_code", format!("E{:03}", id % EMPLOYEE_COUNT + 1))
        .with(
            "punch_time",
            format!("2025-03-{:02} {:02}:{:02}:00", 1 + id / 1440, id / 60 % 24, id % 60),
        )
        .with("punch_state", id % 2)
        .with("verify_type", 1i64)
        .with("terminal_sn", "CJDE2001")
}

fn employee(id: i64) -> SourceRow {
    SourceRow::new()
        .with("id", id)
        .with("emp_code", format!("E{id:03}"))
        .with("first_name", format!("Employee {id}"))
}

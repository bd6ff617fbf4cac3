//! Persistence layer.
//!
//! The engine's shared state is snapshotted to a JSON file after every
//! committed round, together with the round to resume at. Writes go to a
//! `.tmp` sibling first and are renamed into place.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::state::SharedState;
use crate::types::RoundKind;

/// Default snapshot path.
const DEFAULT_STATE_FILE: &str = "yieldarb_state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: SharedState,
    pub next_round: RoundKind,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(state: SharedState, next_round: RoundKind) -> Self {
        Self {
            state,
            next_round,
            saved_at: Utc::now(),
        }
    }
}

/// Save a snapshot atomically.
pub fn save_snapshot(snapshot: &Snapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let tmp = format!("{path}.tmp");
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialise snapshot")?;

    std::fs::write(&tmp, &json).context(format!("Failed to write snapshot to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move snapshot into {path}"))?;

    debug!(
        path,
        cycle = snapshot.state.cycle().cycle_id,
        version = snapshot.state.version(),
        next_round = %snapshot.next_round,
        "Snapshot saved"
    );
    Ok(())
}

/// Load a snapshot. Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<Snapshot>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read snapshot from {path}"))?;
    let snapshot: Snapshot =
        serde_json::from_str(&json).context(format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        cycle = snapshot.state.cycle().cycle_id,
        positions = snapshot.state.positions().active_positions.len(),
        next_round = %snapshot.next_round,
        saved_at = %snapshot.saved_at,
        "State restored from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the snapshot file.
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete snapshot {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CycleSlice, PositionSlice};
    use crate::types::Event;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("yieldarb_test_state_{}.json", uuid::Uuid::new_v4()));
        p.to_string_lossy().to_string()
    }

    fn make_state() -> SharedState {
        let mut state = SharedState::new();
        state.commit(PositionSlice {
            realized_pnl_usd: dec!(12.5),
            ..Default::default()
        });
        state.record(RoundKind::PositionTracking, Event::Done);
        state.commit(CycleSlice {
            cycle_id: 7,
            completed_cycles: 6,
            last_cycle: None,
        });
        state
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path();
        let snapshot = Snapshot::new(make_state(), RoundKind::DataCollection);
        save_snapshot(&snapshot, Some(&path)).unwrap();

        let loaded = load_snapshot(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.state.cycle().cycle_id, 7);
        assert_eq!(loaded.state.positions().realized_pnl_usd, dec!(12.5));
        assert_eq!(loaded.state.version(), 2);

        delete_snapshot(Some(&path)).unwrap();
    }

    #[test]
    fn test_tmp_file_removed_after_save() {
        let path = temp_path();
        save_snapshot(&Snapshot::new(SharedState::new(), RoundKind::Allocation), Some(&path)).unwrap();
        assert!(Path::new(&path).exists());
        assert!(!Path::new(&format!("{path}.tmp")).exists());
        delete_snapshot(Some(&path)).unwrap();
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let path = temp_path();
        save_snapshot(&Snapshot::new(SharedState::new(), RoundKind::Allocation), Some(&path)).unwrap();
        save_snapshot(&Snapshot::new(make_state(), RoundKind::Reset), Some(&path)).unwrap();
        let loaded = load_snapshot(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.next_round, RoundKind::Reset);
        delete_snapshot(Some(&path)).unwrap();
    }

    #[test]
    fn test_load_nonexistent() {
        let path = temp_path();
        assert!(load_snapshot(Some(&path)).unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_file_errors() {
        let path = temp_path();
        std::fs::write(&path, "{ not json").unwrap();
        assert_err!(load_snapshot(Some(&path)));
        delete_snapshot(Some(&path)).unwrap();
    }

    #[test]
    fn test_delete_nonexistent_ok() {
        assert_ok!(delete_snapshot(Some(&temp_path())));
    }
}

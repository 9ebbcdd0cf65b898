pub mod config;
pub mod model;
pub mod store;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::Path;

pub use config::TestbedConfig;

/// KPI report written into each run's output directory.
pub const KPI_REPORT_FILE: &str = "kpi_report.json";
pub use model::{
    ExperimentRun, MessageClass, MessageFilter, MessageRecord, NetworkCondition,
    NetworkConditionEvent, NetworkProfile, NewRun, Protocol, ProtocolSelection, RunStatus,
};
pub use store::{Admission, ProtocolStatistics, Store, StoreError};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames, so readers never observe a
/// partially written artifact.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Seconds since the Unix epoch with microsecond resolution, the unit used on
/// the wire for `send_timestamp`.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let root = std::env::temp_dir().join(format!(
            "v2x_core_write_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("nested").join("report.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read back"), b"second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unix_seconds_keeps_sub_second_precision() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.250Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert!((unix_seconds(at) - 1_704_067_200.25).abs() < 1e-6);
    }
}

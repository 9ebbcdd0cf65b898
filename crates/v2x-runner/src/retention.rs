use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use v2x_core::{Store, StoreError};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted: u64,
    pub bytes_reclaimed: u64,
    pub errors: Vec<String>,
    pub cutoff: DateTime<Utc>,
}

/// Deletes every run created strictly before `cutoff`, output directory first.
/// A directory that cannot be removed is reported but does not keep the record.
/// Runs still holding the single-flight slot are skipped.
pub fn cleanup_before(store: &Store, cutoff: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
    let mut report = CleanupReport {
        deleted: 0,
        bytes_reclaimed: 0,
        errors: Vec::new(),
        cutoff,
    };
    for run in store.list_runs(None, None)? {
        if run.created_at >= cutoff {
            continue;
        }
        if run.status.is_active() {
            report
                .errors
                .push(format!("Skipped {}: run is still {}", run.name, run.status));
            continue;
        }
        if run.output_directory.exists() {
            let bytes = dir_size(&run.output_directory);
            match fs::remove_dir_all(&run.output_directory) {
                Ok(()) => {
                    report.bytes_reclaimed += bytes;
                    info!(dir = %run.output_directory.display(), bytes, "deleted output directory");
                }
                Err(err) => {
                    warn!(dir = %run.output_directory.display(), error = %err, "output directory not deleted");
                    report.errors.push(format!(
                        "Failed to delete {}: {}",
                        run.output_directory.display(),
                        err
                    ));
                }
            }
        }
        if store.delete_run(run.id)? {
            report.deleted += 1;
        }
    }
    info!(deleted = report.deleted, errors = report.errors.len(), "retention cleanup finished");
    Ok(report)
}

fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

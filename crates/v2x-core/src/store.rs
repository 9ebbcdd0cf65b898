//! SQLite-backed store for experiment runs, ingested messages and the
//! network-condition audit trail.
//!
//! A single connection sits behind a mutex; every write goes through it, which
//! serializes admission and per-run state changes within one process. Admission
//! also runs in an IMMEDIATE transaction so separate processes sharing the
//! database file serialize as well.

use crate::model::{
    ExperimentRun, MessageClass, MessageFilter, MessageRecord, NetworkCondition,
    NetworkConditionEvent, NetworkProfile, NewRun, Protocol, ProtocolSelection, RunStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {column} value in store: {value:?}")]
    InvalidValue { column: &'static str, value: String },
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("{0} is not a terminal status")]
    NotTerminal(RunStatus),
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    Admitted(ExperimentRun),
    /// Another run already holds the single-flight slot.
    Blocked(ExperimentRun),
    NameTaken(ExperimentRun),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtocolStatistics {
    pub total_messages: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub total_gaps: u64,
}

const RUN_COLUMNS: &str = "id, experiment_name, network_profile, duration_seconds, protocol, \
     advanced_options, status, current_phase, progress_percent, created_at, started_at, \
     completed_at, error_message, output_directory, process_id";

const MESSAGE_COLUMNS: &str = "message_id, vehicle_id, message_type, send_timestamp, \
     receive_timestamp, latency_ms, protocol, sequence_gap, payload_size, created_at";

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A poisoned lock still guards a usable connection.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiment_runs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               experiment_name TEXT NOT NULL UNIQUE,\
               network_profile TEXT NOT NULL,\
               duration_seconds INTEGER NOT NULL,\
               protocol TEXT NOT NULL,\
               advanced_options TEXT,\
               status TEXT NOT NULL DEFAULT 'pending',\
               current_phase TEXT,\
               progress_percent INTEGER NOT NULL DEFAULT 0,\
               created_at TEXT NOT NULL,\
               started_at TEXT,\
               completed_at TEXT,\
               error_message TEXT,\
               output_directory TEXT NOT NULL,\
               process_id INTEGER\
             );\
             CREATE TABLE IF NOT EXISTS messages (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               message_id TEXT NOT NULL,\
               vehicle_id TEXT NOT NULL,\
               message_type TEXT NOT NULL,\
               send_timestamp REAL NOT NULL,\
               receive_timestamp REAL NOT NULL,\
               latency_ms REAL NOT NULL,\
               protocol TEXT NOT NULL,\
               sequence_gap INTEGER NOT NULL DEFAULT 0,\
               payload_size INTEGER NOT NULL DEFAULT 0,\
               created_at TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS network_conditions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               condition_name TEXT NOT NULL,\
               applied_at TEXT NOT NULL,\
               delay_ms INTEGER,\
               loss_percent REAL,\
               bandwidth_limit TEXT,\
               description TEXT\
             );\
             CREATE INDEX IF NOT EXISTS idx_runs_status ON experiment_runs(status);\
             CREATE INDEX IF NOT EXISTS idx_message_id ON messages(message_id);\
             CREATE INDEX IF NOT EXISTS idx_vehicle_id ON messages(vehicle_id);\
             CREATE INDEX IF NOT EXISTS idx_message_type ON messages(message_type);\
             CREATE INDEX IF NOT EXISTS idx_timestamps ON messages(send_timestamp, receive_timestamp);\
             CREATE INDEX IF NOT EXISTS idx_conditions_applied ON network_conditions(applied_at);",
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Experiment runs
    // ---------------------------------------------------------------------

    /// Checks the single-flight slot and name uniqueness, then inserts a
    /// `pending` run, all inside one write transaction.
    pub fn admit_run(&self, new: &NewRun) -> Result<Admission, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active = tx
            .query_row(
                &format!(
                    "SELECT {} FROM experiment_runs WHERE status IN ('pending', 'running') \
                     ORDER BY id LIMIT 1",
                    RUN_COLUMNS
                ),
                [],
                read_run_row,
            )
            .optional()?;
        if let Some(row) = active {
            return Ok(Admission::Blocked(row.into_run()?));
        }

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM experiment_runs WHERE experiment_name = ?1",
                    RUN_COLUMNS
                ),
                params![new.name],
                read_run_row,
            )
            .optional()?;
        if let Some(row) = existing {
            return Ok(Admission::NameTaken(row.into_run()?));
        }

        let advanced = new
            .advanced_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO experiment_runs (experiment_name, network_profile, duration_seconds, \
             protocol, advanced_options, status, progress_percent, created_at, output_directory) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)",
            params![
                new.name,
                new.network_profile.as_str(),
                new.duration_seconds,
                new.protocol.as_str(),
                advanced,
                format_ts(new.created_at),
                new.output_directory.to_string_lossy().to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let run = tx
            .query_row(
                &format!("SELECT {} FROM experiment_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                read_run_row,
            )?
            .into_run()?;
        tx.commit()?;
        Ok(Admission::Admitted(run))
    }

    pub fn get_run(&self, id: i64) -> Result<Option<ExperimentRun>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM experiment_runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            read_run_row,
        )
        .optional()?
        .map(RunRow::into_run)
        .transpose()
    }

    pub fn get_run_by_name(&self, name: &str) -> Result<Option<ExperimentRun>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM experiment_runs WHERE experiment_name = ?1",
                RUN_COLUMNS
            ),
            params![name],
            read_run_row,
        )
        .optional()?
        .map(RunRow::into_run)
        .transpose()
    }

    /// The run currently holding the single-flight slot, if any.
    pub fn active_run(&self) -> Result<Option<ExperimentRun>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM experiment_runs WHERE status IN ('pending', 'running') \
                 ORDER BY id LIMIT 1",
                RUN_COLUMNS
            ),
            [],
            read_run_row,
        )
        .optional()?
        .map(RunRow::into_run)
        .transpose()
    }

    /// Runs newest first.
    pub fn list_runs(
        &self,
        limit: Option<usize>,
        status: Option<RunStatus>,
    ) -> Result<Vec<ExperimentRun>, StoreError> {
        let mut sql = format!("SELECT {} FROM experiment_runs", RUN_COLUMNS);
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// `pending -> running`. Returns false if the run was no longer pending.
    pub fn mark_running(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE experiment_runs SET status = 'running', current_phase = 'initializing', \
             progress_percent = 0, started_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, format_ts(started_at)],
        )?;
        Ok(changed == 1)
    }

    pub fn record_process_id(&self, id: i64, pid: u32) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE experiment_runs SET process_id = ?2 WHERE id = ?1",
            params![id, pid],
        )?;
        Ok(())
    }

    /// Phase and percent are written together; ignored once the run left `running`.
    pub fn update_progress(&self, id: i64, phase: &str, percent: u8) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE experiment_runs SET current_phase = ?2, progress_percent = ?3 \
             WHERE id = ?1 AND status = 'running'",
            params![id, phase, percent.min(100)],
        )?;
        Ok(changed == 1)
    }

    /// Moves an active run into a terminal state. Returns false when the run
    /// already reached a terminal state, which is left untouched.
    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NotTerminal(status));
        }
        let conn = self.lock();
        let changed = if status == RunStatus::Completed {
            conn.execute(
                "UPDATE experiment_runs SET status = 'completed', current_phase = 'completed', \
                 progress_percent = 100, completed_at = ?2, error_message = NULL \
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, format_ts(completed_at)],
            )?
        } else {
            conn.execute(
                "UPDATE experiment_runs SET status = ?2, completed_at = ?3, error_message = ?4 \
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, status.as_str(), format_ts(completed_at), error_message],
            )?
        };
        Ok(changed == 1)
    }

    pub fn delete_run(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM experiment_runs WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    pub fn insert_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        let created_at = record.created_at.unwrap_or_else(Utc::now);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (message_id, vehicle_id, message_type, send_timestamp, \
             receive_timestamp, latency_ms, protocol, sequence_gap, payload_size, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.message_id,
                record.vehicle_id,
                record.message_class.as_str(),
                record.send_timestamp,
                record.receive_timestamp,
                record.latency_ms,
                record.protocol.as_str(),
                record.sequence_gap as i64,
                record.payload_size as i64,
                format_ts(created_at),
            ],
        )?;
        Ok(())
    }

    /// Matching messages in arrival order (receive timestamp ascending).
    pub fn messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>, StoreError> {
        let mut sql = format!("SELECT {} FROM messages WHERE 1=1", MESSAGE_COLUMNS);
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(class) = filter.message_class {
            sql.push_str(" AND message_type = ?");
            values.push(SqlValue::Text(class.as_str().to_string()));
        }
        if let Some(protocol) = filter.protocol {
            sql.push_str(" AND protocol = ?");
            values.push(SqlValue::Text(protocol.as_str().to_string()));
        }
        if let Some(vehicle) = &filter.vehicle_id {
            sql.push_str(" AND vehicle_id = ?");
            values.push(SqlValue::Text(vehicle.clone()));
        }
        if let Some(from) = filter.received_from {
            sql.push_str(" AND receive_timestamp >= ?");
            values.push(SqlValue::Real(from));
        }
        if let Some(to) = filter.received_to {
            sql.push_str(" AND receive_timestamp <= ?");
            values.push(SqlValue::Real(to));
        }
        sql.push_str(" ORDER BY receive_timestamp ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(MessageRow::into_record).collect()
    }

    pub fn message_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Removes every ingested message ahead of a fresh experiment.
    pub fn clear_messages(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let removed = conn.execute("DELETE FROM messages", [])?;
        tracing::info!(removed, "message table cleared");
        Ok(removed as u64)
    }

    /// SQL-side summary for one protocol.
    pub fn protocol_statistics(&self, protocol: Protocol) -> Result<ProtocolStatistics, StoreError> {
        let conn = self.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*), AVG(latency_ms), MIN(latency_ms), MAX(latency_ms), \
             SUM(sequence_gap) FROM messages WHERE protocol = ?1",
            params![protocol.as_str()],
            |row| {
                Ok(ProtocolStatistics {
                    total_messages: row.get::<_, i64>(0)?.max(0) as u64,
                    avg_latency_ms: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    min_latency_ms: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    max_latency_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    total_gaps: row.get::<_, Option<i64>>(4)?.unwrap_or(0).max(0) as u64,
                })
            },
        )?;
        Ok(stats)
    }

    // ---------------------------------------------------------------------
    // Network condition audit trail
    // ---------------------------------------------------------------------

    pub fn insert_network_condition(
        &self,
        condition: &NetworkCondition,
        applied_at: DateTime<Utc>,
    ) -> Result<NetworkConditionEvent, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO network_conditions (condition_name, applied_at, delay_ms, loss_percent, \
             bandwidth_limit, description) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                condition.name,
                format_ts(applied_at),
                condition.delay_ms,
                condition.loss_percent,
                condition.bandwidth_limit,
                condition.description,
            ],
        )?;
        Ok(NetworkConditionEvent {
            id: conn.last_insert_rowid(),
            condition: condition.clone(),
            applied_at,
        })
    }

    /// Audit events applied within `[from, to]`, oldest first. Open bounds are unbounded.
    pub fn network_conditions(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<NetworkConditionEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, condition_name, applied_at, delay_ms, loss_percent, bandwidth_limit, \
             description FROM network_conditions WHERE 1=1",
        );
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(from) = from {
            sql.push_str(" AND applied_at >= ?");
            values.push(SqlValue::Text(format_ts(from)));
        }
        if let Some(to) = to {
            sql.push_str(" AND applied_at <= ?");
            values.push(SqlValue::Text(format_ts(to)));
        }
        sql.push_str(" ORDER BY applied_at ASC, id ASC");

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    NetworkCondition {
                        name: row.get(1)?,
                        delay_ms: row.get(3)?,
                        loss_percent: row.get(4)?,
                        bandwidth_limit: row.get(5)?,
                        description: row.get(6)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, condition, applied_at)| {
                Ok(NetworkConditionEvent {
                    id,
                    condition,
                    applied_at: parse_ts(&applied_at)?,
                })
            })
            .collect()
    }
}

// Fixed-width UTC timestamps compare correctly as text.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp(format!("{}: {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn invalid(column: &'static str, value: &str) -> StoreError {
    StoreError::InvalidValue {
        column,
        value: value.to_string(),
    }
}

struct RunRow {
    id: i64,
    name: String,
    profile: String,
    duration_seconds: i64,
    protocol: String,
    advanced_options: Option<String>,
    status: String,
    current_phase: Option<String>,
    progress_percent: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    output_directory: String,
    process_id: Option<i64>,
}

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        name: row.get(1)?,
        profile: row.get(2)?,
        duration_seconds: row.get(3)?,
        protocol: row.get(4)?,
        advanced_options: row.get(5)?,
        status: row.get(6)?,
        current_phase: row.get(7)?,
        progress_percent: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        error_message: row.get(12)?,
        output_directory: row.get(13)?,
        process_id: row.get(14)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<ExperimentRun, StoreError> {
        let network_profile = NetworkProfile::parse(&self.profile)
            .ok_or_else(|| invalid("network_profile", &self.profile))?;
        let protocol = ProtocolSelection::parse(&self.protocol)
            .ok_or_else(|| invalid("protocol", &self.protocol))?;
        let status =
            RunStatus::parse(&self.status).ok_or_else(|| invalid("status", &self.status))?;
        let advanced_options = self
            .advanced_options
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(ExperimentRun {
            id: self.id,
            name: self.name,
            network_profile,
            duration_seconds: u32::try_from(self.duration_seconds)
                .map_err(|_| invalid("duration_seconds", &self.duration_seconds.to_string()))?,
            protocol,
            advanced_options,
            status,
            current_phase: self.current_phase,
            progress_percent: self.progress_percent.clamp(0, 100) as u8,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error_message: self.error_message,
            output_directory: PathBuf::from(self.output_directory),
            process_id: self.process_id.and_then(|pid| u32::try_from(pid).ok()),
        })
    }
}

struct MessageRow {
    message_id: String,
    vehicle_id: String,
    message_type: String,
    send_timestamp: f64,
    receive_timestamp: f64,
    latency_ms: f64,
    protocol: String,
    sequence_gap: i64,
    payload_size: i64,
    created_at: String,
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        message_id: row.get(0)?,
        vehicle_id: row.get(1)?,
        message_type: row.get(2)?,
        send_timestamp: row.get(3)?,
        receive_timestamp: row.get(4)?,
        latency_ms: row.get(5)?,
        protocol: row.get(6)?,
        sequence_gap: row.get(7)?,
        payload_size: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl MessageRow {
    fn into_record(self) -> Result<MessageRecord, StoreError> {
        let message_class = MessageClass::parse(&self.message_type)
            .ok_or_else(|| invalid("message_type", &self.message_type))?;
        let protocol =
            Protocol::parse(&self.protocol).ok_or_else(|| invalid("protocol", &self.protocol))?;
        Ok(MessageRecord {
            message_id: self.message_id,
            vehicle_id: self.vehicle_id,
            message_class,
            send_timestamp: self.send_timestamp,
            receive_timestamp: self.receive_timestamp,
            latency_ms: self.latency_ms,
            protocol,
            sequence_gap: self.sequence_gap.max(0) as u64,
            payload_size: self.payload_size.max(0) as u64,
            created_at: Some(parse_ts(&self.created_at)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_run(name: &str) -> NewRun {
        NewRun {
            name: name.to_string(),
            network_profile: NetworkProfile::Moderate,
            duration_seconds: 30,
            protocol: ProtocolSelection::Udp,
            advanced_options: Some(serde_json::json!({"vehicles": 2})),
            output_directory: PathBuf::from(format!("/outputs/{}", name)),
            created_at: Utc::now(),
        }
    }

    fn record(seq: u64, protocol: Protocol, receive: f64) -> MessageRecord {
        MessageRecord {
            message_id: format!("TEL_VEH_001_{}", seq),
            vehicle_id: "VEH_001".to_string(),
            message_class: MessageClass::Telemetry,
            send_timestamp: receive - 0.01,
            receive_timestamp: receive,
            latency_ms: 10.0,
            protocol,
            sequence_gap: 0,
            payload_size: 120,
            created_at: None,
        }
    }

    fn admitted(admission: Admission) -> ExperimentRun {
        match admission {
            Admission::Admitted(run) => run,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn admission_is_single_flight() {
        let store = Store::open_in_memory().expect("store");
        let first = admitted(store.admit_run(&new_run("first")).expect("admit"));
        assert_eq!(first.status, RunStatus::Pending);
        assert_eq!(
            first.advanced_options,
            Some(serde_json::json!({"vehicles": 2}))
        );

        match store.admit_run(&new_run("second")).expect("admit") {
            Admission::Blocked(active) => assert_eq!(active.id, first.id),
            other => panic!("expected blocked, got {:?}", other),
        }
        assert_eq!(store.list_runs(None, None).expect("list").len(), 1);

        store
            .finish_run(first.id, RunStatus::Failed, Some("boom"), Utc::now())
            .expect("finish");
        admitted(store.admit_run(&new_run("second")).expect("admit"));
    }

    #[test]
    fn admission_rejects_duplicate_names() {
        let store = Store::open_in_memory().expect("store");
        let run = admitted(store.admit_run(&new_run("dup")).expect("admit"));
        store
            .finish_run(run.id, RunStatus::Completed, None, Utc::now())
            .expect("finish");
        match store.admit_run(&new_run("dup")).expect("admit") {
            Admission::NameTaken(existing) => assert_eq!(existing.id, run.id),
            other => panic!("expected name conflict, got {:?}", other),
        }
    }

    #[test]
    fn transitions_are_one_directional() {
        let store = Store::open_in_memory().expect("store");
        let run = admitted(store.admit_run(&new_run("mono")).expect("admit"));

        assert!(!store.update_progress(run.id, "setup", 5).expect("progress"));
        assert!(store.mark_running(run.id, Utc::now()).expect("running"));
        assert!(!store.mark_running(run.id, Utc::now()).expect("second running"));
        assert!(store.update_progress(run.id, "traffic", 150).expect("progress"));
        assert_eq!(
            store.get_run(run.id).expect("get").expect("row").progress_percent,
            100
        );

        assert!(store
            .finish_run(run.id, RunStatus::Cancelled, Some("Cancelled by user"), Utc::now())
            .expect("cancel"));
        assert!(!store
            .finish_run(run.id, RunStatus::Failed, Some("late"), Utc::now())
            .expect("late fail"));
        assert!(!store.update_progress(run.id, "late", 50).expect("late progress"));

        let run = store.get_run(run.id).expect("get").expect("row");
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error_message.as_deref(), Some("Cancelled by user"));
        assert!(run.completed_at.is_some());
        assert!(store
            .finish_run(run.id, RunStatus::Running, None, Utc::now())
            .is_err());
    }

    #[test]
    fn completed_runs_report_full_progress() {
        let store = Store::open_in_memory().expect("store");
        let run = admitted(store.admit_run(&new_run("ok")).expect("admit"));
        store.mark_running(run.id, Utc::now()).expect("running");
        store
            .finish_run(run.id, RunStatus::Completed, None, Utc::now())
            .expect("complete");
        let run = store.get_run(run.id).expect("get").expect("row");
        assert_eq!(run.progress_percent, 100);
        assert_eq!(run.current_phase.as_deref(), Some("completed"));
        assert!(store.active_run().expect("active").is_none());
    }

    #[test]
    fn messages_filter_and_order_by_arrival() {
        let store = Store::open_in_memory().expect("store");
        store.insert_message(&record(3, Protocol::Tcp, 103.0)).expect("insert");
        store.insert_message(&record(1, Protocol::Udp, 101.0)).expect("insert");
        store.insert_message(&record(2, Protocol::Udp, 102.0)).expect("insert");

        let all = store.messages(&MessageFilter::default()).expect("all");
        let ids: Vec<_> = all.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["TEL_VEH_001_1", "TEL_VEH_001_2", "TEL_VEH_001_3"]);
        assert!(all.iter().all(|m| m.created_at.is_some()));

        let udp = store
            .messages(&MessageFilter::protocol(Protocol::Udp))
            .expect("udp");
        assert_eq!(udp.len(), 2);

        let windowed = store
            .messages(&MessageFilter {
                received_from: Some(101.5),
                received_to: Some(103.0),
                ..MessageFilter::default()
            })
            .expect("window");
        assert_eq!(windowed.len(), 2);

        let stats = store.protocol_statistics(Protocol::Udp).expect("stats");
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.total_gaps, 0);
        assert_eq!(
            store.protocol_statistics(Protocol::Mqtt).expect("stats"),
            ProtocolStatistics::default()
        );

        assert_eq!(store.clear_messages().expect("clear"), 3);
        assert_eq!(store.message_count().expect("count"), 0);
    }

    #[test]
    fn network_conditions_are_queried_by_time_range() {
        let store = Store::open_in_memory().expect("store");
        let now = Utc::now();
        for (offset, name) in [(-120, "normal"), (-30, "severe"), (30, "normal")] {
            store
                .insert_network_condition(
                    &NetworkCondition {
                        name: name.to_string(),
                        delay_ms: Some(100),
                        loss_percent: Some(2.5),
                        ..NetworkCondition::default()
                    },
                    now + Duration::seconds(offset),
                )
                .expect("insert condition");
        }
        let window = store
            .network_conditions(Some(now - Duration::seconds(60)), Some(now))
            .expect("query");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].condition.name, "severe");
        assert_eq!(store.network_conditions(None, None).expect("all").len(), 3);
    }

    #[test]
    fn concurrent_admission_across_handles_admits_one() {
        let root = std::env::temp_dir().join(format!(
            "v2x_store_race_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("testbed.db");
        // Two handles on one file stand in for two processes.
        let stores = [
            std::sync::Arc::new(Store::open(&path).expect("open a")),
            std::sync::Arc::new(Store::open(&path).expect("open b")),
        ];
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = stores[i % 2].clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.admit_run(&new_run(&format!("racer_{}", i))).expect("admit")
                })
            })
            .collect();
        let admitted_count = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|a| matches!(a, Admission::Admitted(_)))
            .count();
        assert_eq!(admitted_count, 1);
        let runs = stores[0].list_runs(None, None).expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Pending);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn file_backed_store_persists_runs() {
        let root = std::env::temp_dir().join(format!(
            "v2x_store_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("db").join("testbed.db");
        let id = {
            let store = Store::open(&path).expect("open");
            admitted(store.admit_run(&new_run("durable")).expect("admit")).id
        };
        let store = Store::open(&path).expect("reopen");
        let run = store.get_run_by_name("durable").expect("get").expect("row");
        assert_eq!(run.id, id);
        assert_eq!(run.network_profile, NetworkProfile::Moderate);
        assert!(store.delete_run(id).expect("delete"));
        assert!(store.get_run(id).expect("get").is_none());
        let _ = std::fs::remove_dir_all(root);
    }
}

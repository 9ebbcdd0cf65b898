//! Experiment orchestrator: single-flight admission, subprocess supervision,
//! bounded cancellation and retention cleanup over the shared store.

pub mod process;
pub mod retention;
pub mod validate;

pub use retention::CleanupReport;
pub use validate::{SubmitRequest, ValidatedRequest, ValidationError};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use v2x_core::{
    ensure_dir, Admission, ExperimentRun, NetworkCondition, NetworkConditionEvent, NewRun,
    RunStatus, Store, TestbedConfig, KPI_REPORT_FILE,
};

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
pub const ORPHANED_MESSAGE: &str = "orphaned: orchestrator restarted";

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted {
        run_id: i64,
        name: String,
        output_directory: PathBuf,
    },
    /// Another run holds the single-flight slot; nothing was created.
    Blocked {
        run_id: i64,
        name: String,
        message: String,
    },
    Rejected {
        reason: String,
    },
}

/// A run plus the timing fields derived at read time.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: ExperimentRun,
    pub elapsed_seconds: Option<u64>,
    pub remaining_seconds: Option<u64>,
    /// Whether this process holds a live supervisor for the run.
    pub supervised: bool,
}

// Per-run liveness cache. The store stays the source of truth for status.
#[derive(Debug, Default)]
struct Slot {
    child: Option<Child>,
    cancel_requested: bool,
    finished: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

struct Inner {
    store: Arc<Store>,
    config: TestbedConfig,
    slots: Mutex<HashMap<i64, SlotRef>>,
}

/// Long-lived service object; clones share the same handle table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, config: TestbedConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.inner.config
    }

    /// Validates, admits and starts supervision. Returns as soon as the run is
    /// persisted as `pending`; the experiment itself proceeds on its own thread.
    pub fn submit(&self, req: &SubmitRequest) -> Result<SubmitOutcome> {
        let valid = match validate::validate_request(req) {
            Ok(valid) => valid,
            Err(err) => return Ok(reject(err)),
        };
        let store = &self.inner.store;
        if store.get_run_by_name(&valid.name)?.is_some() {
            return Ok(reject(ValidationError::NameTaken(valid.name)));
        }
        let config = &self.inner.config;
        match validate::available_bytes(&config.outputs_dir) {
            Ok(free) if free < config.min_free_bytes => {
                return Ok(reject(ValidationError::InsufficientSpace(free)));
            }
            Ok(_) => {}
            Err(err) => warn!(
                dir = %config.outputs_dir.display(),
                error = %err,
                "free space check failed; continuing"
            ),
        }

        let new = NewRun {
            output_directory: config.output_directory_for(&valid.name),
            name: valid.name,
            network_profile: valid.network_profile,
            duration_seconds: valid.duration_seconds,
            protocol: valid.protocol,
            advanced_options: valid.advanced_options,
            created_at: Utc::now(),
        };
        let run = match store.admit_run(&new)? {
            Admission::Admitted(run) => run,
            Admission::Blocked(active) => {
                info!(active_run = active.id, requested = %new.name, "submission blocked");
                return Ok(SubmitOutcome::Blocked {
                    run_id: active.id,
                    message: format!(
                        "Experiment '{}' is already running. Please wait for it to complete.",
                        active.name
                    ),
                    name: active.name,
                });
            }
            Admission::NameTaken(existing) => {
                return Ok(reject(ValidationError::NameTaken(existing.name)));
            }
        };

        let slot: SlotRef = Arc::default();
        lock(&self.inner.slots).insert(run.id, slot.clone());
        let inner = self.inner.clone();
        let supervised = run.clone();
        let spawned = thread::Builder::new()
            .name(format!("supervisor-{}", run.id))
            .spawn(move || supervise(inner, supervised, slot));
        if let Err(err) = spawned {
            lock(&self.inner.slots).remove(&run.id);
            let message = format!("supervisor spawn failed: {}", err);
            store.finish_run(run.id, RunStatus::Failed, Some(&message), Utc::now())?;
            return Err(anyhow!("spawn_failed: {}", message));
        }

        info!(
            run_id = run.id,
            name = %run.name,
            profile = %run.network_profile,
            duration_secs = run.duration_seconds,
            protocol = %run.protocol,
            "experiment accepted"
        );
        Ok(SubmitOutcome::Accepted {
            run_id: run.id,
            name: run.name,
            output_directory: run.output_directory,
        })
    }

    pub fn status(&self, run_id: i64) -> Result<RunView> {
        let run = self.get(run_id)?;
        Ok(self.view(run))
    }

    pub fn list(&self, limit: Option<usize>, status: Option<RunStatus>) -> Result<Vec<RunView>> {
        let runs = self.inner.store.list_runs(limit, status)?;
        Ok(runs.into_iter().map(|run| self.view(run)).collect())
    }

    pub fn running(&self) -> Result<Option<RunView>> {
        Ok(self.inner.store.active_run()?.map(|run| self.view(run)))
    }

    /// Terminates the run's process (SIGTERM, grace, SIGKILL), marks it
    /// cancelled and clears impairments. Without a live handle in this
    /// process, the recorded pid is signalled only while it still names the
    /// group leader spawned for this run.
    pub fn cancel(&self, run_id: i64) -> Result<ExperimentRun> {
        let run = self.get(run_id)?;
        if !run.status.is_active() {
            bail!("cancel_not_active: run {} is {}", run_id, run.status);
        }
        let grace = self.inner.config.cancel_grace();
        let slot = lock(&self.inner.slots).get(&run_id).cloned();

        match slot {
            Some(slot) => {
                let child = {
                    let mut slot = lock(&slot);
                    if slot.finished {
                        drop(slot);
                        let current = self.get(run_id)?;
                        bail!("cancel_not_active: run {} is {}", run_id, current.status);
                    }
                    slot.cancel_requested = true;
                    slot.child.take()
                };
                if let Some(mut child) = child {
                    match process::terminate(&mut child, grace) {
                        Ok((status, killed)) => info!(
                            run_id,
                            pid = child.id(),
                            code = ?status.code(),
                            killed,
                            "experiment process stopped"
                        ),
                        Err(err) => warn!(run_id, error = %err, "terminating experiment process failed"),
                    }
                }
                self.inner.store.finish_run(
                    run_id,
                    RunStatus::Cancelled,
                    Some(CANCELLED_MESSAGE),
                    Utc::now(),
                )?;
            }
            None => {
                // First terminal write wins, so mark before signalling a process
                // that another orchestrator may be supervising.
                self.inner.store.finish_run(
                    run_id,
                    RunStatus::Cancelled,
                    Some(CANCELLED_MESSAGE),
                    Utc::now(),
                )?;
                match (run.process_id, run.started_at) {
                    (Some(pid), Some(started)) if process::is_spawned_leader(pid, started) => {
                        process::terminate_pid(pid, grace);
                    }
                    (Some(pid), _) => {
                        warn!(run_id, pid, "recorded pid no longer names the experiment; not signalling")
                    }
                    (None, _) => {}
                }
            }
        }
        self.inner.clear_impairments(run_id);

        let current = self.get(run_id)?;
        if current.status != RunStatus::Cancelled {
            bail!("cancel_not_active: run {} is {}", run_id, current.status);
        }
        info!(run_id, name = %current.name, "experiment cancelled");
        Ok(current)
    }

    /// Blocks until the run is terminal and its supervisor has released it.
    pub fn wait(&self, run_id: i64, timeout: Duration) -> Result<ExperimentRun> {
        let deadline = Instant::now() + timeout;
        loop {
            let run = self.get(run_id)?;
            let supervised = lock(&self.inner.slots).contains_key(&run_id);
            if run.status.is_terminal() && !supervised {
                return Ok(run);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "wait_timeout: run {} still {} after {}s",
                    run_id,
                    run.status,
                    timeout.as_secs()
                ));
            }
            thread::sleep(SUPERVISOR_POLL);
        }
    }

    /// [`wait`](Self::wait) for a caller that owns supervision and is about to
    /// exit: on timeout the run is cancelled, so its process is stopped and
    /// impairments are cleared before the error is returned.
    pub fn wait_or_cancel(&self, run_id: i64, timeout: Duration) -> Result<ExperimentRun> {
        match self.wait(run_id, timeout) {
            Ok(run) => Ok(run),
            Err(err) => {
                warn!(run_id, error = %err, "run did not finish in time; cancelling");
                if let Err(cancel_err) = self.cancel(run_id) {
                    warn!(run_id, error = %cancel_err, "cancel after wait timeout failed");
                }
                let release = self.inner.config.cancel_grace()
                    + self.inner.config.clear_timeout()
                    + SUPERVISOR_POLL * 5;
                let run = self.wait(run_id, release)?;
                Err(anyhow!(
                    "wait_timeout: run {} did not finish within {}s and is now {}",
                    run_id,
                    timeout.as_secs(),
                    run.status
                ))
            }
        }
    }

    /// The run's `kpi_report.json`, annotated with run metadata.
    pub fn results(&self, run_id: i64) -> Result<Value> {
        let run = self.get(run_id)?;
        if run.status != RunStatus::Completed {
            bail!(
                "results_unavailable: Experiment has status '{}', no results available",
                run.status
            );
        }
        let path = run.output_directory.join(KPI_REPORT_FILE);
        if !path.exists() {
            bail!("results_missing: Results file not found at {}", path.display());
        }
        let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut results: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("results_invalid: {}", path.display()))?;
        let annotations = json!({
            "experiment_name": run.name,
            "network_profile": run.network_profile,
            "duration_seconds": run.duration_seconds,
            "started_at": run.started_at,
            "completed_at": run.completed_at,
        });
        match results.as_object_mut() {
            Some(obj) => {
                if let Value::Object(extra) = annotations {
                    obj.extend(extra);
                }
            }
            None => {
                results = json!({ "report": results, "experiment": annotations });
            }
        }
        Ok(results)
    }

    pub fn cleanup(&self, days: u32) -> Result<CleanupReport> {
        self.cleanup_before(Utc::now() - ChronoDuration::days(i64::from(days)))
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        Ok(retention::cleanup_before(&self.inner.store, cutoff)?)
    }

    /// Fails runs left active by a previous process. Only call this from the
    /// process that owns supervision, before it accepts submissions.
    pub fn reconcile_orphans(&self) -> Result<Vec<i64>> {
        let mut reconciled = Vec::new();
        for status in [RunStatus::Pending, RunStatus::Running] {
            for run in self.inner.store.list_runs(None, Some(status))? {
                if lock(&self.inner.slots).contains_key(&run.id) {
                    continue;
                }
                if self.inner.store.finish_run(
                    run.id,
                    RunStatus::Failed,
                    Some(ORPHANED_MESSAGE),
                    Utc::now(),
                )? {
                    warn!(run_id = run.id, name = %run.name, "orphaned run marked failed");
                    reconciled.push(run.id);
                }
            }
        }
        Ok(reconciled)
    }

    pub fn record_network_condition(&self, condition: &NetworkCondition) -> Result<NetworkConditionEvent> {
        let event = self
            .inner
            .store
            .insert_network_condition(condition, Utc::now())?;
        info!(
            name = %event.condition.name,
            delay_ms = ?event.condition.delay_ms,
            loss_percent = ?event.condition.loss_percent,
            "network condition recorded"
        );
        Ok(event)
    }

    /// Audit events applied between the run's start and completion (or now).
    pub fn network_conditions_for(&self, run_id: i64) -> Result<Vec<NetworkConditionEvent>> {
        let run = self.get(run_id)?;
        let Some(started) = run.started_at else {
            return Ok(Vec::new());
        };
        let until = run.completed_at.unwrap_or_else(Utc::now);
        Ok(self
            .inner
            .store
            .network_conditions(Some(started), Some(until))?)
    }

    fn get(&self, run_id: i64) -> Result<ExperimentRun> {
        self.inner
            .store
            .get_run(run_id)?
            .ok_or_else(|| anyhow!("run_not_found: {}", run_id))
    }

    fn view(&self, run: ExperimentRun) -> RunView {
        let now = Utc::now();
        RunView {
            elapsed_seconds: run.elapsed_seconds(now),
            remaining_seconds: run.remaining_seconds(now),
            supervised: lock(&self.inner.slots).contains_key(&run.id),
            run,
        }
    }
}

fn reject(err: ValidationError) -> SubmitOutcome {
    info!(reason = %err, "submission rejected");
    SubmitOutcome::Rejected {
        reason: err.to_string(),
    }
}

impl Inner {
    /// Never fatal: failures are logged and the run's state is unaffected.
    fn clear_impairments(&self, run_id: i64) {
        match process::run_with_timeout(&self.config.clear_command, self.config.clear_timeout()) {
            Ok(status) if status.success() => debug!(run_id, "impairments cleared"),
            Ok(status) => warn!(run_id, code = ?status.code(), "impairment clear command failed"),
            Err(err) => warn!(run_id, error = %err, "impairment clear command failed"),
        }
    }
}

/// Finalizes the run if the supervisor exits without doing so (error or
/// panic), then clears impairments and releases the handle.
struct SupervisorGuard {
    inner: Arc<Inner>,
    run_id: i64,
    slot: SlotRef,
    done: bool,
}

impl SupervisorGuard {
    fn complete(&mut self, status: RunStatus, error_message: Option<&str>) -> Result<()> {
        self.inner
            .store
            .finish_run(self.run_id, status, error_message, Utc::now())?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        let (cancelled, leftover) = {
            let mut slot = lock(&self.slot);
            slot.finished = true;
            (slot.cancel_requested, slot.child.take())
        };
        if let Some(mut child) = leftover {
            let _ = process::kill_now(&mut child);
        }
        if !self.done && !cancelled {
            let message = if thread::panicking() {
                "supervisor panicked"
            } else {
                "supervisor aborted"
            };
            let _ = self
                .inner
                .store
                .finish_run(self.run_id, RunStatus::Failed, Some(message), Utc::now());
        }
        if !cancelled {
            self.inner.clear_impairments(self.run_id);
        }
        lock(&self.inner.slots).remove(&self.run_id);
    }
}

fn supervise(inner: Arc<Inner>, run: ExperimentRun, slot: SlotRef) {
    let mut guard = SupervisorGuard {
        inner: inner.clone(),
        run_id: run.id,
        slot: slot.clone(),
        done: false,
    };
    let result = match drive(&inner, &run, &slot) {
        Ok(Some((status, message))) => guard.complete(status, message.as_deref()),
        Ok(None) => {
            guard.done = true;
            Ok(())
        }
        Err(err) => {
            error!(run_id = run.id, error = %format!("{:#}", err), "experiment supervision failed");
            guard.complete(RunStatus::Failed, Some(&format!("{:#}", err)))
        }
    };
    if let Err(err) = result {
        error!(run_id = run.id, error = %err, "could not record final run state");
    }
}

/// Returns the terminal state to record, or `None` when cancellation owns it.
fn drive(
    inner: &Inner,
    run: &ExperimentRun,
    slot: &SlotRef,
) -> Result<Option<(RunStatus, Option<String>)>> {
    let store = &inner.store;
    if !store.mark_running(run.id, Utc::now())? {
        debug!(run_id = run.id, "run left pending before start");
        return Ok(None);
    }
    ensure_dir(&run.output_directory)?;

    let mut command = inner.config.experiment_command.clone();
    command.push(run.name.clone());
    command.push(run.duration_seconds.to_string());
    command.push(run.network_profile.as_str().to_string());

    let lines = {
        let mut guard = lock(slot);
        if guard.cancel_requested {
            return Ok(None);
        }
        let (child, lines) = process::spawn_merged(&command)?;
        let pid = child.id();
        guard.child = Some(child);
        store.record_process_id(run.id, pid)?;
        info!(run_id = run.id, pid, command = ?command, "experiment process started");
        lines
    };

    let status = loop {
        let line = lines.recv_timeout(SUPERVISOR_POLL);
        match line {
            Ok(line) => {
                record_line(store, run.id, &line);
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Both streams closed; the process may still be exiting.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(SUPERVISOR_POLL),
        }
        let mut guard = lock(slot);
        let Some(child) = guard.child.as_mut() else {
            // Cancellation took the process.
            return Ok(None);
        };
        if let Some(status) = child.try_wait()? {
            guard.child = None;
            break status;
        }
    };
    // Output that arrived between the last read and exit.
    for line in lines.try_iter() {
        record_line(store, run.id, &line);
    }

    if lock(slot).cancel_requested {
        return Ok(None);
    }
    info!(run_id = run.id, code = ?status.code(), "experiment process exited");
    if status.success() {
        Ok(Some((RunStatus::Completed, None)))
    } else {
        Ok(Some((RunStatus::Failed, Some(process::describe_exit(&status)))))
    }
}

fn record_line(store: &Store, run_id: i64, line: &str) {
    info!(run_id, line, "experiment output");
    if let Some((phase, percent)) = process::parse_phase(line) {
        match store.update_progress(run_id, &phase, percent) {
            Ok(_) => info!(run_id, phase = %phase, percent, "phase update"),
            Err(err) => warn!(run_id, error = %err, "progress update failed"),
        }
    }
}

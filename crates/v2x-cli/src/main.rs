mod api;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use v2x_core::{
    ensure_dir, MessageClass, MessageFilter, NetworkCondition, Protocol, ProtocolSelection,
    RunStatus, Store, TestbedConfig,
};
use v2x_metrics::MetricsEngine;
use v2x_receiver::Receiver;
use v2x_runner::{Orchestrator, RunView, SubmitOutcome, SubmitRequest};

#[derive(Parser)]
#[command(name = "v2x", version = "0.3.0", about = "V2X testbed orchestrator and telemetry receiver")]
struct Cli {
    /// YAML configuration; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `info` or `v2x_receiver=debug`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an experiment and supervise it until it finishes.
    Submit {
        name: String,
        #[arg(long)]
        duration: i64,
        #[arg(long)]
        profile: String,
        #[arg(long, default_value = "ALL")]
        protocol: String,
        /// Free-form JSON stored with the run.
        #[arg(long)]
        options: Option<String>,
        /// Seconds to wait for completion; defaults to the duration plus 60.
        #[arg(long)]
        wait_timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Status {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Running {
        #[arg(long)]
        json: bool,
    },
    Results {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        json: bool,
    },
    /// Run the telemetry receiver in the foreground.
    Receive {
        /// UDP, TCP, MQTT or ALL; falls back to $PROTOCOL, then ALL.
        #[arg(long)]
        protocol: Option<String>,
        /// Stop after this many seconds; runs until killed when omitted.
        #[arg(long)]
        duration: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Metrics {
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(long)]
        vehicle: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write the KPI report and CSV exports.
    Report {
        #[arg(long, conflicts_with = "run")]
        out: Option<PathBuf>,
        /// Export into this run's output directory.
        #[arg(long)]
        run: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Append a network-condition audit event.
    RecordCondition {
        name: String,
        #[arg(long)]
        delay_ms: Option<u32>,
        #[arg(long)]
        loss_percent: Option<f64>,
        #[arg(long)]
        bandwidth: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        json: bool,
    },
    ClearMessages {
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP control API, optionally with the receiver alongside.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        receiver: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_file.as_deref())?;
    let json_mode = command_json_mode(&cli.command);
    let result = TestbedConfig::load(cli.config.as_deref())
        .and_then(|config| run_command(cli.command, config));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    // RUST_LOG wins over --log-level when set.
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log level: {}", directive))?;
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                ensure_dir(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn open_store(config: &TestbedConfig) -> Result<Arc<Store>> {
    if let Some(parent) = config
        .database_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        ensure_dir(parent)?;
    }
    let store = Store::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

fn run_command(command: Commands, config: TestbedConfig) -> Result<Option<Value>> {
    let store = open_store(&config)?;
    match command {
        Commands::Submit {
            name,
            duration,
            profile,
            protocol,
            options,
            wait_timeout,
            json,
        } => {
            let advanced_options = options
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--options must be valid JSON")?;
            let request = SubmitRequest {
                name,
                duration_seconds: duration,
                network_profile: profile,
                protocol,
                advanced_options,
            };
            let orchestrator = Orchestrator::new(store, config);
            let outcome = orchestrator.submit(&request)?;
            let run_id = match &outcome {
                SubmitOutcome::Accepted { run_id, .. } => *run_id,
                _ if json => {
                    return Ok(Some(json!({
                        "ok": false,
                        "command": "submit",
                        "outcome": outcome,
                    })));
                }
                SubmitOutcome::Blocked { message, .. } => bail!("submission_blocked: {}", message),
                SubmitOutcome::Rejected { reason } => bail!("submission_rejected: {}", reason),
            };
            let timeout = wait_timeout.unwrap_or(duration.max(0) as u64 + 60);
            // This process owns supervision, so a timeout cancels rather than
            // leaving the experiment running without a supervisor.
            let run = orchestrator.wait_or_cancel(run_id, Duration::from_secs(timeout))?;
            if json {
                return Ok(Some(json!({
                    "ok": run.status == RunStatus::Completed,
                    "command": "submit",
                    "outcome": outcome,
                    "run": run,
                })));
            }
            println!("run_id: {}", run.id);
            println!("name: {}", run.name);
            println!("status: {}", run.status);
            println!("output_directory: {}", run.output_directory.display());
            if let Some(err) = &run.error_message {
                println!("error: {}", err);
            }
        }
        Commands::Status { run_id, json } => {
            let view = Orchestrator::new(store, config).status(run_id)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "status", "run": view })));
            }
            print_run(&view);
        }
        Commands::Cancel { run_id, json } => {
            let run = Orchestrator::new(store, config).cancel(run_id)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "cancel", "run": run })));
            }
            println!("run_id: {}", run.id);
            println!("status: {}", run.status);
        }
        Commands::List {
            limit,
            status,
            json,
        } => {
            let status = status
                .map(|s| RunStatus::parse(&s).ok_or_else(|| anyhow!("unknown status: {}", s)))
                .transpose()?;
            let runs = Orchestrator::new(store, config).list(limit, status)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "list", "runs": runs })));
            }
            for view in &runs {
                println!(
                    "{}\t{}\t{}\t{}\t{}%",
                    view.run.id,
                    view.run.name,
                    view.run.status,
                    view.run.network_profile,
                    view.run.progress_percent
                );
            }
        }
        Commands::Running { json } => {
            let view = Orchestrator::new(store, config).running()?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "running", "run": view })));
            }
            match &view {
                Some(view) => print_run(view),
                None => println!("running: none"),
            }
        }
        Commands::Results { run_id, json } => {
            let results = Orchestrator::new(store, config).results(run_id)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "results", "results": results })));
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Cleanup { days, json } => {
            let report = Orchestrator::new(store, config).cleanup(days)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "cleanup", "cleanup": report })));
            }
            println!("deleted: {}", report.deleted);
            println!("bytes_reclaimed: {}", report.bytes_reclaimed);
            for err in &report.errors {
                println!("error: {}", err);
            }
        }
        Commands::Receive {
            protocol,
            duration,
            json,
        } => {
            let selection = resolve_selection(protocol)?;
            let receiver = Receiver::new(store, config.receiver.clone());
            let snapshot = receiver.run(&selection.protocols(), duration.map(Duration::from_secs))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "receive",
                    "protocol": selection,
                    "ingest": snapshot,
                })));
            }
            println!("received: {}", snapshot.received);
            println!("stored: {}", snapshot.stored);
            println!("dropped: {}", snapshot.dropped);
            println!("negative_latency: {}", snapshot.negative_latency);
        }
        Commands::Metrics {
            class,
            protocol,
            vehicle,
            json,
        } => {
            let filter = build_filter(class, protocol, vehicle)?;
            let engine = MetricsEngine::new(store);
            let kpis = engine.kpis(&filter)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "metrics",
                    "kpis": kpis,
                    "protocol_comparison": engine.compare_protocols(&filter)?,
                    "message_type_comparison": engine.compare_classes(&filter)?,
                })));
            }
            println!("messages: {}", kpis.packet_loss.counts.total_received);
            println!("avg_latency_ms: {:.3}", kpis.latency.avg_latency_ms);
            println!("p95_latency_ms: {:.3}", kpis.latency.p95_latency_ms);
            println!("p99_latency_ms: {:.3}", kpis.latency.p99_latency_ms);
            println!("jitter_ms: {:.3}", kpis.jitter_ms);
            println!("loss_rate_percent: {:.3}", kpis.packet_loss.loss_rate_percent);
            println!("messages_per_second: {:.3}", kpis.throughput.messages_per_second);
        }
        Commands::Report { out, run, json } => {
            let dir = match (out, run) {
                (Some(out), _) => out,
                (None, Some(run_id)) => {
                    Orchestrator::new(store.clone(), config)
                        .status(run_id)?
                        .run
                        .output_directory
                }
                (None, None) => bail!("report requires --out or --run"),
            };
            let summary = MetricsEngine::new(store).export(&dir, &MessageFilter::default())?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "report", "export": summary })));
            }
            println!("kpi_report: {}", summary.kpi_report.display());
            println!("messages_csv: {}", summary.messages_csv.display());
            if let Some(path) = &summary.latency_by_protocol_csv {
                println!("latency_by_protocol_csv: {}", path.display());
            }
            println!("total_messages: {}", summary.total_messages);
        }
        Commands::RecordCondition {
            name,
            delay_ms,
            loss_percent,
            bandwidth,
            description,
            json,
        } => {
            let condition = NetworkCondition {
                name,
                delay_ms,
                loss_percent,
                bandwidth_limit: bandwidth,
                description,
            };
            let event = Orchestrator::new(store, config).record_network_condition(&condition)?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "record-condition", "event": event })));
            }
            println!("event_id: {}", event.id);
            println!("applied_at: {}", event.applied_at.to_rfc3339());
        }
        Commands::ClearMessages { json } => {
            let removed = store.clear_messages()?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "clear-messages", "removed": removed })));
            }
            println!("removed: {}", removed);
        }
        Commands::Serve { bind, receiver } => {
            let orchestrator = Orchestrator::new(store.clone(), config.clone());
            let orphaned = orchestrator.reconcile_orphans()?;
            if !orphaned.is_empty() {
                info!(runs = ?orphaned, "reconciled orphaned runs");
            }
            let running = match receiver {
                Some(raw) => {
                    let selection = resolve_selection(Some(raw))?;
                    let rx = Receiver::new(store.clone(), config.receiver.clone());
                    Some(rx.start(&selection.protocols())?)
                }
                None => None,
            };
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            let served = api::Api::new(orchestrator, MetricsEngine::new(store)).serve(&bind);
            if let Some(running) = running {
                running.stop_and_join();
            }
            served?;
        }
    }
    Ok(None)
}

fn resolve_selection(flag: Option<String>) -> Result<ProtocolSelection> {
    let raw = flag
        .or_else(|| std::env::var("PROTOCOL").ok())
        .unwrap_or_else(|| "ALL".to_string());
    ProtocolSelection::parse(&raw.to_ascii_uppercase())
        .ok_or_else(|| anyhow!("unknown protocol: {} (expected UDP, TCP, MQTT or ALL)", raw))
}

fn build_filter(
    class: Option<String>,
    protocol: Option<String>,
    vehicle: Option<String>,
) -> Result<MessageFilter> {
    let message_class = class
        .map(|c| MessageClass::parse(&c).ok_or_else(|| anyhow!("unknown message class: {}", c)))
        .transpose()?;
    let protocol = protocol
        .map(|p| Protocol::parse(&p).ok_or_else(|| anyhow!("unknown protocol: {}", p)))
        .transpose()?;
    Ok(MessageFilter {
        message_class,
        protocol,
        vehicle_id: vehicle,
        ..MessageFilter::default()
    })
}

fn print_run(view: &RunView) {
    let run = &view.run;
    println!("run_id: {}", run.id);
    println!("name: {}", run.name);
    println!("status: {}", run.status);
    println!("profile: {}", run.network_profile);
    println!("protocol: {}", run.protocol);
    if let Some(phase) = &run.current_phase {
        println!("phase: {}", phase);
    }
    println!("progress: {}%", run.progress_percent);
    if let Some(elapsed) = view.elapsed_seconds {
        println!("elapsed_seconds: {}", elapsed);
    }
    if let Some(remaining) = view.remaining_seconds {
        println!("remaining_seconds: {}", remaining);
    }
    if let Some(err) = &run.error_message {
        println!("error: {}", err);
    }
    println!("output_directory: {}", run.output_directory.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Submit { json, .. }
        | Commands::Status { json, .. }
        | Commands::Cancel { json, .. }
        | Commands::List { json, .. }
        | Commands::Running { json, .. }
        | Commands::Results { json, .. }
        | Commands::Cleanup { json, .. }
        | Commands::Receive { json, .. }
        | Commands::Metrics { json, .. }
        | Commands::Report { json, .. }
        | Commands::RecordCondition { json, .. }
        | Commands::ClearMessages { json } => *json,
        Commands::Serve { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_defaults_and_case() {
        assert_eq!(
            resolve_selection(Some("udp".to_string())).expect("udp"),
            ProtocolSelection::Udp
        );
        assert!(resolve_selection(Some("quic".to_string())).is_err());
    }

    #[test]
    fn filters_reject_unknown_values() {
        let filter = build_filter(Some("safety".to_string()), Some("mqtt".to_string()), None)
            .expect("filter");
        assert_eq!(filter.message_class, Some(MessageClass::Safety));
        assert_eq!(filter.protocol, Some(Protocol::Mqtt));
        assert!(build_filter(Some("video".to_string()), None, None).is_err());
    }

    #[test]
    fn json_errors_carry_code() {
        let err = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "command_failed");
    }
}

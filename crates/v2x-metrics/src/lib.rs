//! Read-side aggregation over the message table.

pub mod report;
pub mod stats;

pub use report::{KpiReport, ReportMetadata, TimeRange};
pub use stats::{Kpis, LatencyStats, LossReport, LossStats, Throughput};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use v2x_core::{
    atomic_write_bytes, atomic_write_json_pretty, MessageClass, MessageFilter, MessageRecord,
    Protocol, ProtocolStatistics, Store,
};

pub use v2x_core::KPI_REPORT_FILE;
pub const MESSAGES_CSV_FILE: &str = "messages.csv";
pub const LATENCY_BY_PROTOCOL_FILE: &str = "latency_by_protocol.csv";

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub kpi_report: PathBuf,
    pub messages_csv: PathBuf,
    pub latency_by_protocol_csv: Option<PathBuf>,
    pub total_messages: u64,
}

/// Queries are point-in-time and hold no state between calls.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    store: Arc<Store>,
}

impl MetricsEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn records(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        self.store
            .messages(filter)
            .context("store_query_failed: messages")
    }

    pub fn latency(&self, filter: &MessageFilter) -> Result<LatencyStats> {
        let latencies: Vec<f64> = self.records(filter)?.iter().map(|r| r.latency_ms).collect();
        Ok(stats::latency_stats(&latencies))
    }

    pub fn jitter(&self, filter: &MessageFilter) -> Result<f64> {
        Ok(stats::jitter_ms(&self.records(filter)?))
    }

    pub fn loss(&self, filter: &MessageFilter) -> Result<LossReport> {
        Ok(stats::loss_report(&self.records(filter)?))
    }

    pub fn throughput(&self, filter: &MessageFilter) -> Result<Throughput> {
        Ok(stats::throughput(&self.records(filter)?))
    }

    pub fn kpis(&self, filter: &MessageFilter) -> Result<Kpis> {
        Ok(Kpis::compute(&self.records(filter)?))
    }

    pub fn compare_protocols(&self, filter: &MessageFilter) -> Result<BTreeMap<Protocol, Kpis>> {
        Ok(report::compare_protocols(&self.records(filter)?))
    }

    pub fn compare_classes(&self, filter: &MessageFilter) -> Result<BTreeMap<MessageClass, Kpis>> {
        Ok(report::compare_classes(&self.records(filter)?))
    }

    /// Count/avg/min/max/gaps computed inside the store, per protocol.
    pub fn protocol_summary(&self) -> Result<BTreeMap<Protocol, ProtocolStatistics>> {
        let mut out = BTreeMap::new();
        for protocol in Protocol::ALL {
            let stats = self
                .store
                .protocol_statistics(protocol)
                .with_context(|| format!("store_query_failed: statistics for {}", protocol))?;
            out.insert(protocol, stats);
        }
        Ok(out)
    }

    pub fn report(&self, filter: &MessageFilter) -> Result<KpiReport> {
        Ok(KpiReport::build(&self.records(filter)?, Utc::now()))
    }

    /// Writes the KPI report and tabular exports into `dir`. The per-protocol
    /// latency table is skipped when no protocol has records.
    pub fn export(&self, dir: &Path, filter: &MessageFilter) -> Result<ExportSummary> {
        let records = self.records(filter)?;
        let report = KpiReport::build(&records, Utc::now());

        let kpi_path = dir.join(KPI_REPORT_FILE);
        let value = serde_json::to_value(&report)?;
        atomic_write_json_pretty(&kpi_path, &value)
            .with_context(|| format!("export_failed: {}", kpi_path.display()))?;

        let csv_path = dir.join(MESSAGES_CSV_FILE);
        atomic_write_bytes(&csv_path, report::messages_csv(&records).as_bytes())
            .with_context(|| format!("export_failed: {}", csv_path.display()))?;

        let latency_path = if report.protocol_comparison.is_empty() {
            None
        } else {
            let path = dir.join(LATENCY_BY_PROTOCOL_FILE);
            let csv = report::latency_by_protocol_csv(&report.protocol_comparison);
            atomic_write_bytes(&path, csv.as_bytes())
                .with_context(|| format!("export_failed: {}", path.display()))?;
            Some(path)
        };

        info!(
            dir = %dir.display(),
            messages = records.len(),
            "metrics exported"
        );
        Ok(ExportSummary {
            kpi_report: kpi_path,
            messages_csv: csv_path,
            latency_by_protocol_csv: latency_path,
            total_messages: records.len() as u64,
        })
    }
}

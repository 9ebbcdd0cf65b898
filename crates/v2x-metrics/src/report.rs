use crate::stats::{receive_span, Kpis};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use v2x_core::{MessageClass, MessageRecord, Protocol};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    pub total_messages: u64,
    pub unique_vehicles: u64,
    pub protocols_used: Vec<Protocol>,
    pub time_range: TimeRange,
    /// Samples whose receive time precedes their send time; kept as observed.
    pub negative_latency_samples: u64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiReport {
    pub metadata: ReportMetadata,
    pub overall_kpis: Kpis,
    pub protocol_comparison: BTreeMap<Protocol, Kpis>,
    pub message_type_comparison: BTreeMap<MessageClass, Kpis>,
}

/// Per-protocol KPI slices; protocols without records are omitted.
pub fn compare_protocols(records: &[MessageRecord]) -> BTreeMap<Protocol, Kpis> {
    Protocol::ALL
        .into_iter()
        .filter_map(|protocol| {
            let slice: Vec<MessageRecord> = records
                .iter()
                .filter(|r| r.protocol == protocol)
                .cloned()
                .collect();
            (!slice.is_empty()).then(|| (protocol, Kpis::compute(&slice)))
        })
        .collect()
}

pub fn compare_classes(records: &[MessageRecord]) -> BTreeMap<MessageClass, Kpis> {
    MessageClass::ALL
        .into_iter()
        .filter_map(|class| {
            let slice: Vec<MessageRecord> = records
                .iter()
                .filter(|r| r.message_class == class)
                .cloned()
                .collect();
            (!slice.is_empty()).then(|| (class, Kpis::compute(&slice)))
        })
        .collect()
}

impl KpiReport {
    pub fn build(records: &[MessageRecord], generated_at: DateTime<Utc>) -> Self {
        let vehicles: BTreeSet<&str> = records.iter().map(|r| r.vehicle_id.as_str()).collect();
        let protocols: BTreeSet<Protocol> = records.iter().map(|r| r.protocol).collect();
        let time_range = receive_span(records)
            .map(|(start, end)| TimeRange { start, end })
            .unwrap_or_default();
        Self {
            metadata: ReportMetadata {
                total_messages: records.len() as u64,
                unique_vehicles: vehicles.len() as u64,
                protocols_used: protocols.into_iter().collect(),
                time_range,
                negative_latency_samples: records.iter().filter(|r| r.latency_ms < 0.0).count()
                    as u64,
                generated_at,
            },
            overall_kpis: Kpis::compute(records),
            protocol_comparison: compare_protocols(records),
            message_type_comparison: compare_classes(records),
        }
    }
}

pub const MESSAGES_CSV_HEADER: &str = "message_id,vehicle_id,message_type,send_timestamp,\
receive_timestamp,latency_ms,protocol,sequence_gap,payload_size,created_at";

pub fn messages_csv(records: &[MessageRecord]) -> String {
    let mut out = String::with_capacity(64 + records.len() * 128);
    out.push_str(MESSAGES_CSV_HEADER);
    out.push('\n');
    for r in records {
        let created = r
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{:.6},{:.6},{:.3},{},{},{},{}",
            csv_field(&r.message_id),
            csv_field(&r.vehicle_id),
            r.message_class,
            r.send_timestamp,
            r.receive_timestamp,
            r.latency_ms,
            r.protocol,
            r.sequence_gap,
            r.payload_size,
            created
        );
    }
    out
}

pub fn latency_by_protocol_csv(comparison: &BTreeMap<Protocol, Kpis>) -> String {
    let mut out = String::from(
        "protocol,avg_latency_ms,median_latency_ms,p95_latency_ms,p99_latency_ms,\
min_latency_ms,max_latency_ms,stddev_latency_ms\n",
    );
    for (protocol, kpis) in comparison {
        let l = &kpis.latency;
        let _ = writeln!(
            out,
            "{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3}",
            protocol,
            l.avg_latency_ms,
            l.median_latency_ms,
            l.p95_latency_ms,
            l.p99_latency_ms,
            l.min_latency_ms,
            l.max_latency_ms,
            l.stddev_latency_ms
        );
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

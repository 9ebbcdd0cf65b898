//! Pure KPI arithmetic over message records. Every function returns zeros for
//! empty (or degenerate) input rather than an error.

use serde::Serialize;
use v2x_core::MessageRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_latency_ms: f64,
    pub median_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub stddev_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossStats {
    pub total_expected: u64,
    pub total_received: u64,
    pub total_lost: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub total_messages: u64,
    pub total_bytes: u64,
    pub messages_per_second: f64,
    pub bytes_per_second: f64,
    pub kbps: f64,
    pub mbps: f64,
    pub duration_seconds: f64,
}

/// Full KPI set for one slice of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Kpis {
    pub latency: LatencyStats,
    pub jitter_ms: f64,
    pub packet_loss: LossReport,
    pub throughput: Throughput,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossReport {
    #[serde(flatten)]
    pub counts: LossStats,
    pub loss_rate_percent: f64,
}

impl Kpis {
    pub fn compute(records: &[MessageRecord]) -> Self {
        let latencies: Vec<f64> = records.iter().map(|r| r.latency_ms).collect();
        Self {
            latency: latency_stats(&latencies),
            jitter_ms: jitter_ms(records),
            packet_loss: loss_report(records),
            throughput: throughput(records),
        }
    }
}

pub fn latency_stats(latencies: &[f64]) -> LatencyStats {
    if latencies.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    LatencyStats {
        avg_latency_ms: mean,
        median_latency_ms: percentile(&sorted, 0.50),
        p95_latency_ms: percentile(&sorted, 0.95),
        p99_latency_ms: percentile(&sorted, 0.99),
        min_latency_ms: sorted[0],
        max_latency_ms: sorted[sorted.len() - 1],
        stddev_latency_ms: variance.sqrt(),
    }
}

/// Linear interpolation between closest ranks over an ascending slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = q.clamp(0.0, 1.0) * (len - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

/// Mean absolute difference between consecutive latencies, in arrival order.
pub fn jitter_ms(records: &[MessageRecord]) -> f64 {
    if records.len() < 2 {
        return 0.0;
    }
    let mut ordered: Vec<&MessageRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.receive_timestamp.total_cmp(&b.receive_timestamp));
    let total: f64 = ordered
        .windows(2)
        .map(|w| (w[1].latency_ms - w[0].latency_ms).abs())
        .sum();
    total / (ordered.len() - 1) as f64
}

pub fn loss_stats(records: &[MessageRecord]) -> LossStats {
    let total_received = records.len() as u64;
    let total_lost: u64 = records.iter().map(|r| r.sequence_gap).sum();
    LossStats {
        total_expected: total_received + total_lost,
        total_received,
        total_lost,
    }
}

pub fn loss_rate_percent(stats: &LossStats) -> f64 {
    if stats.total_expected == 0 {
        return 0.0;
    }
    let lost = stats.total_expected.saturating_sub(stats.total_received) as f64;
    (lost / stats.total_expected as f64 * 100.0).clamp(0.0, 100.0)
}

pub fn loss_report(records: &[MessageRecord]) -> LossReport {
    let counts = loss_stats(records);
    LossReport {
        loss_rate_percent: loss_rate_percent(&counts),
        counts,
    }
}

pub fn throughput(records: &[MessageRecord]) -> Throughput {
    let (min, max) = match receive_span(records) {
        Some(span) => span,
        None => return Throughput::default(),
    };
    let span = max - min;
    if span <= 0.0 {
        return Throughput::default();
    }
    let total_messages = records.len() as u64;
    let total_bytes: u64 = records.iter().map(|r| r.payload_size).sum();
    let bytes_per_second = total_bytes as f64 / span;
    Throughput {
        total_messages,
        total_bytes,
        messages_per_second: total_messages as f64 / span,
        bytes_per_second,
        kbps: bytes_per_second * 8.0 / 1000.0,
        mbps: bytes_per_second * 8.0 / 1_000_000.0,
        duration_seconds: span,
    }
}

/// `(earliest, latest)` receive timestamps.
pub fn receive_span(records: &[MessageRecord]) -> Option<(f64, f64)> {
    records.iter().fold(None, |acc, r| {
        let t = r.receive_timestamp;
        Some(match acc {
            None => (t, t),
            Some((lo, hi)) => (f64::min(lo, t), f64::max(hi, t)),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use v2x_core::{MessageClass, Protocol};

    fn record(seq: u64, received: f64, latency: f64, gap: u64) -> MessageRecord {
        MessageRecord {
            message_id: format!("TEL_V1_{}", seq),
            vehicle_id: "V1".to_string(),
            message_class: MessageClass::Telemetry,
            send_timestamp: received - latency / 1000.0,
            receive_timestamp: received,
            latency_ms: latency,
            protocol: Protocol::Udp,
            sequence_gap: gap,
            payload_size: 200,
            created_at: None,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn latency_summary_for_five_samples() {
        let stats = latency_stats(&[50.0, 10.0, 40.0, 20.0, 30.0]);
        assert!(close(stats.avg_latency_ms, 30.0));
        assert!(close(stats.median_latency_ms, 30.0));
        assert!(close(stats.p95_latency_ms, 48.0));
        assert!(stats.p95_latency_ms > 40.0 && stats.p95_latency_ms < 50.0);
        assert!(close(stats.p99_latency_ms, 49.6));
        assert!(close(stats.min_latency_ms, 10.0));
        assert!(close(stats.max_latency_ms, 50.0));
        assert!((stats.stddev_latency_ms - 200f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(latency_stats(&[]), LatencyStats::default());
        assert_eq!(Kpis::compute(&[]), Kpis::default());
    }

    #[test]
    fn single_sample_has_no_spread() {
        let stats = latency_stats(&[12.5]);
        assert!(close(stats.p99_latency_ms, 12.5));
        assert!(close(stats.stddev_latency_ms, 0.0));
        assert_eq!(jitter_ms(&[record(1, 1.0, 12.5, 0)]), 0.0);
    }

    #[test]
    fn jitter_follows_arrival_order_not_input_order() {
        let records = vec![
            record(3, 3.0, 30.0, 0),
            record(1, 1.0, 10.0, 0),
            record(2, 2.0, 40.0, 0),
        ];
        // Arrival order latencies: 10, 40, 30 -> |30| + |10| over 2.
        assert!(close(jitter_ms(&records), 20.0));
    }

    #[test]
    fn contiguous_sequence_has_no_loss() {
        let records: Vec<_> = (0..10).map(|i| record(i, i as f64, 5.0, 0)).collect();
        let loss = loss_report(&records);
        assert_eq!(loss.counts.total_expected, 10);
        assert_eq!(loss.loss_rate_percent, 0.0);
    }

    #[test]
    fn gaps_produce_loss() {
        let records = vec![record(1, 1.0, 5.0, 0), record(4, 2.0, 5.0, 2)];
        let loss = loss_report(&records);
        assert_eq!(loss.counts.total_expected, 4);
        assert_eq!(loss.counts.total_lost, 2);
        assert!(close(loss.loss_rate_percent, 50.0));
        assert_eq!(loss_rate_percent(&LossStats::default()), 0.0);
    }

    #[test]
    fn throughput_over_observed_span() {
        let records = vec![record(1, 100.0, 5.0, 0), record(2, 102.0, 5.0, 0)];
        let t = throughput(&records);
        assert!(close(t.messages_per_second, 1.0));
        assert!(close(t.bytes_per_second, 200.0));
        assert!(close(t.kbps, 1.6));
        assert!(close(t.duration_seconds, 2.0));

        let same_instant = vec![record(1, 5.0, 1.0, 0), record(2, 5.0, 1.0, 0)];
        assert_eq!(throughput(&same_instant), Throughput::default());
    }

    #[test]
    fn recomputation_is_stable() {
        let records: Vec<_> = (0..50)
            .map(|i| record(i, i as f64 * 0.1, (i % 7) as f64 * 3.0, i % 3))
            .collect();
        assert_eq!(Kpis::compute(&records), Kpis::compute(&records));
    }
}

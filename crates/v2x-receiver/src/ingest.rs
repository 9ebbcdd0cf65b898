use crate::tracker::SequenceTracker;
use crate::wire;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use v2x_core::{unix_seconds, MessageRecord, Protocol, Store};

/// Shared by every binding: decode, gap-track, time and persist one payload.
#[derive(Debug)]
pub struct Ingestor {
    store: Arc<Store>,
    tracker: SequenceTracker,
    stats: IngestStats,
}

#[derive(Debug, Default)]
struct IngestStats {
    received: AtomicU64,
    dropped: AtomicU64,
    stored: AtomicU64,
    store_errors: AtomicU64,
    negative_latency: AtomicU64,
    gaps: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub stored: u64,
    pub store_errors: u64,
    pub negative_latency: u64,
    pub gaps: u64,
}

impl Ingestor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            tracker: SequenceTracker::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn ingest(&self, payload: &[u8], protocol: Protocol) -> Option<MessageRecord> {
        self.ingest_at(payload, protocol, unix_seconds(Utc::now()))
    }

    /// Returns the persisted record, or `None` when the payload was dropped.
    /// Undecodable payloads leave the sequence tracker untouched.
    pub fn ingest_at(
        &self,
        payload: &[u8],
        protocol: Protocol,
        receive_timestamp: f64,
    ) -> Option<MessageRecord> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let msg = match wire::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(protocol = %protocol, bytes = payload.len(), error = %err, "dropping undecodable message");
                return None;
            }
        };

        let sequence_gap = msg
            .sequence()
            .map(|seq| self.tracker.observe(&msg.vehicle_id, msg.message_class, seq))
            .unwrap_or(0);
        if sequence_gap > 0 {
            self.stats.gaps.fetch_add(sequence_gap, Ordering::Relaxed);
            debug!(
                vehicle_id = %msg.vehicle_id,
                class = %msg.message_class,
                gap = sequence_gap,
                "sequence gap"
            );
        }

        let latency_ms = (receive_timestamp - msg.send_timestamp) * 1000.0;
        if latency_ms < 0.0 {
            self.stats.negative_latency.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %msg.message_id,
                vehicle_id = %msg.vehicle_id,
                latency_ms,
                clock_skew = true,
                "receive time precedes send time"
            );
        }

        let record = MessageRecord {
            message_id: msg.message_id,
            vehicle_id: msg.vehicle_id,
            message_class: msg.message_class,
            send_timestamp: msg.send_timestamp,
            receive_timestamp,
            latency_ms,
            protocol,
            sequence_gap,
            payload_size: payload.len() as u64,
            created_at: None,
        };
        if let Err(err) = self.store.insert_message(&record) {
            self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %record.message_id, error = %err, "failed to persist message");
            return None;
        }
        self.stats.stored.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            stored: self.stats.stored.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
            negative_latency: self.stats.negative_latency.load(Ordering::Relaxed),
            gaps: self.stats.gaps.load(Ordering::Relaxed),
        }
    }

    pub fn tracked_pairs(&self) -> usize {
        self.tracker.tracked_pairs()
    }
}

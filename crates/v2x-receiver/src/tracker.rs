use std::collections::HashMap;
use std::sync::Mutex;
use v2x_core::MessageClass;

/// Last sequence seen per (producer, class). In memory only: a restarted
/// receiver starts from an empty map, so the first message of each pair after
/// a restart re-establishes the baseline and earlier losses go uncounted.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Mutex<HashMap<(String, MessageClass), u64>>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sequence numbers skipped before `sequence`.
    /// Backward jumps report 0 and still move the baseline.
    pub fn observe(&self, vehicle_id: &str, class: MessageClass, sequence: u64) -> u64 {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.insert((vehicle_id.to_string(), class), sequence) {
            Some(prev) => sequence.saturating_sub(prev.saturating_add(1)),
            None => 0,
        }
    }

    pub fn tracked_pairs(&self) -> usize {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

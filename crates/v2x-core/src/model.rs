use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkProfile {
    Normal,
    Moderate,
    Severe,
    Handoff,
}

impl NetworkProfile {
    pub const ALL: [NetworkProfile; 4] = [
        NetworkProfile::Normal,
        NetworkProfile::Moderate,
        NetworkProfile::Severe,
        NetworkProfile::Handoff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
            Self::Handoff => "handoff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport a single message arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "MQTT")]
    Mqtt,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Udp, Protocol::Tcp, Protocol::Mqtt];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::Mqtt => "MQTT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocols an experiment exercises. `All` runs every binding at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolSelection {
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "MQTT")]
    Mqtt,
    #[serde(rename = "ALL")]
    All,
}

impl ProtocolSelection {
    pub const ALL: [ProtocolSelection; 4] = [
        ProtocolSelection::Udp,
        ProtocolSelection::Tcp,
        ProtocolSelection::Mqtt,
        ProtocolSelection::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::Mqtt => "MQTT",
            Self::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    pub fn protocols(self) -> Vec<Protocol> {
        match self {
            Self::Udp => vec![Protocol::Udp],
            Self::Tcp => vec![Protocol::Tcp],
            Self::Mqtt => vec![Protocol::Mqtt],
            Self::All => Protocol::ALL.to_vec(),
        }
    }
}

impl fmt::Display for ProtocolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an experiment run: `pending -> running -> {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Pending and running runs count against the single-flight ceiling.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Telemetry,
    Safety,
}

impl MessageClass {
    pub const ALL: [MessageClass; 2] = [MessageClass::Telemetry, MessageClass::Safety];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Safety => "safety",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentRun {
    pub id: i64,
    pub name: String,
    pub network_profile: NetworkProfile,
    pub duration_seconds: u32,
    pub protocol: ProtocolSelection,
    pub advanced_options: Option<Value>,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_directory: PathBuf,
    /// Last spawned experiment process; informational only, liveness lives in
    /// the orchestrator's handle table.
    pub process_id: Option<u32>,
}

impl ExperimentRun {
    /// Seconds since the run started, only while it is running.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.status != RunStatus::Running {
            return None;
        }
        let started = self.started_at?;
        Some((now - started).num_seconds().max(0) as u64)
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        self.elapsed_seconds(now)
            .map(|elapsed| u64::from(self.duration_seconds).saturating_sub(elapsed))
    }
}

/// A validated request, ready to be admitted by the store.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub network_profile: NetworkProfile,
    pub duration_seconds: u32,
    pub protocol: ProtocolSelection,
    pub advanced_options: Option<Value>,
    pub output_directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// One decoded inbound message, as persisted in the message table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub vehicle_id: String,
    pub message_class: MessageClass,
    pub send_timestamp: f64,
    pub receive_timestamp: f64,
    /// `receive - send` in milliseconds. Negative values mean clock skew and
    /// are kept as observed.
    pub latency_ms: f64,
    pub protocol: Protocol,
    pub sequence_gap: u64,
    pub payload_size: u64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub message_class: Option<MessageClass>,
    pub protocol: Option<Protocol>,
    pub vehicle_id: Option<String>,
    pub received_from: Option<f64>,
    pub received_to: Option<f64>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn class(message_class: MessageClass) -> Self {
        Self {
            message_class: Some(message_class),
            ..Self::default()
        }
    }

    pub fn protocol(protocol: Protocol) -> Self {
        Self {
            protocol: Some(protocol),
            ..Self::default()
        }
    }
}

/// An impairment profile as applied by the external shaping tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    pub name: String,
    pub delay_ms: Option<u32>,
    pub loss_percent: Option<f64>,
    pub bandwidth_limit: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkConditionEvent {
    pub id: i64,
    #[serde(flatten)]
    pub condition: NetworkCondition,
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running_run(started_secs_ago: i64, duration: u32) -> (ExperimentRun, DateTime<Utc>) {
        let now = Utc::now();
        let run = ExperimentRun {
            id: 1,
            name: "exp".to_string(),
            network_profile: NetworkProfile::Normal,
            duration_seconds: duration,
            protocol: ProtocolSelection::All,
            advanced_options: None,
            status: RunStatus::Running,
            current_phase: Some("traffic".to_string()),
            progress_percent: 40,
            created_at: now - Duration::seconds(started_secs_ago + 1),
            started_at: Some(now - Duration::seconds(started_secs_ago)),
            completed_at: None,
            error_message: None,
            output_directory: PathBuf::from("/outputs/exp"),
            process_id: None,
        };
        (run, now)
    }

    #[test]
    fn enum_strings_round_trip_through_parse() {
        for p in NetworkProfile::ALL {
            assert_eq!(NetworkProfile::parse(p.as_str()), Some(p));
        }
        for s in RunStatus::ALL {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ProtocolSelection::parse("ALL"), Some(ProtocolSelection::All));
        assert_eq!(ProtocolSelection::parse("all"), None);
        assert_eq!(Protocol::parse("mqtt"), Some(Protocol::Mqtt));
        assert_eq!(NetworkProfile::parse("extreme"), None);
    }

    #[test]
    fn only_pending_and_running_are_active() {
        assert!(RunStatus::Pending.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn remaining_time_is_derived_and_floors_at_zero() {
        let (run, now) = running_run(25, 60);
        assert_eq!(run.elapsed_seconds(now), Some(25));
        assert_eq!(run.remaining_seconds(now), Some(35));

        let (overdue, now) = running_run(90, 60);
        assert_eq!(overdue.remaining_seconds(now), Some(0));

        let (mut done, now) = running_run(10, 60);
        done.status = RunStatus::Completed;
        assert_eq!(done.elapsed_seconds(now), None);
    }

    #[test]
    fn all_selection_expands_to_every_protocol() {
        assert_eq!(ProtocolSelection::All.protocols().len(), 3);
        assert_eq!(ProtocolSelection::Tcp.protocols(), vec![Protocol::Tcp]);
    }
}

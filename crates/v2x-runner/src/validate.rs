use serde::Deserialize;
use serde_json::Value;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;
use v2x_core::{NetworkProfile, ProtocolSelection};

pub const MAX_NAME_LEN: usize = 100;
pub const MIN_DURATION_SECS: i64 = 10;
pub const MAX_DURATION_SECS: i64 = 300;

/// A submission as received from a caller, before any checking.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub name: String,
    pub duration_seconds: i64,
    pub network_profile: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub advanced_options: Option<Value>,
}

fn default_protocol() -> String {
    ProtocolSelection::All.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub name: String,
    pub duration_seconds: u32,
    pub network_profile: NetworkProfile,
    pub protocol: ProtocolSelection,
    pub advanced_options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Experiment name cannot be empty")]
    EmptyName,
    #[error("Experiment name must contain only letters, numbers, and underscores")]
    InvalidNameCharacters,
    #[error("Experiment name must be less than 100 characters")]
    NameTooLong,
    #[error("Experiment '{0}' already exists")]
    NameTaken(String),
    #[error("Duration must be between 10 and 300 seconds")]
    DurationOutOfRange(i64),
    #[error("Invalid network profile. Must be one of: normal, moderate, severe, handoff")]
    UnknownProfile(String),
    #[error("Invalid protocol. Must be one of: UDP, TCP, MQTT, ALL")]
    UnknownProtocol(String),
    #[error("Insufficient disk space: {:.2}GB available", gib(.0))]
    InsufficientSpace(u64),
}

fn gib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Field checks only; name uniqueness and free space need the store and the
/// filesystem and are checked by the orchestrator.
pub fn validate_request(req: &SubmitRequest) -> Result<ValidatedRequest, ValidationError> {
    let name = req.name.as_str();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidNameCharacters);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong);
    }
    if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&req.duration_seconds) {
        return Err(ValidationError::DurationOutOfRange(req.duration_seconds));
    }
    let network_profile = NetworkProfile::parse(&req.network_profile)
        .ok_or_else(|| ValidationError::UnknownProfile(req.network_profile.clone()))?;
    let protocol = ProtocolSelection::parse(&req.protocol)
        .ok_or_else(|| ValidationError::UnknownProtocol(req.protocol.clone()))?;
    Ok(ValidatedRequest {
        name: name.to_string(),
        duration_seconds: req.duration_seconds as u32,
        network_profile,
        protocol,
        advanced_options: req.advanced_options.clone(),
    })
}

/// Free bytes available to unprivileged writers on the filesystem holding
/// `path`. A path that does not exist yet is resolved to its nearest ancestor.
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

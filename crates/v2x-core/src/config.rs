use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Testbed configuration, loaded from YAML. Every field has a default so an
/// absent file yields a working configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TestbedConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Parent of every run's output directory (`<outputs_dir>/<name>`).
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,

    /// Experiment executable; `(name, duration_seconds, profile)` are appended.
    #[serde(default = "default_experiment_command")]
    pub experiment_command: Vec<String>,

    /// Impairment-clearing command, run without extra arguments.
    #[serde(default = "default_clear_command")]
    pub clear_command: Vec<String>,

    #[serde(default = "default_clear_timeout_secs")]
    pub clear_timeout_secs: u64,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Submissions are refused below this much free space in `outputs_dir`.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_port")]
    pub udp_port: u16,

    #[serde(default = "default_port")]
    pub tcp_port: u16,

    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,

    /// Declared frame lengths above this close the connection.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,

    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Topics follow `<namespace>/<producer_id>/<message_class>`.
    #[serde(default = "default_topic_namespace")]
    pub topic_namespace: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            outputs_dir: default_outputs_dir(),
            experiment_command: default_experiment_command(),
            clear_command: default_clear_command(),
            clear_timeout_secs: default_clear_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            min_free_bytes: default_min_free_bytes(),
            receiver: ReceiverConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            udp_port: default_port(),
            tcp_port: default_port(),
            max_datagram_bytes: default_max_datagram_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            topic_namespace: default_topic_namespace(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

impl MqttConfig {
    /// Single wildcard subscription covering every producer and class.
    pub fn wildcard_topic(&self) -> String {
        format!("{}/#", self.topic_namespace.trim_end_matches('/'))
    }
}

impl TestbedConfig {
    /// Reads the YAML file when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_yaml(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// `V2X_DATABASE`, `V2X_OUTPUTS`, and `PORT` for both stream and datagram
    /// listeners, as the edge-server containers are configured.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("V2X_DATABASE") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(outputs) = lookup("V2X_OUTPUTS") {
            self.outputs_dir = PathBuf::from(outputs);
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT value: {}", port))?;
            self.receiver.udp_port = port;
            self.receiver.tcp_port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.experiment_command.is_empty() {
            bail!("experiment_command must not be empty");
        }
        if self.clear_command.is_empty() {
            bail!("clear_command must not be empty");
        }
        if self.receiver.max_datagram_bytes == 0 {
            bail!("receiver.max_datagram_bytes must be > 0");
        }
        Ok(())
    }

    pub fn clear_timeout(&self) -> Duration {
        Duration::from_secs(self.clear_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn output_directory_for(&self, name: &str) -> PathBuf {
        self.outputs_dir.join(name)
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/data/v2x_testbed.db")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("/outputs")
}

fn default_experiment_command() -> Vec<String> {
    vec!["bash".to_string(), "/app/run_experiment.sh".to_string()]
}

fn default_clear_command() -> Vec<String> {
    vec!["bash".to_string(), "/network_profiles/clear.sh".to_string()]
}

fn default_clear_timeout_secs() -> u64 {
    10
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_min_free_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_max_datagram_bytes() -> usize {
    4096
}

fn default_max_frame_bytes() -> u32 {
    1024 * 1024
}

fn default_mqtt_host() -> String {
    "mqtt_broker".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "edge_server".to_string()
}

fn default_topic_namespace() -> String {
    "v2x".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

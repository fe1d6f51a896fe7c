use crate::error::{HarnessError, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessSection {
    /// Variable carrying `host:port` to both client processes
    #[serde(default = "default_address_env")]
    pub address_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Append a random run id to `name` so parallel runs don't collide
    #[serde(default = "default_true")]
    pub unique_name: bool,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Host port to publish on; 0 picks a free port for each run
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_port")]
    pub container_port: u16,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Leave the server running after the run
    #[serde(default)]
    pub keep: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_server_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_receiver_args")]
    pub args: Vec<String>,
    pub workdir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Line the receiver prints once it has joined; empty disables the wait
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
    #[serde(default = "default_max_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
    #[serde(default = "default_receiver_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SenderConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_sender_args")]
    pub args: Vec<String>,
    pub workdir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Upper bound on the sender's runtime; 0 waits forever
    #[serde(default = "default_sender_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyConfig {
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    /// Pause between the sender exiting and reading the receiver's output
    #[serde(default = "default_verify_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ArtifactsConfig {
    #[serde(default)]
    pub keep: bool,
    #[serde(default)]
    pub keep_on_failure: bool,
}

// Default value functions
fn default_address_env() -> String {
    "IRC_SERVER".to_owned()
}

fn default_server_name() -> String {
    "ircprobe-ircd".to_owned()
}

fn default_image() -> String {
    "inspircd/inspircd-docker".to_owned()
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    6667
}

fn default_docker_binary() -> String {
    "docker".to_owned()
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_attempt_timeout_ms() -> u64 {
    1000
}

const fn default_retry_delay_ms() -> u64 {
    2000
}

const fn default_server_settle_ms() -> u64 {
    2000
}

fn default_program() -> String {
    "cargo".to_owned()
}

fn default_receiver_args() -> Vec<String> {
    ["run", "--quiet", "--example", "receive_message"]
        .map(str::to_owned)
        .to_vec()
}

fn default_sender_args() -> Vec<String> {
    ["run", "--quiet", "--example", "send_message"]
        .map(str::to_owned)
        .to_vec()
}

fn default_ready_marker() -> String {
    "joined #test".to_owned()
}

const fn default_ready_delay_ms() -> u64 {
    500
}

const fn default_receiver_settle_ms() -> u64 {
    500
}

const fn default_sender_timeout() -> u64 {
    120
}

const fn default_verify_settle_ms() -> u64 {
    1000
}

fn default_markers() -> Vec<String> {
    vec!["Hello World".to_owned(), "Goodbye world".to_owned()]
}

fn default_true() -> bool {
    true
}

impl Default for HarnessSection {
    fn default() -> Self {
        Self {
            address_env: default_address_env(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            unique_name: true,
            image: default_image(),
            host: default_host(),
            port: default_port(),
            container_port: default_port(),
            docker_binary: default_docker_binary(),
            extra_args: Vec::new(),
            keep: false,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            settle_ms: default_server_settle_ms(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_receiver_args(),
            workdir: None,
            env: Vec::new(),
            ready_marker: default_ready_marker(),
            ready_attempts: default_max_attempts(),
            ready_delay_ms: default_ready_delay_ms(),
            settle_ms: default_receiver_settle_ms(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_sender_args(),
            workdir: None,
            env: Vec::new(),
            timeout_secs: default_sender_timeout(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            settle_ms: default_verify_settle_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl ReceiverConfig {
    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl VerifyConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HarnessError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| HarnessError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    fn find_config_file() -> Result<PathBuf> {
        let candidates = [
            Some(PathBuf::from("ircprobe.toml")),
            dirs::config_dir().map(|p| p.join("ircprobe/ircprobe.toml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        Err(HarnessError::Config("Config file not found".to_owned()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.harness.address_env.is_empty() {
            return Err(HarnessError::Config(
                "harness.address_env must not be empty".to_owned(),
            ));
        }
        if self.server.name.is_empty() || self.server.image.is_empty() {
            return Err(HarnessError::Config(
                "server.name and server.image are required".to_owned(),
            ));
        }
        if self.readiness.max_attempts == 0 {
            return Err(HarnessError::Config(
                "readiness.max_attempts must be at least 1".to_owned(),
            ));
        }
        if !self.receiver.ready_marker.is_empty() && self.receiver.ready_attempts == 0 {
            return Err(HarnessError::Config(
                "receiver.ready_attempts must be at least 1".to_owned(),
            ));
        }
        if self.receiver.program.is_empty() || self.sender.program.is_empty() {
            return Err(HarnessError::Config(
                "receiver.program and sender.program are required".to_owned(),
            ));
        }
        if self.verify.markers.is_empty() || self.verify.markers.iter().any(String::is_empty) {
            return Err(HarnessError::Config(
                "verify.markers must list at least one non-empty marker".to_owned(),
            ));
        }
        Ok(())
    }
}

//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use lorachunk_core::{ProtocolConfig, RadioConfig};
use serde::Deserialize;

/// Host configuration. File: ~/.config/lorachunk/config.toml or /etc/lorachunk/config.toml.
/// Env overrides: LORACHUNK_SERIAL, LORACHUNK_FREQ, LORACHUNK_ADDR.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Serial device of the LoRa module (default /dev/ttyS0).
    #[serde(default = "default_serial")]
    pub serial: PathBuf,
    /// UART baud rate of the module (default 9600).
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// `[radio]` table: own address (default 0) and frequency (default 433 MHz).
    #[serde(default)]
    pub radio: RadioConfig,
    /// Where `send` goes when no destination is given (default 0, the default own address).
    #[serde(default = "default_dest_address")]
    pub dest_address: u16,
    /// Directory received files are written to (default: current directory).
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Serial poll interval (default 50 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub protocol: ProtocolSection,
}

/// `[protocol]` table: [`ProtocolConfig`] with durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProtocolSection {
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub nack_timeout_ms: u64,
    pub max_retry_rounds: u32,
    pub recv_timeout_ms: u64,
    pub nack_ack_timeout_ms: u64,
    pub max_nack_retries: u32,
    pub transfer_ttl_ms: u64,
}

fn default_serial() -> PathBuf {
    PathBuf::from("/dev/ttyS0")
}
fn default_baud() -> u32 {
    9600
}
fn default_dest_address() -> u16 {
    0
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            baud: default_baud(),
            radio: RadioConfig::default(),
            dest_address: default_dest_address(),
            output_dir: default_output_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            protocol: ProtocolSection::default(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        let p = ProtocolConfig::default();
        Self {
            chunk_size: p.chunk_size,
            inter_chunk_delay_ms: millis(p.inter_chunk_delay),
            nack_timeout_ms: millis(p.nack_timeout),
            max_retry_rounds: p.max_retry_rounds,
            recv_timeout_ms: millis(p.recv_timeout),
            nack_ack_timeout_ms: millis(p.nack_ack_timeout),
            max_nack_retries: p.max_nack_retries,
            transfer_ttl_ms: millis(p.transfer_ttl),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ProtocolSection {
    pub fn to_protocol(&self) -> ProtocolConfig {
        ProtocolConfig {
            chunk_size: self.chunk_size,
            inter_chunk_delay: Duration::from_millis(self.inter_chunk_delay_ms),
            nack_timeout: Duration::from_millis(self.nack_timeout_ms),
            max_retry_rounds: self.max_retry_rounds,
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            nack_ack_timeout: Duration::from_millis(self.nack_ack_timeout_ms),
            max_nack_retries: self.max_nack_retries,
            transfer_ttl: Duration::from_millis(self.transfer_ttl_ms),
        }
    }
}

/// Load config: `explicit` file if given (must exist), else the first of the
/// default paths that exists, else defaults. Env vars are applied on top.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_from(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_from(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Apply LORACHUNK_* overrides; `get` looks up a variable. Unparseable values
/// are ignored with a warning.
pub fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(s) = get("LORACHUNK_SERIAL") {
        c.serial = PathBuf::from(s);
    }
    if let Some(s) = get("LORACHUNK_FREQ") {
        match s.parse::<u16>() {
            Ok(f) => c.radio.freq_mhz = f,
            Err(_) => tracing::warn!(value = %s, "ignoring LORACHUNK_FREQ"),
        }
    }
    if let Some(s) = get("LORACHUNK_ADDR") {
        match s.parse::<u16>() {
            Ok(a) => c.radio.address = a,
            Err(_) => tracing::warn!(value = %s, "ignoring LORACHUNK_ADDR"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lorachunk/config.toml"));
    }
    out.push(PathBuf::from("/etc/lorachunk/config.toml"));
    out
}

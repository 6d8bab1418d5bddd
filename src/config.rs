//! Process configuration: a `clap::Parser` CLI struct layered under a
//! `serde`-deserialized `Config`, grounded on `turn_server::config::Config`.
//! Compiled defaults < config file < server-pushed dictionary <
//! explicit `Session::set_config`/`apply_server_config`, each layer
//! overriding only the keys it sets (§6/§11).

use std::collections::HashMap;
use std::fs::read_to_string;

use clap::Parser;
use serde::Deserialize;

use session::config::{DataSaving, SessionConfig};

fn default_init_timeout() -> f64 {
    20.0
}

fn default_recv_timeout() -> f64 {
    20.0
}

fn default_log_file_path() -> Option<String> {
    None
}

fn default_stats_dump_file_path() -> Option<String> {
    None
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

fn deserialize_data_saving<'de, D>(deserializer: D) -> Result<DataSaving, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "never" => Ok(DataSaving::Never),
        "mobile_only" => Ok(DataSaving::MobileOnly),
        "always" => Ok(DataSaving::Always),
        other => Err(serde::de::Error::custom(format!("unknown data_saving value: {other}"))),
    }
}

fn default_data_saving() -> DataSaving {
    DataSaving::Never
}

/// The session-level knobs from §6, deserialized from the config file and
/// layered onto `session::config::SessionConfig`'s compiled defaults.
#[derive(Deserialize, Debug)]
pub struct Engine {
    #[serde(default = "default_init_timeout")]
    pub init_timeout: f64,
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout: f64,
    #[serde(default = "default_data_saving", deserialize_with = "deserialize_data_saving")]
    pub data_saving: DataSaving,
    #[serde(default = "default_log_file_path")]
    pub log_file_path: Option<String>,
    #[serde(default = "default_stats_dump_file_path")]
    pub stats_dump_file_path: Option<String>,
    #[serde(default = "default_true")]
    pub enable_aec: bool,
    #[serde(default = "default_true")]
    pub enable_ns: bool,
    #[serde(default = "default_true")]
    pub enable_agc: bool,

    /// Worker threads for the tokio runtime. Defaults to the host's CPU
    /// count, mirroring `turn_server::config::Turn::threads`.
    #[serde(default = "num_cpus::get")]
    pub threads: usize,
}

fn default_true() -> bool {
    true
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            init_timeout: default_init_timeout(),
            recv_timeout: default_recv_timeout(),
            data_saving: default_data_saving(),
            log_file_path: default_log_file_path(),
            stats_dump_file_path: default_stats_dump_file_path(),
            enable_aec: true,
            enable_ns: true,
            enable_agc: true,
            threads: num_cpus::get(),
        }
    }
}

impl Engine {
    /// Builds the runtime `SessionConfig` this file's values apply to,
    /// starting from the crate's compiled defaults.
    pub fn to_session_config(&self) -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.init_timeout = std::time::Duration::from_secs_f64(self.init_timeout);
        cfg.recv_timeout = std::time::Duration::from_secs_f64(self.recv_timeout);
        cfg.data_saving = self.data_saving;
        cfg.enable_aec = self.enable_aec;
        cfg.enable_ns = self.enable_ns;
        cfg.enable_agc = self.enable_agc;
        cfg
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub log: Log,

    /// The server-config push-down dictionary (§6): layered beneath the
    /// file and CLI values above, above only the compiled defaults.
    #[serde(default)]
    pub server_config: HashMap<String, String>,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Path to a JSON5 configuration file.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Parses CLI flags, reads the config file if `--config` was given,
    /// and falls back to an all-defaults document otherwise.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let raw = match cli.config {
            Some(path) => read_to_string(path)?,
            None => "{}".to_string(),
        };
        Ok(serde_json5::from_str(&raw)?)
    }
}

use anyhow::{Result, anyhow};
use evdev::KeyCode;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;

pub(crate) fn config() -> Result<(Config, PathBuf)> {
    let config_path = match env::args().nth(1) {
        Some(arg_path) => PathBuf::from(arg_path),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("simulkeys")
            .join("config.yml"),
    };

    let config = if !config_path.exists() {
        let config = Config::default();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config_path, config.serialize(&config_path)?)?;
        info!("Default config written to {}", config_path.display());
        config
    } else {
        let config_content = fs::read_to_string(&config_path)?;
        Config::parse(&config_content, &config_path)
            .map_err(|e| anyhow!("Invalid config {}: {e}", config_path.display()))?
    };

    debug!("Config: {:#?}", config);

    Ok((config, config_path))
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

fn default_source_keys() -> Vec<KeyCode> {
    vec![KeyCode::KEY_Q, KeyCode::KEY_X]
}

fn default_target_key() -> KeyCode {
    KeyCode::KEY_S
}

fn default_threshold_ms() -> u64 {
    150
}

fn default_holdoff_us() -> u64 {
    200
}

/// How delayed presses are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BackendKind {
    /// A sleeper thread per pending press.
    #[default]
    Threads,
    /// Input reads and deadline sleeps as tasks on one single-threaded runtime.
    /// Needs a pollable input (pipe, socket, tty).
    Cooperative,
    /// `poll(2)` on stdin with the earliest deadline as timeout.
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Config {
    /// Keys that must all go down within the threshold
    #[serde(default = "default_source_keys")]
    pub source_keys: Vec<KeyCode>,
    /// Key emitted instead of the sources
    #[serde(default = "default_target_key")]
    pub target_key: KeyCode,
    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: u64,
    /// Pause after every synthesized key
    #[serde(default = "default_holdoff_us")]
    pub holdoff_us: u64,
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_keys: default_source_keys(),
            target_key: default_target_key(),
            threshold_ms: default_threshold_ms(),
            holdoff_us: default_holdoff_us(),
            backend: BackendKind::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ConfigError {
    #[error("at least two source keys are required, got {0}")]
    TooFewSources(usize),
    #[error("source key {0:?} is listed more than once")]
    DuplicateSource(KeyCode),
    #[error("target key {0:?} is also a source key")]
    TargetIsSource(KeyCode),
    #[error("threshold must be greater than zero")]
    ZeroThreshold,
}

/// The one remapping rule, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChordRule {
    pub sources: Vec<KeyCode>,
    pub target: KeyCode,
    pub threshold: Duration,
}

impl Config {
    fn parse(content: &str, path: &Path) -> Result<Self> {
        if is_toml(path) {
            Ok(toml::from_str(content)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }

    fn serialize(&self, path: &Path) -> Result<String> {
        if is_toml(path) {
            Ok(toml::to_string(self)?)
        } else {
            Ok(serde_yaml::to_string(self)?)
        }
    }

    pub fn rule(&self) -> Result<ChordRule, ConfigError> {
        if self.source_keys.len() < 2 {
            return Err(ConfigError::TooFewSources(self.source_keys.len()));
        }
        for (i, key) in self.source_keys.iter().enumerate() {
            if self.source_keys[..i].contains(key) {
                return Err(ConfigError::DuplicateSource(*key));
            }
        }
        if self.source_keys.contains(&self.target_key) {
            return Err(ConfigError::TargetIsSource(self.target_key));
        }
        if self.threshold_ms == 0 {
            return Err(ConfigError::ZeroThreshold);
        }

        Ok(ChordRule {
            sources: self.source_keys.clone(),
            target: self.target_key,
            threshold: Duration::from_millis(self.threshold_ms),
        })
    }

    pub fn holdoff(&self) -> Duration {
        Duration::from_micros(self.holdoff_us)
    }
}

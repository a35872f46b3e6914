//! Configuration parsing for the coven daemon.
//!
//! Reads the key=value format from `<workspace>/.coven/config`.
//! Every knob has a default; unknown keys are rejected so typos surface
//! at startup instead of silently running with defaults.

use crate::types::TaskType;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown task type in {key}: {value}")]
    InvalidTaskType { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global cap on concurrently running agent steps.
    pub max_concurrent_agents: usize,
    /// Task source poll interval.
    pub poll_interval_ms: u64,
    /// Event log retention window.
    pub event_retention_hours: u64,
    /// Retention for completed workflows before hard delete.
    pub workflow_retention_hours: u64,
    /// Byte cap on captured step output.
    pub output_capture_bytes: usize,
    /// Ring buffer capacity in lines, per agent.
    pub ring_buffer_lines: usize,
    /// Question detector rolling window in lines.
    pub question_window_lines: usize,
    /// How long a subscriber's queue may stay full before it is dropped.
    pub slow_consumer_timeout_ms: u64,
    /// Running workflows without a checkpoint for this long are stale.
    pub stale_claim_timeout_sec: u64,
    /// Grace between SIGTERM and SIGKILL when stopping a process group.
    pub kill_grace_ms: u64,
    /// Agent binary; override path is the only optional environment knob.
    pub agent_bin: PathBuf,
    /// Extra arguments passed to the agent binary before the spell.
    pub agent_args: Vec<String>,
    /// Directory of user grimoires, relative to the workspace.
    pub grimoires_dir: PathBuf,
    /// Base branch for worktrees; auto-detected when unset.
    pub base_branch: Option<String>,
    /// Default grimoire name when no label or type mapping applies.
    pub grimoire_default: Option<String>,
    /// Task-type to grimoire mapping (`grimoire.bug=fix-bug`).
    pub grimoire_by_type: BTreeMap<TaskType, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 3,
            poll_interval_ms: 2000,
            event_retention_hours: 24,
            workflow_retention_hours: 168,
            output_capture_bytes: 16 * 1024,
            ring_buffer_lines: 2000,
            question_window_lines: 20,
            slow_consumer_timeout_ms: 5000,
            stale_claim_timeout_sec: 300,
            kill_grace_ms: 5000,
            agent_bin: PathBuf::from("claude"),
            agent_args: Vec::new(),
            grimoires_dir: PathBuf::from(".coven/grimoires"),
            base_branch: None,
            grimoire_default: None,
            grimoire_by_type: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load config from the workspace's `.coven/config` if present.
    pub fn load_workspace(workspace: &Path) -> Result<Self, ConfigError> {
        let path = workspace.join(".coven/config");
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply(key, &value)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_concurrent_agents" => {
                self.max_concurrent_agents = Self::parse_int(key, value)? as usize;
            }
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_int(key, value)?,
            "event_retention_hours" => self.event_retention_hours = Self::parse_int(key, value)?,
            "workflow_retention_hours" => {
                self.workflow_retention_hours = Self::parse_int(key, value)?;
            }
            "output_capture_bytes" => {
                self.output_capture_bytes = Self::parse_int(key, value)? as usize;
            }
            "ring_buffer_lines" => self.ring_buffer_lines = Self::parse_int(key, value)? as usize,
            "question_window_lines" => {
                self.question_window_lines = Self::parse_int(key, value)? as usize;
            }
            "slow_consumer_timeout_ms" => {
                self.slow_consumer_timeout_ms = Self::parse_int(key, value)?;
            }
            "stale_claim_timeout_sec" => {
                self.stale_claim_timeout_sec = Self::parse_int(key, value)?;
            }
            "kill_grace_ms" => self.kill_grace_ms = Self::parse_int(key, value)?,
            "agent_bin" => self.agent_bin = PathBuf::from(value),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(ToString::to_string).collect();
            }
            "grimoires_dir" => self.grimoires_dir = PathBuf::from(value),
            "base_branch" => self.base_branch = Some(value.to_string()),
            "grimoire_default" => self.grimoire_default = Some(value.to_string()),
            _ => {
                if let Some(ty) = key.strip_prefix("grimoire.") {
                    let task_type =
                        TaskType::parse(ty).ok_or_else(|| ConfigError::InvalidTaskType {
                            key: key.to_string(),
                            value: ty.to_string(),
                        })?;
                    self.grimoire_by_type.insert(task_type, value.to_string());
                } else {
                    return Err(ConfigError::UnknownKey(key.to_string()));
                }
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Strip one layer of matching quotes.
    fn unquote(value: &str) -> String {
        let bytes = value.as_bytes();
        if bytes.len() >= 2
            && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
        {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        }
    }
}

//! Configuration structures for GenLoop
//!
//! This module defines the node configuration. Configuration is loaded
//! from a YAML file; every tuning knob has a serde default so a minimal
//! file only needs the dispatcher address and identity fields.

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Chat-prompt rendering format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    /// `Role: content` lines with a trailing `Assistant:` cue.
    Plain,

    /// `<|role|>...<|says|>...<|end|>` tagged turns.
    Tagged,
}

/// Output emission discipline. Both express the same contract: newly
/// produced text is emitted exactly once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Buffer decoded fragments, flush past a byte threshold.
    Chunk,

    /// Diff each cumulative decoded snapshot against a watermark.
    Diff,
}

/// Top-level configuration for a GenLoop node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Dispatcher address (host:port)
    pub dispatcher_addr: String,

    /// Node display name advertised at connect time
    pub node_name: String,

    /// Advertised model name; derived from the tokenizer path when empty
    #[serde(default)]
    pub model_name: String,

    /// Bearer token presented at connect time
    pub auth_token: String,

    /// Maximum concurrent tasks this node accepts
    pub max_concurrency: usize,

    /// Path to the tokenizer definition (tokenizer.json)
    pub tokenizer_path: PathBuf,

    /// End-of-sequence token as the tokenizer spells it
    #[serde(default = "default_eos_token")]
    pub eos_token: String,

    /// Model context window in tokens
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,

    /// Tokens held back from the context window as working room
    #[serde(default = "default_reserved_margin")]
    pub reserved_margin: usize,

    /// Pad token id used for batch left-padding
    #[serde(default)]
    pub pad_id: u32,

    /// Prompt rendering format
    #[serde(default = "default_prompt_format")]
    pub prompt_format: PromptFormat,

    /// Output emission discipline
    #[serde(default = "default_stream_mode")]
    pub stream_mode: StreamMode,

    /// Chunk-mode flush threshold in UTF-8 bytes
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Keepalive cadence in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Backoff between reconnect attempts in seconds
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    /// Inbound wait when tasks are active, in milliseconds
    #[serde(default = "default_busy_recv_timeout_ms")]
    pub busy_recv_timeout_ms: u64,

    /// Inbound wait when idle, in milliseconds
    #[serde(default = "default_idle_recv_timeout_ms")]
    pub idle_recv_timeout_ms: u64,

    /// Watchdog report interval in seconds
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

/// Default value functions
fn default_eos_token() -> String {
    "</s>".to_string()
}

fn default_context_limit() -> usize {
    2048
}

fn default_reserved_margin() -> usize {
    50
}

fn default_prompt_format() -> PromptFormat {
    PromptFormat::Plain
}

fn default_stream_mode() -> StreamMode {
    StreamMode::Chunk
}

fn default_flush_threshold() -> usize {
    15
}

fn default_keepalive_secs() -> u64 {
    10
}

fn default_reconnect_backoff_secs() -> u64 {
    10
}

fn default_busy_recv_timeout_ms() -> u64 {
    1
}

fn default_idle_recv_timeout_ms() -> u64 {
    100
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            NodeError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let config: NodeConfig = serde_yaml::from_str(&content).map_err(|e| {
            NodeError::config(format!("failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher_addr.is_empty() {
            return Err(NodeError::config("dispatcher_addr must not be empty"));
        }
        if self.node_name.is_empty() {
            return Err(NodeError::config("node_name must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(NodeError::config("max_concurrency must be at least 1"));
        }
        if self.reserved_margin >= self.context_limit {
            return Err(NodeError::config(format!(
                "reserved_margin {} consumes the whole context window {}",
                self.reserved_margin, self.context_limit
            )));
        }
        Ok(())
    }

    /// Model name advertised at connect time. Falls back to the name of
    /// the directory holding the tokenizer, lowercased, when no name is
    /// configured.
    pub fn advertised_model(&self) -> String {
        if !self.model_name.is_empty() {
            return self.model_name.clone();
        }
        self.tokenizer_path
            .parent()
            .and_then(|p| p.file_name())
            .or_else(|| self.tokenizer_path.file_stem())
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Keepalive cadence as a Duration
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Reconnect backoff as a Duration
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// Bounded inbound wait: short while tasks are active, long when idle
    pub fn recv_timeout(&self, busy: bool) -> Duration {
        if busy {
            Duration::from_millis(self.busy_recv_timeout_ms)
        } else {
            Duration::from_millis(self.idle_recv_timeout_ms)
        }
    }

    /// Watchdog report interval as a Duration
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

//! Run limits and resource tracking.
//!
//! Guards a run through configurable limits on:
//! - Accumulated operation cost (the run's investment)
//! - Input/output sizes of file reads and operation results
//! - Per-operation timeouts
//! - Denylist patterns (to avoid reading or overwriting secrets)

use std::path::Path;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits for a single pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    /// Cost budget in USD (default: 3.0)
    #[serde(default = "default_max_cost_usd")]
    pub max_cost_usd: f64,

    /// Maximum bytes a file read may return (default: 10MB)
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    /// Maximum bytes an operation may return (default: 10MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Timeout for subprocess and completion operations that set none
    /// themselves; falls back to the configured default, then 300s
    #[serde(default)]
    pub step_timeout_seconds: Option<u64>,

    /// Glob patterns file operations refuse to touch
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_cost_usd() -> f64 {
    3.0
}
fn default_max_input_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_output_bytes() -> u64 {
    10 * 1024 * 1024
}
/// Step timeout when neither the pipeline nor the configuration sets one
pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 300;

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_cost_usd: default_max_cost_usd(),
            max_input_bytes: default_max_input_bytes(),
            max_output_bytes: default_max_output_bytes(),
            step_timeout_seconds: None,
            denylist_patterns: default_denylist(),
        }
    }
}

impl RunLimits {
    /// Operation timeout, ignoring configured defaults
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds.unwrap_or(DEFAULT_STEP_TIMEOUT_SECONDS))
    }

    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Refuse denylisted paths
    pub fn validate_path(&self, path: &Path) -> Result<(), LimitViolation> {
        let path_str = path.to_string_lossy();
        if self.is_denylisted(&path_str) {
            return Err(LimitViolation::DenylistMatch {
                path: path_str.to_string(),
            });
        }
        Ok(())
    }

    /// Validate file input against the size limit
    pub fn validate_input(&self, input: &str) -> Result<(), LimitViolation> {
        let size = input.len() as u64;
        if size > self.max_input_bytes {
            return Err(LimitViolation::MaxInputBytes {
                actual: size,
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Validate operation output against the size limit
    pub fn validate_output(&self, output: &str) -> Result<(), LimitViolation> {
        let size = output.len() as u64;
        if size > self.max_output_bytes {
            return Err(LimitViolation::MaxOutputBytes {
                actual: size,
                limit: self.max_output_bytes,
            });
        }
        Ok(())
    }

    /// Check the tracker against the cost budget
    pub fn check_budget(&self, tracker: &RunTracker) -> Result<(), LimitViolation> {
        if tracker.cost_usd >= self.max_cost_usd {
            return Err(LimitViolation::Budget {
                spent_usd: tracker.cost_usd,
                limit_usd: self.max_cost_usd,
            });
        }
        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// Number of stage activations
    pub activations: u32,

    /// Total tokens reported by operations
    pub tokens_used: u64,

    /// Total cost reported by operations
    pub cost_usd: f64,

    /// Total output bytes produced
    pub output_bytes: u64,

    /// When the run started
    pub started_at: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            activations: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            output_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Record one stage activation
    pub fn record_activation(&mut self, output_bytes: u64, tokens: Option<u64>, cost_usd: Option<f64>) {
        self.activations += 1;
        self.output_bytes += output_bytes;
        self.tokens_used += tokens.unwrap_or(0);
        self.cost_usd += cost_usd.unwrap_or(0.0);
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Limit violations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitViolation {
    #[error("Cost budget exhausted: ${spent_usd:.4} >= ${limit_usd:.4}")]
    Budget { spent_usd: f64, limit_usd: f64 },

    #[error("Maximum input bytes exceeded: {actual} > {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },

    #[error("Maximum output bytes exceeded: {actual} > {limit}")]
    MaxOutputBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

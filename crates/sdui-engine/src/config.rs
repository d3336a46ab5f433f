//! Engine configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::apply::{ApplyOptions, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::error::EngineError;
use crate::sync::{ConflictStrategy, ManualScope};

/// Tunables for the engine and its client sessions.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use sdui_engine::{ConflictStrategy, EngineConfig};
///
/// let config = EngineConfig::from_json(r#"{"conflict_strategy": "merge"}"#).unwrap();
/// assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
/// assert_eq!(config.confidence_threshold, 0.5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum selector confidence for auto-apply.
    pub confidence_threshold: f64,
    /// Strategy for instances opened without an explicit one.
    pub conflict_strategy: ConflictStrategy,
    /// What a pending manual conflict blocks.
    pub manual_scope: ManualScope,
    /// Number of recently applied actions kept for conflict detection.
    pub conflict_window: usize,
    /// Per-subscriber queue length before the oldest patches are dropped.
    pub subscriber_capacity: usize,
    /// Per-instance command queue length.
    pub command_capacity: usize,
    pub confirmation_timeout_ms: u64,
    /// How long settled execution records are kept.
    pub execution_retention_ms: u64,
    /// Versions kept per instance by the in-memory store.
    pub store_history: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            conflict_strategy: ConflictStrategy::default(),
            manual_scope: ManualScope::default(),
            conflict_window: 256,
            subscriber_capacity: 64,
            command_capacity: 128,
            confirmation_timeout_ms: 10_000,
            execution_retention_ms: 60_000,
            store_history: 32,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "confidence_threshold must be within 0..=1, got {}",
                self.confidence_threshold
            )));
        }
        for (name, value) in [
            ("conflict_window", self.conflict_window),
            ("subscriber_capacity", self.subscriber_capacity),
            ("command_capacity", self.command_capacity),
        ] {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        self.reconnect.validate()
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            confidence_threshold: self.confidence_threshold,
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_millis(self.execution_retention_ms)
    }
}

/// Exponential backoff with jitter for client reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    /// Cap on the delay before jitter.
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0 disables).
    pub jitter: f64,
    /// Give up after this many consecutive failures; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    fn validate(&self) -> Result<(), EngineError> {
        if self.multiplier < 1.0 {
            return Err(EngineError::InvalidConfig("reconnect.multiplier must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(EngineError::InvalidConfig("reconnect.jitter must be within 0..1".into()));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let base = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let spread = if self.jitter > 0.0 {
            rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((base * (1.0 + spread)).max(0.0).round() as u64)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

//! Runtime configuration.
//!
//! Every field has a default, so an empty (or absent) TOML file yields a
//! working configuration.

use crate::domain::endorsement::EndorsementType;
use crate::error::{EndorseError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub ledger: LedgerSettings,
    pub orchestrator: OrchestratorSettings,
    pub gateway: GatewaySettings,
    pub event_log: EventLogSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| EndorseError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.window_secs == 0 {
            return Err(EndorseError::Config(
                "scheduler.window_secs must be positive".to_string(),
            ));
        }
        if self.orchestrator.max_retries == 0 {
            return Err(EndorseError::Config(
                "orchestrator.max_retries must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.orchestrator.jitter_ratio) {
            return Err(EndorseError::Config(
                "orchestrator.jitter_ratio must be in [0, 1)".to_string(),
            ));
        }
        if self.orchestrator.backoff_cap_secs < self.orchestrator.backoff_base_secs {
            return Err(EndorseError::Config(
                "orchestrator.backoff_cap_secs must not be below backoff_base_secs".to_string(),
            ));
        }
        if self.event_log.partitions == 0 {
            return Err(EndorseError::Config(
                "event_log.partitions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Tumbling window length per employer/insurer pair.
    pub window_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { window_secs: 300 }
    }
}

impl SchedulerSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// How long to try for the advisory lock before going straight to the row lock.
    pub lock_wait_ms: u64,
    pub advisory_ttl_secs: u64,
    /// Bounded wait on the authoritative row lock.
    pub row_lock_timeout_ms: u64,
    pub pricing: PricingTable,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            lock_wait_ms: 50,
            advisory_ttl_secs: 300,
            row_lock_timeout_ms: 2_000,
            pricing: PricingTable::default(),
        }
    }
}

impl LedgerSettings {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn advisory_ttl(&self) -> Duration {
        Duration::from_secs(self.advisory_ttl_secs)
    }

    pub fn row_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.row_lock_timeout_ms)
    }
}

/// Default prices for requests that arrive without a quoted amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingTable {
    pub addition: Option<Decimal>,
    pub deletion: Option<Decimal>,
    pub modification: Option<Decimal>,
}

impl PricingTable {
    pub fn price(&self, kind: EndorsementType) -> Decimal {
        let price = match kind {
            EndorsementType::Addition => self.addition,
            EndorsementType::Deletion => self.deletion,
            EndorsementType::Modification => self.modification,
        };
        price.unwrap_or(Decimal::ZERO).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Insurer attempts before a request is dead-lettered.
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub jitter_ratio: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 300,
            backoff_cap_secs: 3_600,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl GatewaySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogSettings {
    pub partitions: u32,
    /// Records fetched per consumer poll.
    pub poll_batch: usize,
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            partitions: 8,
            poll_batch: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed for development
    #[default]
    Pretty,
    /// Compact single-line
    Compact,
    /// JSON for log shippers
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// An `EnvFilter` directive such as `info` or `endorse=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

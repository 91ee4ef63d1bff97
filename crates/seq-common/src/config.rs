//! Configuration structures for a sequencer session.
//!
//! Supports TOML deserialization with defaults that reproduce the reference
//! three-service layout (10 ms tick, divisors 2/10/15, sequencer on core 1,
//! services split over cores 2 and 3).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Base tick interval of the timer source.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Run length in base ticks. Defaults to the LCM of all divisors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cycles: Option<u64>,

    /// Wall-clock limit after which the run is aborted externally.
    #[serde(
        with = "humantime_serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_runtime: Option<Duration>,

    /// Window within which all services must exit after termination begins.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Real-time scheduling configuration.
    pub realtime: RealtimeConfig,

    /// CPU partitioning rule.
    pub affinity: AffinityRule,

    /// Event sink configuration.
    pub sink: SinkConfig,

    /// Dispatch metrics configuration.
    pub metrics: MetricsConfig,

    /// Services released by the sequencer, in index order.
    pub services: Vec<ServiceConfig>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            total_cycles: None,
            max_runtime: None,
            join_timeout: Duration::from_secs(1),
            realtime: RealtimeConfig::default(),
            affinity: AffinityRule::default(),
            sink: SinkConfig::default(),
            metrics: MetricsConfig::default(),
            services: vec![
                ServiceConfig::every(2).named("S1"),
                ServiceConfig::every(10).named("S2"),
                ServiceConfig::every(15).named("S3"),
            ],
        }
    }
}

/// One periodic service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Display name; defaults to `S<index+1>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Release every `divisor`-th base tick.
    pub divisor: u64,

    /// Worst-case execution time, used only for the utilization report.
    #[serde(
        default,
        with = "humantime_serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub wcet: Option<Duration>,
}

impl ServiceConfig {
    /// A service released every `divisor`-th tick.
    #[must_use]
    pub fn every(divisor: u64) -> Self {
        Self {
            name: None,
            divisor,
            wcet: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the worst-case execution time.
    #[must_use]
    pub fn with_wcet(mut self, wcet: Duration) -> Self {
        self.wcet = Some(wcet);
        self
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply the real-time policy, priorities, and affinities (requires
    /// privileges). When false the plan is computed and logged only.
    pub enabled: bool,

    /// Scheduler policy for the sequencer and all services.
    pub policy: SchedPolicy,

    /// Priority of the sequencer thread; services are placed below it.
    pub sequencer_priority: u8,

    /// Lock all memory pages (mlockall) before arming the timer.
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            sequencer_priority: 99,
            lock_memory: true,
            prefault_stack_size: 256 * 1024,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// `SCHED_FIFO`: first-in-first-out real-time.
    #[default]
    Fifo,
    /// `SCHED_RR`: round-robin real-time.
    Rr,
    /// `SCHED_OTHER`: normal time-sharing (non-RT).
    Other,
}

impl SchedPolicy {
    /// Whether this is a fixed-priority real-time policy.
    #[must_use]
    pub fn is_realtime(self) -> bool {
        !matches!(self, Self::Other)
    }

    /// Valid priority range for the policy on Linux.
    #[must_use]
    pub fn priority_range(self) -> (u8, u8) {
        match self {
            Self::Fifo | Self::Rr => (1, 99),
            Self::Other => (0, 0),
        }
    }
}

/// Rule for partitioning CPU cores between the sequencer and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AffinityRule {
    /// No pinning; the OS migrates threads freely.
    None,
    /// Sequencer on its own core, even-indexed services on one core and
    /// odd-indexed services on another.
    EvenOdd {
        /// Core reserved for the sequencer.
        sequencer_cpu: usize,
        /// Core for services 0, 2, 4, ...
        even_cpu: usize,
        /// Core for services 1, 3, 5, ...
        odd_cpu: usize,
    },
    /// Sequencer on its own core, services assigned round-robin over a list.
    RoundRobin {
        /// Core reserved for the sequencer.
        sequencer_cpu: usize,
        /// Cores shared by the services.
        service_cpus: Vec<usize>,
    },
}

impl Default for AffinityRule {
    fn default() -> Self {
        Self::EvenOdd {
            sequencer_cpu: 1,
            even_cpu: 2,
            odd_cpu: 3,
        }
    }
}

/// Event sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Capacity of the bounded event hand-off channel.
    pub capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Dispatch metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Size of the dispatch-time ring buffer.
    pub histogram_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_size: 10_000,
        }
    }
}

impl SequencerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Period divisors in service index order.
    #[must_use]
    pub fn divisors(&self) -> Vec<u64> {
        self.services.iter().map(|s| s.divisor).collect()
    }

    /// Display name of service `index`.
    #[must_use]
    pub fn service_name(&self, index: usize) -> String {
        self.services
            .get(index)
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| format!("S{}", index + 1))
    }

    /// Check the values that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be non-zero".into()));
        }
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("at least one service is required".into()));
        }
        if let Some((index, _)) = self
            .services
            .iter()
            .enumerate()
            .find(|(_, s)| s.divisor == 0)
        {
            return Err(ConfigError::Invalid(format!(
                "service {index} has a zero divisor"
            )));
        }
        if let Some(total) = self.total_cycles {
            if total == 0 {
                return Err(ConfigError::Invalid("total_cycles must be non-zero".into()));
            }
            if let Some(s) = self.services.iter().find(|s| total % s.divisor != 0) {
                return Err(ConfigError::Invalid(format!(
                    "total_cycles {total} is not a multiple of divisor {}",
                    s.divisor
                )));
            }
        }
        if self.sink.capacity == 0 {
            return Err(ConfigError::Invalid("sink.capacity must be non-zero".into()));
        }
        if self.join_timeout.is_zero() {
            return Err(ConfigError::Invalid("join_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as `humantime_serde` for optional durations.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

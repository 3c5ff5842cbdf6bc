use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::TimeSource;
use crate::producer::guardrail::{DEFAULT_HARD_LIMIT, DEFAULT_SOFT_LIMIT};

/// Smallest accepted bucket size.
pub const MIN_BUCKET: Duration = Duration::from_millis(1);

/// Top-level configuration for the tallyd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    /// Overridden by `--log-level`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Run-loop tick driving bucket boundaries. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Clock the daemon reads "now" from. Default: boottime.
    #[serde(default)]
    pub time_source: TimeSource,

    /// Record input configuration.
    #[serde(default)]
    pub input: InputConfig,

    /// Pull request and report output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Periodic report configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Value metrics to aggregate.
    #[serde(default)]
    pub metrics: Vec<ValueMetricConfig>,
}

/// Record input configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// File to read JSON-lines records from, or "-" for stdin. Default: "-".
    #[serde(default = "default_stdio_path")]
    pub path: String,

    /// Capacity of the channel between the reader task and the run loop.
    /// Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// File to append JSON-lines records to, or "-" for stdout. Default: "-".
    #[serde(default = "default_stdio_path")]
    pub path: String,
}

/// Periodic report configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
    /// Dump every producer at this interval. Zero disables periodic
    /// reports; dumps then only happen on request and at shutdown.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /dump. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// A single value metric.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueMetricConfig {
    /// Metric id, unique within the config.
    pub id: i64,

    /// Human-readable name used in reports and labels. Default: the id.
    #[serde(default)]
    pub name: String,

    /// Bucket size. Default: 1h.
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,

    /// Counter source to pull. Absent for push metrics.
    #[serde(default)]
    pub pull_tag: Option<String>,

    /// Event field holding the numeric value.
    pub value_field: String,

    /// Event fields making up the dimension key, in order.
    #[serde(default)]
    pub dimensions: Vec<String>,

    /// Name of the gating condition. Absent means always true.
    #[serde(default)]
    pub condition: Option<String>,

    /// Dimension count limits.
    #[serde(default)]
    pub guardrail: GuardrailConfig,
}

/// Dimension count limits for one metric.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GuardrailConfig {
    /// Tracked-key count that triggers a warning. Default: 300.
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,

    /// Maximum tracked keys; new keys beyond it are dropped. Default: 500.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_stdio_path() -> String {
    "-".to_string()
}

fn default_channel_capacity() -> usize {
    65_536
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_bucket() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_soft_limit() -> usize {
    DEFAULT_SOFT_LIMIT
}

fn default_hard_limit() -> usize {
    DEFAULT_HARD_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tick_interval: default_tick_interval(),
            time_source: TimeSource::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            report: ReportConfig::default(),
            health: HealthConfig::default(),
            metrics: Vec::new(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: default_stdio_path(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_stdio_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
        }
    }
}

impl ValueMetricConfig {
    /// Name used in reports and metric labels.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    pub fn is_pulled(&self) -> bool {
        self.pull_tag.is_some()
    }

    /// Validate a single metric definition.
    pub fn validate(&self) -> Result<()> {
        let id = self.id;

        if self.bucket < MIN_BUCKET {
            bail!("metric {id}: bucket must be at least {MIN_BUCKET:?}");
        }

        if u64::try_from(self.bucket.as_nanos()).is_err() {
            bail!("metric {id}: bucket {:?} is too large", self.bucket);
        }

        if self.value_field.is_empty() {
            bail!("metric {id}: value_field is required");
        }

        if matches!(&self.pull_tag, Some(tag) if tag.is_empty()) {
            bail!("metric {id}: pull_tag must not be empty when set");
        }

        if matches!(&self.condition, Some(c) if c.is_empty()) {
            bail!("metric {id}: condition must not be empty when set");
        }

        if self.guardrail.hard_limit == 0 {
            bail!("metric {id}: guardrail.hard_limit must be positive");
        }

        if self.guardrail.soft_limit > self.guardrail.hard_limit {
            bail!(
                "metric {id}: guardrail.soft_limit {} exceeds hard_limit {}",
                self.guardrail.soft_limit,
                self.guardrail.hard_limit,
            );
        }

        let mut seen = HashSet::with_capacity(self.dimensions.len());
        for field in &self.dimensions {
            if field.is_empty() {
                bail!("metric {id}: dimension field names must not be empty");
            }
            if !seen.insert(field.as_str()) {
                bail!("metric {id}: duplicate dimension field {field:?}");
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick_interval must be positive");
        }

        if self.input.channel_capacity == 0 {
            bail!("input.channel_capacity must be positive");
        }

        if self.input.path.is_empty() {
            bail!("input.path is required (use \"-\" for stdin)");
        }

        if self.output.path.is_empty() {
            bail!("output.path is required (use \"-\" for stdout)");
        }

        if self.metrics.is_empty() {
            bail!("at least one metric is required");
        }

        let mut ids = HashSet::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            if !ids.insert(metric.id) {
                bail!("duplicate metric id {}", metric.id);
            }
            metric.validate()?;
        }

        Ok(())
    }
}

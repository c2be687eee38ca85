use anyhow::{anyhow, Context, Result};
use keel_core::TopicSpec;
use keel_placement::PlacementStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// configuration settings loaded from the config file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Scheduling loop and placement settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Dispatch worker pool settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Fleet roles and their rollout versions
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    /// Static topic catalog, used when running standalone
    #[serde(default)]
    pub topics: Vec<TopicSpec>,
    /// Prometheus exporter address (host:port)
    #[serde(default)]
    pub prometheus: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between two scheduling ticks (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Placement strategy (flatten or vertical)
    #[serde(default)]
    pub strategy: PlacementStrategy,
    /// Fraction of the expected brokers that must be alive before a fleet receives work
    #[serde(default = "default_health_gate_threshold")]
    pub health_gate_threshold: f64,
    /// A broker silent for longer than this is considered dead (seconds)
    #[serde(default = "default_unknown_timeout_seconds")]
    pub unknown_timeout_seconds: u64,
    /// A dead broker is forgotten after this long (seconds)
    #[serde(default = "default_reclaim_timeout_seconds")]
    pub reclaim_timeout_seconds: u64,
    /// Lifetime of operator drain / load-shift overrides (seconds)
    #[serde(default = "default_override_ttl_seconds")]
    pub operator_override_ttl_seconds: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_health_gate_threshold() -> f64 {
    0.8
}

fn default_unknown_timeout_seconds() -> u64 {
    30
}

fn default_reclaim_timeout_seconds() -> u64 {
    600
}

fn default_override_ttl_seconds() -> u64 {
    900
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            strategy: PlacementStrategy::default(),
            health_gate_threshold: default_health_gate_threshold(),
            unknown_timeout_seconds: default_unknown_timeout_seconds(),
            reclaim_timeout_seconds: default_reclaim_timeout_seconds(),
            operator_override_ttl_seconds: default_override_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Max payloads in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-payload acknowledgement timeout (milliseconds)
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_concurrency() -> usize {
    16
}

fn default_dispatch_timeout_ms() -> u64 {
    5000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

/// Rollout settings of a fleet role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    /// Version the fleet currently runs
    pub current_version: String,
    /// Version the fleet should move to; equal to current (or absent) when stable
    #[serde(default)]
    pub target_version: Option<String>,
    /// version -> number of brokers expected to run it
    #[serde(default)]
    pub expected_brokers: BTreeMap<String, u32>,
}

/// Validated scheduler configuration
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    pub tick_interval: Duration,
    pub strategy: PlacementStrategy,
    pub health_gate_threshold: f64,
    pub unknown_timeout: Duration,
    pub reclaim_timeout: Duration,
    pub override_ttl: Duration,
    pub dispatch_concurrency: usize,
    pub dispatch_timeout: Duration,
    pub roles: Vec<RoleConfig>,
    pub topics: Vec<TopicSpec>,
    pub prom_exporter: Option<SocketAddr>,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let dispatch = DispatchConfig::default();
        Self {
            tick_interval: Duration::from_millis(scheduler.tick_interval_ms),
            strategy: scheduler.strategy,
            health_gate_threshold: scheduler.health_gate_threshold,
            unknown_timeout: Duration::from_secs(scheduler.unknown_timeout_seconds),
            reclaim_timeout: Duration::from_secs(scheduler.reclaim_timeout_seconds),
            override_ttl: Duration::from_secs(scheduler.operator_override_ttl_seconds),
            dispatch_concurrency: dispatch.concurrency,
            dispatch_timeout: Duration::from_millis(dispatch.timeout_ms),
            roles: Vec::new(),
            topics: Vec::new(),
            prom_exporter: None,
        }
    }
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let scheduler = config.scheduler;

        let threshold = scheduler.health_gate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "health_gate_threshold must be within (0, 1], got {}",
                threshold
            ));
        }
        if scheduler.tick_interval_ms == 0 {
            return Err(anyhow!("tick_interval_ms must be positive"));
        }
        if config.dispatch.concurrency == 0 {
            return Err(anyhow!("dispatch concurrency must be positive"));
        }
        if let PlacementStrategy::Vertical(layout) = &scheduler.strategy {
            if let Some((group, _)) = layout.group_sizes.iter().find(|(_, size)| **size == 0) {
                return Err(anyhow!("vertical group {} has a zero broker count", group));
            }
        }
        for role in &config.roles {
            if role.name.is_empty() || role.current_version.is_empty() {
                return Err(anyhow!("every role needs a name and a current_version"));
            }
        }
        for topic in &config.topics {
            topic
                .validate()
                .with_context(|| format!("invalid topic in configuration: {}", topic.name))?;
        }

        let prom_exporter: Option<SocketAddr> = match config.prometheus {
            Some(addr) => Some(
                addr.parse()
                    .context(format!("Failed to parse into Socket address: {}", addr))?,
            ),
            None => None,
        };

        Ok(ServiceConfiguration {
            tick_interval: Duration::from_millis(scheduler.tick_interval_ms),
            strategy: scheduler.strategy,
            health_gate_threshold: threshold,
            unknown_timeout: Duration::from_secs(scheduler.unknown_timeout_seconds),
            reclaim_timeout: Duration::from_secs(scheduler.reclaim_timeout_seconds),
            override_ttl: Duration::from_secs(scheduler.operator_override_ttl_seconds),
            dispatch_concurrency: config.dispatch.concurrency,
            dispatch_timeout: Duration::from_millis(config.dispatch.timeout_ms),
            roles: config.roles,
            topics: config.topics,
            prom_exporter,
        })
    }
}

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 6] = [
    SCHEDULER_TICKS_TOTAL,
    SCHEDULER_SKIPPED_ROLES_TOTAL,
    DISPATCH_TOTAL,
    DISPATCH_FAILURES_TOTAL,
    BROKERS_RECLAIMED_TOTAL,
    ROLLOUT_SWITCHES_TOTAL,
];
pub(crate) const GAUGES: [Metric; 2] = [PARTITIONS_WAITING, BROKERS_ALIVE];
pub(crate) const HISTOGRAMS: [Metric; 1] = [SCHEDULER_TICK_DURATION_SECONDS];

// SCHEDULER Metrics --------------------------

pub(crate) const SCHEDULER_TICKS_TOTAL: Metric = Metric {
    name: "keel_scheduler_ticks_total",
    description: "Total number of scheduling ticks executed",
};

pub(crate) const SCHEDULER_SKIPPED_ROLES_TOTAL: Metric = Metric {
    name: "keel_scheduler_skipped_roles_total",
    description: "Number of times a fleet role was left untouched because no subset passed the health gate",
};

pub(crate) const SCHEDULER_TICK_DURATION_SECONDS: Metric = Metric {
    name: "keel_scheduler_tick_duration_seconds",
    description: "Duration of a full scheduling tick in seconds",
};

// PLACEMENT Metrics --------------------------

pub(crate) const PARTITIONS_WAITING: Metric = Metric {
    name: "keel_partitions_waiting",
    description: "Number of partitions without a target broker after the last tick",
};

pub(crate) const BROKERS_ALIVE: Metric = Metric {
    name: "keel_brokers_alive",
    description: "Number of brokers considered alive in the last tick",
};

pub(crate) const BROKERS_RECLAIMED_TOTAL: Metric = Metric {
    name: "keel_brokers_reclaimed_total",
    description: "Total number of dead brokers forgotten by the scheduler",
};

// DISPATCH Metrics --------------------------

pub(crate) const DISPATCH_TOTAL: Metric = Metric {
    name: "keel_dispatch_total",
    description: "Total number of payloads acknowledged by brokers",
};

pub(crate) const DISPATCH_FAILURES_TOTAL: Metric = Metric {
    name: "keel_dispatch_failures_total",
    description: "Total number of payloads that failed or timed out",
};

// ROLLOUT Metrics --------------------------

pub(crate) const ROLLOUT_SWITCHES_TOTAL: Metric = Metric {
    name: "keel_rollout_switches_total",
    description: "Total number of completed version switches",
};

/// Installs the Prometheus recorder (when an address is given) and registers every metric.
pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>) -> Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    for name in COUNTERS {
        register_counter(name)
    }

    for name in GAUGES {
        register_gauge(name)
    }

    for name in HISTOGRAMS {
        register_histogram(name)
    }
    Ok(())
}

fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}

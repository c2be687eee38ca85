#![allow(dead_code)]

use keel_core::{BrokerReport, DispatchPayload, MemoryCatalog, MemorySink, TopicSpec};
use keel_scheduler::{
    HeartbeatTable, OperatorCommands, RolloutCoordinator, ServiceConfiguration, TickReport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A coordinator wired to in-memory collaborators, with a manual clock.
pub struct Harness {
    pub coordinator: RolloutCoordinator,
    pub catalog: MemoryCatalog,
    pub sink: MemorySink,
    pub heartbeats: HeartbeatTable,
    pub operator: OperatorCommands,
    pub now: Instant,
}

pub fn harness(config: ServiceConfiguration, topics: Vec<TopicSpec>) -> Harness {
    let catalog = MemoryCatalog::with_topics(topics);
    let sink = MemorySink::new();
    let heartbeats = HeartbeatTable::new();
    let operator = OperatorCommands::new();
    let coordinator = RolloutCoordinator::new(
        config,
        Arc::new(catalog.clone()),
        Arc::new(sink.clone()),
        heartbeats.clone(),
        operator.clone(),
    );
    Harness {
        coordinator,
        catalog,
        sink,
        heartbeats,
        operator,
        now: Instant::now(),
    }
}

impl Harness {
    /// Records heartbeats as received at the current clock.
    pub async fn beat(&self, reports: Vec<BrokerReport>) {
        for report in reports {
            self.heartbeats.record_at(report, self.now).await;
        }
    }

    /// Runs a tick, then moves the clock forward by one second.
    pub async fn tick(&mut self) -> TickReport {
        let report = self.coordinator.tick(self.now).await;
        self.now += Duration::from_secs(1);
        report
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn last_payload(&self, broker: &str) -> Option<DispatchPayload> {
        self.sink.last_payload(&address(broker))
    }

    pub fn dispatch_count(&self, broker: &str) -> usize {
        self.sink.dispatch_count(&address(broker))
    }
}

pub fn address(broker: &str) -> String {
    format!("{}:6650", broker)
}

pub fn broker(name: &str, version: &str, capacity: u64) -> BrokerReport {
    BrokerReport::new(name, address(name), version, capacity).with_session(format!("{}-s1", name))
}

/// The report of a broker that loaded and now serves everything in its last payload.
pub fn confirming(report: BrokerReport, payload: Option<DispatchPayload>) -> BrokerReport {
    let Some(payload) = payload else {
        return report;
    };
    payload
        .tasks
        .iter()
        .fold(report, |report, task| report.serving(task.topic.clone(), task.partition))
}

pub fn task_names(payload: &DispatchPayload) -> Vec<String> {
    payload
        .tasks
        .iter()
        .map(|t| format!("{}#{}", t.topic, t.partition))
        .collect()
}

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::dispatch::{DispatchPayload, DispatchSink, TopicCatalog};
use crate::errors::{KeelError, Result};
use crate::topic::{PartitionTransition, TopicSpec};

/// MemoryCatalog is an in-memory topic catalog.
/// Used by tests and by the standalone scheduler binary.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    topics: Arc<DashMap<String, TopicSpec>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog::default()
    }

    pub fn with_topics(topics: impl IntoIterator<Item = TopicSpec>) -> Self {
        let catalog = MemoryCatalog::new();
        for topic in topics {
            catalog.put(topic);
        }
        catalog
    }

    pub fn put(&self, topic: TopicSpec) {
        self.topics.insert(topic.name.clone(), topic);
    }

    pub fn remove(&self, name: &str) {
        self.topics.remove(name);
    }

    /// Makes `topics()` fail, as a catalog outage would.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopicCatalog for MemoryCatalog {
    async fn topics(&self) -> Result<Vec<TopicSpec>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeelError::Catalog("catalog unavailable".to_string()));
        }
        let mut topics: Vec<TopicSpec> = self.topics.iter().map(|e| e.value().clone()).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }
}

/// MemorySink records everything handed to it.
/// SHOULD BE USED ONLY FOR TESTING PURPOSES
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    // broker address -> payloads in delivery order
    payloads: Arc<DashMap<String, Vec<DispatchPayload>>>,
    transitions: Arc<Mutex<Vec<PartitionTransition>>>,
    rollouts: Arc<DashMap<String, String>>,
    unreachable: Arc<DashSet<String>>,
    reject_transitions: Arc<AtomicBool>,
    reject_rollouts: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Makes every dispatch to `address` fail until `set_reachable` is called.
    pub fn set_unreachable(&self, address: &str) {
        self.unreachable.insert(address.to_string());
    }

    pub fn set_reachable(&self, address: &str) {
        self.unreachable.remove(address);
    }

    /// Makes `publish_transitions` fail while set.
    pub fn reject_transitions(&self, reject: bool) {
        self.reject_transitions.store(reject, Ordering::SeqCst);
    }

    /// Makes `persist_rollout` fail while set.
    pub fn reject_rollouts(&self, reject: bool) {
        self.reject_rollouts.store(reject, Ordering::SeqCst);
    }

    pub fn last_payload(&self, address: &str) -> Option<DispatchPayload> {
        self.payloads
            .get(address)
            .and_then(|history| history.last().cloned())
    }

    pub fn dispatch_count(&self, address: &str) -> usize {
        self.payloads.get(address).map(|h| h.len()).unwrap_or(0)
    }

    pub async fn transitions(&self) -> Vec<PartitionTransition> {
        self.transitions.lock().await.clone()
    }

    pub fn rollout(&self, role: &str) -> Option<String> {
        self.rollouts.get(role).map(|v| v.value().clone())
    }
}

#[async_trait]
impl DispatchSink for MemorySink {
    async fn dispatch(&self, payload: DispatchPayload) -> Result<()> {
        if self.unreachable.contains(&payload.broker_address) {
            return Err(KeelError::Unreachable(payload.broker_address));
        }
        self.payloads
            .entry(payload.broker_address.clone())
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn publish_transitions(&self, transitions: Vec<PartitionTransition>) -> Result<()> {
        if self.reject_transitions.load(Ordering::SeqCst) {
            return Err(KeelError::Sink(format!(
                "rejected {} partition transitions",
                transitions.len()
            )));
        }
        self.transitions.lock().await.extend(transitions);
        Ok(())
    }

    async fn persist_rollout(&self, role: &str, version: &str) -> Result<()> {
        if self.reject_rollouts.load(Ordering::SeqCst) {
            return Err(KeelError::Sink(format!(
                "rejected rollout of role {} to {}",
                role, version
            )));
        }
        self.rollouts.insert(role.to_string(), version.to_string());
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{KeelError, Result};

/// Fleet role used when a topic does not name one.
pub const DEFAULT_ROLE: &str = "default";

/// Size of the key space partitions split between them (`u32` hash slots).
const KEY_SPACE: u64 = 1 << 32;

// TopicSpec is the catalog snapshot of a topic, refreshed every scheduling tick.
//
// The scheduler never creates or deletes topics, it only places the partitions
// of whatever the catalog currently holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSpec {
    /// Unique topic name
    pub name: String,
    /// Number of partitions (placement units)
    pub partition_count: u32,
    /// Resource units consumed by one partition on its broker
    pub resource_cost: u64,
    /// Maximum number of this topic's partitions a single broker may own
    pub partition_limit: u32,
    /// Broker group the partitions are pinned to
    #[serde(default)]
    pub group: Option<String>,
    /// Fleet role serving the topic
    #[serde(default = "default_role")]
    pub role: String,
    /// Topic configuration version forwarded to brokers
    #[serde(default)]
    pub version: u64,
    /// Opaque build parameters forwarded verbatim to brokers
    #[serde(default)]
    pub build_params: BTreeMap<String, String>,
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partition_count: u32, resource_cost: u64, partition_limit: u32) -> Self {
        TopicSpec {
            name: name.into(),
            partition_count,
            resource_cost,
            partition_limit,
            group: None,
            role: default_role(),
            version: 0,
            build_params: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// The group tag as seen by the ledger, empty when the topic is not pinned.
    pub fn group_tag(&self) -> &str {
        self.group.as_deref().unwrap_or("")
    }

    /// Aggregate resource demand of the whole topic.
    pub fn total_demand(&self) -> u64 {
        u64::from(self.partition_count).saturating_mul(self.resource_cost)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KeelError::InvalidTopic("empty topic name".to_string()));
        }
        if self.partition_count == 0 {
            return Err(KeelError::InvalidTopic(format!(
                "topic {} has no partitions",
                self.name
            )));
        }
        if self.partition_limit == 0 {
            return Err(KeelError::InvalidTopic(format!(
                "topic {} has a zero partition limit",
                self.name
            )));
        }
        Ok(())
    }
}

/// Identifies one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub topic: String,
    pub partition: u32,
}

impl TaskKey {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        TaskKey {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.partition)
    }
}

/// Half-open hash slot range `[start, end)` served by a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: u64,
    pub end: u64,
}

impl PartitionRange {
    /// Cuts the key space into `count` contiguous ranges and returns the `index`-th one.
    pub fn for_partition(index: u32, count: u32) -> Self {
        let count = u64::from(count.max(1));
        let index = u64::from(index).min(count - 1);
        PartitionRange {
            start: index * KEY_SPACE / count,
            end: (index + 1) * KEY_SPACE / count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    /// No broker could take the partition this tick
    Waiting,
    /// Target chosen, withheld until the previous owner unloads it
    Migrating,
    /// Target dispatched, not yet confirmed by the broker
    Loading,
    /// Target broker reports serving the partition
    Serving,
}

impl Default for PartitionStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionStatus::Waiting => "waiting",
            PartitionStatus::Migrating => "migrating",
            PartitionStatus::Loading => "loading",
            PartitionStatus::Serving => "serving",
        };
        f.write_str(s)
    }
}

/// Status change of a single partition, persisted by the dispatch sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTransition {
    pub topic: String,
    pub partition: u32,
    pub status: PartitionStatus,
    pub target_broker: Option<String>,
}

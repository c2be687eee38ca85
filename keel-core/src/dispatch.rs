use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::broker::{FencingToken, SessionId};
use crate::errors::Result;
use crate::topic::{PartitionRange, PartitionTransition, TopicSpec};

/// One partition a broker is instructed to own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub topic: String,
    pub partition: u32,
    pub range: PartitionRange,
    pub topic_version: u64,
    pub fencing_token: Option<FencingToken>,
    pub build_params: BTreeMap<String, String>,
}

/// The complete target set of a broker; an empty task list means "drain".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub broker_address: String,
    pub session_id: SessionId,
    pub tasks: Vec<DispatchTask>,
}

impl DispatchPayload {
    pub fn is_drain(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Source of the persisted topic metadata.
#[async_trait]
pub trait TopicCatalog: Send + Sync + 'static {
    async fn topics(&self) -> Result<Vec<TopicSpec>>;
}

/// Receiver of everything the scheduler decides.
#[async_trait]
pub trait DispatchSink: Send + Sync + 'static {
    /// Delivers a broker's full target set. `Unreachable` means retry next tick.
    async fn dispatch(&self, payload: DispatchPayload) -> Result<()>;

    /// Persists partition status changes.
    async fn publish_transitions(&self, transitions: Vec<PartitionTransition>) -> Result<()>;

    /// Persists a completed version flip of a fleet role.
    async fn persist_rollout(&self, role: &str, version: &str) -> Result<()>;
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topic::TaskKey;

/// Opaque ownership token ("inline version") minted by brokers.
///
/// The scheduler copies and compares it, it never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(String);

impl FencingToken {
    pub fn new(token: impl Into<String>) -> Self {
        FencingToken(token.into())
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque broker process session, changes whenever the broker restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(session: impl Into<String>) -> Self {
        SessionId(session.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a task as reported by the broker holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Loading,
    Serving,
    Unloading,
}

impl TaskState {
    /// Whether the broker stands behind the task (as opposed to letting it go).
    pub fn confirms_ownership(&self) -> bool {
        matches!(self, TaskState::Loading | TaskState::Serving)
    }
}

/// One entry of a broker's self-reported current task set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedTask {
    pub topic: String,
    pub partition: u32,
    pub state: TaskState,
    pub session_id: SessionId,
    pub fencing_token: FencingToken,
}

impl ReportedTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.topic.clone(), self.partition)
    }
}

// BrokerReport is the heartbeat payload a broker sends to the scheduler.
//
// The broker name doubles as its placement identity: for vertical placement it
// encodes `<group>##<ordinal>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerReport {
    /// Unique broker (role) name
    pub name: String,
    /// Address payloads are dispatched to
    pub address: String,
    /// Fleet role the broker belongs to
    #[serde(default = "default_role")]
    pub role: String,
    /// Configuration version the broker runs
    pub version: String,
    /// Resource units the broker can hold
    pub capacity: u64,
    /// Broker's own view of its health
    #[serde(default = "default_alive")]
    pub alive: bool,
    /// Current process session
    #[serde(default)]
    pub session_id: SessionId,
    /// Tasks the broker currently holds
    #[serde(default)]
    pub tasks: Vec<ReportedTask>,
}

fn default_role() -> String {
    crate::topic::DEFAULT_ROLE.to_string()
}

fn default_alive() -> bool {
    true
}

impl BrokerReport {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        version: impl Into<String>,
        capacity: u64,
    ) -> Self {
        BrokerReport {
            name: name.into(),
            address: address.into(),
            role: default_role(),
            version: version.into(),
            capacity,
            alive: true,
            session_id: SessionId::default(),
            tasks: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_id = SessionId::new(session);
        self
    }

    /// Adds a serving task with a token derived from the session.
    pub fn serving(mut self, topic: impl Into<String>, partition: u32) -> Self {
        let topic = topic.into();
        let fencing_token = FencingToken::new(format!("{}:{}:{}", self.session_id, topic, partition));
        self.tasks.push(ReportedTask {
            topic,
            partition,
            state: TaskState::Serving,
            session_id: self.session_id.clone(),
            fencing_token,
        });
        self
    }
}

//! # Keel Core
//!
//! Shared vocabulary of the Keel partition scheduler.
//!
//! - **Topics**: catalog snapshots, partition hash ranges and partition statuses
//! - **Brokers**: heartbeat reports and the tasks a broker claims to own
//! - **Dispatch**: per-broker payloads and partition status transitions
//! - **Collaborators**: the `TopicCatalog` and `DispatchSink` seams to the outside world

mod errors;
pub use errors::{KeelError, Result};

mod topic;
pub use topic::{PartitionRange, PartitionStatus, PartitionTransition, TaskKey, TopicSpec, DEFAULT_ROLE};

mod broker;
pub use broker::{BrokerReport, FencingToken, ReportedTask, SessionId, TaskState};

mod dispatch;
pub use dispatch::{DispatchPayload, DispatchSink, DispatchTask, TopicCatalog};

mod memory;
pub use memory::{MemoryCatalog, MemorySink};

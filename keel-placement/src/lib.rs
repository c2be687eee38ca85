//! # Keel Placement
//!
//! Decides which broker owns which topic partition for one scheduling tick.
//!
//! ## Building Blocks
//!
//! - **`ResourceLedger`**: per-broker capacity accounting (free resource, target and
//!   current task sets, liveness) with brokers ordered by free resource
//! - **`TopicTable`**: per-topic demand and per-partition placement records
//! - **`PlacementEngine`**: pure `(topics, brokers) -> PlacementPlan` function with two
//!   strategies, `Flatten` (greedy bin packing) and `Vertical` (modulo placement in
//!   fixed-size broker groups)
//!
//! Nothing in this crate performs I/O; callers feed it snapshots and act on the plan.

pub mod demand;
pub mod engine;
pub mod ledger;

#[cfg(test)]
pub(crate) mod test_support;

pub use demand::{PartitionSlot, SyncSummary, TopicDemand, TopicTable};
pub use engine::{Phase, PlacementEngine, PlacementPlan, PlacementStrategy, VerticalLayout};
pub use ledger::{parse_role_name, BrokerLedger, ResourceLedger, GROUP_SEPARATOR};

//! # Keel Scheduler
//!
//! Keeps every topic partition of a broker fleet placed on a live broker, across
//! broker failures and fleet version rollouts.
//!
//! The `RolloutCoordinator` owns the scheduler state and runs one tick at a time:
//! heartbeats and operator commands are collected concurrently, placement runs per
//! fleet role behind a health gate, and the resulting target sets are handed to a
//! `DispatchSink` by a bounded pool of concurrent deliveries.

pub mod config;
pub mod coordinator;
mod dispatch;
pub mod heartbeat;
pub mod operator;
pub mod rollout;
pub mod scheduler_metrics;
pub mod service;

pub use config::{LoadConfiguration, RoleConfig, ServiceConfiguration};
pub use coordinator::{RolloutCoordinator, SchedulerState, TickReport};
pub use heartbeat::{json_lines, spawn_ingestion, Heartbeat, HeartbeatTable};
pub use operator::{OperatorCommand, OperatorCommands};
pub use rollout::{health_gate, FleetDecision, RoleRollout, RolloutPhase};
pub use service::spawn_scheduler;

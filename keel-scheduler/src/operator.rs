use keel_placement::BrokerLedger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

/// Manual capacity overrides an operator can issue while the scheduler runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Zero the effective capacity of every broker of a group
    DrainGroup { group: String },
    /// Withhold `ratio` (0.0 - 1.0) of a broker's capacity
    ShiftLoad { broker: String, ratio: f64 },
}

/// Inbox of operator commands, drained at the start of each tick.
#[derive(Debug, Clone, Default)]
pub struct OperatorCommands {
    inbox: Arc<Mutex<Vec<OperatorCommand>>>,
}

impl OperatorCommands {
    pub fn new() -> Self {
        OperatorCommands::default()
    }

    pub async fn submit(&self, command: OperatorCommand) {
        self.inbox.lock().await.push(command);
    }

    pub(crate) async fn take(&self) -> Vec<OperatorCommand> {
        std::mem::take(&mut *self.inbox.lock().await)
    }
}

/// Overrides currently in force, each with its own expiry.
#[derive(Debug, Default)]
pub(crate) struct ActiveOverrides {
    // expiry per override, None when the ttl runs past what Instant can hold
    drained_groups: HashMap<String, Option<Instant>>,
    load_shift: HashMap<String, (f64, Option<Instant>)>,
}

impl ActiveOverrides {
    /// Applies new commands; a repeated command refreshes the expiry.
    pub(crate) fn absorb(&mut self, commands: Vec<OperatorCommand>, now: Instant, ttl: Duration) {
        let expires_at = now.checked_add(ttl);
        for command in commands {
            info!(command = ?command, ttl_secs = ttl.as_secs(), "operator override accepted");
            match command {
                OperatorCommand::DrainGroup { group } => {
                    self.drained_groups.insert(group, expires_at);
                }
                OperatorCommand::ShiftLoad { broker, ratio } => {
                    self.load_shift
                        .insert(broker, (ratio.clamp(0.0, 1.0), expires_at));
                }
            }
        }
    }

    pub(crate) fn expire(&mut self, now: Instant) {
        self.drained_groups.retain(|group, expires_at| {
            let keep = expires_at.map_or(true, |at| at > now);
            if !keep {
                info!(group = %group, "drain override expired");
            }
            keep
        });
        self.load_shift.retain(|broker, (_, expires_at)| {
            let keep = expires_at.map_or(true, |at| at > now);
            if !keep {
                info!(broker = %broker, "load shift override expired");
            }
            keep
        });
    }

    pub(crate) fn apply(&self, broker: &mut BrokerLedger) {
        let drained = broker
            .group()
            .map(|group| self.drained_groups.contains_key(group))
            .unwrap_or(false);
        let shift = self
            .load_shift
            .get(broker.name())
            .map(|(ratio, _)| *ratio)
            .unwrap_or(0.0);
        broker.set_capacity_override(shift, drained);
    }
}

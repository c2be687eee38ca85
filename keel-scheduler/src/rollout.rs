use std::collections::{BTreeMap, HashMap};

use crate::config::RoleConfig;

/// Whether a fleet role is moving between configuration versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutPhase {
    Stable,
    Switching,
}

/// Rollout bookkeeping of one fleet role.
///
/// A role without configuration is unversioned: every broker of the role is
/// eligible and it never switches.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRollout {
    name: String,
    current_version: Option<String>,
    target_version: Option<String>,
    expected: BTreeMap<String, u32>,
    switch_ready: bool,
}

/// What the coordinator does with a role in the current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetDecision {
    /// Place the topics on the brokers running `version` (`None`: any version).
    Place { version: Option<String> },
    /// Drain `from`, place on `to`.
    Switch { from: String, to: String },
    /// No subset passed the gate; leave the role untouched.
    Skip,
}

/// A subset is eligible when `actual >= expected * threshold`.
///
/// Without an expected count a subset needs at least one live broker.
pub fn health_gate(expected: u32, actual: usize, threshold: f64) -> bool {
    if expected == 0 {
        return actual > 0;
    }
    // smallest broker count meeting the threshold, tolerant of f64 rounding
    let required = (f64::from(expected) * threshold - 1e-9).ceil();
    actual as f64 >= required
}

impl RoleRollout {
    pub fn from_config(config: &RoleConfig) -> Self {
        RoleRollout {
            name: config.name.clone(),
            current_version: Some(config.current_version.clone()),
            target_version: config.target_version.clone(),
            expected: config.expected_brokers.clone(),
            switch_ready: false,
        }
    }

    pub fn unversioned(name: impl Into<String>) -> Self {
        RoleRollout {
            name: name.into(),
            current_version: None,
            target_version: None,
            expected: BTreeMap::new(),
            switch_ready: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    pub fn target_version(&self) -> Option<&str> {
        self.target_version.as_deref()
    }

    pub fn expected_for(&self, version: &str) -> u32 {
        self.expected.get(version).copied().unwrap_or(0)
    }

    pub fn phase(&self) -> RolloutPhase {
        match (&self.current_version, &self.target_version) {
            (Some(current), Some(target)) if current != target => RolloutPhase::Switching,
            _ => RolloutPhase::Stable,
        }
    }

    /// Whether a broker running `version` belongs to the subset of `version`.
    pub fn matches(subset: Option<&str>, version: &str) -> bool {
        subset.map(|v| v == version).unwrap_or(true)
    }

    /// Starts (or cancels, when `version` equals the current one) a switch.
    pub fn set_target(&mut self, version: String, expected: u32) {
        self.expected.insert(version.clone(), expected);
        if self.current_version.is_none() {
            self.current_version = Some(version);
            self.target_version = None;
        } else {
            self.target_version = Some(version);
        }
        self.switch_ready = false;
    }

    /// Gates the role's subsets; `live` counts alive brokers per version.
    pub fn decide(&self, live: &HashMap<String, usize>, threshold: f64) -> FleetDecision {
        let live_of = |version: &str| live.get(version).copied().unwrap_or(0);

        let Some(current) = self.current_version.as_deref() else {
            let total: usize = live.values().sum();
            return if health_gate(0, total, threshold) {
                FleetDecision::Place { version: None }
            } else {
                FleetDecision::Skip
            };
        };
        let current_ok = health_gate(self.expected_for(current), live_of(current), threshold);

        match self.phase() {
            RolloutPhase::Stable => {
                if current_ok {
                    FleetDecision::Place {
                        version: Some(current.to_string()),
                    }
                } else {
                    FleetDecision::Skip
                }
            }
            RolloutPhase::Switching => {
                let target = self.target_version.as_deref().unwrap_or(current);
                if health_gate(self.expected_for(target), live_of(target), threshold) {
                    FleetDecision::Switch {
                        from: current.to_string(),
                        to: target.to_string(),
                    }
                } else if current_ok {
                    FleetDecision::Place {
                        version: Some(current.to_string()),
                    }
                } else {
                    FleetDecision::Skip
                }
            }
        }
    }

    /// Evaluated after a switching tick: the new subset is complete, or the old
    /// subset no longer holds anything.
    pub fn evaluate_switch(&mut self, new_live: usize, old_tasks: usize) {
        let Some(target) = self.target_version.as_deref() else {
            return;
        };
        let complete = new_live as u32 >= self.expected_for(target) && self.expected_for(target) > 0;
        self.switch_ready = complete || old_tasks == 0;
    }

    pub fn is_switch_ready(&self) -> bool {
        self.switch_ready && self.phase() == RolloutPhase::Switching
    }

    /// Makes the target version current.
    pub fn finalize_switch(&mut self) -> Option<&str> {
        if !self.is_switch_ready() {
            return None;
        }
        self.current_version = self.target_version.take();
        self.switch_ready = false;
        self.current_version.as_deref()
    }
}

use keel_core::{
    DispatchPayload, DispatchSink, DispatchTask, PartitionStatus, PartitionTransition, TaskKey,
    TaskState, TopicCatalog,
};
use keel_placement::{
    BrokerLedger, PlacementEngine, PlacementPlan, ResourceLedger, TopicDemand, TopicTable,
};
use metrics::{counter, gauge, histogram};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServiceConfiguration;
use crate::dispatch::Dispatcher;
use crate::heartbeat::HeartbeatTable;
use crate::operator::{ActiveOverrides, OperatorCommands};
use crate::rollout::{FleetDecision, RoleRollout, RolloutPhase};
use crate::scheduler_metrics::{
    BROKERS_ALIVE, BROKERS_RECLAIMED_TOTAL, PARTITIONS_WAITING, ROLLOUT_SWITCHES_TOTAL,
    SCHEDULER_SKIPPED_ROLES_TOTAL, SCHEDULER_TICKS_TOTAL, SCHEDULER_TICK_DURATION_SECONDS,
};

/// Everything the scheduler remembers between ticks.
#[derive(Debug, Default)]
pub struct SchedulerState {
    topics: TopicTable,
    brokers: BTreeMap<String, BrokerLedger>,
    rollouts: BTreeMap<String, RoleRollout>,
    overrides: ActiveOverrides,
    // broker name -> last payload the broker acknowledged
    acknowledged: HashMap<String, DispatchPayload>,
    // last status transition persisted per partition
    published: HashMap<TaskKey, PartitionTransition>,
}

impl SchedulerState {
    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerLedger> {
        self.brokers.get(name)
    }

    pub fn brokers(&self) -> impl Iterator<Item = &BrokerLedger> {
        self.brokers.values()
    }

    pub fn rollout(&self, role: &str) -> Option<&RoleRollout> {
        self.rollouts.get(role)
    }

    pub fn status(&self, key: &TaskKey) -> Option<PartitionStatus> {
        self.topics.slot(key).map(|slot| slot.status())
    }

    pub fn target(&self, key: &TaskKey) -> Option<&str> {
        self.topics.slot(key).and_then(|slot| slot.target_broker())
    }
}

/// Summary of a single tick, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Roles whose version switch was finalized at the start of the tick
    pub finalized: Vec<String>,
    /// Roles left untouched because no broker subset passed the health gate
    pub skipped: Vec<String>,
    pub dispatched: usize,
    pub dispatch_failures: usize,
    pub published: usize,
    pub reclaimed: Vec<String>,
    pub waiting: usize,
}

// Result of gating and placing one role.
struct RoleOutcome {
    role: String,
    plan: PlacementPlan,
    // alive brokers that receive their target set
    assigned: Vec<String>,
    // alive brokers told to drop everything
    drained: Vec<String>,
}

// Decision for one partition, computed before the table is mutated.
struct SlotDecision {
    key: TaskKey,
    target: Option<String>,
    status: PartitionStatus,
    withheld: bool,
}

/// Drives the placement engine once per tick.
///
/// Per tick, in order:
/// 1. finalize version switches completed during the previous tick
/// 2. refresh topics, heartbeats, operator overrides and liveness
/// 3. health-gate the broker subsets of every role
/// 4. run the placement engine (twice for a switching role)
/// 5. translate the plans into payloads and status transitions
/// 6. reclaim brokers dead for longer than the reclaim timeout
pub struct RolloutCoordinator {
    config: ServiceConfiguration,
    engine: PlacementEngine,
    catalog: Arc<dyn TopicCatalog>,
    sink: Arc<dyn DispatchSink>,
    dispatcher: Dispatcher,
    heartbeats: HeartbeatTable,
    operator: OperatorCommands,
    state: SchedulerState,
}

impl RolloutCoordinator {
    pub fn new(
        config: ServiceConfiguration,
        catalog: Arc<dyn TopicCatalog>,
        sink: Arc<dyn DispatchSink>,
        heartbeats: HeartbeatTable,
        operator: OperatorCommands,
    ) -> Self {
        let mut state = SchedulerState::default();
        for role in &config.roles {
            state
                .rollouts
                .insert(role.name.clone(), RoleRollout::from_config(role));
        }
        let dispatcher = Dispatcher::new(
            Arc::clone(&sink),
            config.dispatch_concurrency,
            config.dispatch_timeout,
        );
        RolloutCoordinator {
            engine: PlacementEngine::new(config.strategy.clone()),
            config,
            catalog,
            sink,
            dispatcher,
            heartbeats,
            operator,
            state,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn operator(&self) -> &OperatorCommands {
        &self.operator
    }

    /// Moves `role` to `version`, expecting `expected_brokers` brokers to run it.
    /// Setting the current version again cancels a pending switch.
    pub fn set_target(&mut self, role: &str, version: &str, expected_brokers: u32) {
        let rollout = self
            .state
            .rollouts
            .entry(role.to_string())
            .or_insert_with(|| RoleRollout::unversioned(role));
        rollout.set_target(version.to_string(), expected_brokers);
        info!(
            role = %role,
            version = %version,
            expected_brokers = expected_brokers,
            phase = ?rollout.phase(),
            "rollout target updated"
        );
    }

    /// Runs one complete scheduling tick as of `now`.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        counter!(SCHEDULER_TICKS_TOTAL.name).increment(1);

        self.finalize_switches(&mut report).await;
        self.refresh(now).await;
        let outcomes = self.plan_roles(&mut report);
        self.apply_and_dispatch(outcomes, &mut report).await;
        self.reclaim(&mut report).await;

        report.waiting = self
            .state
            .topics
            .iter()
            .flat_map(|topic| topic.partitions())
            .filter(|(_, slot)| slot.status() == PartitionStatus::Waiting)
            .count();
        let alive = self.state.brokers.values().filter(|b| b.is_alive()).count();
        gauge!(PARTITIONS_WAITING.name).set(report.waiting as f64);
        gauge!(BROKERS_ALIVE.name).set(alive as f64);
        histogram!(SCHEDULER_TICK_DURATION_SECONDS.name).record(started.elapsed().as_secs_f64());

        debug!(
            dispatched = report.dispatched,
            dispatch_failures = report.dispatch_failures,
            waiting = report.waiting,
            skipped = ?report.skipped,
            "tick completed"
        );
        report
    }

    async fn finalize_switches(&mut self, report: &mut TickReport) {
        for rollout in self.state.rollouts.values_mut() {
            if !rollout.is_switch_ready() {
                continue;
            }
            let Some(version) = rollout.target_version().map(str::to_string) else {
                continue;
            };
            match self.sink.persist_rollout(rollout.name(), &version).await {
                Ok(()) => {
                    rollout.finalize_switch();
                    info!(role = %rollout.name(), version = %version, "version switch completed");
                    counter!(ROLLOUT_SWITCHES_TOTAL.name).increment(1);
                    report.finalized.push(rollout.name().to_string());
                }
                Err(err) => warn!(
                    role = %rollout.name(),
                    version = %version,
                    error = %err,
                    "unable to persist the version switch, will retry next tick"
                ),
            }
        }
    }

    async fn refresh(&mut self, now: Instant) {
        let commands = self.operator.take().await;
        let state = &mut self.state;
        state
            .overrides
            .absorb(commands, now, self.config.override_ttl);
        state.overrides.expire(now);

        match self.catalog.topics().await {
            Ok(specs) => {
                let summary = state.topics.sync(specs);
                if !summary.is_empty() {
                    info!(
                        created = ?summary.created,
                        deleted = ?summary.deleted,
                        resized = ?summary.resized,
                        rejected = ?summary.rejected,
                        "topic catalog changed"
                    );
                }
                let topics = &state.topics;
                state.published.retain(|key, _| {
                    topics
                        .get(&key.topic)
                        .is_some_and(|t| key.partition < t.partition_count())
                });
            }
            Err(err) => warn!(error = %err, "topic catalog unavailable, keeping the previous snapshot"),
        }

        for beat in self.heartbeats.snapshot().await {
            match state.brokers.get_mut(&beat.report.name) {
                Some(broker) => broker.refresh(beat.report, beat.received_at),
                None => {
                    info!(
                        broker = %beat.report.name,
                        role = %beat.report.role,
                        version = %beat.report.version,
                        capacity = beat.report.capacity,
                        "new broker registered"
                    );
                    state.brokers.insert(
                        beat.report.name.clone(),
                        BrokerLedger::from_report(beat.report, beat.received_at),
                    );
                }
            }
        }

        for broker in state.brokers.values_mut() {
            let was_alive = broker.is_alive();
            state.overrides.apply(broker);
            broker.prepare_decision(now, self.config.unknown_timeout);
            if was_alive && broker.is_dead() {
                warn!(
                    broker = %broker.name(),
                    unknown_for_secs = broker.unknown_for().as_secs(),
                    "broker considered dead"
                );
            } else if !was_alive && broker.is_alive() {
                info!(broker = %broker.name(), "broker is alive");
            }
        }

        state.topics.observe(state.brokers.values());

        let mut roles: BTreeSet<String> = state.topics.roles().into_iter().collect();
        roles.extend(state.brokers.values().map(|b| b.role().to_string()));
        for role in roles {
            state
                .rollouts
                .entry(role.clone())
                .or_insert_with(|| RoleRollout::unversioned(role));
        }
    }

    fn plan_roles(&mut self, report: &mut TickReport) -> Vec<RoleOutcome> {
        let state = &self.state;
        let mut outcomes = Vec::new();
        // role -> (live brokers on the new version, tasks still held by the old version)
        let mut switch_progress: Vec<(String, usize, usize)> = Vec::new();

        for (role, rollout) in &state.rollouts {
            let role_brokers: Vec<&BrokerLedger> =
                state.brokers.values().filter(|b| b.role() == role.as_str()).collect();
            let mut live: HashMap<String, usize> = HashMap::new();
            for broker in role_brokers.iter().filter(|b| b.is_alive()) {
                *live.entry(broker.version().to_string()).or_insert(0) += 1;
            }
            let topics: Vec<&TopicDemand> = state.topics.for_role(role).collect();

            match rollout.decide(&live, self.config.health_gate_threshold) {
                FleetDecision::Skip => {
                    if topics.is_empty() && role_brokers.iter().all(|b| b.is_dead()) {
                        continue;
                    }
                    warn!(
                        role = %role,
                        live = ?live,
                        "no broker subset passed the health gate, skipping role for this tick"
                    );
                    counter!(SCHEDULER_SKIPPED_ROLES_TOTAL.name, "role" => role.clone()).increment(1);
                    report.skipped.push(role.clone());
                }
                FleetDecision::Place { version } => {
                    let mut ledger = subset(&role_brokers, version.as_deref());
                    let plan = self.engine.place(&topics, &mut ledger);
                    let assigned = alive_names(&ledger);
                    // off-version brokers still holding tasks are told to drop them
                    let drained = role_brokers
                        .iter()
                        .filter(|b| {
                            b.is_alive() && !RoleRollout::matches(version.as_deref(), b.version())
                        })
                        .filter(|b| !b.current_task_set().is_empty())
                        .map(|b| b.name().to_string())
                        .collect();
                    outcomes.push(RoleOutcome {
                        role: role.clone(),
                        plan,
                        assigned,
                        drained,
                    });
                }
                FleetDecision::Switch { from, to } => {
                    let mut old = subset(&role_brokers, Some(from.as_str()));
                    let drain_plan = self.engine.place(&[], &mut old);
                    debug_assert!(drain_plan.targets().is_empty());
                    let mut new = subset(&role_brokers, Some(to.as_str()));
                    let plan = self.engine.place(&topics, &mut new);

                    let assigned = alive_names(&new);
                    let mut drained = alive_names(&old);
                    drained.extend(
                        role_brokers
                            .iter()
                            .filter(|b| b.is_alive() && b.version() != from && b.version() != to)
                            .filter(|b| !b.current_task_set().is_empty())
                            .map(|b| b.name().to_string()),
                    );

                    let old_tasks: usize = old
                        .alive_brokers()
                        .map(|b| b.current_task_set().len() + b.target_task_set().len())
                        .sum();
                    let new_live = live.get(&to).copied().unwrap_or(0);
                    info!(
                        role = %role,
                        from = %from,
                        to = %to,
                        new_live = new_live,
                        old_tasks = old_tasks,
                        "switching role to the new version"
                    );
                    switch_progress.push((role.clone(), new_live, old_tasks));
                    outcomes.push(RoleOutcome {
                        role: role.clone(),
                        plan,
                        assigned,
                        drained,
                    });
                }
            }
        }

        for (role, new_live, old_tasks) in switch_progress {
            if let Some(rollout) = self.state.rollouts.get_mut(&role) {
                rollout.evaluate_switch(new_live, old_tasks);
            }
        }
        outcomes
    }

    async fn apply_and_dispatch(&mut self, outcomes: Vec<RoleOutcome>, report: &mut TickReport) {
        let mut payloads: Vec<(String, DispatchPayload)> = Vec::new();
        let mut transitions: Vec<PartitionTransition> = Vec::new();

        for outcome in &outcomes {
            let decisions = self.decide_slots(outcome);
            let withheld: BTreeSet<TaskKey> = decisions
                .iter()
                .filter(|d| d.withheld)
                .map(|d| d.key.clone())
                .collect();

            for decision in decisions {
                let Some(topic) = self.state.topics.get(&decision.key.topic) else {
                    continue;
                };
                let skip_status = topic.is_inconsistent();
                if !skip_status {
                    let transition = PartitionTransition {
                        topic: decision.key.topic.clone(),
                        partition: decision.key.partition,
                        status: decision.status,
                        target_broker: decision
                            .target
                            .as_deref()
                            .and_then(|t| self.state.brokers.get(t))
                            .map(|b| b.address().to_string()),
                    };
                    if self.state.published.get(&decision.key) != Some(&transition) {
                        transitions.push(transition);
                    }
                }
                if let Some(slot) = self.state.topics.slot_mut(&decision.key) {
                    slot.set_target_broker(decision.target);
                    slot.set_status(decision.status);
                }
            }

            for broker in &outcome.assigned {
                if let Some(payload) = self.build_payload(broker, Some((&outcome.plan, &withheld))) {
                    payloads.push((broker.clone(), payload));
                }
            }
            for broker in &outcome.drained {
                if let Some(payload) = self.build_payload(broker, None) {
                    payloads.push((broker.clone(), payload));
                }
            }
            debug!(
                role = %outcome.role,
                placed = outcome.plan.targets().len(),
                waiting = outcome.plan.waiting().len(),
                withheld = withheld.len(),
                "role placement applied"
            );
        }

        for topic in self.state.topics.iter().filter(|t| t.is_inconsistent()) {
            info!(
                topic = %topic.name(),
                partitions = topic.partition_count(),
                "partition count changed, skipping status update for this tick"
            );
        }

        if !payloads.is_empty() {
            let deliveries = self.dispatcher.deliver(payloads).await;
            for delivery in deliveries {
                match delivery.result {
                    Ok(()) => {
                        report.dispatched += 1;
                        self.state
                            .acknowledged
                            .insert(delivery.broker, delivery.payload);
                    }
                    Err(_) => report.dispatch_failures += 1,
                }
            }
        }

        if !transitions.is_empty() {
            match self.sink.publish_transitions(transitions.clone()).await {
                Ok(()) => {
                    report.published = transitions.len();
                    for transition in transitions {
                        let key = TaskKey::new(transition.topic.clone(), transition.partition);
                        self.state.published.insert(key, transition);
                    }
                }
                Err(err) => warn!(
                    count = transitions.len(),
                    error = %err,
                    "unable to publish partition transitions, will retry next tick"
                ),
            }
        }
    }

    // Status of every partition of the role. A partition whose target differs from a
    // broker still reporting it is Migrating and withheld from the target's payload
    // until the other broker lets it go.
    fn decide_slots(&self, outcome: &RoleOutcome) -> Vec<SlotDecision> {
        let state = &self.state;
        let mut decisions = Vec::new();
        for topic in state.topics.for_role(&outcome.role) {
            for (partition, _) in topic.partitions() {
                let key = TaskKey::new(topic.name(), partition);
                let target = outcome.plan.target(&key).map(str::to_string);
                let (status, withheld) = match target.as_deref() {
                    None => (PartitionStatus::Waiting, false),
                    Some(target) => {
                        let target_ledger = state.brokers.get(target);
                        let held_by_target = target_ledger.is_some_and(|b| b.holds(&key));
                        let held_elsewhere = state
                            .brokers
                            .values()
                            .any(|b| b.name() != target && b.is_alive() && b.holds(&key));
                        if held_elsewhere && !held_by_target {
                            (PartitionStatus::Migrating, true)
                        } else if target_ledger.is_some_and(|b| {
                            b.current_task_set()
                                .get(&key)
                                .is_some_and(|task| task.state == TaskState::Serving)
                        }) {
                            (PartitionStatus::Serving, false)
                        } else {
                            (PartitionStatus::Loading, false)
                        }
                    }
                };
                decisions.push(SlotDecision {
                    key,
                    target,
                    status,
                    withheld,
                });
            }
        }
        decisions
    }

    // Full target set of `broker`, or a drain payload when no plan is given.
    // Returns None when the broker already acknowledged the same payload in its
    // current session.
    fn build_payload(
        &self,
        broker: &str,
        plan: Option<(&PlacementPlan, &BTreeSet<TaskKey>)>,
    ) -> Option<DispatchPayload> {
        let ledger = self.state.brokers.get(broker)?;
        let mut tasks = Vec::new();
        if let Some((plan, withheld)) = plan {
            for (key, target) in plan.targets() {
                if target != broker || withheld.contains(key) {
                    continue;
                }
                let Some(topic) = self.state.topics.get(&key.topic) else {
                    continue;
                };
                tasks.push(DispatchTask {
                    topic: key.topic.clone(),
                    partition: key.partition,
                    range: topic.range(key.partition),
                    topic_version: topic.spec().version,
                    // the previous owner's token, only when ownership is handed over
                    fencing_token: topic
                        .partition(key.partition)
                        .filter(|slot| slot.current_broker() != Some(broker))
                        .and_then(|slot| slot.fencing_token().cloned()),
                    build_params: topic.spec().build_params.clone(),
                });
            }
        }
        let payload = DispatchPayload {
            broker_address: ledger.address().to_string(),
            session_id: ledger.session_id().clone(),
            tasks,
        };
        if self.state.acknowledged.get(broker) == Some(&payload) {
            return None;
        }
        Some(payload)
    }

    async fn reclaim(&mut self, report: &mut TickReport) {
        let reclaim_timeout = self.config.reclaim_timeout;
        let state = &mut self.state;
        let rollouts = &state.rollouts;
        let expired: Vec<(String, Instant)> = state
            .brokers
            .values()
            .filter(|b| b.is_dead() && b.unknown_for() >= reclaim_timeout)
            .filter(|b| {
                rollouts
                    .get(b.role())
                    .map(|r| r.phase() == RolloutPhase::Stable)
                    .unwrap_or(true)
            })
            .map(|b| (b.name().to_string(), b.last_heartbeat()))
            .collect();

        for (name, last_heartbeat) in expired {
            state.brokers.remove(&name);
            state.acknowledged.remove(&name);
            if !self.heartbeats.forget_if_stale(&name, last_heartbeat).await {
                debug!(broker = %name, "broker sent a heartbeat while being reclaimed");
            }
            for topic in state.topics.iter().map(|t| t.name().to_string()).collect::<Vec<_>>() {
                let Some(demand) = state.topics.get_mut(&topic) else {
                    continue;
                };
                for partition in 0..demand.partition_count() {
                    if let Some(slot) = demand.partition_mut(partition) {
                        if slot.current_broker() == Some(name.as_str()) {
                            slot.set_current_broker(None);
                        }
                    }
                }
            }
            info!(broker = %name, "dead broker reclaimed");
            counter!(BROKERS_RECLAIMED_TOTAL.name).increment(1);
            report.reclaimed.push(name);
        }
    }
}

fn subset(brokers: &[&BrokerLedger], version: Option<&str>) -> ResourceLedger {
    ResourceLedger::new(
        brokers
            .iter()
            .filter(|b| RoleRollout::matches(version, b.version()))
            .map(|b| (*b).clone()),
    )
}

fn alive_names(ledger: &ResourceLedger) -> Vec<String> {
    ledger
        .alive_brokers()
        .map(|b| b.name().to_string())
        .collect()
}

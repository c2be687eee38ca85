use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace};

use crate::coordinator::RolloutCoordinator;

/// Runs a tick every `interval` until `shutdown` flips to true.
///
/// Ticks never overlap: a slow tick delays the next one instead of queuing a burst.
/// Shutdown is only observed between ticks.
pub fn spawn_scheduler(
    mut coordinator: RolloutCoordinator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<RolloutCoordinator> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "scheduling loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = coordinator.tick(Instant::now()).await;
                    trace!(report = ?report, "tick report");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduling loop stopped");
        coordinator
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfiguration;
    use crate::heartbeat::HeartbeatTable;
    use crate::operator::OperatorCommands;
    use keel_core::{BrokerReport, MemoryCatalog, MemorySink, TopicSpec};
    use std::sync::Arc;

    /// **Test:** Loop Ticks Until Shutdown
    ///
    /// **Expectation:** the loop places the topic on the only broker, and hands the
    /// coordinator back once shutdown is signalled.
    #[tokio::test]
    async fn test_loop_runs_until_shutdown() {
        let heartbeats = HeartbeatTable::new();
        heartbeats
            .record(BrokerReport::new("b1", "b1:6650", "v1", 100))
            .await;
        let sink = Arc::new(MemorySink::new());
        let coordinator = RolloutCoordinator::new(
            ServiceConfiguration::default(),
            Arc::new(MemoryCatalog::with_topics(vec![TopicSpec::new("t1", 2, 10, 2)])),
            sink.clone(),
            heartbeats,
            OperatorCommands::new(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_scheduler(coordinator, Duration::from_millis(10), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let coordinator = handle.await.unwrap();
        assert_eq!(
            coordinator.state().target(&keel_core::TaskKey::new("t1", 0)),
            Some("b1")
        );
        assert!(sink.dispatch_count("b1:6650") >= 1);
    }
}

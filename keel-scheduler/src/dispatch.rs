use futures::stream::{self, StreamExt};
use keel_core::{DispatchPayload, DispatchSink, KeelError, Result};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::scheduler_metrics::{DISPATCH_FAILURES_TOTAL, DISPATCH_TOTAL};

/// Outcome of one payload delivery.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub broker: String,
    pub payload: DispatchPayload,
    pub result: Result<()>,
}

/// Bounded pool of concurrent deliveries towards the sink.
pub(crate) struct Dispatcher {
    sink: Arc<dyn DispatchSink>,
    concurrency: usize,
    timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(sink: Arc<dyn DispatchSink>, concurrency: usize, timeout: Duration) -> Self {
        Dispatcher {
            sink,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Delivers every payload, at most `concurrency` at a time. A payload that is
    /// not acknowledged within the timeout is reported as unreachable.
    pub(crate) async fn deliver(&self, payloads: Vec<(String, DispatchPayload)>) -> Vec<Delivery> {
        stream::iter(payloads)
            .map(|(broker, payload)| {
                let sink = Arc::clone(&self.sink);
                let timeout = self.timeout;
                async move {
                    let result =
                        match tokio::time::timeout(timeout, sink.dispatch(payload.clone())).await {
                            Ok(result) => result,
                            Err(_) => Err(KeelError::Unreachable(format!(
                                "{} did not acknowledge within {:?}",
                                payload.broker_address, timeout
                            ))),
                        };
                    match &result {
                        Ok(()) => {
                            debug!(
                                broker = %broker,
                                tasks = payload.tasks.len(),
                                "payload acknowledged"
                            );
                            counter!(DISPATCH_TOTAL.name).increment(1);
                        }
                        Err(err) => {
                            warn!(
                                broker = %broker,
                                address = %payload.broker_address,
                                error = %err,
                                "dispatch failed, will retry next tick"
                            );
                            counter!(DISPATCH_FAILURES_TOTAL.name).increment(1);
                        }
                    }
                    Delivery {
                        broker,
                        payload,
                        result,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

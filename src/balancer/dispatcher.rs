//! The dispatch loop.
//!
//! Each iteration draws one client proportionally to its weight and blocks on
//! that client alone until it yields a request, closes its queue, or the
//! balancer is cancelled. A drawn client that is idle therefore stalls the
//! loop even if others have work ready; weighting is statistical, not a
//! round-robin guarantee.
//!
//! Forwarding into the bounded work queue waits while the queue is full. That
//! wait is the only backpressure in the system: ingestion slows to whatever
//! rate the workers drain the queue at.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::stats::Stats;
use crate::balancer::registry::{Cleanup, Outbound, Registry};
use crate::work::Request;

pub struct Dispatcher {
    registry: Arc<Registry>,
    tx_requests: async_channel::Sender<Request>,
    shutdown: CancellationToken,
    stats: Arc<Stats>,
    idle_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        tx_requests: async_channel::Sender<Request>,
        shutdown: CancellationToken,
        stats: Arc<Stats>,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            registry,
            tx_requests,
            shutdown,
            stats,
            idle_backoff,
        }
    }

    pub async fn run(self) {
        info!("Dispatcher started");

        while !self.shutdown.is_cancelled() {
            let Some(drawn) = self.registry.draw() else {
                // Nothing registered: wait for a registration, bounded by the
                // backoff so the loop never spins.
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.registry.registered() => {}
                    _ = sleep(self.idle_backoff) => {}
                }
                continue;
            };

            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = next_request(&drawn.outbound) => next,
            };

            match next {
                Some(request) => {
                    debug!("Forwarding request {} from {:?}", request.id, drawn.client);
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        sent = self.tx_requests.send(request) => {
                            if sent.is_err() {
                                warn!("Work queue closed, dispatcher stopping");
                                break;
                            }
                            self.stats.inc_dispatched();
                        }
                    }
                }
                None => match self.registry.cleanup(&drawn.client, drawn.registration) {
                    Cleanup::Removed { slots_removed } => {
                        info!("Cleaning up {:?}: workload drained, {} slots removed", drawn.client, slots_removed);
                        self.stats.inc_cleaned_up();
                    }
                    Cleanup::Partial { slots_removed } => {
                        info!(
                            "Registration {} of {:?} drained, {} slots removed, other registrations remain",
                            drawn.registration, drawn.client, slots_removed
                        );
                        self.stats.inc_cleaned_up();
                    }
                    Cleanup::Unknown => {
                        debug!("Registration {} of {:?} was already cleaned up", drawn.registration, drawn.client);
                    }
                },
            }
        }

        info!("Dispatcher shutting down");
    }
}

async fn next_request(outbound: &Outbound) -> Option<Request> {
    outbound.lock().await.recv().await
}

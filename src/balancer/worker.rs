use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analytics::stats::Stats;
use crate::balancer::Server;
use crate::utils::time::{elapsed_ms, now_instant};
use crate::work::Request;

/// One slot of downstream capacity.
///
/// A worker runs at most one `process` call at a time, so a pool of
/// `max_parallel` workers never has more than `max_parallel` calls in flight.
pub struct Worker {
    id: usize,
    server: Arc<dyn Server>,
    rx_requests: async_channel::Receiver<Request>,
    shutdown: CancellationToken,
    stats: Arc<Stats>,
}

impl Worker {
    pub fn new(
        id: usize,
        server: Arc<dyn Server>,
        rx_requests: async_channel::Receiver<Request>,
        shutdown: CancellationToken,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            id,
            server,
            rx_requests,
            shutdown,
            stats,
        }
    }

    pub async fn run(self) {
        debug!("Worker {} started", self.id);

        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.rx_requests.recv() => match received {
                    Ok(request) => request,
                    Err(_) => {
                        debug!("Worker {}: work queue closed", self.id);
                        break;
                    }
                },
            };

            // Both branches may have been ready at once; never start a new call
            // after cancellation.
            if self.shutdown.is_cancelled() {
                debug!("Worker {} dropping request {} received during shutdown", self.id, request.id);
                break;
            }

            self.process(request).await;
        }

        debug!("Worker {} shutting down", self.id);
    }

    async fn process(&self, request: Request) {
        debug!("Worker {} processing request {}", self.id, request.id);

        let start = now_instant();
        self.stats.begin_process();
        let result = self.server.process(request).await;
        self.stats.end_process(result.is_ok(), elapsed_ms(start));

        // Failures are reported and dropped: no retry, no propagation.
        if let Err(e) = result {
            warn!("Worker {} encountered error processing request {}: {:#}", self.id, request.id, e);
        }
    }
}

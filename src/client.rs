use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::balancer::Client;
use crate::work::Request;

/// A client that sends a fixed number of requests, then stops.
#[derive(Debug, Clone)]
pub struct SyntheticClient {
    request_count: u64,
    weight: u32,
}

impl SyntheticClient {
    pub fn new(request_count: u64, weight: u32) -> Self {
        Self {
            request_count,
            weight,
        }
    }
}

impl Client for SyntheticClient {
    fn weight(&self) -> u32 {
        self.weight
    }

    /// Feeds requests with ids counting down from `request_count` to 1, or
    /// until `token` is cancelled. Must be called inside a tokio runtime.
    fn workload(&self, token: CancellationToken) -> mpsc::Receiver<Request> {
        let (tx, rx) = mpsc::channel(1);
        let mut remaining = self.request_count;

        tokio::spawn(async move {
            while remaining > 0 {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = tx.send(Request::new(remaining)) => {
                        if sent.is_err() {
                            return;
                        }
                        remaining -= 1;
                    }
                }
            }
        });

        rx
    }
}

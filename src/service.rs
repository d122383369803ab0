use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::balancer::Server;
use crate::work::Request;

/// Stand-in for the downstream service: expensive, so it should be kept busy,
/// and fragile, so it must not be flooded.
///
/// Each call sleeps a random `0..max_latency` and fails with probability
/// `failure_per_mille / 1000`.
#[derive(Debug, Clone)]
pub struct ExpensiveFragileService {
    failure_per_mille: u32,
    max_latency: Duration,
}

impl ExpensiveFragileService {
    pub fn new(failure_per_mille: u32, max_latency: Duration) -> Self {
        Self {
            failure_per_mille: failure_per_mille.min(1000),
            max_latency,
        }
    }
}

impl Default for ExpensiveFragileService {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(100))
    }
}

#[async_trait]
impl Server for ExpensiveFragileService {
    async fn process(&self, request: Request) -> anyhow::Result<()> {
        // The thread-local generator is not Send; finish with it before awaiting.
        let (fail, latency) = {
            let mut rng = rand::rng();
            let fail = rng.random_range(0..1000) < self.failure_per_mille;
            let max_ms = self.max_latency.as_millis() as u64;
            let latency = if max_ms == 0 { 0 } else { rng.random_range(0..max_ms) };
            (fail, Duration::from_millis(latency))
        };

        if fail {
            return Err(anyhow!("request {} failed", request.id));
        }

        tokio::time::sleep(latency).await;
        Ok(())
    }
}

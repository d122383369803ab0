//! Weighted admission control in front of a single downstream [`Server`].
//!
//! A [`Balancer`] owns a fixed pool of `max_parallel` workers and one dispatch
//! loop. Clients register at any time; the dispatch loop samples them
//! proportionally to their weight and feeds their requests into a bounded work
//! queue that the workers drain. Because each worker runs one downstream call
//! at a time, the server never sees more than `max_parallel` concurrent calls.
//!
//! ```text
//! Client ──► outbound queue ──► Dispatcher (weighted draw) ──► work queue ──► Worker ──► Server
//! ```

pub mod dispatcher;
pub mod registry;
pub mod selector;
pub mod worker;


use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::analytics::stats::Stats;
use crate::error::{AppError, Result};
use crate::work::Request;
use dispatcher::Dispatcher;
use registry::{ClientKey, Registry};
use worker::Worker;

/// A producer of requests.
pub trait Client: Send + Sync + 'static {
    /// Unit-less share of processing capacity, at least 1. Must not change
    /// while the client is registered.
    fn weight(&self) -> u32;

    /// Starts producing requests into the returned queue.
    ///
    /// The queue yields at least one request before it closes, and must close
    /// promptly once `token` is cancelled.
    fn workload(&self, token: CancellationToken) -> mpsc::Receiver<Request>;
}

/// The expensive downstream service.
///
/// `process` may be called concurrently up to the balancer's `max_parallel`
/// times and may take arbitrarily long.
#[async_trait]
pub trait Server: Send + Sync + 'static {
    async fn process(&self, request: Request) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BalancerState {
    Constructed = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl BalancerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Constructed,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalancerOptions {
    /// How long the dispatch loop sleeps when nothing is registered, unless a
    /// registration wakes it first.
    pub idle_backoff: Duration,
    /// Seed for the draw generator. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_millis(10),
            seed: None,
        }
    }
}

/// Keeps the downstream [`Server`] from being flooded.
///
/// THE SERVER MUST NEVER PROCESS MORE THAN `max_parallel` REQUESTS AT ONCE.
/// Capacity is shared between registered clients by weight: with a limit of
/// 100 and clients weighted 1, 1 and 2, they get roughly 25, 25 and 50 slots
/// while all three have work, and the survivors split the whole 100 as soon as
/// one of them drains.
///
/// Must be created inside a tokio runtime; construction starts the workers and
/// the dispatch loop immediately.
pub struct Balancer {
    max_parallel: usize,
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    state: AtomicU8,
}

impl Balancer {
    pub fn new(server: Arc<dyn Server>, max_parallel: usize) -> Result<Self> {
        Self::with_options(server, max_parallel, BalancerOptions::default())
    }

    pub fn with_options(server: Arc<dyn Server>, max_parallel: usize, options: BalancerOptions) -> Result<Self> {
        if max_parallel == 0 {
            return Err(AppError::InvalidCeiling);
        }

        let registry = match options.seed {
            Some(seed) => Registry::with_rng(StdRng::seed_from_u64(seed)),
            None => Registry::new(),
        };

        let balancer = Self {
            max_parallel,
            registry: Arc::new(registry),
            stats: Arc::new(Stats::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: AtomicU8::new(BalancerState::Constructed as u8),
        };
        balancer.start(server, options.idle_backoff);
        Ok(balancer)
    }

    fn start(&self, server: Arc<dyn Server>, idle_backoff: Duration) {
        info!("Starting balancer with {} workers", self.max_parallel);

        let (tx_requests, rx_requests) = async_channel::bounded(self.max_parallel);

        for id in 0..self.max_parallel {
            let worker = Worker::new(
                id,
                server.clone(),
                rx_requests.clone(),
                self.shutdown.clone(),
                self.stats.clone(),
            );
            self.tasks.spawn(worker.run());
        }

        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            tx_requests,
            self.shutdown.clone(),
            self.stats.clone(),
            idle_backoff,
        );
        self.tasks.spawn(dispatcher.run());

        self.state.store(BalancerState::Running as u8, Ordering::SeqCst);
    }

    /// Registers a client and starts dispatching its requests.
    ///
    /// Registering the same client again is additive: it adds another
    /// workload and another `weight` worth of draw share.
    pub fn register(&self, client: Arc<dyn Client>) -> Result<()> {
        let weight = client.weight();
        if weight < 1 {
            return Err(AppError::InvalidWeight(weight));
        }
        if self.shutdown.is_cancelled() {
            return Err(AppError::ShutDown);
        }

        let key = ClientKey::new(client.clone());
        info!("Registering {:?} with weight {}", key, weight);

        let outbound = client.workload(self.shutdown.child_token());
        self.registry.register(key, weight, outbound);
        self.stats.inc_registered();
        Ok(())
    }

    /// Stops dispatching, lets in-flight downstream calls finish, and waits
    /// until every worker has exited. Requests still queued are abandoned.
    ///
    /// Calling it again after it returned is a no-op.
    pub async fn shutdown(&self) {
        if self.state() == BalancerState::Stopped {
            return;
        }

        let started = self.state.compare_exchange(
            BalancerState::Running as u8,
            BalancerState::ShuttingDown as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_ok() {
            info!("Initiating shutdown...");
        }

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.state.store(BalancerState::Stopped as u8, Ordering::SeqCst);
        info!("Shutdown complete");
    }

    pub fn state(&self) -> BalancerState {
        BalancerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Draw slots currently held by `client`, i.e. its cumulative weight over
    /// registrations that have not drained yet.
    pub fn slot_count(&self, client: &Arc<dyn Client>) -> usize {
        self.registry.slot_count(&ClientKey::new(client.clone()))
    }

    pub fn is_registered(&self, client: &Arc<dyn Client>) -> bool {
        self.registry.contains(&ClientKey::new(client.clone()))
    }

    /// Total draw slots across all clients.
    pub fn total_slots(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        // Background tasks must not outlive an unshut balancer.
        self.shutdown.cancel();
    }
}

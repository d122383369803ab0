use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct Stats {
    pub registered: AtomicU64,
    pub cleaned_up: AtomicU64,
    pub dispatched: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,

    // Downstream calls currently running, and the highest value ever seen.
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,

    pub last_process_latency_ms: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cleaned_up(&self) {
        self.cleaned_up.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the start of a downstream call.
    pub fn begin_process(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    /// Marks the end of a downstream call, successful or not.
    pub fn end_process(&self, ok: bool, latency_ms: u64) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_process_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Finished downstream calls, failed ones included.
    pub fn completed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    pub fn log_stats(&self) {
        let registered = self.registered.load(Ordering::Relaxed);
        let cleaned = self.cleaned_up.load(Ordering::Relaxed);
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let latency = self.last_process_latency_ms.load(Ordering::Relaxed);

        info!(
            "STATS: Clients: {} registered, {} drained | Requests: {} dispatched, {} ok, {} failed | In flight: {} (peak {}) | Last latency {}ms",
            registered,
            cleaned,
            dispatched,
            processed,
            failed,
            self.in_flight(),
            self.peak_in_flight(),
            latency
        );
    }
}

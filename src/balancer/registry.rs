//! Registration state shared by `register`, the dispatch loop and cleanup.
//!
//! The weighted selector and the client → outbound-queue table live behind a
//! single mutex so they can only ever change together. Critical sections never
//! await or do I/O.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::balancer::selector::WeightedSelector;
use crate::balancer::Client;
use crate::work::Request;

/// A client's outbound queue. Only the dispatch loop receives from it; the
/// async mutex exists so it can be held across the `recv` await.
pub type Outbound = Arc<AsyncMutex<mpsc::Receiver<Request>>>;

/// Identity of a registered client: two keys are equal iff they point at the
/// same client allocation.
#[derive(Clone)]
pub struct ClientKey(Arc<dyn Client>);

impl ClientKey {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self(client)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for ClientKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ClientKey {}

impl Hash for ClientKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client@{:#x}", self.addr())
    }
}

/// One call to `register`: its own slots and its own outbound queue.
#[derive(Clone)]
struct Registration {
    id: u64,
    weight: u32,
    outbound: Outbound,
}

/// What the dispatch loop gets back from a draw.
#[derive(Clone)]
pub struct Drawn {
    pub client: ClientKey,
    pub registration: u64,
    pub outbound: Outbound,
}

/// Result of cleaning up an exhausted registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// The registration was already gone.
    Unknown,
    /// Other registrations of the same client are still live.
    Partial { slots_removed: usize },
    /// The client no longer holds any slot and left the table.
    Removed { slots_removed: usize },
}

struct Inner {
    selector: WeightedSelector<ClientKey>,
    table: HashMap<ClientKey, VecDeque<Registration>>,
    rng: StdRng,
    next_id: u64,
}

pub struct Registry {
    inner: Mutex<Inner>,
    registered: Notify,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Uses the given generator for every draw. Seeded generators make the
    /// draw sequence reproducible.
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(Inner {
                selector: WeightedSelector::new(),
                table: HashMap::new(),
                rng,
                next_id: 0,
            }),
            registered: Notify::new(),
        }
    }

    /// Adds `weight` slots for `client` and records its outbound queue.
    /// Returns the id of the new registration.
    pub fn register(&self, client: ClientKey, weight: u32, outbound: mpsc::Receiver<Request>) -> u64 {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            inner.selector.insert(client.clone(), weight);
            inner.table.entry(client).or_default().push_back(Registration {
                id,
                weight,
                outbound: Arc::new(AsyncMutex::new(outbound)),
            });
            id
        };
        self.registered.notify_one();
        id
    }

    /// Draws a client proportionally to its weight and hands back the
    /// outbound queue of its oldest live registration.
    pub fn draw(&self) -> Option<Drawn> {
        let mut inner = self.inner.lock();
        let Inner {
            selector, table, rng, ..
        } = &mut *inner;

        let client = selector.draw(rng)?;
        let registration = table.get(client).and_then(VecDeque::front);
        debug_assert!(registration.is_some(), "selector holds {client:?} but the table does not");

        registration.map(|r| Drawn {
            client: client.clone(),
            registration: r.id,
            outbound: r.outbound.clone(),
        })
    }

    /// Drops an exhausted registration together with its slots. The client
    /// leaves the table once its last registration is gone.
    pub fn cleanup(&self, client: &ClientKey, registration: u64) -> Cleanup {
        let mut inner = self.inner.lock();
        let Inner { selector, table, .. } = &mut *inner;

        let Some(registrations) = table.get_mut(client) else {
            return Cleanup::Unknown;
        };
        let Some(idx) = registrations.iter().position(|r| r.id == registration) else {
            return Cleanup::Unknown;
        };
        let Some(removed) = registrations.remove(idx) else {
            return Cleanup::Unknown;
        };

        if registrations.is_empty() {
            table.remove(client);
            let slots_removed = selector.remove_all(client);
            Cleanup::Removed { slots_removed }
        } else {
            let slots_removed = selector.remove(client, removed.weight);
            Cleanup::Partial { slots_removed }
        }
    }

    /// Total number of slots across all clients.
    pub fn len(&self) -> usize {
        self.inner.lock().selector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().selector.is_empty()
    }

    /// Slots currently held by `client`.
    pub fn slot_count(&self, client: &ClientKey) -> usize {
        self.inner.lock().selector.count(client)
    }

    pub fn contains(&self, client: &ClientKey) -> bool {
        self.inner.lock().table.contains_key(client)
    }

    /// Number of distinct clients with at least one live registration.
    pub fn client_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Completes when a registration happens. A registration made while
    /// nobody was waiting wakes the next waiter immediately.
    pub async fn registered(&self) {
        self.registered.notified().await;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tokio_util::sync::CancellationToken;

    struct Fixed(u32);

    impl Client for Fixed {
        fn weight(&self) -> u32 {
            self.0
        }

        fn workload(&self, _token: CancellationToken) -> mpsc::Receiver<Request> {
            mpsc::channel(1).1
        }
    }

    fn key(weight: u32) -> ClientKey {
        ClientKey::new(Arc::new(Fixed(weight)))
    }

    fn outbound() -> mpsc::Receiver<Request> {
        mpsc::channel(1).1
    }

    #[test]
    fn test_keys_compare_by_identity() {
        let a = key(1);
        let b = key(1);

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_and_cleanup_keep_table_and_slots_in_sync() {
        let registry = Registry::with_rng(StdRng::seed_from_u64(1));
        let a = key(3);

        let id = registry.register(a.clone(), 3, outbound());
        assert_eq!(registry.slot_count(&a), 3);
        assert!(registry.contains(&a));

        let drawn = registry.draw().unwrap();
        assert_eq!(drawn.client, a);
        assert_eq!(drawn.registration, id);

        assert_eq!(registry.cleanup(&a, id), Cleanup::Removed { slots_removed: 3 });
        assert!(!registry.contains(&a));
        assert_eq!(registry.slot_count(&a), 0);
        assert!(registry.is_empty());
        assert!(registry.draw().is_none());
    }

    #[test]
    fn test_cleanup_of_one_registration_keeps_the_other() {
        let registry = Registry::with_rng(StdRng::seed_from_u64(2));
        let a = key(2);

        let first = registry.register(a.clone(), 2, outbound());
        let second = registry.register(a.clone(), 2, outbound());
        assert_eq!(registry.slot_count(&a), 4);
        assert_eq!(registry.client_count(), 1);

        // Oldest registration is served first.
        assert_eq!(registry.draw().unwrap().registration, first);

        assert_eq!(registry.cleanup(&a, first), Cleanup::Partial { slots_removed: 2 });
        assert_eq!(registry.slot_count(&a), 2);
        assert!(registry.contains(&a));
        assert_eq!(registry.draw().unwrap().registration, second);

        assert_eq!(registry.cleanup(&a, second), Cleanup::Removed { slots_removed: 2 });
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_unknown_is_noop() {
        let registry = Registry::new();
        let a = key(1);
        let b = key(1);
        let id = registry.register(a.clone(), 1, outbound());

        assert_eq!(registry.cleanup(&b, id), Cleanup::Unknown);
        assert_eq!(registry.cleanup(&a, id + 1), Cleanup::Unknown);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(Registry::new());
        let clients: Vec<ClientKey> = (1..=8).map(key).collect();
        let mut handles = vec![];

        for client in clients.clone() {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let weight = client.0.weight();
                    registry.register(client.clone(), weight, outbound());
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        for client in &clients {
            assert_eq!(registry.slot_count(client), 50 * client.0.weight() as usize);
        }
        assert_eq!(registry.len(), 50 * (1..=8).sum::<usize>());
        assert_eq!(registry.client_count(), 8);
    }

    #[test]
    fn test_draw_share_follows_weights() {
        let registry = Registry::with_rng(StdRng::seed_from_u64(11));
        let light = key(1);
        let heavy = key(3);
        registry.register(light.clone(), 1, outbound());
        registry.register(heavy.clone(), 3, outbound());

        let draws = 80_000;
        let heavy_hits = (0..draws)
            .filter(|_| registry.draw().unwrap().client == heavy)
            .count();
        let share = heavy_hits as f64 / draws as f64;
        assert!((share - 0.75).abs() < 0.01, "share was {share:.4}");
    }

    #[tokio::test]
    async fn test_registration_wakes_waiter() {
        let registry = Arc::new(Registry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.registered().await })
        };

        tokio::task::yield_now().await;
        registry.register(key(1), 1, outbound());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}

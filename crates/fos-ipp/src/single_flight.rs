//! Deduplicated futures.
//!
//! [`SingleFlight`] launches at most one instance of an operation at a time.
//! Every caller that arrives while the operation is running receives a clone
//! of the same shared future and therefore the same result. The slot is
//! cleared as soon as the operation settles, so the next call starts fresh.

use crate::events::lock;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The handle every concurrent caller awaits
pub type Flight<T> = Shared<BoxFuture<'static, T>>;

type Slot<T> = Arc<Mutex<Option<(u64, Flight<T>)>>>;

pub struct SingleFlight<T: Clone> {
    slot: Slot<T>,
    generation: AtomicU64,
    launched: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            launched: AtomicU64::new(0),
        }
    }

    /// Join the running operation, or start one with `make`.
    ///
    /// `make` is only invoked when nothing is in flight. It runs under the
    /// slot lock and must only build the future, not poll it.
    pub fn run<F, Fut>(&self, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some((_, flight)) = slot.as_ref() {
            return flight.clone();
        }

        let id = self.generation.fetch_add(1, Ordering::Relaxed);
        self.launched.fetch_add(1, Ordering::Relaxed);

        let operation = make();
        let owner = Arc::downgrade(&self.slot);
        let flight = async move {
            let output = operation.await;
            if let Some(owner) = owner.upgrade() {
                let mut slot = lock(&owner);
                if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
                    *slot = None;
                }
            }
            output
        }
        .boxed()
        .shared();

        *slot = Some((id, flight.clone()));
        flight
    }

    /// The running operation, if any
    pub fn in_flight(&self) -> Option<Flight<T>> {
        lock(&self.slot).as_ref().map(|(_, flight)| flight.clone())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Number of operations actually launched since creation
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Relaxed)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight = SingleFlight::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let make = |runs: Arc<AtomicUsize>, gate: Arc<Notify>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                7
            }
        };

        let a = flight.run(make(runs.clone(), gate.clone()));
        let b = flight.run(make(runs.clone(), gate.clone()));
        let c = flight.run(make(runs.clone(), gate.clone()));
        assert!(flight.is_running());

        let joined = tokio::spawn(async move { (a.await, b.await, c.await) });
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(joined.await.unwrap(), (7, 7, 7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.launched(), 1);
        assert!(!flight.is_running());
    }

    #[tokio::test]
    async fn test_next_call_after_settle_starts_fresh() {
        let flight = SingleFlight::<u32>::new();

        assert_eq!(flight.run(|| async { 1 }).await, 1);
        assert!(flight.in_flight().is_none());
        assert_eq!(flight.run(|| async { 2 }).await, 2);
        assert_eq!(flight.launched(), 2);
    }
}

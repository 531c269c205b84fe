//! Request Coalescer
//!
//! Collapses concurrent fetches for the same key into one underlying call.
//! The first caller for a key becomes the leader and runs the fetch; later
//! callers attach to the leader's result channel.
//!
//! # Design
//!
//! - `DashMap` of key → `watch::Receiver` for the in-flight result
//! - The leader holds an [`InFlightGuard`]; dropping it removes the map entry,
//!   so the entry never outlives the fetch, even if the fetch panics or the
//!   leader's future is dropped
//! - Waiters on an abandoned fetch get `ProviderFailure` rather than hanging

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::{Error, Result};

type Outcome<T> = Option<std::result::Result<T, String>>;

/// In-flight fetch handle owned by the leader
pub struct InFlightGuard<T> {
    key: String,
    inflight: Arc<DashMap<String, watch::Receiver<Outcome<T>>>>,
    tx: watch::Sender<Outcome<T>>,
}

impl<T> InFlightGuard<T> {
    /// Publish the result to every waiter
    fn complete(&self, result: &Result<T>)
    where
        T: Clone,
    {
        let shared = match result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.to_string()),
        };
        self.tx.send_replace(Some(shared));
    }
}

impl<T> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

enum Role<T> {
    Leader(InFlightGuard<T>),
    Waiter(watch::Receiver<Outcome<T>>),
}

/// Per-process in-flight request map
pub struct Coalescer<T> {
    inflight: Arc<DashMap<String, watch::Receiver<Outcome<T>>>>,
    leaders: AtomicU64,
    waiters: AtomicU64,
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            leaders: AtomicU64::new(0),
            waiters: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key` unless one is already in flight
    ///
    /// The leader gets its own result back unchanged. Waiters get a clone of
    /// the value, or `ProviderFailure` carrying the leader's error text.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.join(key) {
            Role::Leader(guard) => {
                self.leaders.fetch_add(1, Ordering::Relaxed);
                let result = fetch().await;
                guard.complete(&result);
                result
            }
            Role::Waiter(mut rx) => {
                self.waiters.fetch_add(1, Ordering::Relaxed);
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(shared) => shared.clone(),
                    Err(_) => None,
                };
                match outcome {
                    Some(Ok(value)) => Ok(value),
                    Some(Err(reason)) => Err(Error::ProviderFailure {
                        key: key.to_string(),
                        reason,
                    }),
                    None => Err(Error::ProviderFailure {
                        key: key.to_string(),
                        reason: "in-flight fetch abandoned".into(),
                    }),
                }
            }
        }
    }

    fn join(&self, key: &str) -> Role<T> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => Role::Waiter(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Role::Leader(InFlightGuard {
                    key: key.to_string(),
                    inflight: Arc::clone(&self.inflight),
                    tx,
                })
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of keys currently being fetched
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Fetches actually issued
    pub fn leaders(&self) -> u64 {
        self.leaders.load(Ordering::Relaxed)
    }

    /// Callers that attached to an existing fetch
    pub fn waiters(&self) -> u64 {
        self.waiters.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let coalescer = Arc::new(Coalescer::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    coalescer
                        .run("author:stephen king", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok("bibliography".to_string())
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "bibliography");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.leaders(), 1);
        assert_eq!(coalescer.waiters(), 15);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_waiters_and_clears_entry() {
        let coalescer = Arc::new(Coalescer::<u32>::new());

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("title:dune", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(Error::ProviderFailure {
                            key: "title:dune".into(),
                            reason: "upstream 503".into(),
                        })
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(coalescer.is_in_flight("title:dune"));

        let waiter = coalescer.run("title:dune", || async { Ok(7) }).await;
        assert_matches!(waiter, Err(Error::ProviderFailure { reason, .. }) if reason.contains("upstream 503"));
        assert!(leader.await.unwrap().is_err());
        assert!(!coalescer.is_in_flight("title:dune"));

        // Next call starts a fresh fetch
        assert_eq!(coalescer.run("title:dune", || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_releases_waiters() {
        let coalescer = Arc::new(Coalescer::<u32>::new());

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("isbn:123", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        panic!("provider client crashed");
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = coalescer.run("isbn:123", || async { Ok(1) }).await;
        assert_matches!(waiter, Err(Error::ProviderFailure { .. }));
        assert!(leader.await.is_err());
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let coalescer = Coalescer::<u32>::new();
        let (a, b) = tokio::join!(
            coalescer.run("title:a", || async { Ok(1) }),
            coalescer.run("title:b", || async { Ok(2) }),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(coalescer.leaders(), 2);
    }
}

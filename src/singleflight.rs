//! Single-flight coordinator
//!
//! Coalesces concurrent computations by exact key: the first caller spawns
//! the work on the runtime and every caller (the initiator included) waits
//! on a broadcast of the shared outcome. At most one computation per key is
//! in flight process-wide at any instant.
//!
//! Two deliberate departures from a plain dedup map:
//!
//! - **Reentrancy**: a call chain that already holds `key` (tracked on the
//!   `Cx`) runs the computation directly instead of waiting on itself.
//!   Recursive loads, e.g. a watermark whose URL collides with the outer
//!   request, would otherwise self-deadlock.
//! - **Cancellation**: waiters race the broadcast against their own
//!   deadline. A caller that gives up leaves the spawned computation
//!   running for the remaining waiters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use crate::context::Cx;
use crate::error::{Error, Result};

type FlightMap<T> = Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>;

/// Coalescing group keyed by exact string
#[derive(Debug)]
pub struct Group<T> {
    flights: FlightMap<T>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes the flight entry when the computation ends, send or panic alike.
/// A flight that never completes would otherwise trap all future callers.
struct Unregister<T> {
    flights: FlightMap<T>,
    key: String,
}

impl<T> Unregister<T> {
    /// Take the sender out of the map; subscription happens under the same
    /// lock, so a waiter either finds the entry (and will receive) or starts
    /// a fresh flight.
    fn take(&self) -> Option<broadcast::Sender<T>> {
        self.flights.lock().expect("flight map poisoned").remove(&self.key)
    }
}

impl<T> Drop for Unregister<T> {
    fn drop(&mut self) {
        let _ = self.take();
    }
}

impl<T: Clone + Send + 'static> Group<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make` once per concurrent set of callers sharing `key`.
    ///
    /// The computation receives a context with `key` marked as held and the
    /// initiating caller's deadline baked in; its outcome is broadcast to
    /// every waiter. Waiter-side expiry yields `Error::Timeout` without
    /// cancelling the computation.
    pub async fn acquire<F, Fut>(&self, cx: &Cx, key: &str, make: F) -> Result<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if cx.holds(key) {
            // the current call chain owns this key already; dedup would
            // wait on itself
            debug!(key, "singleflight reentry");
            return Ok(make(cx.clone()).await);
        }
        let mut rx = {
            let mut flights = self.flights.lock().expect("flight map poisoned");
            match flights.get(key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    flights.insert(key.to_string(), tx);
                    let fut = make(cx.holding(key));
                    let guard = Unregister {
                        flights: Arc::clone(&self.flights),
                        key: key.to_string(),
                    };
                    tokio::spawn(async move {
                        let outcome = fut.await;
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(outcome);
                        }
                    });
                    rx
                }
            }
        };
        cx.fence(async move { rx.recv().await.map_err(|_| Error::Internal) })
            .await
    }

    /// Number of computations currently in flight
    pub fn in_flight(&self) -> usize {
        self.flights.lock().expect("flight map poisoned").len()
    }
}

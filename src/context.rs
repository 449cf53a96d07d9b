//! Request context: layered deadlines and single-flight reentrancy tags
//!
//! `Cx` is the explicit context value threaded through every gateway call.
//! Each pipeline stage derives a child context whose deadline is the minimum
//! of the parent deadline and its own budget, so expiry of an outer stage
//! always bounds the inner ones. The held-key set marks single-flight keys
//! the current call chain already owns; `Group::acquire` consults it to
//! bypass deduplication instead of deadlocking on itself.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Explicit per-request context
#[derive(Debug, Clone, Default)]
pub struct Cx {
    deadline: Option<Instant>,
    // copy-on-write: `holding` clones the set, so sibling call chains
    // never observe each other's keys
    held: Arc<HashSet<String>>,
}

impl Cx {
    /// Root context with no deadline
    pub fn root() -> Self {
        Self::default()
    }

    /// Derive a child context bounded by `timeout` from now.
    /// A `None` or zero timeout leaves the deadline unchanged.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Cx {
        let mut cx = self.clone();
        if let Some(t) = timeout {
            if !t.is_zero() {
                let stage = Instant::now() + t;
                cx.deadline = Some(match self.deadline {
                    Some(outer) => outer.min(stage),
                    None => stage,
                });
            }
        }
        cx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// True when the current call chain already acquired `key`
    pub fn holds(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// Derive a context that records `key` as held
    pub fn holding(&self, key: &str) -> Cx {
        let mut held = (*self.held).clone();
        held.insert(key.to_string());
        Cx {
            deadline: self.deadline,
            held: Arc::new(held),
        }
    }

    /// Run `fut` under this context's deadline; expiry yields `Error::Timeout`
    pub async fn fence<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            },
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_deadline_runs_to_completion() {
        let cx = Cx::root();
        let out = cx
            .fence(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, Error>(7)
            })
            .await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fence_times_out() {
        let cx = Cx::root().with_timeout(Some(Duration::from_millis(10)));
        let out: Result<()> = cx
            .fence(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(out.unwrap_err(), Error::Timeout);
    }

    #[tokio::test]
    async fn test_outer_deadline_bounds_inner() {
        let outer = Cx::root().with_timeout(Some(Duration::from_millis(10)));
        // inner stage asks for a larger budget, but the outer deadline holds
        let inner = outer.with_timeout(Some(Duration::from_secs(60)));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test]
    async fn test_zero_timeout_means_unbounded_stage() {
        let cx = Cx::root().with_timeout(Some(Duration::ZERO));
        assert!(cx.deadline().is_none());
    }

    #[test]
    fn test_held_keys_are_copy_on_write() {
        let cx = Cx::root();
        let a = cx.holding("res:a");
        let b = cx.holding("img:b");
        assert!(a.holds("res:a"));
        assert!(!a.holds("img:b"));
        assert!(b.holds("img:b"));
        assert!(!cx.holds("res:a"));
        // nesting accumulates
        let ab = a.holding("img:b");
        assert!(ab.holds("res:a") && ab.holds("img:b"));
    }
}

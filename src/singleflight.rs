//! Per-key load deduplication with bounded result memoization.
//!
//! `FlightGroup::do_call` guarantees that at most one loader runs per key at
//! any instant: concurrent callers share the in-flight execution, and callers
//! arriving within the TTL after completion get the memoized result (value or
//! error) without re-executing. This is what bounds backing-store traffic to
//! O(1) calls per key per TTL under a thundering herd.
//!
//! The loader runs on its own task, so a caller dropping its future (timeout,
//! disconnect) never cancels the shared execution; a panicking loader is
//! converted into a typed error and broadcast, so waiters cannot deadlock.
//!
//! A background sweeper ticks at TTL/2 and drops expired completed entries;
//! `do_call` also treats an expired entry as absent, so correctness does not
//! depend on sweeper timing.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::byteview::ByteView;
use crate::error::CacheError;

/// Default memoization window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

struct Call {
    notify: Notify,
    result: OnceLock<(Result<ByteView, CacheError>, Instant)>,
}

impl Call {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: OnceLock::new(),
        }
    }
}

pub struct FlightGroup {
    ttl: Duration,
    calls: Arc<Mutex<FxHashMap<String, Arc<Call>>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FlightGroup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            calls: Arc::new(Mutex::new(FxHashMap::default())),
            sweeper: Mutex::new(None),
        }
    }

    /// Executes `load` for `key`, collapsing concurrent and recent callers.
    ///
    /// Exactly one of the callers racing on a cold key becomes the leader and
    /// spawns the loader; everyone (leader included) waits on the shared
    /// completion signal and clones the shared result.
    pub async fn do_call<F, Fut>(&self, key: &str, load: F) -> Result<ByteView, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ByteView, CacheError>> + Send + 'static,
    {
        self.ensure_sweeper();

        let (call, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(existing) => match existing.result.get() {
                    Some((result, at)) if at.elapsed() < self.ttl => {
                        debug!(key, "single-flight memo hit");
                        return result.clone();
                    }
                    Some(_) => {
                        // expired memo: this caller starts a fresh execution
                        let call = Arc::new(Call::new());
                        calls.insert(key.to_string(), call.clone());
                        (call, true)
                    }
                    None => (existing.clone(), false),
                },
                None => {
                    let call = Arc::new(Call::new());
                    calls.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        if leader {
            let shared = call.clone();
            let owned_key = key.to_string();
            let loader = tokio::spawn(load());
            // The supervisor owns completion: it runs even if every caller
            // goes away, and it converts a loader panic into a typed error.
            tokio::spawn(async move {
                let result = match loader.await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::LoaderPanic(owned_key)),
                };
                let _ = shared.result.set((result, Instant::now()));
                shared.notify.notify_waiters();
            });
        }

        loop {
            let notified = call.notify.notified();
            if let Some((result, _)) = call.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Halts the sweeper and clears the memo.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.calls.lock().clear();
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let calls = self.calls.clone();
        let ttl = self.ttl;
        let tick = (ttl / 2).max(Duration::from_millis(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                calls.lock().retain(|_, call| match call.result.get() {
                    Some((_, at)) => at.elapsed() < ttl,
                    None => true,
                });
            }
        }));
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Drop for FlightGroup {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

//! In-flight request registry.
//!
//! Identical concurrent calls share one future and one [`CancelHandle`]. The map
//! only holds weak references: an entry disappears when its call settles, when
//! it is cancelled, or when every caller awaiting it has been dropped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use futures_util::{
    future::{Shared, WeakShared},
    FutureExt,
};
use reqwest::{Method, Url};

use crate::{cancel::CancelHandle, envelope::ApiResponse, errors::Error, transport::BoxFuture};

/// Settled value observed by every caller sharing a key.
pub(crate) type SharedResult = std::result::Result<Arc<ApiResponse>, Error>;

pub(crate) type SharedCall = Shared<BoxFuture<'static, SharedResult>>;

struct InFlightEntry {
    key: String,
    method: Method,
    /// Full URL without its query string.
    url: String,
    future: WeakShared<BoxFuture<'static, SharedResult>>,
    cancel: CancelHandle,
}

#[derive(Default)]
struct CacheState {
    next_id: u64,
    entries: HashMap<u64, InFlightEntry>,
    by_key: HashMap<String, u64>,
}

impl CacheState {
    fn evict(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            if self.by_key.get(&entry.key) == Some(&id) {
                self.by_key.remove(&entry.key);
            }
        }
    }
}

/// Keyed registry of in-flight calls.
#[derive(Clone, Default)]
pub struct DedupeCache {
    state: Arc<Mutex<CacheState>>,
}

/// Removes its entry when the wrapped call settles or is dropped.
struct EvictGuard {
    state: Weak<Mutex<CacheState>>,
    id: u64,
}

impl Drop for EvictGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).evict(self.id);
        }
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn strip_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the live call for `key` when `dedupe` is set, otherwise start `work`.
    ///
    /// Lookup and insertion happen in one critical section, so two concurrent callers
    /// can never both miss. `work` receives the new entry's cancel handle and is not
    /// polled until the returned future is.
    pub(crate) fn join_or_start<F>(
        &self,
        key: String,
        method: Method,
        url: &Url,
        dedupe: bool,
        work: F,
    ) -> (SharedCall, CancelHandle, bool)
    where
        F: FnOnce(CancelHandle) -> BoxFuture<'static, SharedResult>,
    {
        let mut state = lock(&self.state);
        if dedupe {
            if let Some(id) = state.by_key.get(&key).copied() {
                let live = state.entries.get(&id).and_then(|entry| {
                    entry
                        .future
                        .upgrade()
                        .map(|future| (future, entry.cancel.clone()))
                });
                if let Some((future, cancel)) = live {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(key = %key, "joined in-flight request");
                    return (future, cancel, true);
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let cancel = CancelHandle::new();
        let guard = EvictGuard {
            state: Arc::downgrade(&self.state),
            id,
        };
        let inner = work(cancel.clone());
        let future: BoxFuture<'static, SharedResult> = Box::pin(async move {
            let _guard = guard;
            inner.await
        });
        let shared = future.shared();
        if let Some(weak) = shared.downgrade() {
            // Opted-out calls stay cancellable but are never joined.
            if dedupe {
                state.by_key.insert(key.clone(), id);
            }
            state.entries.insert(
                id,
                InFlightEntry {
                    key,
                    method,
                    url: strip_query(url),
                    future: weak,
                    cancel: cancel.clone(),
                },
            );
        }
        (shared, cancel, false)
    }

    /// Cancel every live call to `url` (query ignored) with `method`.
    /// Returns how many calls were cancelled.
    pub fn cancel(&self, url: &Url, method: &Method) -> usize {
        let target = strip_query(url);
        let handles: Vec<CancelHandle> = {
            let mut state = lock(&self.state);
            let ids: Vec<u64> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.method == *method && entry.url == target)
                .map(|(id, _)| *id)
                .collect();
            let mut handles = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = state.entries.get(&id) {
                    handles.push(entry.cancel.clone());
                }
                state.evict(id);
            }
            handles
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Cancel every live call.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CancelHandle> = {
            let mut state = lock(&self.state);
            state.by_key.clear();
            state.entries.drain().map(|(_, entry)| entry.cancel).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DedupeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeCache")
            .field("in_flight", &self.len())
            .finish()
    }
}

use crate::path::{Path, PathBuf};
use fnv::FnvHashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cache invalidation handler. Handlers may suspend; they run detached on
/// the receiving side's executor.
pub type InvalidationCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Names one registered callback so it can be deregistered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallbackHandle {
    path: PathBuf,
    id: u64,
}

/// Process-local registry of cache invalidation callbacks, keyed by path.
///
/// Callbacks are one-shot by convention: handlers deregister themselves after
/// their first fire.
#[derive(Default)]
pub struct InvalidationCallbackDirectory {
    callbacks: Mutex<FnvHashMap<PathBuf, FnvHashMap<u64, InvalidationCallback>>>,
    next_id: AtomicU64,
}

impl InvalidationCallbackDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: PathBuf, callback: InvalidationCallback) -> CallbackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .entry(path.clone())
            .or_default()
            .insert(id, callback);
        CallbackHandle { path, id }
    }

    pub fn deregister(&self, handle: &CallbackHandle) {
        let mut callbacks = self.callbacks.lock();
        if let Some(for_path) = callbacks.get_mut(&handle.path) {
            for_path.remove(&handle.id);
            if for_path.is_empty() {
                callbacks.remove(&handle.path);
            }
        }
    }

    /// Fires every callback registered for `path`, concurrently and detached.
    pub fn invoke(&self, path: Path<'_>) {
        let fired: Vec<InvalidationCallback> = {
            let callbacks = self.callbacks.lock();
            match callbacks.get(&path.to_owned()) {
                Some(for_path) => for_path.values().cloned().collect(),
                None => return,
            }
        };
        tracing::debug!("invalidating {} callback(s) for {}", fired.len(), path);
        for callback in fired {
            async_global_executor::spawn(callback()).detach();
        }
    }
}

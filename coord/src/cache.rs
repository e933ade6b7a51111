use crate::entry::StoredEntry;
use crate::error::Result;
use crate::id::SessionId;
use crate::invalidation::{CallbackHandle, InvalidationCallback, InvalidationCallbackDirectory};
use crate::lock::LockManager;
use crate::path::{Path, PathBuf};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct CacheLine {
    entry: StoredEntry,
    registration: CallbackHandle,
}

/// Read-lock-backed entry cache.
///
/// A cached line is coherent because the session holds a read lock on the
/// entry: any writer must invalidate the holder before it can take the write
/// lock. The installed invalidation handler releases the read lock and drops
/// the line, after which the next `get` re-enters the acquisition path.
pub struct CacheManager {
    session: SessionId,
    locks: Arc<LockManager>,
    invalidations: Arc<InvalidationCallbackDirectory>,
    lines: Arc<Mutex<FnvHashMap<PathBuf, CacheLine>>>,
}

fn invalidation_handler(
    session: SessionId,
    path: PathBuf,
    lines: Arc<Mutex<FnvHashMap<PathBuf, CacheLine>>>,
    locks: Arc<LockManager>,
    invalidations: Weak<InvalidationCallbackDirectory>,
) -> InvalidationCallback {
    Arc::new(move || {
        let session = session.clone();
        let path = path.clone();
        let lines = lines.clone();
        let locks = locks.clone();
        let invalidations = invalidations.clone();
        Box::pin(async move {
            let line = lines.lock().remove(&path);
            if let Some(line) = line {
                if let Some(invalidations) = invalidations.upgrade() {
                    invalidations.deregister(&line.registration);
                }
                if let Err(err) = locks.release_read_lock(&session, path.as_path()).await {
                    tracing::debug!("releasing invalidated line {} failed: {}", path, err);
                }
            }
        })
    })
}

impl CacheManager {
    pub fn new(
        session: SessionId,
        locks: Arc<LockManager>,
        invalidations: Arc<InvalidationCallbackDirectory>,
    ) -> Self {
        Self {
            session,
            locks,
            invalidations,
            lines: Arc::new(Mutex::new(FnvHashMap::default())),
        }
    }

    /// Returns the entry at `path`, from the cache when a coherent line is
    /// held, otherwise by acquiring the read lock and installing a line.
    pub async fn get(&self, path: Path<'_>) -> Result<StoredEntry> {
        let owned = path.to_owned();
        if let Some(line) = self.lines.lock().get(&owned) {
            return Ok(line.entry.clone());
        }
        let entry = self.locks.acquire_read_lock(&self.session, path).await?;
        let handler = invalidation_handler(
            self.session.clone(),
            owned.clone(),
            self.lines.clone(),
            self.locks.clone(),
            Arc::downgrade(&self.invalidations),
        );
        let registration = self.invalidations.register(owned.clone(), handler);
        let mut lines = self.lines.lock();
        if lines.contains_key(&owned) {
            // A racing get installed a line first; one handler per path is
            // enough.
            drop(lines);
            self.invalidations.deregister(&registration);
        } else {
            lines.insert(
                owned,
                CacheLine {
                    entry: entry.clone(),
                    registration,
                },
            );
        }
        Ok(entry)
    }

    /// Drops the line for `path` without releasing the read lock. Used by
    /// the session's own write path, where the write-lock acquisition absorbs
    /// the read lock the line was backed by.
    pub fn evict(&self, path: Path<'_>) {
        let line = self.lines.lock().remove(&path.to_owned());
        if let Some(line) = line {
            self.invalidations.deregister(&line.registration);
        }
    }
}

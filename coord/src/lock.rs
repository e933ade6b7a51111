use crate::entry::StoredEntry;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::id::SessionId;
use crate::path::Path;
use crate::session::SessionManager;
use crate::store::{exchanged, EntryStore};
use crate::wait::WaitManager;
use std::sync::Arc;

/// Acquires and releases per-entry read and write locks.
///
/// Lock state lives in the stored entry; every transition is a
/// compare-exchange and conflicts are retried after rereading. Waiting uses
/// the wait manager's register-reread-suspend discipline, so lost
/// notifications cost latency only.
pub struct LockManager {
    store: Arc<dyn EntryStore>,
    sessions: Arc<SessionManager>,
    waits: Arc<WaitManager>,
    exchange: Arc<dyn Exchange>,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn EntryStore>,
        sessions: Arc<SessionManager>,
        waits: Arc<WaitManager>,
        exchange: Arc<dyn Exchange>,
    ) -> Self {
        Self {
            store,
            sessions,
            waits,
            exchange,
        }
    }

    /// Commits a lock transition. A transition that leaves a stub or
    /// tombstone without holders removes the record instead.
    async fn commit(&self, new: StoredEntry, expected: StoredEntry) -> Result<bool> {
        if new.is_reapable() {
            let observed = self.store.compare_exchange(None, Some(expected)).await?;
            Ok(observed.is_none())
        } else {
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(expected))
                .await?;
            Ok(exchanged(&observed, &Some(new)))
        }
    }

    /// Acquires a shared lock on `path` for `session`, creating the entry
    /// record if the path has never been written. Returns the entry as
    /// observed at the acquisition point.
    pub async fn acquire_read_lock(
        &self,
        session: &SessionId,
        path: Path<'_>,
    ) -> Result<StoredEntry> {
        self.sessions.add_entry(session, path).await?;
        loop {
            let entry = match self.store.get(path).await? {
                None => {
                    let new = StoredEntry::created_for_read(path.to_owned(), session.clone());
                    let observed = self
                        .store
                        .compare_exchange(Some(new.clone()), None)
                        .await?;
                    if exchanged(&observed, &Some(new.clone())) {
                        return Ok(new);
                    }
                    continue;
                }
                Some(entry) => entry,
            };
            if entry.is_marked_as_deleted() && !entry.holds_read_lock(session) {
                if entry.ephemeral_owner() != Some(session) {
                    self.forget(session, path).await;
                }
                return Err(Error::EntryNotFound(path.to_owned()));
            }
            if let Some(holder) = entry.write_lock() {
                if !entry.holds_write_lock(session) {
                    let holder = holder.clone();
                    self.waits.await_write_release(path, &holder).await?;
                    continue;
                }
            }
            if entry.holds_read_lock(session) {
                return Ok(entry);
            }
            let new = entry.with_read_lock(session);
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(entry))
                .await?;
            if exchanged(&observed, &Some(new.clone())) {
                return Ok(new);
            }
        }
    }

    /// Acquires the exclusive lock on `path` for `session`, creating the
    /// entry record if the path has never been written. Foreign readers are
    /// sent cache invalidations and waited out; a tombstone is reaped before
    /// the lock is taken on a fresh record.
    pub async fn acquire_write_lock(
        &self,
        session: &SessionId,
        path: Path<'_>,
    ) -> Result<StoredEntry> {
        self.sessions.add_entry(session, path).await?;
        loop {
            let entry = match self.store.get(path).await? {
                None => {
                    let new = StoredEntry::created_for_write(path.to_owned(), session.clone());
                    let observed = self
                        .store
                        .compare_exchange(Some(new.clone()), None)
                        .await?;
                    if exchanged(&observed, &Some(new.clone())) {
                        return Ok(new);
                    }
                    continue;
                }
                Some(entry) => entry,
            };
            if entry.holds_write_lock(session) {
                return Ok(entry);
            }
            if entry.is_marked_as_deleted() {
                if let Some(holder) = entry.write_lock() {
                    let holder = holder.clone();
                    self.waits.await_write_release(path, &holder).await?;
                } else if entry.holds_read_lock(session) {
                    // Shed the own read lock in place; going through the full
                    // release would drop the path from the session's cleanup
                    // set while this acquisition still needs it.
                    let new = entry.without_read_lock(session);
                    if self.commit(new, entry).await? {
                        if let Err(err) = self
                            .exchange
                            .notify_read_release(&path.to_owned(), session)
                            .await
                        {
                            tracing::debug!(
                                "read release notification for {} failed: {}",
                                path,
                                err
                            );
                        }
                    }
                } else if entry.read_locks().is_empty() {
                    self.store.compare_exchange(None, Some(entry)).await?;
                } else {
                    self.invalidate_and_await_readers(session, &entry, path).await?;
                }
                continue;
            }
            if let Some(holder) = entry.write_lock() {
                let holder = holder.clone();
                self.waits.await_write_release(path, &holder).await?;
                // Writer handoff: make stale reader caches drop out before
                // competing for the lock again.
                if let Some(current) = self.store.get(path).await? {
                    for reader in current.read_locks() {
                        if reader != session {
                            if let Err(err) = self
                                .exchange
                                .invalidate_cache(&path.to_owned(), reader)
                                .await
                            {
                                tracing::debug!("invalidate {} failed: {}", path, err);
                            }
                        }
                    }
                }
                continue;
            }
            if entry.read_locks_subset_of(session) {
                let new = entry.with_write_lock(session);
                let observed = self
                    .store
                    .compare_exchange(Some(new.clone()), Some(entry))
                    .await?;
                if exchanged(&observed, &Some(new.clone())) {
                    return Ok(new);
                }
                continue;
            }
            self.invalidate_and_await_readers(session, &entry, path).await?;
        }
    }

    async fn invalidate_and_await_readers(
        &self,
        session: &SessionId,
        entry: &StoredEntry,
        path: Path<'_>,
    ) -> Result<()> {
        let readers: Vec<SessionId> = entry
            .read_locks()
            .iter()
            .filter(|reader| *reader != session)
            .cloned()
            .collect();
        for reader in &readers {
            if let Err(err) = self.exchange.invalidate_cache(&path.to_owned(), reader).await {
                tracing::debug!("invalidate {} for {:?} failed: {}", path, reader, err);
            }
        }
        for reader in &readers {
            self.waits.await_read_release(path, reader).await?;
        }
        Ok(())
    }

    /// Releases `session`'s read lock on `path`, notifies peers, and drops
    /// the entry from the session's cleanup set unless the session still
    /// owns it ephemerally or holds the write lock.
    pub async fn release_read_lock(&self, session: &SessionId, path: Path<'_>) -> Result<()> {
        let mut released = false;
        let mut keep_tracking = false;
        loop {
            let entry = match self.store.get(path).await? {
                None => break,
                Some(entry) => entry,
            };
            if !entry.holds_read_lock(session) {
                keep_tracking = entry.ephemeral_owner() == Some(session)
                    || entry.holds_write_lock(session);
                break;
            }
            let new = entry.without_read_lock(session);
            let keep = new.ephemeral_owner() == Some(session) || new.holds_write_lock(session);
            if self.commit(new, entry).await? {
                released = true;
                keep_tracking = keep;
                break;
            }
        }
        if released {
            if let Err(err) = self
                .exchange
                .notify_read_release(&path.to_owned(), session)
                .await
            {
                tracing::debug!("read release notification for {} failed: {}", path, err);
            }
        }
        if !keep_tracking {
            self.forget(session, path).await;
        }
        Ok(())
    }

    /// Releases `session`'s write lock on `path`; reaps the record if the
    /// release leaves a tombstone or stub without holders.
    pub async fn release_write_lock(&self, session: &SessionId, path: Path<'_>) -> Result<()> {
        let mut released = false;
        let mut keep_tracking = false;
        loop {
            let entry = match self.store.get(path).await? {
                None => break,
                Some(entry) => entry,
            };
            if !entry.holds_write_lock(session) {
                keep_tracking = entry.ephemeral_owner() == Some(session)
                    || entry.holds_read_lock(session);
                break;
            }
            let new = entry.without_write_lock();
            let keep = new.ephemeral_owner() == Some(session) || new.holds_read_lock(session);
            if self.commit(new, entry).await? {
                released = true;
                keep_tracking = keep;
                break;
            }
        }
        if released {
            if let Err(err) = self
                .exchange
                .notify_write_release(&path.to_owned(), session)
                .await
            {
                tracing::debug!("write release notification for {} failed: {}", path, err);
            }
        }
        if !keep_tracking {
            self.forget(session, path).await;
        }
        Ok(())
    }

    /// Releases whatever lock `owner` holds on `path` on its behalf. Used by
    /// cleaners reclaiming an ended session; the ended record itself is not
    /// touched.
    pub async fn release_locks_of(&self, owner: &SessionId, path: Path<'_>) -> Result<()> {
        let mut released_read = false;
        let mut released_write = false;
        loop {
            let entry = match self.store.get(path).await? {
                None => break,
                Some(entry) => entry,
            };
            let had_read = entry.holds_read_lock(owner);
            let had_write = entry.holds_write_lock(owner);
            if !had_read && !had_write {
                break;
            }
            let new = entry.without_locks_of(owner);
            if self.commit(new, entry).await? {
                released_read = had_read;
                released_write = had_write;
                break;
            }
        }
        if released_read {
            if let Err(err) = self.exchange.notify_read_release(&path.to_owned(), owner).await {
                tracing::debug!("read release notification for {} failed: {}", path, err);
            }
        }
        if released_write {
            if let Err(err) = self
                .exchange
                .notify_write_release(&path.to_owned(), owner)
                .await
            {
                tracing::debug!("write release notification for {} failed: {}", path, err);
            }
        }
        Ok(())
    }

    async fn forget(&self, session: &SessionId, path: Path<'_>) {
        match self.sessions.remove_entry(session, path).await {
            Ok(()) => {}
            Err(Error::SessionEnded) => {}
            Err(err) => tracing::debug!("dropping {} from session {:?}: {}", path, session, err),
        }
    }
}

use crate::entry::StoredSession;
use crate::error::{Error, Result};
use crate::id::SessionId;
use crate::path::Path;
use crate::store::{exchanged, SessionStore};
use fnv::{FnvHashMap, FnvHashSet};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch; the time base for leases.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
struct EndWaiters {
    /// Sessions this process has observed as ended.
    ended: FnvHashSet<SessionId>,
    by_session: FnvHashMap<SessionId, Vec<oneshot::Sender<()>>>,
    /// Ends observed while nobody was waiting on `await_any_end`.
    any_queue: VecDeque<SessionId>,
    any_waiters: Vec<oneshot::Sender<SessionId>>,
}

/// Tracks session liveness and ownership over the session store.
///
/// Any participant observing an expired lease may end the session by
/// compare-exchange; the end-of-session suspension primitives are process
/// local and are fed both by local `end` calls and by the expiration scan.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    waiters: Mutex<EndWaiters>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            waiters: Mutex::new(EndWaiters::default()),
        }
    }

    /// Creates the session record. Succeeds exactly once per id.
    pub async fn try_begin(&self, id: &SessionId, lease_end: u64) -> Result<bool> {
        let new = StoredSession::new(id.clone(), lease_end);
        let observed = self.store.compare_exchange(Some(new.clone()), None).await?;
        Ok(exchanged(&observed, &Some(new)))
    }

    /// Advances the session lease. The lease end never moves backwards.
    pub async fn update_lease(&self, id: &SessionId, lease_end: u64) -> Result<()> {
        loop {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or(Error::UnknownSession)?;
            if current.is_ended() {
                return Err(Error::SessionEnded);
            }
            let new = current.with_lease(lease_end);
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(current))
                .await?;
            if exchanged(&observed, &Some(new)) {
                return Ok(());
            }
        }
    }

    /// Records a path the session must clean up. Idempotent.
    pub async fn add_entry(&self, id: &SessionId, path: Path<'_>) -> Result<()> {
        let path = path.to_owned();
        loop {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or(Error::UnknownSession)?;
            if current.is_ended() {
                return Err(Error::SessionEnded);
            }
            if current.has_entry(&path) {
                return Ok(());
            }
            let new = current.with_entry(path.clone());
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(current))
                .await?;
            if exchanged(&observed, &Some(new)) {
                return Ok(());
            }
        }
    }

    /// Forgets a path. Removing an unknown path is a no-op.
    pub async fn remove_entry(&self, id: &SessionId, path: Path<'_>) -> Result<()> {
        let path = path.to_owned();
        loop {
            let current = match self.store.get(id).await? {
                Some(current) => current,
                None => return Ok(()),
            };
            if current.is_ended() {
                return Err(Error::SessionEnded);
            }
            if !current.has_entry(&path) {
                return Ok(());
            }
            let new = current.without_entry(&path);
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(current))
                .await?;
            if exchanged(&observed, &Some(new)) {
                return Ok(());
            }
        }
    }

    /// The paths currently recorded for cleanup.
    pub async fn entries(&self, id: &SessionId) -> Result<Vec<crate::path::PathBuf>> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or(Error::UnknownSession)?;
        Ok(current.entry_paths().to_vec())
    }

    /// Ends the session. Idempotent; wakes every end-of-session waiter.
    pub async fn end(&self, id: &SessionId) -> Result<()> {
        loop {
            let current = match self.store.get(id).await? {
                // Already cleaned up and removed.
                None => break,
                Some(current) => current,
            };
            if current.is_ended() {
                break;
            }
            let new = current.ended();
            let observed = self
                .store
                .compare_exchange(Some(new.clone()), Some(current))
                .await?;
            if exchanged(&observed, &Some(new)) {
                break;
            }
        }
        self.wake(id);
        Ok(())
    }

    /// True iff the record exists, is not ended, and the lease has not run
    /// out yet.
    pub async fn is_live(&self, id: &SessionId) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|s| s.is_live(now_millis()))
            .unwrap_or(false))
    }

    /// The raw record, for cleaners.
    pub(crate) async fn record(&self, id: &SessionId) -> Result<Option<StoredSession>> {
        self.store.get(id).await
    }

    /// Removes a fully cleaned-up ended record. Racing removals are no-ops.
    pub(crate) async fn remove_record(&self, record: StoredSession) -> Result<()> {
        self.store.compare_exchange(None, Some(record)).await?;
        Ok(())
    }

    /// Sessions that have not ended, i.e. the peers exchange messages fan
    /// out to.
    pub async fn known_sessions(&self) -> Result<Vec<SessionId>> {
        Ok(self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.is_ended())
            .map(|s| s.id().clone())
            .collect())
    }

    /// One expiration pass: ends every session whose lease has run out and
    /// propagates ends observed from other processes to local waiters.
    pub async fn scan(&self, now: u64) -> Result<()> {
        for session in self.store.list_sessions().await? {
            if session.is_ended() {
                self.wake(session.id());
                continue;
            }
            if session.lease_end() <= now {
                tracing::debug!("session {:?} lease expired, ending", session.id());
                let id = session.id().clone();
                let new = session.ended();
                let observed = self
                    .store
                    .compare_exchange(Some(new.clone()), Some(session))
                    .await?;
                if exchanged(&observed, &Some(new)) {
                    self.wake(&id);
                }
            }
        }
        Ok(())
    }

    /// Resolves once the session has been observed as ended by this process.
    pub fn await_end(&self, id: &SessionId) -> impl Future<Output = ()> + Send + 'static {
        let rx = {
            let mut waiters = self.waiters.lock();
            if waiters.ended.contains(id) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                waiters.by_session.entry(id.clone()).or_default().push(tx);
                Some(rx)
            }
        };
        async move {
            if let Some(rx) = rx {
                rx.await.ok();
            }
        }
    }

    /// Resolves with the next session observed as ended. Returns `None` when
    /// the manager is torn down under the waiter.
    pub fn await_any_end(&self) -> impl Future<Output = Option<SessionId>> + Send + 'static {
        let (queued, rx) = {
            let mut waiters = self.waiters.lock();
            match waiters.any_queue.pop_front() {
                Some(id) => (Some(id), None),
                None => {
                    let (tx, rx) = oneshot::channel();
                    waiters.any_waiters.push(tx);
                    (None, Some(rx))
                }
            }
        };
        async move {
            match (queued, rx) {
                (Some(id), _) => Some(id),
                (None, Some(rx)) => rx.await.ok(),
                (None, None) => None,
            }
        }
    }

    fn wake(&self, id: &SessionId) {
        let mut waiters = self.waiters.lock();
        let first = waiters.ended.insert(id.clone());
        if let Some(txs) = waiters.by_session.remove(id) {
            for tx in txs {
                tx.send(()).ok();
            }
        }
        if first {
            if waiters.any_waiters.is_empty() {
                waiters.any_queue.push_back(id.clone());
            } else {
                for tx in waiters.any_waiters.drain(..) {
                    tx.send(id.clone()).ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathBuf;
    use crate::store::SledSessionStore;

    fn sid(n: u8) -> SessionId {
        SessionId::new([n; 16], "local")
    }

    fn path(s: &str) -> PathBuf {
        PathBuf::parse(s).unwrap()
    }

    fn manager() -> SessionManager {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SessionManager::new(Arc::new(SledSessionStore::new(&db).unwrap()))
    }

    #[async_std::test]
    async fn begin_succeeds_exactly_once() {
        let manager = manager();
        assert!(manager.try_begin(&sid(1), u64::MAX).await.unwrap());
        assert!(!manager.try_begin(&sid(1), u64::MAX).await.unwrap());
        assert!(manager.is_live(&sid(1)).await.unwrap());
    }

    #[async_std::test]
    async fn lease_is_monotonic() {
        let manager = manager();
        manager.try_begin(&sid(1), 100).await.unwrap();
        manager.update_lease(&sid(1), 50).await.unwrap();
        let record = manager.record(&sid(1)).await.unwrap().unwrap();
        assert_eq!(record.lease_end(), 100);
        manager.update_lease(&sid(1), 200).await.unwrap();
        let record = manager.record(&sid(1)).await.unwrap().unwrap();
        assert_eq!(record.lease_end(), 200);
        assert!(matches!(
            manager.update_lease(&sid(2), 100).await,
            Err(Error::UnknownSession)
        ));
    }

    #[async_std::test]
    async fn entry_tracking_is_idempotent() {
        let manager = manager();
        manager.try_begin(&sid(1), u64::MAX).await.unwrap();
        manager.add_entry(&sid(1), path("/a").as_path()).await.unwrap();
        manager.add_entry(&sid(1), path("/a").as_path()).await.unwrap();
        assert_eq!(manager.entries(&sid(1)).await.unwrap(), vec![path("/a")]);
        manager
            .remove_entry(&sid(1), path("/b").as_path())
            .await
            .unwrap();
        manager
            .remove_entry(&sid(1), path("/a").as_path())
            .await
            .unwrap();
        manager
            .remove_entry(&sid(1), path("/a").as_path())
            .await
            .unwrap();
        assert!(manager.entries(&sid(1)).await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn end_is_terminal_and_idempotent() {
        let manager = manager();
        manager.try_begin(&sid(1), u64::MAX).await.unwrap();
        manager.end(&sid(1)).await.unwrap();
        manager.end(&sid(1)).await.unwrap();
        assert!(!manager.is_live(&sid(1)).await.unwrap());
        assert!(matches!(
            manager.update_lease(&sid(1), u64::MAX).await,
            Err(Error::SessionEnded)
        ));
        assert!(matches!(
            manager.add_entry(&sid(1), path("/a").as_path()).await,
            Err(Error::SessionEnded)
        ));
    }

    #[async_std::test]
    async fn end_wakes_waiters() {
        let manager = manager();
        manager.try_begin(&sid(1), u64::MAX).await.unwrap();
        let end = manager.await_end(&sid(1));
        let any = manager.await_any_end();
        manager.end(&sid(1)).await.unwrap();
        end.await;
        assert_eq!(any.await, Some(sid(1)));
        // Registered after the fact: resolves immediately.
        manager.await_end(&sid(1)).await;
    }

    #[async_std::test]
    async fn queued_end_is_not_lost() {
        let manager = manager();
        manager.try_begin(&sid(1), u64::MAX).await.unwrap();
        manager.end(&sid(1)).await.unwrap();
        assert_eq!(manager.await_any_end().await, Some(sid(1)));
    }

    #[async_std::test]
    async fn scan_ends_expired_sessions() {
        let manager = manager();
        manager.try_begin(&sid(1), 10).await.unwrap();
        manager.try_begin(&sid(2), u64::MAX).await.unwrap();
        manager.scan(100).await.unwrap();
        assert!(!manager.is_live(&sid(1)).await.unwrap());
        assert!(manager.is_live(&sid(2)).await.unwrap());
        assert_eq!(manager.await_any_end().await, Some(sid(1)));
        assert_eq!(manager.known_sessions().await.unwrap(), vec![sid(2)]);
    }
}

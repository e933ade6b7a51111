use crate::cache::CacheManager;
use crate::entry::StoredEntry;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeManager};
use crate::id::{Address, SessionId};
use crate::invalidation::InvalidationCallbackDirectory;
use crate::lock::LockManager;
use crate::path::{Path, PathBuf};
use crate::session::{now_millis, SessionManager};
use crate::store::{exchanged, EntryStore, SessionStore};
use crate::transport::Multiplexer;
use crate::wait::{LockWaitDirectory, WaitManager};
use futures::future::BoxFuture;
use futures_timer::Delay;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Tunables of one coordination participant.
#[derive(Clone, Copy, Debug)]
pub struct CoordinationConfig {
    /// How far each renewal pushes the session lease into the future. The
    /// renewal task runs at a quarter of this.
    pub lease_length: Duration,
    /// Interval of the expiration scan that ends sessions with run-out
    /// leases.
    pub scan_interval: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lease_length: Duration::from_secs(30),
            scan_interval: Duration::from_secs(2),
        }
    }
}

impl CoordinationConfig {
    fn lease_end(&self, now: u64) -> u64 {
        now + self.lease_length.as_millis() as u64
    }
}

/// Lifetime of a created entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryCreationMode {
    /// The entry outlives its creator.
    Default,
    /// The entry is removed when the creating session ends.
    Ephemeral,
}

/// An entry as returned to application code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    path: PathBuf,
    value: Vec<u8>,
    version: u64,
    is_ephemeral: bool,
}

impl Entry {
    fn from_stored(stored: &StoredEntry) -> Self {
        Self {
            path: stored.path().clone(),
            value: stored.value().to_vec(),
            version: stored.version(),
            is_ephemeral: stored.ephemeral_owner().is_some(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The optimistic token to pass as `expected_version` to `set_value` or
    /// `delete`.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_ephemeral(&self) -> bool {
        self.is_ephemeral
    }
}

/// Reclaims what an ended session left behind: its ephemeral entries are
/// removed, its locks released. Idempotent across racing cleaners; every
/// live participant runs one.
struct SessionCleaner {
    sessions: Arc<SessionManager>,
    entries: Arc<dyn EntryStore>,
    locks: Arc<LockManager>,
    exchange: Arc<dyn Exchange>,
}

impl SessionCleaner {
    async fn clean(&self, ended: &SessionId) -> Result<()> {
        let record = match self.sessions.record(ended).await? {
            Some(record) => record,
            None => return Ok(()),
        };
        if !record.is_ended() {
            return Ok(());
        }
        for path in record.entry_paths() {
            self.clean_entry(ended, path.as_path()).await?;
        }
        self.sessions.remove_record(record).await?;
        Ok(())
    }

    async fn clean_entry(&self, ended: &SessionId, path: Path<'_>) -> Result<()> {
        loop {
            let entry = match self.entries.get(path).await? {
                None => return Ok(()),
                Some(entry) => entry,
            };
            if entry.ephemeral_owner() == Some(ended) {
                for reader in entry.read_locks() {
                    if reader != ended {
                        if let Err(err) =
                            self.exchange.invalidate_cache(&path.to_owned(), reader).await
                        {
                            tracing::debug!("invalidate {} failed: {}", path, err);
                        }
                    }
                }
                let observed = self.entries.compare_exchange(None, Some(entry)).await?;
                if observed.is_none() {
                    tracing::debug!("removed ephemeral entry {} of {:?}", path, ended);
                    // Wake waiters of either kind; the entry is gone.
                    if let Err(err) = self
                        .exchange
                        .notify_write_release(&path.to_owned(), ended)
                        .await
                    {
                        tracing::debug!("release notification for {} failed: {}", path, err);
                    }
                    if let Err(err) = self
                        .exchange
                        .notify_read_release(&path.to_owned(), ended)
                        .await
                    {
                        tracing::debug!("release notification for {} failed: {}", path, err);
                    }
                    return Ok(());
                }
                continue;
            }
            return self.locks.release_locks_of(ended, path).await;
        }
    }
}

/// The coordination facade: a hierarchical, durable namespace of entries with
/// per-entry read/write locks, ephemeral lifetimes, and cache-coherent reads,
/// shared by any number of sessions over a common backing store.
///
/// One instance represents one session. Construction begins the session and
/// spawns the background tasks (lease renewal, expiration scan, cleanup);
/// [`CoordinationManager::shutdown`] ends the session gracefully.
pub struct CoordinationManager {
    session: SessionId,
    config: CoordinationConfig,
    entries: Arc<dyn EntryStore>,
    sessions: Arc<SessionManager>,
    locks: Arc<LockManager>,
    cache: CacheManager,
    exchange: Arc<dyn Exchange>,
    tasks: Mutex<Vec<async_global_executor::Task<()>>>,
}

impl CoordinationManager {
    /// Begins a session over the given stores and transport and starts the
    /// background tasks.
    pub async fn init<A: Address>(
        entries: Arc<dyn EntryStore>,
        session_store: Arc<dyn SessionStore>,
        multiplexer: &dyn Multiplexer<A>,
        config: CoordinationConfig,
    ) -> Result<Arc<Self>> {
        let sessions = Arc::new(SessionManager::new(session_store));
        let mut session = SessionId::generate(&multiplexer.local_address());
        while !sessions
            .try_begin(&session, config.lease_end(now_millis()))
            .await?
        {
            session = SessionId::generate(&multiplexer.local_address());
        }
        tracing::debug!("session {:?} began", session);

        let wait_directory = Arc::new(LockWaitDirectory::new());
        let invalidations = Arc::new(InvalidationCallbackDirectory::new());
        let exchange: Arc<dyn Exchange> = ExchangeManager::new(
            session.clone(),
            multiplexer,
            wait_directory.clone(),
            invalidations.clone(),
            sessions.clone(),
        )?;
        let waits = Arc::new(WaitManager::new(
            entries.clone(),
            wait_directory,
            sessions.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            entries.clone(),
            sessions.clone(),
            waits,
            exchange.clone(),
        ));
        let cache = CacheManager::new(session.clone(), locks.clone(), invalidations);

        let me = Arc::new(Self {
            session,
            config,
            entries,
            sessions,
            locks,
            cache,
            exchange,
            tasks: Mutex::new(Vec::new()),
        });
        me.spawn_background_tasks();
        Ok(me)
    }

    /// The local session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    fn cleaner(&self) -> SessionCleaner {
        SessionCleaner {
            sessions: self.sessions.clone(),
            entries: self.entries.clone(),
            locks: self.locks.clone(),
            exchange: self.exchange.clone(),
        }
    }

    fn spawn_background_tasks(&self) {
        let renewal = {
            let sessions = self.sessions.clone();
            let session = self.session.clone();
            let config = self.config;
            async_global_executor::spawn(async move {
                let interval = config.lease_length / 4;
                loop {
                    Delay::new(interval).await;
                    match sessions
                        .update_lease(&session, config.lease_end(now_millis()))
                        .await
                    {
                        Ok(()) => {}
                        Err(Error::SessionEnded) | Err(Error::UnknownSession) => break,
                        Err(err) => tracing::warn!("lease renewal failed: {}", err),
                    }
                }
            })
        };
        let scan = {
            let sessions = self.sessions.clone();
            let interval = self.config.scan_interval;
            async_global_executor::spawn(async move {
                loop {
                    Delay::new(interval).await;
                    if let Err(err) = sessions.scan(now_millis()).await {
                        tracing::warn!("expiration scan failed: {}", err);
                    }
                }
            })
        };
        let cleanup = {
            let cleaner = self.cleaner();
            async_global_executor::spawn(async move {
                while let Some(ended) = cleaner.sessions.await_any_end().await {
                    if let Err(err) = cleaner.clean(&ended).await {
                        tracing::warn!("cleanup of session {:?} failed: {}", ended, err);
                    }
                }
            })
        };
        self.tasks.lock().extend([renewal, scan, cleanup]);
    }

    /// Ends the local session gracefully: stops the background tasks, marks
    /// the session ended, and reclaims its entries inline.
    pub async fn shutdown(&self) -> Result<()> {
        self.tasks.lock().clear();
        self.sessions.end(&self.session).await?;
        self.cleaner().clean(&self.session).await
    }

    /// Provisions every missing ancestor of `path` as an empty entry,
    /// outermost first. The root is the empty sequence, not an entry, and is
    /// never provisioned.
    async fn ensure_ancestors(&self, path: Path<'_>) -> Result<()> {
        let ancestors: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .filter(|ancestor| !ancestor.is_root())
            .map(|a| a.to_owned())
            .collect();
        for ancestor in ancestors.into_iter().rev() {
            match self.entries.get(ancestor.as_path()).await? {
                Some(entry) if entry.exists() => continue,
                _ => {}
            }
            self.create_if_absent(ancestor.as_path(), Vec::new(), EntryCreationMode::Default)
                .await?;
        }
        Ok(())
    }

    /// Creates the entry under a write lock iff it does not exist yet.
    /// Returns `None` when it already did.
    async fn create_if_absent(
        &self,
        path: Path<'_>,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Option<Entry>> {
        let locked = self.locks.acquire_write_lock(&self.session, path).await?;
        let result = self.initialize_locked(locked, value, mode).await;
        self.locks.release_write_lock(&self.session, path).await?;
        self.cache.evict(path);
        result
    }

    async fn initialize_locked(
        &self,
        mut entry: StoredEntry,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Option<Entry>> {
        loop {
            if entry.is_marked_as_deleted() {
                // A concurrent delete of ours still owns the tombstone.
                return Ok(None);
            }
            if entry.exists() {
                return Ok(None);
            }
            let owner = match mode {
                EntryCreationMode::Ephemeral => Some(self.session.clone()),
                EntryCreationMode::Default => None,
            };
            let new = entry.initialized(value.clone(), owner);
            let observed = self
                .entries
                .compare_exchange(Some(new.clone()), Some(entry))
                .await?;
            if exchanged(&observed, &Some(new.clone())) {
                return Ok(Some(Entry::from_stored(&new)));
            }
            entry = match observed {
                Some(current) if current.holds_write_lock(&self.session) => current,
                // The write lock was reclaimed underneath us.
                _ => return Err(Error::SessionEnded),
            };
        }
    }

    /// Creates an entry. Fails with `EntryAlreadyExists` if the path already
    /// holds one. Missing ancestors are provisioned as empty entries.
    pub async fn create(
        &self,
        path: Path<'_>,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Entry> {
        self.ensure_ancestors(path).await?;
        match self.create_if_absent(path, value, mode).await? {
            Some(entry) => Ok(entry),
            None => Err(Error::EntryAlreadyExists(path.to_owned())),
        }
    }

    /// Creates the entry if absent, otherwise behaves like [`Self::get`].
    pub async fn get_or_create(
        &self,
        path: Path<'_>,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Entry> {
        loop {
            match self.get(path).await {
                Ok(entry) => return Ok(entry),
                Err(Error::EntryNotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.ensure_ancestors(path).await?;
            if let Some(entry) = self.create_if_absent(path, value.clone(), mode).await? {
                return Ok(entry);
            }
        }
    }

    /// Cache-coherent read.
    pub async fn get(&self, path: Path<'_>) -> Result<Entry> {
        let stored = self.cache.get(path).await?;
        if !stored.exists() {
            return Err(Error::EntryNotFound(path.to_owned()));
        }
        Ok(Entry::from_stored(&stored))
    }

    /// Writes `value` under the write lock and returns the pre-mutation
    /// version. `expected_version = 0` writes unconditionally, creating the
    /// entry if necessary; any other value must match the entry's current
    /// version or the call fails with `VersionConflict`.
    pub async fn set_value(
        &self,
        path: Path<'_>,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64> {
        self.ensure_ancestors(path).await?;
        self.cache.evict(path);
        let locked = self.locks.acquire_write_lock(&self.session, path).await?;
        let result = self.set_value_locked(locked, value, expected_version).await;
        self.locks.release_write_lock(&self.session, path).await?;
        result
    }

    async fn set_value_locked(
        &self,
        mut entry: StoredEntry,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64> {
        loop {
            if entry.is_marked_as_deleted() {
                // A concurrent delete of ours still owns the tombstone.
                return Err(Error::EntryNotFound(entry.path().clone()));
            }
            if expected_version != 0 {
                if !entry.exists() {
                    return Err(Error::EntryNotFound(entry.path().clone()));
                }
                if entry.version() != expected_version {
                    return Err(Error::VersionConflict {
                        current: entry.version(),
                    });
                }
            }
            let pre = entry.version();
            let new = if entry.version() == 0 {
                entry.initialized(value.clone(), None)
            } else {
                entry.with_value(value.clone())
            };
            let observed = self
                .entries
                .compare_exchange(Some(new.clone()), Some(entry))
                .await?;
            if exchanged(&observed, &Some(new.clone())) {
                return Ok(pre);
            }
            entry = match observed {
                Some(current) if current.holds_write_lock(&self.session) => current,
                _ => return Err(Error::SessionEnded),
            };
        }
    }

    /// Deletes the entry under its write lock. `expected_version` works as in
    /// [`Self::set_value`]. With `recursive = false` the call fails with
    /// `HasChildren` if live children exist; recursive deletion works
    /// depth-first under per-node write locks and is not atomic.
    pub async fn delete(
        &self,
        path: Path<'_>,
        expected_version: u64,
        recursive: bool,
    ) -> Result<()> {
        self.delete_inner(path.to_owned(), expected_version, recursive)
            .await
    }

    fn delete_inner(
        &self,
        path: PathBuf,
        expected_version: u64,
        recursive: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cache.evict(path.as_path());
            let locked = self
                .locks
                .acquire_write_lock(&self.session, path.as_path())
                .await?;
            let result = self.delete_locked(locked, expected_version, recursive).await;
            self.locks
                .release_write_lock(&self.session, path.as_path())
                .await?;
            result
        })
    }

    async fn delete_locked(
        &self,
        mut entry: StoredEntry,
        expected_version: u64,
        recursive: bool,
    ) -> Result<()> {
        if !entry.exists() {
            return Err(Error::EntryNotFound(entry.path().clone()));
        }
        if expected_version != 0 && entry.version() != expected_version {
            return Err(Error::VersionConflict {
                current: entry.version(),
            });
        }
        let children: Vec<StoredEntry> = self
            .entries
            .children(entry.path().as_path())
            .await?
            .into_iter()
            .filter(|child| child.exists())
            .collect();
        if !children.is_empty() {
            if !recursive {
                return Err(Error::HasChildren(entry.path().clone()));
            }
            for child in children {
                match self.delete_inner(child.path().clone(), 0, true).await {
                    // A concurrent delete got there first.
                    Ok(()) | Err(Error::EntryNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        loop {
            let new = entry.marked_deleted();
            let observed = self
                .entries
                .compare_exchange(Some(new.clone()), Some(entry))
                .await?;
            if exchanged(&observed, &Some(new)) {
                return Ok(());
            }
            entry = match observed {
                Some(current) if current.holds_write_lock(&self.session) => current,
                _ => return Err(Error::SessionEnded),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SledEntryStore, SledSessionStore};
    use crate::transport::LoopbackNetwork;
    use futures::FutureExt;

    fn path(s: &str) -> PathBuf {
        PathBuf::parse(s).unwrap()
    }

    fn fast_config() -> CoordinationConfig {
        CoordinationConfig {
            lease_length: Duration::from_millis(500),
            scan_interval: Duration::from_millis(100),
        }
    }

    async fn manager(
        db: &sled::Db,
        network: &LoopbackNetwork,
        host: &str,
        config: CoordinationConfig,
    ) -> Arc<CoordinationManager> {
        let entries: Arc<dyn EntryStore> = Arc::new(SledEntryStore::new(db).unwrap());
        let sessions: Arc<dyn SessionStore> = Arc::new(SledSessionStore::new(db).unwrap());
        CoordinationManager::init(entries, sessions, &network.node(host), config)
            .await
            .unwrap()
    }

    fn db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[async_std::test]
    async fn create_get_set_delete() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;

        let created = a
            .create(path("/a/b").as_path(), vec![0x01, 0x02], EntryCreationMode::Default)
            .await
            .unwrap();
        assert_eq!(created.version(), 1);

        let read = a.get(path("/a/b").as_path()).await.unwrap();
        assert_eq!(read.value(), [0x01, 0x02]);
        assert_eq!(read.version(), 1);

        let pre = a
            .set_value(path("/a/b").as_path(), vec![0x03], 1)
            .await
            .unwrap();
        assert_eq!(pre, 1);
        let read = a.get(path("/a/b").as_path()).await.unwrap();
        assert_eq!(read.value(), [0x03]);
        assert_eq!(read.version(), 2);

        a.delete(path("/a/b").as_path(), 2, false).await.unwrap();
        assert!(matches!(
            a.get(path("/a/b").as_path()).await,
            Err(Error::EntryNotFound(_))
        ));
    }

    #[async_std::test]
    async fn create_twice_fails() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;
        a.create(path("/x").as_path(), vec![1], EntryCreationMode::Default)
            .await
            .unwrap();
        assert!(matches!(
            a.create(path("/x").as_path(), vec![2], EntryCreationMode::Default)
                .await,
            Err(Error::EntryAlreadyExists(_))
        ));
        let entry = a
            .get_or_create(path("/x").as_path(), vec![3], EntryCreationMode::Default)
            .await
            .unwrap();
        assert_eq!(entry.value(), [1]);
    }

    #[async_std::test]
    async fn ancestors_are_provisioned() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;
        a.create(path("/a/b/c").as_path(), vec![1], EntryCreationMode::Default)
            .await
            .unwrap();
        let parent = a.get(path("/a/b").as_path()).await.unwrap();
        assert_eq!(parent.value(), [0u8; 0]);
        assert_eq!(parent.version(), 1);
        // The root has no parent and is never materialized.
        assert!(matches!(
            a.get(PathBuf::root().as_path()).await,
            Err(Error::EntryNotFound(_))
        ));
    }

    #[async_std::test]
    async fn version_conflict_reports_current_version() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;
        let b = manager(&db, &network, "b", CoordinationConfig::default()).await;

        let pre = a
            .set_value(path("/k").as_path(), vec![0xaa], 0)
            .await
            .unwrap();
        assert_eq!(pre, 0);

        let pre = b.set_value(path("/k").as_path(), vec![0xbb], 1).await.unwrap();
        assert_eq!(pre, 1);

        match a.set_value(path("/k").as_path(), vec![0xcc], 1).await {
            Err(Error::VersionConflict { current }) => assert_eq!(current, 2),
            other => panic!("expected version conflict, got {:?}", other),
        }
    }

    #[async_std::test]
    async fn cached_read_is_invalidated_by_writer() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;
        let b = manager(&db, &network, "b", CoordinationConfig::default()).await;

        a.create(path("/x").as_path(), vec![0xaa], EntryCreationMode::Default)
            .await
            .unwrap();
        assert_eq!(a.get(path("/x").as_path()).await.unwrap().value(), [0xaa]);

        // B's unconditional write invalidates A's cached read lock and then
        // proceeds.
        b.set_value(path("/x").as_path(), vec![0xbb], 0).await.unwrap();

        for _ in 0..100u32 {
            let read = a.get(path("/x").as_path()).await.unwrap();
            if read.value() == [0xbb] {
                assert_eq!(read.version(), 2);
                // Mutual exclusion held throughout: nobody writes while the
                // entry still carries a writer.
                let stored = a.entries.get(path("/x").as_path()).await.unwrap().unwrap();
                if stored.write_lock().is_some() {
                    assert!(stored.read_locks_subset_of(stored.write_lock().unwrap()));
                }
                return;
            }
            async_std::task::sleep(Duration::from_millis(10)).await;
        }
        panic!("A never observed B's write");
    }

    #[async_std::test]
    async fn ephemeral_entries_die_with_their_session() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", fast_config()).await;
        let b = manager(&db, &network, "b", fast_config()).await;

        b.create(path("/e").as_path(), vec![1], EntryCreationMode::Ephemeral)
            .await
            .unwrap();
        assert!(a.get(path("/e").as_path()).await.unwrap().is_ephemeral());

        b.shutdown().await.unwrap();

        for _ in 0..100u32 {
            match a.get(path("/e").as_path()).await {
                Err(Error::EntryNotFound(_)) => return,
                Ok(_) => async_std::task::sleep(Duration::from_millis(10)).await,
                Err(err) => panic!("unexpected error: {}", err),
            }
        }
        panic!("ephemeral entry survived its session");
    }

    #[async_std::test]
    async fn recursive_delete_is_depth_first() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;

        for p in ["/r", "/r/x", "/r/x/y"] {
            a.get_or_create(path(p).as_path(), vec![1], EntryCreationMode::Default)
                .await
                .unwrap();
        }
        assert!(matches!(
            a.delete(path("/r").as_path(), 0, false).await,
            Err(Error::HasChildren(_))
        ));
        a.delete(path("/r").as_path(), 0, true).await.unwrap();
        for p in ["/r", "/r/x", "/r/x/y"] {
            assert!(matches!(
                a.get(path(p).as_path()).await,
                Err(Error::EntryNotFound(_))
            ));
        }
    }

    #[async_std::test]
    async fn expired_holder_does_not_block_forever() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", fast_config()).await;
        let b = manager(&db, &network, "b", fast_config()).await;

        a.create(path("/x").as_path(), vec![1], EntryCreationMode::Default)
            .await
            .unwrap();

        // B takes the write lock and then dies without releasing: dropping
        // the manager kills its renewal task, its endpoint, everything.
        b.locks
            .acquire_write_lock(&b.session, path("/x").as_path())
            .await
            .unwrap();
        drop(b);

        let write_path = path("/x");
        let write = a.set_value(write_path.as_path(), vec![2], 0);
        futures::pin_mut!(write);
        assert!(write.as_mut().now_or_never().is_none());

        // A's own expiration scan ends B once the lease runs out and the
        // cleanup task releases B's lock from authoritative state.
        async_std::future::timeout(Duration::from_secs(10), write)
            .await
            .expect("waiter should be unblocked by expiration-based cleanup")
            .unwrap();
    }

    #[async_std::test]
    async fn operations_fail_after_shutdown() {
        let db = db();
        let network = LoopbackNetwork::new();
        let a = manager(&db, &network, "a", CoordinationConfig::default()).await;
        a.shutdown().await.unwrap();
        assert!(matches!(
            a.create(path("/x").as_path(), vec![1], EntryCreationMode::Default)
                .await,
            Err(Error::SessionEnded) | Err(Error::UnknownSession)
        ));
    }
}

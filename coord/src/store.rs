use crate::entry::{StoredEntry, StoredSession};
use crate::error::{Error, Result};
use crate::id::SessionId;
use crate::path::{Path, SEPARATOR};
use crate::util::Ref;
use async_trait::async_trait;
use futures_timer::Delay;
use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_ATTEMPTS: u32 = 5;

/// Records carrying the backing-store concurrency token.
pub trait Versioned {
    fn storage_version(&self) -> u64;
}

impl Versioned for StoredEntry {
    fn storage_version(&self) -> u64 {
        StoredEntry::storage_version(self)
    }
}

impl Versioned for StoredSession {
    fn storage_version(&self) -> u64 {
        StoredSession::storage_version(self)
    }
}

/// True if a compare-exchange that returned `observed` installed `new`.
pub fn exchanged<R: Versioned>(observed: &Option<R>, new: &Option<R>) -> bool {
    match (observed, new) {
        (None, None) => true,
        (Some(o), Some(n)) => o.storage_version() == n.storage_version(),
        _ => false,
    }
}

/// Linearizable single-entry storage for the coordination tree.
///
/// `compare_exchange` atomically replaces the record at the key shared by
/// `new` and `expected` iff the stored record's `storage_version` equals
/// `expected`'s, and returns the post state: `new` on success, the real
/// current record otherwise. An absent `expected` encodes creation, an absent
/// `new` encodes removal.
#[async_trait]
pub trait EntryStore: Send + Sync + 'static {
    async fn get(&self, path: Path<'_>) -> Result<Option<StoredEntry>>;

    async fn compare_exchange(
        &self,
        new: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<Option<StoredEntry>>;

    /// Returns the entries whose parent is `parent`. Children are implicit:
    /// an entry is a child iff its path extends `parent` by one segment.
    async fn children(&self, parent: Path<'_>) -> Result<Vec<StoredEntry>>;
}

/// Linearizable storage for session records, same compare-exchange contract
/// as [`EntryStore`].
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, id: &SessionId) -> Result<Option<StoredSession>>;

    async fn compare_exchange(
        &self,
        new: Option<StoredSession>,
        expected: Option<StoredSession>,
    ) -> Result<Option<StoredSession>>;

    /// Snapshot of all current session records.
    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;
}

async fn with_backoff<T, F>(mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = BACKOFF_BASE;
    let mut attempt = 1;
    loop {
        match op() {
            Err(Error::BackendUnavailable(err)) if attempt < BACKOFF_ATTEMPTS => {
                tracing::debug!("backend error, attempt {}: {}", attempt, err);
                Delay::new(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Entry storage over a sled tree, keyed by escaped path.
#[derive(Clone)]
pub struct SledEntryStore {
    tree: sled::Tree,
}

impl SledEntryStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("coordination.entries").map_err(Error::backend)?,
        })
    }

    fn read(&self, key: &[u8]) -> Result<Option<(sled::IVec, StoredEntry)>> {
        let raw = match self.tree.get(key).map_err(Error::backend)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        // Persisted bytes are a trust boundary; validate before touching the
        // archived view.
        let entry = Ref::<StoredEntry>::checked(&raw)
            .and_then(|valid| valid.to_owned())
            .map_err(Error::BackendUnavailable)?;
        Ok(Some((raw, entry)))
    }
}

#[async_trait]
impl EntryStore for SledEntryStore {
    async fn get(&self, path: Path<'_>) -> Result<Option<StoredEntry>> {
        let key = path.escaped();
        with_backoff(|| Ok(self.read(key.as_bytes())?.map(|(_, entry)| entry))).await
    }

    async fn compare_exchange(
        &self,
        new: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<Option<StoredEntry>> {
        let key = match (&new, &expected) {
            (Some(n), Some(e)) if n.path() != e.path() => return Err(Error::KeyMismatch),
            (Some(n), _) => n.path().escaped(),
            (None, Some(e)) => e.path().escaped(),
            (None, None) => return Err(Error::KeyMismatch),
        };
        let new_bytes = new.as_ref().map(Ref::archive);
        with_backoff(|| loop {
            let current = self.read(key.as_bytes())?;
            match (&expected, &current) {
                (None, Some((_, cur))) => return Ok(Some(cur.clone())),
                (Some(_), None) => return Ok(None),
                (Some(exp), Some((_, cur)))
                    if exp.storage_version() != cur.storage_version() =>
                {
                    return Ok(Some(cur.clone()))
                }
                _ => {}
            }
            let old_raw = current.as_ref().map(|(raw, _)| raw.clone());
            let swap = self
                .tree
                .compare_and_swap(
                    key.as_bytes(),
                    old_raw,
                    new_bytes.as_ref().map(|r| r.as_bytes()),
                )
                .map_err(Error::backend)?;
            match swap {
                Ok(()) => return Ok(new.clone()),
                // Lost a race between read and swap; re-evaluate against the
                // now-current record.
                Err(_) => continue,
            }
        })
        .await
    }

    async fn children(&self, parent: Path<'_>) -> Result<Vec<StoredEntry>> {
        let mut prefix = parent.escaped();
        prefix.push(SEPARATOR);
        with_backoff(|| {
            let mut out = Vec::new();
            for item in self.tree.scan_prefix(prefix.as_bytes()) {
                let (key, raw) = item.map_err(Error::backend)?;
                let rest = &key[prefix.len()..];
                if rest.contains(&(SEPARATOR as u8)) {
                    continue;
                }
                let entry = Ref::<StoredEntry>::checked(&raw)
                    .and_then(|valid| valid.to_owned())
                    .map_err(Error::BackendUnavailable)?;
                out.push(entry);
            }
            Ok(out)
        })
        .await
    }
}

/// Session storage over a sled tree, keyed by session id bytes.
#[derive(Clone)]
pub struct SledSessionStore {
    tree: sled::Tree,
}

impl SledSessionStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db
                .open_tree("coordination.sessions")
                .map_err(Error::backend)?,
        })
    }

    fn read(&self, key: &[u8]) -> Result<Option<(sled::IVec, StoredSession)>> {
        let raw = match self.tree.get(key).map_err(Error::backend)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let session = Ref::<StoredSession>::checked(&raw)
            .and_then(|valid| valid.to_owned())
            .map_err(Error::BackendUnavailable)?;
        Ok(Some((raw, session)))
    }
}

#[async_trait]
impl SessionStore for SledSessionStore {
    async fn get(&self, id: &SessionId) -> Result<Option<StoredSession>> {
        with_backoff(|| Ok(self.read(id.as_bytes())?.map(|(_, session)| session))).await
    }

    async fn compare_exchange(
        &self,
        new: Option<StoredSession>,
        expected: Option<StoredSession>,
    ) -> Result<Option<StoredSession>> {
        let key = match (&new, &expected) {
            (Some(n), Some(e)) if n.id() != e.id() => return Err(Error::KeyMismatch),
            (Some(n), _) => n.id().as_bytes().to_vec(),
            (None, Some(e)) => e.id().as_bytes().to_vec(),
            (None, None) => return Err(Error::KeyMismatch),
        };
        let new_bytes = new.as_ref().map(Ref::archive);
        with_backoff(|| loop {
            let current = self.read(&key)?;
            match (&expected, &current) {
                (None, Some((_, cur))) => return Ok(Some(cur.clone())),
                (Some(_), None) => return Ok(None),
                (Some(exp), Some((_, cur)))
                    if exp.storage_version() != cur.storage_version() =>
                {
                    return Ok(Some(cur.clone()))
                }
                _ => {}
            }
            let old_raw = current.as_ref().map(|(raw, _)| raw.clone());
            let swap = self
                .tree
                .compare_and_swap(&key, old_raw, new_bytes.as_ref().map(|r| r.as_bytes()))
                .map_err(Error::backend)?;
            match swap {
                Ok(()) => return Ok(new.clone()),
                Err(_) => continue,
            }
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        with_backoff(|| {
            let mut out = Vec::new();
            for item in self.tree.iter() {
                let (_, raw) = item.map_err(Error::backend)?;
                let session = Ref::<StoredSession>::checked(&raw)
                    .and_then(|valid| valid.to_owned())
                    .map_err(Error::BackendUnavailable)?;
                out.push(session);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathBuf;

    fn sid(n: u8) -> SessionId {
        SessionId::new([n; 16], "local")
    }

    fn path(s: &str) -> PathBuf {
        PathBuf::parse(s).unwrap()
    }

    fn store() -> SledEntryStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledEntryStore::new(&db).unwrap()
    }

    #[async_std::test]
    async fn create_update_delete() {
        let store = store();
        let p = path("/a");
        assert!(store.get(p.as_path()).await.unwrap().is_none());

        let created = StoredEntry::created_for_write(p.clone(), sid(1))
            .initialized(b"v".to_vec(), None);
        let observed = store
            .compare_exchange(Some(created.clone()), None)
            .await
            .unwrap();
        assert!(exchanged(&observed, &Some(created.clone())));
        assert_eq!(store.get(p.as_path()).await.unwrap().unwrap(), created);

        let updated = created.with_value(b"w".to_vec());
        let observed = store
            .compare_exchange(Some(updated.clone()), Some(created.clone()))
            .await
            .unwrap();
        assert!(exchanged(&observed, &Some(updated.clone())));

        // Stale expectation fails and reports the real current record.
        let stale = created.with_value(b"x".to_vec());
        let observed = store
            .compare_exchange(Some(stale.clone()), Some(created))
            .await
            .unwrap();
        assert!(!exchanged(&observed, &Some(stale)));
        assert_eq!(observed.unwrap(), updated);

        let observed = store
            .compare_exchange(None, Some(updated))
            .await
            .unwrap();
        assert!(exchanged(&observed, &None));
        assert!(store.get(p.as_path()).await.unwrap().is_none());
    }

    #[async_std::test]
    async fn create_fails_when_present() {
        let store = store();
        let p = path("/a");
        let first = StoredEntry::created_for_write(p.clone(), sid(1));
        store
            .compare_exchange(Some(first.clone()), None)
            .await
            .unwrap();
        let second = StoredEntry::created_for_write(p, sid(2));
        let observed = store
            .compare_exchange(Some(second.clone()), None)
            .await
            .unwrap();
        assert!(!exchanged(&observed, &Some(second)));
        assert_eq!(observed.unwrap(), first);
    }

    #[async_std::test]
    async fn key_mismatch_is_a_programming_error() {
        let store = store();
        let a = StoredEntry::created_for_write(path("/a"), sid(1));
        let b = StoredEntry::created_for_write(path("/b"), sid(1));
        assert!(matches!(
            store.compare_exchange(Some(a), Some(b)).await,
            Err(Error::KeyMismatch)
        ));
        assert!(matches!(
            store.compare_exchange(None, None).await,
            Err(Error::KeyMismatch)
        ));
    }

    #[async_std::test]
    async fn children_scan() {
        let store = store();
        for p in ["/r", "/r/x", "/r/y", "/r/x/deep", "/other"] {
            let entry = StoredEntry::created_for_write(path(p), sid(1))
                .initialized(b"v".to_vec(), None);
            store.compare_exchange(Some(entry), None).await.unwrap();
        }
        let mut children: Vec<_> = store
            .children(path("/r").as_path())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path().escaped())
            .collect();
        children.sort();
        assert_eq!(children, vec!["/r/x", "/r/y"]);

        let roots: Vec<_> = store
            .children(PathBuf::root().as_path())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path().escaped())
            .collect();
        assert_eq!(roots.len(), 2);
    }

    #[async_std::test]
    async fn session_round_trip() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledSessionStore::new(&db).unwrap();
        let s = StoredSession::new(sid(1), 100);
        let observed = store
            .compare_exchange(Some(s.clone()), None)
            .await
            .unwrap();
        assert!(exchanged(&observed, &Some(s.clone())));
        assert_eq!(store.get(&sid(1)).await.unwrap().unwrap(), s);
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);

        let ended = s.ended();
        store
            .compare_exchange(Some(ended.clone()), Some(s))
            .await
            .unwrap();
        let observed = store.compare_exchange(None, Some(ended)).await.unwrap();
        assert!(exchanged(&observed, &None));
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}

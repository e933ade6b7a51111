use crate::id::SessionId;
use crate::path::PathBuf;
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// A single entry of the coordination tree as persisted in the backing store.
///
/// Lock state is authoritative here; exchange messages are only hints. Every
/// transition helper returns a new record with `storage_version` advanced, so
/// a compare-exchange against the previous record is the only way to make a
/// transition visible.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub struct StoredEntry {
    path: PathBuf,
    value: Vec<u8>,
    /// Public optimistic token: 0 until the entry is first initialized with a
    /// value, then incremented by each value mutation.
    version: u64,
    read_locks: Vec<SessionId>,
    write_lock: Option<SessionId>,
    /// Backing-store token, advanced by every transition including lock state.
    storage_version: u64,
    ephemeral_owner: Option<SessionId>,
    is_marked_as_deleted: bool,
}

impl StoredEntry {
    /// A placeholder record for a path nobody has written yet, created so
    /// that lock state has somewhere to live.
    fn stub(path: PathBuf) -> Self {
        Self {
            path,
            value: Vec::new(),
            version: 0,
            read_locks: Vec::new(),
            write_lock: None,
            storage_version: 1,
            ephemeral_owner: None,
            is_marked_as_deleted: false,
        }
    }

    /// Creates the record a reader materializes when it locks an absent path.
    pub fn created_for_read(path: PathBuf, reader: SessionId) -> Self {
        let mut entry = Self::stub(path);
        entry.read_locks.push(reader);
        entry
    }

    /// Creates the record a writer materializes when it locks an absent path.
    pub fn created_for_write(path: PathBuf, writer: SessionId) -> Self {
        let mut entry = Self::stub(path);
        entry.write_lock = Some(writer);
        entry
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn read_locks(&self) -> &[SessionId] {
        &self.read_locks
    }

    pub fn write_lock(&self) -> Option<&SessionId> {
        self.write_lock.as_ref()
    }

    pub fn storage_version(&self) -> u64 {
        self.storage_version
    }

    pub fn ephemeral_owner(&self) -> Option<&SessionId> {
        self.ephemeral_owner.as_ref()
    }

    pub fn is_marked_as_deleted(&self) -> bool {
        self.is_marked_as_deleted
    }

    /// True once the entry has been initialized and not tombstoned; stubs and
    /// tombstones read as nonexistent.
    pub fn exists(&self) -> bool {
        self.version > 0 && !self.is_marked_as_deleted
    }

    pub fn holds_read_lock(&self, session: &SessionId) -> bool {
        self.read_locks.contains(session)
    }

    pub fn holds_write_lock(&self, session: &SessionId) -> bool {
        self.write_lock.as_ref() == Some(session)
    }

    /// True if no session other than `session` holds a read lock.
    pub fn read_locks_subset_of(&self, session: &SessionId) -> bool {
        self.read_locks.iter().all(|s| s == session)
    }

    /// A stub or tombstone with no remaining holders has no reason to exist.
    pub fn is_reapable(&self) -> bool {
        (self.version == 0 || self.is_marked_as_deleted)
            && self.read_locks.is_empty()
            && self.write_lock.is_none()
    }

    fn advanced(&self) -> Self {
        let mut next = self.clone();
        next.storage_version += 1;
        next
    }

    /// Adds a read lock holder. Idempotent. Callers must have established
    /// that no foreign write lock is held.
    pub fn with_read_lock(&self, session: &SessionId) -> Self {
        debug_assert!(self.write_lock.is_none() || self.holds_write_lock(session));
        let mut next = self.advanced();
        if !next.read_locks.contains(session) {
            next.read_locks.push(session.clone());
        }
        next
    }

    /// Removes a read lock holder. Removing an absent holder is a no-op
    /// transition (the storage version still advances).
    pub fn without_read_lock(&self, session: &SessionId) -> Self {
        let mut next = self.advanced();
        next.read_locks.retain(|s| s != session);
        next
    }

    /// Takes the write lock. Callers must have established that the lock is
    /// free and that no foreign read locks remain; the session's own read
    /// lock is absorbed.
    pub fn with_write_lock(&self, session: &SessionId) -> Self {
        debug_assert!(self.write_lock.is_none() || self.holds_write_lock(session));
        debug_assert!(self.read_locks_subset_of(session));
        let mut next = self.advanced();
        next.write_lock = Some(session.clone());
        next.read_locks.clear();
        next
    }

    /// Releases the write lock.
    pub fn without_write_lock(&self) -> Self {
        let mut next = self.advanced();
        next.write_lock = None;
        next
    }

    /// Removes every lock held by `session`, whichever kind it is.
    pub fn without_locks_of(&self, session: &SessionId) -> Self {
        let mut next = self.advanced();
        next.read_locks.retain(|s| s != session);
        if next.write_lock.as_ref() == Some(session) {
            next.write_lock = None;
        }
        next
    }

    /// Initializes a stub with its first value, making the entry visible.
    pub fn initialized(&self, value: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        debug_assert_eq!(self.version, 0);
        let mut next = self.advanced();
        next.value = value;
        next.version = 1;
        next.ephemeral_owner = ephemeral_owner;
        next
    }

    /// Replaces the value, advancing the public version.
    pub fn with_value(&self, value: Vec<u8>) -> Self {
        let mut next = self.advanced();
        next.value = value;
        next.version += 1;
        next
    }

    /// Tombstones the entry. Holders still see the record until the last one
    /// releases and reaps it.
    pub fn marked_deleted(&self) -> Self {
        let mut next = self.advanced();
        next.is_marked_as_deleted = true;
        next
    }
}

/// A session record as persisted in the backing store.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub struct StoredSession {
    id: SessionId,
    /// Lease expiry, milliseconds since the unix epoch.
    lease_end: u64,
    is_ended: bool,
    /// Paths this session must clean up: every ephemeral entry it created and
    /// every entry it holds a lock on.
    entry_paths: Vec<PathBuf>,
    storage_version: u64,
}

impl StoredSession {
    pub fn new(id: SessionId, lease_end: u64) -> Self {
        Self {
            id,
            lease_end,
            is_ended: false,
            entry_paths: Vec::new(),
            storage_version: 1,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn lease_end(&self) -> u64 {
        self.lease_end
    }

    pub fn is_ended(&self) -> bool {
        self.is_ended
    }

    pub fn entry_paths(&self) -> &[PathBuf] {
        &self.entry_paths
    }

    pub fn storage_version(&self) -> u64 {
        self.storage_version
    }

    pub fn is_live(&self, now: u64) -> bool {
        !self.is_ended && self.lease_end > now
    }

    pub fn has_entry(&self, path: &PathBuf) -> bool {
        self.entry_paths.contains(path)
    }

    fn advanced(&self) -> Self {
        let mut next = self.clone();
        next.storage_version += 1;
        next
    }

    /// Advances the lease. The lease end never moves backwards.
    pub fn with_lease(&self, lease_end: u64) -> Self {
        let mut next = self.advanced();
        next.lease_end = next.lease_end.max(lease_end);
        next
    }

    /// Records a path for cleanup. Idempotent.
    pub fn with_entry(&self, path: PathBuf) -> Self {
        let mut next = self.advanced();
        if !next.entry_paths.contains(&path) {
            next.entry_paths.push(path);
        }
        next
    }

    /// Forgets a path. Removing an unknown path is a no-op transition.
    pub fn without_entry(&self, path: &PathBuf) -> Self {
        let mut next = self.advanced();
        next.entry_paths.retain(|p| p != path);
        next
    }

    /// The terminal transition.
    pub fn ended(&self) -> Self {
        let mut next = self.advanced();
        next.is_ended = true;
        next
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

    #[test]
    fn writer_excludes_readers() {
        let entry = StoredEntry::created_for_read(path("/a"), sid(1));
        assert!(entry.holds_read_lock(&sid(1)));
        let entry = entry.without_read_lock(&sid(1)).with_write_lock(&sid(2));
        assert!(entry.read_locks().is_empty());
        assert!(entry.holds_write_lock(&sid(2)));
    }

    #[test]
    fn own_read_lock_absorbed_by_write_lock() {
        let entry = StoredEntry::created_for_read(path("/a"), sid(1)).with_write_lock(&sid(1));
        assert!(entry.read_locks().is_empty());
        assert!(entry.holds_write_lock(&sid(1)));
    }

    #[test]
    fn storage_version_strictly_increases() {
        let e0 = StoredEntry::created_for_write(path("/a"), sid(1));
        let e1 = e0.initialized(b"v".to_vec(), None);
        let e2 = e1.with_value(b"w".to_vec());
        let e3 = e2.without_write_lock();
        assert!(e0.storage_version() < e1.storage_version());
        assert!(e1.storage_version() < e2.storage_version());
        assert!(e2.storage_version() < e3.storage_version());
    }

    #[test]
    fn public_version_counts_value_mutations_only() {
        let entry = StoredEntry::created_for_write(path("/a"), sid(1));
        assert_eq!(entry.version(), 0);
        assert!(!entry.exists());
        let entry = entry.initialized(b"v".to_vec(), None);
        assert_eq!(entry.version(), 1);
        let entry = entry.with_value(b"w".to_vec());
        assert_eq!(entry.version(), 2);
        let released = entry.without_write_lock();
        assert_eq!(released.version(), 2);
    }

    #[test]
    fn reapable() {
        let stub = StoredEntry::created_for_read(path("/a"), sid(1));
        assert!(!stub.is_reapable());
        assert!(stub.without_read_lock(&sid(1)).is_reapable());
        let live = StoredEntry::created_for_write(path("/a"), sid(1))
            .initialized(b"v".to_vec(), None)
            .without_write_lock();
        assert!(!live.is_reapable());
        assert!(live.marked_deleted().is_reapable());
    }

    #[test]
    fn read_lock_is_idempotent() {
        let entry = StoredEntry::created_for_read(path("/a"), sid(1)).with_read_lock(&sid(1));
        assert_eq!(entry.read_locks().len(), 1);
    }

    #[test]
    fn session_transitions() {
        let s = StoredSession::new(sid(1), 100);
        assert!(s.is_live(99));
        assert!(!s.is_live(100));
        let s = s.with_lease(50);
        assert_eq!(s.lease_end(), 100);
        let s = s.with_lease(200);
        assert_eq!(s.lease_end(), 200);

        let s = s.with_entry(path("/a")).with_entry(path("/a"));
        assert_eq!(s.entry_paths().len(), 1);
        let removed = s.without_entry(&path("/b"));
        assert_eq!(removed.entry_paths().len(), 1);
        let removed = removed.without_entry(&path("/a"));
        assert!(removed.entry_paths().is_empty());

        let ended = removed.ended();
        assert!(ended.is_ended());
        assert!(!ended.is_live(0));
    }
}

//! # lockstep
//!
//! The distributed coordination SDK: a hierarchical, durable, lock-based
//! namespace shared by any number of process-level sessions over a common
//! backing store, with ephemeral entries, leased sessions, and cache-coherent
//! reads. The heavy lifting lives in [`lockstep_coord`]; this crate wires the
//! core up with concrete providers (a `sled` database and an in-process
//! loopback transport) and installs logging.
#![deny(missing_docs)]

pub use lockstep_coord::{
    CoordinationConfig, CoordinationManager, Entry, EntryCreationMode, Error, LoopbackNetwork,
    Multiplexer, Path, PathBuf, Result, SessionId,
};

use lockstep_coord::{Address, EntryStore, SessionStore, SledEntryStore, SledSessionStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// One coordination participant: a session over a backing store and a
/// transport. Dropping the handle abandons the session (peers reclaim it
/// after lease expiry); [`Sdk::shutdown`] ends it gracefully.
pub struct Sdk {
    manager: Arc<CoordinationManager>,
}

impl Sdk {
    /// Creates a participant over the given database and transport.
    pub async fn new<A: Address>(
        db: sled::Db,
        multiplexer: &dyn Multiplexer<A>,
        config: CoordinationConfig,
    ) -> Result<Self> {
        init_logging();
        let entries: Arc<dyn EntryStore> = Arc::new(SledEntryStore::new(&db)?);
        let sessions: Arc<dyn SessionStore> = Arc::new(SledSessionStore::new(&db)?);
        let manager = CoordinationManager::init(entries, sessions, multiplexer, config).await?;
        Ok(Self { manager })
    }

    /// A self-contained in-memory participant, for tests and examples.
    pub async fn memory() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|err| Error::BackendUnavailable(err.into()))?;
        let network = LoopbackNetwork::new();
        Self::shared_memory(&network, db, "local", CoordinationConfig::default()).await
    }

    /// A participant joining an existing loopback network and database; one
    /// call per simulated process.
    pub async fn shared_memory(
        network: &LoopbackNetwork,
        db: sled::Db,
        host: &str,
        config: CoordinationConfig,
    ) -> Result<Self> {
        Self::new(db, &network.node(host), config).await
    }

    /// The local session id.
    pub fn session_id(&self) -> &SessionId {
        self.manager.session_id()
    }

    /// Creates an entry; fails with `EntryAlreadyExists` if present. With
    /// [`EntryCreationMode::Ephemeral`] the entry dies with this session.
    pub async fn create(
        &self,
        path: &str,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Entry> {
        let path = PathBuf::parse(path)?;
        self.manager.create(path.as_path(), value, mode).await
    }

    /// Creates the entry if absent, otherwise reads it.
    pub async fn get_or_create(
        &self,
        path: &str,
        value: Vec<u8>,
        mode: EntryCreationMode,
    ) -> Result<Entry> {
        let path = PathBuf::parse(path)?;
        self.manager.get_or_create(path.as_path(), value, mode).await
    }

    /// Cache-coherent read.
    pub async fn get(&self, path: &str) -> Result<Entry> {
        let path = PathBuf::parse(path)?;
        self.manager.get(path.as_path()).await
    }

    /// Writes a value and returns the pre-mutation version. An
    /// `expected_version` of 0 writes unconditionally (creating the entry if
    /// necessary); any other value must match or the call fails with
    /// `VersionConflict`.
    pub async fn set_value(
        &self,
        path: &str,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64> {
        let path = PathBuf::parse(path)?;
        self.manager
            .set_value(path.as_path(), value, expected_version)
            .await
    }

    /// Deletes an entry; `recursive` removes the subtree depth-first.
    pub async fn delete(&self, path: &str, expected_version: u64, recursive: bool) -> Result<()> {
        let path = PathBuf::parse(path)?;
        self.manager
            .delete(path.as_path(), expected_version, recursive)
            .await
    }

    /// Ends the session gracefully, releasing its locks and removing its
    /// ephemeral entries.
    pub async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown().await
    }
}

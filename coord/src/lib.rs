//! # The lockstep coordination core
//!
//! A distributed coordination service in the spirit of ZooKeeper and Chubby:
//! a hierarchical, durable namespace of entries holding opaque byte values,
//! shared by any number of process-level sessions, with per-entry shared and
//! exclusive locks, ephemeral entries bound to their creating session, and
//! cache-coherent reads.
//!
//! ## Entries and paths
//! Entries are addressed by [`Path`]s, sequences of arbitrary non-empty
//! string segments rooted at the empty sequence. Serialization escapes the
//! separator characters, so any string can be a segment and the escaped form
//! round-trips losslessly. Children are implicit: an entry is a child of
//! another iff its path extends it by one segment.
//!
//! ## Locks over compare-exchange
//! Lock state lives inside the stored entry itself and every transition is a
//! compare-exchange against a linearizable backing store (the [`EntryStore`]
//! contract). A reader adds itself to the entry's read-lock set; a writer
//! takes the exclusive slot once no foreign holders remain. Conflicting
//! transitions simply retry after rereading. Because the store is the single
//! source of truth, no message loss can corrupt lock state.
//!
//! ## Sessions and leases
//! Every participant runs under a session with a leased lifetime. The lease
//! is renewed in the background; a session whose lease runs out may be ended
//! by any peer that observes it. The session record carries the set of paths
//! the session must clean up: entries it locked and ephemeral entries it
//! created. After a session ends, any live participant reclaims those —
//! releasing locks on the dead session's behalf and removing its ephemeral
//! entries.
//!
//! ## Wait/notify and cache coherence
//! Blocking is local: a waiter registers a one-shot suspension in its
//! process-local wait directory, rereads authoritative state to close the
//! lost-wakeup window, and suspends. Release notifications and cache
//! invalidations travel between sessions as best-effort hints through the
//! [`exchange`] channel, multiplexed over a point-to-point transport by
//! session id. A lost hint never blocks anyone for good: waiters also race
//! the holder's end of session, and expiration-based cleanup releases locks
//! from authoritative state.
//!
//! Cached reads stay coherent by holding the read lock: a writer must
//! invalidate every cache holder (which releases its read lock and drops the
//! line) before it can take the write lock.
#![warn(missing_docs)]
mod cache;
mod entry;
mod error;
mod exchange;
mod id;
mod invalidation;
mod lock;
mod manager;
mod path;
#[cfg(test)]
mod props;
mod session;
mod store;
mod transport;
mod util;
mod wait;

pub use crate::cache::CacheManager;
pub use crate::entry::{StoredEntry, StoredSession};
pub use crate::error::{Error, Result};
pub use crate::exchange::{Exchange, ExchangeManager, ExchangeMessage};
pub use crate::id::{Address, SessionId};
pub use crate::invalidation::{CallbackHandle, InvalidationCallback, InvalidationCallbackDirectory};
pub use crate::lock::LockManager;
pub use crate::manager::{
    CoordinationConfig, CoordinationManager, Entry, EntryCreationMode,
};
pub use crate::path::{escape_segment, unescape_segment, Path, PathBuf};
pub use crate::session::{now_millis, SessionManager};
pub use crate::store::{
    exchanged, EntryStore, SessionStore, SledEntryStore, SledSessionStore, Versioned,
};
pub use crate::transport::{
    LogicalAddress, LoopbackMultiplexer, LoopbackNetwork, MultiplexEndPoint, Multiplexer,
};
pub use crate::util::Ref;
pub use crate::wait::{LockWaitDirectory, WaitManager, Waiter};

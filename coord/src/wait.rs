use crate::error::{Error, Result};
use crate::id::SessionId;
use crate::path::{Path, PathBuf};
use crate::session::SessionManager;
use crate::store::EntryStore;
use fnv::FnvHashMap;
use futures::channel::oneshot;
use futures::future::Either;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

type WaiterKey = (PathBuf, SessionId);
type Senders = SmallVec<[oneshot::Sender<()>; 2]>;

/// A one-shot suspension point handed out by the wait directory.
///
/// Resolves when the matching release notification fires. Resolves with
/// `Canceled` if the directory is torn down underneath it.
pub struct Waiter(oneshot::Receiver<()>);

impl Future for Waiter {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Process-local registry of lock waiters, keyed by `(path, holder)`.
///
/// Notifications fire every suspension registered under their key at least
/// once; a notification with no prior registration is lost, so callers must
/// register before reading the state that may trigger it.
#[derive(Default)]
pub struct LockWaitDirectory {
    read: Mutex<FnvHashMap<WaiterKey, Senders>>,
    write: Mutex<FnvHashMap<WaiterKey, Senders>>,
}

fn register(map: &Mutex<FnvHashMap<WaiterKey, Senders>>, key: WaiterKey) -> Waiter {
    let (tx, rx) = oneshot::channel();
    let mut map = map.lock();
    let senders = map.entry(key).or_default();
    senders.retain(|tx| !tx.is_canceled());
    senders.push(tx);
    Waiter(rx)
}

fn notify(map: &Mutex<FnvHashMap<WaiterKey, Senders>>, key: &WaiterKey) {
    if let Some(senders) = map.lock().remove(key) {
        for tx in senders {
            tx.send(()).ok();
        }
    }
}

impl LockWaitDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers for the next read-lock release of `session` on `path`.
    pub fn register_read(&self, path: Path<'_>, session: &SessionId) -> Waiter {
        register(&self.read, (path.to_owned(), session.clone()))
    }

    /// Registers for the next write-lock release of `session` on `path`.
    pub fn register_write(&self, path: Path<'_>, session: &SessionId) -> Waiter {
        register(&self.write, (path.to_owned(), session.clone()))
    }

    pub fn notify_read_release(&self, path: Path<'_>, released_by: &SessionId) {
        notify(&self.read, &(path.to_owned(), released_by.clone()));
    }

    pub fn notify_write_release(&self, path: Path<'_>, released_by: &SessionId) {
        notify(&self.write, &(path.to_owned(), released_by.clone()));
    }
}

/// Blocks lock acquisition until a blocking holder is out of the way.
///
/// Every wait follows the register-reread-suspend discipline: the waiter is
/// registered first, then authoritative state is reread so a release that
/// happened in between is not lost. The suspension additionally races the
/// holder's end of session, which keeps waiters live even when every exchange
/// message is lost.
pub struct WaitManager {
    store: Arc<dyn EntryStore>,
    directory: Arc<LockWaitDirectory>,
    sessions: Arc<SessionManager>,
}

impl WaitManager {
    pub fn new(
        store: Arc<dyn EntryStore>,
        directory: Arc<LockWaitDirectory>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            store,
            directory,
            sessions,
        }
    }

    /// Suspends until `holder` no longer holds the write lock on `path`.
    pub async fn await_write_release(&self, path: Path<'_>, holder: &SessionId) -> Result<()> {
        let waiter = self.directory.register_write(path, holder);
        let entry = self.store.get(path).await?;
        let blocked = matches!(&entry, Some(e) if e.holds_write_lock(holder));
        if !blocked {
            return Ok(());
        }
        let end = self.sessions.await_end(holder);
        futures::pin_mut!(end);
        match futures::future::select(waiter, end).await {
            Either::Left((res, _)) => res,
            Either::Right(((), _)) => Ok(()),
        }
    }

    /// Suspends until `holder` no longer holds a read lock on `path`.
    pub async fn await_read_release(&self, path: Path<'_>, holder: &SessionId) -> Result<()> {
        let waiter = self.directory.register_read(path, holder);
        let entry = self.store.get(path).await?;
        let blocked = matches!(&entry, Some(e) if e.holds_read_lock(holder));
        if !blocked {
            return Ok(());
        }
        let end = self.sessions.await_end(holder);
        futures::pin_mut!(end);
        match futures::future::select(waiter, end).await {
            Either::Left((res, _)) => res,
            Either::Right(((), _)) => Ok(()),
        }
    }
}

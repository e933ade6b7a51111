use crate::error::{Error, Result};
use crate::id::{Address, SessionId};
use crate::invalidation::InvalidationCallbackDirectory;
use crate::path::PathBuf;
use crate::session::SessionManager;
use crate::transport::{LogicalAddress, MultiplexEndPoint, Multiplexer};
use crate::wait::LockWaitDirectory;
use async_trait::async_trait;
use std::convert::TryInto;
use std::sync::Arc;

const MESSAGE_INVALIDATE_CACHE_ENTRY: u8 = 1;
const MESSAGE_RELEASED_READ_LOCK: u8 = 2;
const MESSAGE_RELEASED_WRITE_LOCK: u8 = 3;

/// A hint exchanged between sessions. The backing store stays the source of
/// truth for lock state; these messages only unblock waiters and drop caches
/// earlier than expiration-based cleanup would.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExchangeMessage {
    /// Tells `session` (a read-lock holder) to drop its cached copy of the
    /// entry at `path`.
    InvalidateCacheEntry { path: PathBuf, session: SessionId },
    /// Announces that `session` released its read lock on `path`.
    ReleasedReadLock { path: PathBuf, session: SessionId },
    /// Announces that `session` released its write lock on `path`.
    ReleasedWriteLock { path: PathBuf, session: SessionId },
}

/// Raised for frames that cannot be decoded; the receive loop logs and drops
/// them, this error never reaches callers.
#[derive(Debug, thiserror::Error)]
#[error("malformed exchange frame: {0}")]
pub struct DecodeError(String);

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn take_string<'a>(bytes: &mut &'a [u8]) -> std::result::Result<&'a str, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError("truncated length prefix".into()));
    }
    let len = u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
    if bytes.len() < 4 + len {
        return Err(DecodeError(format!(
            "length prefix {} exceeds remaining {} bytes",
            len,
            bytes.len() - 4
        )));
    }
    let s = std::str::from_utf8(&bytes[4..4 + len])
        .map_err(|err| DecodeError(format!("invalid utf-8: {}", err)))?;
    *bytes = &bytes[4 + len..];
    Ok(s)
}

impl ExchangeMessage {
    fn message_type(&self) -> u8 {
        match self {
            Self::InvalidateCacheEntry { .. } => MESSAGE_INVALIDATE_CACHE_ENTRY,
            Self::ReleasedReadLock { .. } => MESSAGE_RELEASED_READ_LOCK,
            Self::ReleasedWriteLock { .. } => MESSAGE_RELEASED_WRITE_LOCK,
        }
    }

    fn path(&self) -> &PathBuf {
        match self {
            Self::InvalidateCacheEntry { path, .. }
            | Self::ReleasedReadLock { path, .. }
            | Self::ReleasedWriteLock { path, .. } => path,
        }
    }

    fn session(&self) -> &SessionId {
        match self {
            Self::InvalidateCacheEntry { session, .. }
            | Self::ReleasedReadLock { session, .. }
            | Self::ReleasedWriteLock { session, .. } => session,
        }
    }

    /// Serializes the message: one type byte, then the escaped path and the
    /// subject session id, each as 4-byte big-endian length plus UTF-8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.message_type());
        put_string(&mut buf, &self.path().escaped());
        put_string(&mut buf, &self.session().to_string());
        buf
    }

    /// Decodes a frame. `Ok(None)` is the reserved unknown message type,
    /// which receivers drop after logging.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Option<Self>, DecodeError> {
        let (message_type, mut rest) = match bytes.split_first() {
            Some(split) => split,
            None => return Err(DecodeError("empty frame".into())),
        };
        if *message_type == 0 {
            return Ok(None);
        }
        if *message_type > MESSAGE_RELEASED_WRITE_LOCK {
            return Err(DecodeError(format!("message type {}", message_type)));
        }
        let path = PathBuf::parse(take_string(&mut rest)?)
            .map_err(|err| DecodeError(err.to_string()))?;
        let session: SessionId = take_string(&mut rest)?
            .parse()
            .map_err(|err: anyhow::Error| DecodeError(err.to_string()))?;
        if !rest.is_empty() {
            return Err(DecodeError(format!("{} trailing bytes", rest.len())));
        }
        Ok(Some(match *message_type {
            MESSAGE_INVALIDATE_CACHE_ENTRY => Self::InvalidateCacheEntry { path, session },
            MESSAGE_RELEASED_READ_LOCK => Self::ReleasedReadLock { path, session },
            _ => Self::ReleasedWriteLock { path, session },
        }))
    }
}

/// The session-addressed message channel between coordination participants.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    /// Announces a read-lock release of `released_by` on `path` to every
    /// known session, the local one included.
    async fn notify_read_release(&self, path: &PathBuf, released_by: &SessionId) -> Result<()>;

    /// Announces a write-lock release of `released_by` on `path` to every
    /// known session, the local one included.
    async fn notify_write_release(&self, path: &PathBuf, released_by: &SessionId) -> Result<()>;

    /// Tells `holder` to drop its cached copy of `path`.
    async fn invalidate_cache(&self, path: &PathBuf, holder: &SessionId) -> Result<()>;
}

/// Per-session exchange actor: owns the logical endpoint registered under the
/// local session id, fans notifications out to peers, and dispatches received
/// frames into the local wait and invalidation directories.
///
/// Send failures are swallowed after a debug log. Waiters recover by
/// rereading authoritative state after any wakeup, so a lost message costs
/// latency, never correctness.
pub struct ExchangeManager<A: Address> {
    session: SessionId,
    endpoint: Arc<dyn MultiplexEndPoint<A>>,
    wait_directory: Arc<LockWaitDirectory>,
    invalidations: Arc<InvalidationCallbackDirectory>,
    sessions: Arc<SessionManager>,
    _receive_loop: async_global_executor::Task<()>,
}

impl<A: Address> ExchangeManager<A> {
    pub fn new(
        session: SessionId,
        multiplexer: &dyn Multiplexer<A>,
        wait_directory: Arc<LockWaitDirectory>,
        invalidations: Arc<InvalidationCallbackDirectory>,
        sessions: Arc<SessionManager>,
    ) -> Result<Arc<Self>> {
        let endpoint: Arc<dyn MultiplexEndPoint<A>> = Arc::from(
            multiplexer
                .open(&session.to_string())
                .map_err(Error::transport)?,
        );
        let receive_loop = async_global_executor::spawn(receive_loop(
            endpoint.clone(),
            session.clone(),
            wait_directory.clone(),
            invalidations.clone(),
        ));
        Ok(Arc::new(Self {
            session,
            endpoint,
            wait_directory,
            invalidations,
            sessions,
            _receive_loop: receive_loop,
        }))
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    fn remote_address(&self, peer: &SessionId) -> Option<LogicalAddress<A>> {
        let host = peer.address::<A>()?;
        Some(LogicalAddress {
            host,
            name: peer.to_string(),
        })
    }

    async fn send_to(&self, peer: &SessionId, message: ExchangeMessage) {
        let remote = match self.remote_address(peer) {
            Some(remote) => remote,
            None => {
                tracing::debug!("peer {:?} carries an undecodable address, dropping", peer);
                return;
            }
        };
        if let Err(err) = self.endpoint.send(message.encode(), &remote).await {
            tracing::debug!("exchange send to {:?} failed: {}", peer, err);
        }
    }

    async fn notify_release(
        &self,
        path: &PathBuf,
        released_by: &SessionId,
        write: bool,
    ) -> Result<()> {
        for peer in self.sessions.known_sessions().await? {
            if peer == self.session {
                if write {
                    self.wait_directory
                        .notify_write_release(path.as_path(), released_by);
                } else {
                    self.wait_directory
                        .notify_read_release(path.as_path(), released_by);
                }
            } else {
                let message = if write {
                    ExchangeMessage::ReleasedWriteLock {
                        path: path.clone(),
                        session: released_by.clone(),
                    }
                } else {
                    ExchangeMessage::ReleasedReadLock {
                        path: path.clone(),
                        session: released_by.clone(),
                    }
                };
                self.send_to(&peer, message).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<A: Address> Exchange for ExchangeManager<A> {
    async fn notify_read_release(&self, path: &PathBuf, released_by: &SessionId) -> Result<()> {
        self.notify_release(path, released_by, false).await
    }

    async fn notify_write_release(&self, path: &PathBuf, released_by: &SessionId) -> Result<()> {
        self.notify_release(path, released_by, true).await
    }

    async fn invalidate_cache(&self, path: &PathBuf, holder: &SessionId) -> Result<()> {
        if *holder == self.session {
            self.invalidations.invoke(path.as_path());
        } else {
            self.send_to(
                holder,
                ExchangeMessage::InvalidateCacheEntry {
                    path: path.clone(),
                    session: holder.clone(),
                },
            )
            .await;
        }
        Ok(())
    }
}

async fn receive_loop<A: Address>(
    endpoint: Arc<dyn MultiplexEndPoint<A>>,
    local: SessionId,
    wait_directory: Arc<LockWaitDirectory>,
    invalidations: Arc<InvalidationCallbackDirectory>,
) {
    loop {
        let (bytes, from) = match endpoint.receive().await {
            Ok(received) => received,
            Err(err) => {
                tracing::debug!("exchange endpoint closed: {}", err);
                break;
            }
        };
        match ExchangeMessage::decode(&bytes) {
            Ok(Some(ExchangeMessage::InvalidateCacheEntry { path, session })) => {
                if session == local {
                    invalidations.invoke(path.as_path());
                } else {
                    tracing::debug!(
                        "invalidation addressed to foreign session {:?}, dropping",
                        session
                    );
                }
            }
            Ok(Some(ExchangeMessage::ReleasedReadLock { path, session })) => {
                wait_directory.notify_read_release(path.as_path(), &session);
            }
            Ok(Some(ExchangeMessage::ReleasedWriteLock { path, session })) => {
                wait_directory.notify_write_release(path.as_path(), &session);
            }
            Ok(None) => {
                tracing::debug!("unknown exchange message type from {:?}, dropping", from);
            }
            Err(err) => {
                tracing::warn!("dropping exchange frame from {:?}: {}", from, err);
            }
        }
    }
}

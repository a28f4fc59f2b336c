//! A single wire-protocol stream to one server.

use crate::address::ServerAddress;
use crate::connector::{self, BoxedStream, SharedConnector, SharedHandshaker};
use crate::context::{Context, ContextError};
use crate::description::ServerDescription;
use crate::policy::ConnectionConfig;
use crate::wire::{self, Compressor, RequestIds};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection closed")]
    Closed,

    #[error("{op} cancelled")]
    Cancelled { op: &'static str },

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("invalid outgoing message: {reason}")]
    InvalidMessage { reason: String },

    #[error("failed to dial {address}: {source}")]
    Dial {
        address: ServerAddress,
        #[source]
        source: connector::Error,
    },

    #[error("handshake with {address} failed: {source}")]
    Handshake {
        address: ServerAddress,
        #[source]
        source: connector::Error,
    },
}

impl Error {
    fn from_context(op: &'static str, err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Error::Cancelled { op },
            ContextError::DeadlineExceeded => Error::Timeout { op },
        }
    }

    /// Errors which say something about the health of the server, rather
    /// than about the caller.
    pub fn is_network_error(&self) -> bool {
        !matches!(self, Error::Cancelled { .. } | Error::InvalidMessage { .. })
    }

    #[cfg(feature = "probes")]
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Error::Closed => "Closed",
            Error::Cancelled { .. } => "Cancelled",
            Error::Timeout { .. } => "Timeout",
            Error::Io { .. } => "Io",
            Error::Malformed { .. } => "Malformed",
            Error::InvalidMessage { .. } => "InvalidMessage",
            Error::Dial { .. } => "Dial",
            Error::Handshake { .. } => "Handshake",
        }
    }
}

/// Uniquely identifies a connection within a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The generation a connection was created in, and the live counter of its
/// owner. The connection is stale once the two differ.
#[derive(Clone, Debug)]
pub(crate) struct Generation {
    pub stamp: u64,
    pub current: Arc<AtomicU64>,
}

impl Generation {
    pub fn fresh() -> Self {
        Self {
            stamp: 0,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    fn is_stale(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.stamp
    }
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    address: ServerAddress,
    generation: Generation,
    config: Arc<ConnectionConfig>,
    request_ids: Arc<RequestIds>,

    stream: tokio::sync::Mutex<Option<BoxedStream>>,
    connected: AtomicBool,
    dead: AtomicBool,

    // Interrupts I/O in flight when the connection is closed from elsewhere.
    kill: CancellationToken,

    idle_deadline: Mutex<Option<Instant>>,
    lifetime_deadline: Option<Instant>,

    description: Mutex<Option<ServerDescription>>,
    compressor: Mutex<Option<Compressor>>,
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Closes the socket. Returns true only for the call which closed it.
    pub(crate) fn close(&self) -> bool {
        self.dead.store(true, Ordering::SeqCst);
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.kill.cancel();

        // If I/O holds the lock, it observes `kill` and drops the stream.
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
        event!(Level::TRACE, id = self.id.0, address = %self.address, "Closed connection");
        true
    }

    fn touch(&self) {
        *self.idle_deadline.lock().unwrap() =
            self.config.idle_timeout.map(|idle| Instant::now() + idle);
    }

    fn expired(&self) -> bool {
        if self.dead.load(Ordering::SeqCst) || self.generation.is_stale() {
            return true;
        }
        let now = Instant::now();
        if let Some(deadline) = *self.idle_deadline.lock().unwrap() {
            if now >= deadline {
                return true;
            }
        }
        matches!(self.lifetime_deadline, Some(deadline) if now >= deadline)
    }
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation.stamp)
            .field("connected", &self.connected)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

/// A wire-protocol byte stream to one server.
///
/// Owned by exactly one caller at a time. Any failure part way through a
/// read or write closes the connection, since the stream can no longer be
/// trusted to be at a message boundary.
#[derive(Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        address: ServerAddress,
        generation: Generation,
        stream: BoxedStream,
        config: Arc<ConnectionConfig>,
        request_ids: Arc<RequestIds>,
    ) -> Self {
        let now = Instant::now();
        let inner = ConnectionInner {
            id,
            address,
            generation,
            request_ids,
            stream: tokio::sync::Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
            dead: AtomicBool::new(false),
            kill: CancellationToken::new(),
            idle_deadline: Mutex::new(config.idle_timeout.map(|idle| now + idle)),
            lifetime_deadline: config.lifetime.map(|lifetime| now + lifetime),
            description: Mutex::new(None),
            compressor: Mutex::new(None),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.stamp
    }

    /// The description captured during the handshake.
    pub fn description(&self) -> Option<ServerDescription> {
        self.inner.description.lock().unwrap().clone()
    }

    /// The compressor negotiated during the handshake.
    pub fn compressor(&self) -> Option<Compressor> {
        *self.inner.compressor.lock().unwrap()
    }

    pub fn next_request_id(&self) -> i32 {
        self.inner.request_ids.next()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    /// True once the connection is dead, stale, or past its idle or
    /// lifetime deadline.
    pub fn expired(&self) -> bool {
        self.inner.expired()
    }

    /// Closes the socket. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.close();
    }

    fn begin(
        &self,
        op: &'static str,
        ctx: &Context,
        timeout: Option<Duration>,
    ) -> Result<Option<Instant>, Error> {
        if self.is_dead() {
            return Err(Error::Closed);
        }
        if let Some(err) = ctx.err() {
            return Err(Error::from_context(op, err));
        }
        Ok(match (timeout.map(|t| Instant::now() + t), ctx.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    // Runs I/O against the stream, bounded by the caller's context, the
    // effective deadline and the kill switch.
    async fn bounded<T>(
        &self,
        op: &'static str,
        ctx: &Context,
        deadline: Option<Instant>,
        io: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let timed = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, io)
                    .await
                    .unwrap_or(Err(Error::Timeout { op })),
                None => io.await,
            }
        };
        tokio::select! {
            biased;
            err = ctx.done() => Err(Error::from_context(op, err)),
            _ = self.inner.kill.cancelled() => Err(Error::Closed),
            result = timed => result,
        }
    }

    fn finish<T>(
        &self,
        op: &'static str,
        mut stream: tokio::sync::MutexGuard<'_, Option<BoxedStream>>,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => {
                self.inner.touch();
                Ok(value)
            }
            Err(err) => {
                event!(
                    Level::DEBUG,
                    id = self.inner.id.0,
                    address = %self.inner.address,
                    op,
                    err = %err,
                    "Closing connection after failed I/O"
                );
                stream.take();
                drop(stream);
                self.inner.close();
                Err(err)
            }
        }
    }

    /// Writes one complete message.
    ///
    /// The first four bytes of `message` must hold its length.
    pub async fn write_wire_message(&self, ctx: &Context, message: &[u8]) -> Result<(), Error> {
        const OP: &str = "write";
        match message.get(..4) {
            Some(len) if i32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize == message.len() => {}
            _ => {
                return Err(Error::InvalidMessage {
                    reason: format!("length prefix does not match {} byte message", message.len()),
                })
            }
        }

        let deadline = self.begin(OP, ctx, self.inner.config.write_timeout)?;
        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        let io = async {
            stream
                .write_all(message)
                .await
                .map_err(|source| Error::Io { op: OP, source })?;
            stream
                .flush()
                .await
                .map_err(|source| Error::Io { op: OP, source })
        };
        let result = self.bounded(OP, ctx, deadline, io).await;
        self.finish(OP, guard, result)
    }

    /// Reads one complete message, header included.
    pub async fn read_wire_message(&self, ctx: &Context) -> Result<Vec<u8>, Error> {
        const OP: &str = "read";
        let max = self.inner.config.max_message_size;

        let deadline = self.begin(OP, ctx, self.inner.config.read_timeout)?;
        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        let io = async {
            let mut len = [0u8; 4];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|source| Error::Io { op: OP, source })?;
            let declared = i32::from_le_bytes(len);
            if declared < wire::HEADER_LEN as i32 || declared as usize > max {
                return Err(Error::Malformed {
                    reason: format!("message length {declared} outside [{}, {max}]", wire::HEADER_LEN),
                });
            }
            let mut message = vec![0u8; declared as usize];
            message[..4].copy_from_slice(&len);
            stream
                .read_exact(&mut message[4..])
                .await
                .map_err(|source| Error::Io { op: OP, source })?;
            Ok(message)
        };
        let result = self.bounded(OP, ctx, deadline, io).await;
        self.finish(OP, guard, result)
    }
}

/// Everything needed to open connections to one server.
#[derive(Clone)]
pub(crate) struct Dialer {
    pub address: ServerAddress,
    pub connector: SharedConnector,
    pub handshaker: SharedHandshaker,
    pub config: Arc<ConnectionConfig>,
    pub request_ids: Arc<RequestIds>,
}

impl Dialer {
    /// Dials and handshakes a new connection, bounded by the connect
    /// timeout and `ctx`.
    pub async fn establish(
        &self,
        id: ConnectionId,
        generation: Generation,
        ctx: &Context,
    ) -> Result<Connection, Error> {
        let ctx = ctx.child_with_timeout(self.config.connect_timeout);

        let stream = tokio::select! {
            biased;
            err = ctx.done() => return Err(Error::from_context("dial", err)),
            result = self.connector.connect(&self.address) => {
                result.map_err(|source| Error::Dial {
                    address: self.address.clone(),
                    source,
                })?
            }
        };

        let conn = Connection::new(
            id,
            self.address.clone(),
            generation,
            stream,
            self.config.clone(),
            self.request_ids.clone(),
        );

        let result = tokio::select! {
            biased;
            err = ctx.done() => Err(Error::from_context("handshake", err)),
            result = self.handshaker.handshake(&conn, &ctx) => {
                result.map_err(|source| Error::Handshake {
                    address: self.address.clone(),
                    source,
                })
            }
        };
        let handshake = match result {
            Ok(handshake) => handshake,
            Err(err) => {
                conn.close();
                return Err(err);
            }
        };

        let compressor = wire::negotiate(&self.config.compressors, &handshake.compressors);
        *conn.inner.compressor.lock().unwrap() = compressor;
        *conn.inner.description.lock().unwrap() = Some(handshake.description);
        Ok(conn)
    }
}

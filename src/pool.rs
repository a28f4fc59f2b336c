//! A bounded pool of connections to a single server.

use crate::address::ServerAddress;
use crate::claim;
use crate::connection::{self, Connection, ConnectionId, ConnectionInner, Dialer, Generation};
use crate::context::{Context, ContextError};
use crate::join;
use crate::policy::PoolConfig;
#[cfg(feature = "probes")]
use crate::probes;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("pool is connected")]
    PoolConnected,

    #[error("pool is disconnected or disconnecting")]
    PoolDisconnected,

    #[error("pool is closed")]
    PoolClosed,

    #[error("connection does not belong to this pool")]
    WrongPool,

    #[error(transparent)]
    Connection(#[from] connection::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::PoolConnected => "PoolConnected",
            Error::PoolDisconnected => "PoolDisconnected",
            Error::PoolClosed => "PoolClosed",
            Error::WrongPool => "WrongPool",
            Error::Connection(_) => "Connection",
            Error::Context(_) => "Context",
        }
    }
}

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const DISCONNECTING: u8 = 3;

/// A point-in-time sample of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Connections which exist, idle or checked out.
    pub open: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub generation: u64,

    /// Successful checkouts over the life of the pool.
    pub checkouts: usize,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "open: {}, idle: {}, checked out: {}, generation: {}, checkouts: {}",
            self.open, self.idle, self.checked_out, self.generation, self.checkouts
        )
    }
}

/// Told about every error seen on a connection while it is checked out.
pub(crate) type ErrorHook = Box<dyn Fn(&Connection, &connection::Error) + Send + Sync>;

pub(crate) struct PoolInner {
    dialer: Dialer,
    config: PoolConfig,
    on_error: Option<ErrorHook>,

    state: AtomicU8,
    generation: Arc<AtomicU64>,

    // Most recently used at the back.
    idle: Mutex<VecDeque<Connection>>,

    // One permit per checked-out connection.
    permits: Arc<Semaphore>,

    // Every connection this pool has created and not yet closed.
    opened: Mutex<HashMap<ConnectionId, Arc<ConnectionInner>>>,
    retired: Notify,

    // Cancelled when the current connect/disconnect cycle ends.
    lifecycle: Mutex<CancellationToken>,
    pruner: Mutex<Option<JoinHandle<()>>>,

    next_connection_id: AtomicU64,
    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    next_checkout_id: AtomicU64,
    checkouts: AtomicUsize,
}

impl PoolInner {
    fn address(&self) -> &ServerAddress {
        &self.dialer.address
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    fn retire(&self, conn: Connection) {
        conn.close();
        self.opened.lock().unwrap().remove(&conn.id());
        self.retired.notify_waiters();
    }

    pub(crate) fn report_error(&self, conn: &Connection, err: &connection::Error) {
        if let Some(on_error) = &self.on_error {
            on_error(conn, err);
        }
    }

    /// The return path for checked-out connections.
    pub(crate) fn check_in(&self, conn: Connection) {
        #[cfg(feature = "probes")]
        probes::connection__returned!(|| (self.address().as_str(), conn.id().as_u64()));

        if conn.expired() {
            self.retire(conn);
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        if !self.is_connected() || idle.len() >= self.config.max_idle {
            drop(idle);
            self.retire(conn);
            return;
        }
        idle.push_back(conn);
    }

    fn prune(&self) {
        let expired: VecDeque<Connection> = {
            let mut idle = self.idle.lock().unwrap();
            let (expired, live): (VecDeque<_>, VecDeque<_>) =
                idle.drain(..).partition(|conn: &Connection| conn.expired());
            *idle = live;
            expired
        };
        if !expired.is_empty() {
            event!(
                Level::DEBUG,
                address = %self.address(),
                count = expired.len(),
                "Pruning expired idle connections"
            );
        }
        for conn in expired {
            self.retire(conn);
        }
    }

    async fn dial(&self, ctx: &Context, lifecycle: &CancellationToken) -> Result<Connection, Error> {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let generation = Generation {
            stamp: self.generation.load(Ordering::SeqCst),
            current: self.generation.clone(),
        };

        #[cfg(feature = "probes")]
        probes::connect__start!(|| (self.address().as_str(), id.as_u64()));

        let result = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => Err(Error::PoolClosed),
            result = self.dialer.establish(id, generation, ctx) => result.map_err(Error::from),
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                event!(Level::WARN, address = %self.address(), err = %err, "Failed to connect");
                #[cfg(feature = "probes")]
                probes::connect__failed!(|| (self.address().as_str(), id.as_u64(), err.as_str()));
                return Err(err);
            }
        };

        // Registration and the state check share the lock, so a concurrent
        // disconnect either waits for this connection or never sees it.
        {
            let mut opened = self.opened.lock().unwrap();
            if !self.is_connected() {
                drop(opened);
                conn.close();
                #[cfg(feature = "probes")]
                probes::connect__failed!(|| (self.address().as_str(), id.as_u64(), "PoolClosed"));
                return Err(Error::PoolClosed);
            }
            opened.insert(id, conn.inner().clone());
        }

        #[cfg(feature = "probes")]
        probes::connect__done!(|| (self.address().as_str(), id.as_u64()));
        event!(Level::DEBUG, address = %self.address(), id = id.as_u64(), "Opened connection");
        Ok(conn)
    }
}

/// Manages the connections to one server.
///
/// Connections are stamped with the pool's generation when they are made.
/// [Pool::drain] bumps the generation, so every existing connection is
/// discarded the next time the pool looks at it.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Errors from reads and writes through checked-out handles are passed
    /// to `on_error`, if given.
    pub(crate) fn new(dialer: Dialer, config: PoolConfig, on_error: Option<ErrorHook>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_pool_size));
        Self {
            inner: Arc::new(PoolInner {
                dialer,
                config,
                on_error,
                state: AtomicU8::new(DISCONNECTED),
                generation: Arc::new(AtomicU64::new(0)),
                idle: Mutex::new(VecDeque::new()),
                permits,
                opened: Mutex::new(HashMap::new()),
                retired: Notify::new(),
                lifecycle: Mutex::new(CancellationToken::new()),
                pruner: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                next_checkout_id: AtomicU64::new(1),
                checkouts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        self.inner.address()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Starts handing out connections.
    pub fn connect(&self) -> Result<(), Error> {
        self.inner
            .state
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::PoolConnected)?;

        let lifecycle = CancellationToken::new();
        *self.inner.lifecycle.lock().unwrap() = lifecycle.clone();

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.prune_interval;
        let pruner = tokio::task::spawn(prune_loop(weak, period, lifecycle));
        *self.inner.pruner.lock().unwrap() = Some(pruner);

        self.inner.state.store(CONNECTED, Ordering::SeqCst);
        event!(Level::INFO, address = %self.address(), "Pool connected");
        Ok(())
    }

    /// Invalidates every connection made so far.
    pub fn drain(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        event!(Level::INFO, address = %self.address(), generation, "Pool drained");
        #[cfg(feature = "probes")]
        probes::pool__drained!(|| (self.address().as_str(), generation));
    }

    /// Checks out a connection, reusing an idle one when possible.
    #[instrument(level = "debug", skip(self, ctx), err, fields(address = %self.address()), name = "Pool::get")]
    pub async fn get(&self, ctx: &Context) -> Result<claim::Handle, Error> {
        #[cfg(feature = "probes")]
        let checkout_id = self.inner.next_checkout_id.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "probes")]
        probes::checkout__start!(|| (self.address().as_str(), checkout_id));

        let result = self.do_get(ctx).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(handle) => probes::checkout__done!(|| (
                self.address().as_str(),
                checkout_id,
                handle.id().as_u64()
            )),
            Err(err) => {
                probes::checkout__failed!(|| (self.address().as_str(), checkout_id, err.as_str()))
            }
        }
        result
    }

    async fn do_get(&self, ctx: &Context) -> Result<claim::Handle, Error> {
        if !self.is_connected() {
            return Err(Error::PoolClosed);
        }
        let lifecycle = self.inner.lifecycle.lock().unwrap().clone();

        let permit = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            _ = lifecycle.cancelled() => return Err(Error::PoolClosed),
            permit = self.inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::PoolClosed)?
            }
        };

        loop {
            let candidate = self.inner.idle.lock().unwrap().pop_back();
            let Some(conn) = candidate else {
                break;
            };
            if conn.expired() {
                event!(Level::TRACE, id = conn.id().as_u64(), "Discarding expired idle connection");
                self.inner.retire(conn);
                continue;
            }
            self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
            return Ok(claim::Handle::new(conn, permit, self.inner.clone()));
        }

        let conn = self.inner.dial(ctx, &lifecycle).await?;
        self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(claim::Handle::new(conn, permit, self.inner.clone()))
    }

    /// Returns a checked-out connection early.
    ///
    /// Handles from other pools are refused, and go back to their own pool
    /// when dropped.
    pub fn put(&self, handle: claim::Handle) -> Result<(), Error> {
        if !handle.belongs_to(&self.inner) {
            return Err(Error::WrongPool);
        }
        drop(handle);
        Ok(())
    }

    /// Stops handing out connections and closes every connection.
    ///
    /// Waits for checked-out connections to come back until `ctx` is done,
    /// then closes whatever is still open. No connections remain open once
    /// this returns.
    #[instrument(skip(self, ctx), fields(address = %self.address()), name = "Pool::disconnect")]
    pub async fn disconnect(&self, ctx: &Context) -> Result<(), Error> {
        self.inner
            .state
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::PoolDisconnected)?;

        self.inner.lifecycle.lock().unwrap().cancel();
        let idle: Vec<Connection> = self.inner.idle.lock().unwrap().drain(..).collect();
        for conn in idle {
            self.inner.retire(conn);
        }
        let pruner = self.inner.pruner.lock().unwrap().take();
        if let Some(pruner) = pruner {
            join::join(pruner).await;
        }

        loop {
            let retired = self.inner.retired.notified();
            tokio::pin!(retired);
            retired.as_mut().enable();

            let outstanding = self.inner.opened.lock().unwrap().len();
            if outstanding == 0 {
                break;
            }
            event!(Level::DEBUG, outstanding, "Waiting for connections to be returned");

            tokio::select! {
                _ = retired => {}
                err = ctx.done() => {
                    let opened: Vec<_> = self
                        .inner
                        .opened
                        .lock()
                        .unwrap()
                        .drain()
                        .map(|(_, conn)| conn)
                        .collect();
                    event!(
                        Level::WARN,
                        count = opened.len(),
                        reason = %err,
                        "Forcibly closing checked-out connections"
                    );
                    for conn in opened {
                        conn.close();
                    }
                    break;
                }
            }
        }

        self.inner.state.store(DISCONNECTED, Ordering::SeqCst);
        event!(Level::INFO, "Pool disconnected");
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let idle = self.inner.idle.lock().unwrap().len();
        let open = self.inner.opened.lock().unwrap().len();
        Stats {
            open,
            idle,
            checked_out: self
                .inner
                .config
                .max_pool_size
                .saturating_sub(self.inner.permits.available_permits()),
            generation: self.generation(),
            checkouts: self.inner.checkouts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.state.store(DISCONNECTED, Ordering::SeqCst);
        self.inner.lifecycle.lock().unwrap().cancel();
        if let Some(handle) = self.inner.pruner.lock().unwrap().take() {
            handle.abort();
        }
        let idle: Vec<Connection> = self.inner.idle.lock().unwrap().drain(..).collect();
        for conn in idle {
            self.inner.retire(conn);
        }
    }
}

async fn prune_loop(pool: Weak<PoolInner>, period: std::time::Duration, lifecycle: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.reset();
    loop {
        tokio::select! {
            _ = lifecycle.cancelled() => return,
            _ = interval.tick() => {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.prune();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::policy::ConnectionConfig;
    use crate::test_utils::{addr, setup_tracing_subscriber, wait_for, MemoryConnector, ScriptedHandshaker};
    use crate::wire::{self, OpCode, RequestIds};
    use std::collections::HashSet;
    use std::time::Duration;

    fn setup(
        connection: ConnectionConfig,
        config: PoolConfig,
    ) -> (Pool, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let dialer = Dialer {
            address: addr("a"),
            connector: connector.clone(),
            handshaker: Arc::new(ScriptedHandshaker::new()),
            config: Arc::new(connection),
            request_ids: Arc::new(RequestIds::new()),
        };
        let pool = Pool::new(dialer, config, None);
        pool.connect().unwrap();
        (pool, connector)
    }

    fn default_pool() -> (Pool, Arc<MemoryConnector>) {
        setup(ConnectionConfig::default(), PoolConfig::default())
    }

    #[tokio::test]
    async fn test_reuses_idle_connections() {
        let (pool, connector) = default_pool();
        let ctx = Context::background();

        let id = {
            let handle = pool.get(&ctx).await.unwrap();
            handle.id()
        };
        let handle = pool.get(&ctx).await.unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(connector.dials(), 1);
        assert_eq!(pool.stats().checkouts, 2);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (pool, _connector) = default_pool();
        let ctx = Context::background();

        assert!(matches!(pool.connect(), Err(Error::PoolConnected)));
        pool.disconnect(&ctx).await.unwrap();
        assert!(matches!(pool.disconnect(&ctx).await, Err(Error::PoolDisconnected)));
        assert!(matches!(pool.get(&ctx).await, Err(Error::PoolClosed)));

        pool.connect().unwrap();
        pool.get(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_invalidates_existing_connections() {
        let (pool, connector) = default_pool();
        let ctx = Context::background();

        let old = pool.get(&ctx).await.unwrap();
        assert!(!old.expired());
        pool.drain();
        assert!(old.expired());

        let new = pool.get(&ctx).await.unwrap();
        assert!(!new.expired());
        assert_eq!(new.generation(), 1);

        // The old connection is closed instead of re-pooled.
        drop(old);
        assert_eq!(pool.stats().idle, 0);
        drop(new);
        assert_eq!(pool.stats().idle, 1);

        wait_for(Duration::from_secs(5), || connector.live() == 1).await;
    }

    #[tokio::test]
    async fn test_idle_capacity_is_bounded() {
        let max_idle = 2;
        let (pool, connector) = setup(
            ConnectionConfig::default(),
            PoolConfig {
                max_idle,
                ..Default::default()
            },
        );
        let ctx = Context::background();

        let mut handles = vec![];
        for _ in 0..max_idle + 1 {
            handles.push(pool.get(&ctx).await.unwrap());
        }
        assert_eq!(connector.dials(), max_idle + 1);
        for handle in handles.drain(..) {
            drop(handle);
            assert!(pool.stats().idle <= max_idle);
        }
        assert_eq!(pool.stats().idle, max_idle);
        assert_eq!(pool.stats().open, max_idle);
        wait_for(Duration::from_secs(5), || connector.live() == max_idle).await;
    }

    #[tokio::test]
    async fn test_no_connection_is_handed_out_twice() {
        let (pool, _connector) = setup(
            ConnectionConfig::default(),
            PoolConfig {
                max_pool_size: 4,
                ..Default::default()
            },
        );
        let pool = Arc::new(pool);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = vec![];
        for _ in 0..16 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = Context::background();
                for _ in 0..20 {
                    let handle = pool.get(&ctx).await.unwrap();
                    assert!(in_use.lock().unwrap().insert(handle.id()));
                    let message = wire::frame(handle.next_request_id(), 0, OpCode::Msg, b"x");
                    handle.write_wire_message(&ctx, &message).await.unwrap();
                    handle.read_wire_message(&ctx).await.unwrap();
                    assert!(in_use.lock().unwrap().remove(&handle.id()));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.stats().open <= 4);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_capacity() {
        let (pool, _connector) = setup(
            ConnectionConfig::default(),
            PoolConfig {
                max_pool_size: 1,
                ..Default::default()
            },
        );
        let held = pool.get(&Context::background()).await.unwrap();

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = pool.get(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)));

        drop(held);
        pool.get(&Context::background()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_closes_idle_connections() {
        setup_tracing_subscriber();
        let (pool, connector) = setup(
            ConnectionConfig {
                idle_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
            PoolConfig {
                prune_interval: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let ctx = Context::background();
        drop(pool.get(&ctx).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
        wait_for(Duration::from_secs(5), || connector.live() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_connection_is_not_reused() {
        let (pool, connector) = setup(
            ConnectionConfig {
                idle_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
            PoolConfig::default(),
        );
        let ctx = Context::background();
        let first = pool.get(&ctx).await.unwrap().id();

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = pool.get(&ctx).await.unwrap().id();
        assert_ne!(first, second);
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_returned_connections() {
        let (pool, connector) = default_pool();
        let pool = Arc::new(pool);
        let handle = pool.get(&Context::background()).await.unwrap();

        let returner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(handle);
        });
        pool.disconnect(&Context::background()).await.unwrap();
        returner.await.unwrap();
        assert_eq!(pool.stats().open, 0);
        wait_for(Duration::from_secs(5), || connector.live() == 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_force_closes_after_deadline() {
        setup_tracing_subscriber();
        let (pool, connector) = default_pool();
        let ctx = Context::background();
        let held = pool.get(&ctx).await.unwrap();
        drop(pool.get(&ctx).await.unwrap());
        wait_for(Duration::from_secs(5), || connector.live() == 2).await;

        pool.disconnect(&Context::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(pool.stats().open, 0);
        assert!(held.is_dead());
        wait_for(Duration::from_secs(5), || connector.live() == 0).await;

        // Returning it later is harmless.
        drop(held);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_put_rejects_foreign_connections() {
        let (a, _) = default_pool();
        let (b, _) = default_pool();
        let ctx = Context::background();

        let handle = b.get(&ctx).await.unwrap();
        assert!(matches!(a.put(handle), Err(Error::WrongPool)));
        assert_eq!(b.stats().idle, 1);

        let handle = a.get(&ctx).await.unwrap();
        a.put(handle).unwrap();
        assert_eq!(a.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_closed_handles_are_discarded() {
        let (pool, connector) = default_pool();
        let ctx = Context::background();
        let handle = pool.get(&ctx).await.unwrap();
        handle.close();
        drop(handle);
        assert_eq!(pool.stats().idle, 0);
        pool.get(&ctx).await.unwrap();
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_dial_failures_are_reported() {
        let (pool, connector) = default_pool();
        connector.refuse(&addr("a"));
        let err = pool.get(&Context::background()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(connection::Error::Dial { .. })
        ));
        // The permit is released on failure.
        assert_eq!(pool.stats().checked_out, 0);
    }
}

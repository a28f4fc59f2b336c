//! A single server: its connection pool and its heartbeat monitor.

use crate::address::ServerAddress;
use crate::claim;
use crate::connection::{self, Connection, ConnectionId, Dialer, Generation};
use crate::context::Context;
use crate::description::{ServerDescription, ServerKind};
use crate::join;
use crate::policy::{MonitorConfig, PoolConfig};
use crate::pool::{self, ErrorHook, Pool};
#[cfg(feature = "probes")]
use crate::probes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("server is connected")]
    ServerConnected,

    #[error("server is disconnected")]
    ServerDisconnected,

    #[error(transparent)]
    Pool(#[from] pool::Error),
}

struct ServerInner {
    dialer: Dialer,
    pool: Pool,
    config: MonitorConfig,

    description: watch::Sender<ServerDescription>,
    check_now: Notify,

    connected: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInner {
    fn address(&self) -> &ServerAddress {
        &self.dialer.address
    }

    fn publish(&self, description: ServerDescription) {
        let previous = self.description.send_replace(description);
        let current = self.description.borrow();
        if previous.kind != current.kind {
            event!(
                Level::INFO,
                address = %self.address(),
                from = %previous.kind,
                to = %current.kind,
                "Server kind changed"
            );
        }
    }

    // Marks the server Unknown and invalidates its pool.
    fn mark_unknown(&self, err: &connection::Error) {
        if !err.is_network_error() || !self.connected.load(Ordering::SeqCst) {
            return;
        }
        event!(Level::WARN, address = %self.address(), err = %err, "Marking server unknown");
        self.publish(ServerDescription::unknown_with_error(self.address().clone(), err));
        self.pool.drain();
        self.check_now.notify_one();
    }

    fn process_error(&self, conn: &Connection, err: &connection::Error) {
        if conn.generation() < self.pool.generation() {
            return;
        }
        self.mark_unknown(err);
    }

    // Runs one check over the monitoring connection, dialing it first if
    // needed. Returns the description and the measured round trip.
    async fn check(
        &self,
        conn: &mut Option<Connection>,
    ) -> Result<(ServerDescription, Duration), connection::Error> {
        if conn.as_ref().is_some_and(|c| c.is_dead()) {
            *conn = None;
        }
        let ctx = Context::with_timeout(self.dialer.config.connect_timeout);
        let start = Instant::now();

        let description = if let Some(c) = conn.as_ref() {
            let result = self.dialer.handshaker.heartbeat(c, &ctx).await;
            match result {
                Ok(description) => description,
                Err(source) => {
                    c.close();
                    *conn = None;
                    return Err(connection::Error::Handshake {
                        address: self.address().clone(),
                        source,
                    });
                }
            }
        } else {
            let c = self
                .dialer
                .establish(ConnectionId(0), Generation::fresh(), &ctx)
                .await?;
            let description = c
                .description()
                .unwrap_or_else(|| ServerDescription::new(self.address().clone()));
            *conn = Some(c);
            description
        };
        Ok((description, start.elapsed()))
    }

    async fn heartbeat(&self, conn: &mut Option<Connection>, average_rtt: &mut Option<Duration>) {
        #[cfg(feature = "probes")]
        probes::heartbeat__start!(|| self.address().as_str());

        let was_known = self.description.borrow().kind != ServerKind::Unknown;
        let mut result = self.check(conn).await;
        if result.is_err() && was_known {
            // A known server gets one immediate retry on a fresh connection.
            event!(Level::DEBUG, address = %self.address(), "Retrying failed heartbeat");
            result = self.check(conn).await;
        }

        match result {
            Ok((mut description, rtt)) => {
                let alpha = self.config.rtt_alpha;
                let average = match *average_rtt {
                    Some(previous) => previous.mul_f64(1.0 - alpha) + rtt.mul_f64(alpha),
                    None => rtt,
                };
                *average_rtt = Some(average);
                description.address = self.address().clone();
                description.average_rtt = Some(average);

                #[cfg(feature = "probes")]
                probes::heartbeat__done!(|| (
                    self.address().as_str(),
                    description.kind.as_str(),
                    u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX)
                ));
                event!(
                    Level::TRACE,
                    address = %self.address(),
                    kind = %description.kind,
                    rtt = ?rtt,
                    "Heartbeat succeeded"
                );
                self.publish(description);
            }
            Err(err) => {
                #[cfg(feature = "probes")]
                probes::heartbeat__failed!(|| (self.address().as_str(), err.as_str()));
                event!(Level::WARN, address = %self.address(), err = %err, "Heartbeat failed");
                *average_rtt = None;
                self.publish(ServerDescription::unknown_with_error(self.address().clone(), &err));
                self.pool.drain();
            }
        }
    }
}

async fn monitor_loop(inner: Arc<ServerInner>, shutdown: CancellationToken) {
    let mut conn: Option<Connection> = None;
    let mut average_rtt = None;

    loop {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = inner.heartbeat(&mut conn, &mut average_rtt) => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.heartbeat_interval) => {}
            _ = inner.check_now.notified() => {
                let earliest = started + inner.config.min_heartbeat_interval;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(earliest) => {}
                }
            }
        }
    }

    if let Some(conn) = conn {
        conn.close();
    }
    event!(Level::DEBUG, address = %inner.address(), "Monitor exited");
}

/// One member of a topology.
///
/// While connected, a background task checks the server every heartbeat
/// interval and publishes what it learns through [Server::subscribe].
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub(crate) fn new(dialer: Dialer, pool: PoolConfig, config: MonitorConfig) -> Self {
        let address = dialer.address.clone();
        let (description, _) = watch::channel(ServerDescription::new(address));
        let inner = Arc::new_cyclic(|server: &Weak<ServerInner>| {
            let server = server.clone();
            let on_error: ErrorHook = Box::new(move |conn: &Connection, err: &connection::Error| {
                if let Some(server) = server.upgrade() {
                    server.process_error(conn, err);
                }
            });
            ServerInner {
                pool: Pool::new(dialer.clone(), pool, Some(on_error)),
                dialer,
                config,
                description,
                check_now: Notify::new(),
                connected: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                monitor: Mutex::new(None),
            }
        });
        Self { inner }
    }

    pub fn address(&self) -> &ServerAddress {
        self.inner.address()
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The most recent description of this server.
    pub fn description(&self) -> ServerDescription {
        self.inner.description.borrow().clone()
    }

    /// Observes every description published from now on.
    pub fn subscribe(&self) -> watch::Receiver<ServerDescription> {
        self.inner.description.subscribe()
    }

    /// Starts the pool and the heartbeat monitor.
    pub fn connect(&self) -> Result<(), Error> {
        self.inner
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::ServerConnected)?;
        if let Err(err) = self.inner.pool.connect() {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(err.into());
        }

        let shutdown = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap() = shutdown.clone();
        let monitor = tokio::task::spawn(monitor_loop(self.inner.clone(), shutdown));
        *self.inner.monitor.lock().unwrap() = Some(monitor);
        event!(Level::DEBUG, address = %self.address(), "Server connected");
        Ok(())
    }

    /// Asks the monitor to check the server now, rather than at the next
    /// heartbeat. Checks still never start closer together than the
    /// minimum heartbeat interval.
    pub fn request_immediate_check(&self) {
        self.inner.check_now.notify_one();
    }

    /// Checks out a connection to this server.
    ///
    /// A network error while connecting marks the server Unknown.
    pub async fn connection(&self, ctx: &Context) -> Result<claim::Handle, Error> {
        match self.inner.pool.get(ctx).await {
            Ok(handle) => Ok(handle),
            Err(pool::Error::Connection(err)) => {
                self.inner.mark_unknown(&err);
                Err(pool::Error::Connection(err).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reports an error seen while using `conn`.
    ///
    /// Network errors on connections from the pool's current generation mark
    /// the server Unknown. Errors on connections which were already stale
    /// say nothing new about the server. Reads and writes through a
    /// [claim::Handle] report their own errors.
    pub fn process_error(&self, conn: &Connection, err: &connection::Error) {
        self.inner.process_error(conn, err);
    }

    /// Stops the monitor and closes every connection.
    #[instrument(skip(self, ctx), fields(address = %self.address()), name = "Server::disconnect")]
    pub async fn disconnect(&self, ctx: &Context) -> Result<(), Error> {
        self.inner
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::ServerDisconnected)?;

        self.inner.shutdown.lock().unwrap().cancel();
        let monitor = self.inner.monitor.lock().unwrap().take();
        if let Some(monitor) = monitor {
            join::join(monitor).await;
        }
        self.inner.pool.disconnect(ctx).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", self.address())
            .field("kind", &self.inner.description.borrow().kind)
            .finish_non_exhaustive()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown.lock().unwrap().cancel();
        if let Some(monitor) = self.inner.monitor.lock().unwrap().take() {
            monitor.abort();
        }
    }
}

//! The topology: every known server, and selection among them.

use crate::address::ServerAddress;
use crate::claim;
use crate::connection::Dialer;
use crate::connector::{SharedConnector, SharedHandshaker};
use crate::context::{Context, ContextError};
use crate::description::{ServerDescription, ServerKind, TopologyDescription, TopologyKind};
use crate::fsm::Fsm;
use crate::join;
use crate::policy::{self, MonitorMode, Policy};
#[cfg(feature = "probes")]
use crate::probes;
use crate::selector::{CompositeSelector, LatencySelector, ReadPref, ReadPrefSelector, ServerSelector, WriteSelector};
use crate::server::{self, Server};
use crate::session::SessionPool;
use crate::wire::RequestIds;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(feature = "probes")]
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("topology is connected")]
    TopologyConnected,

    #[error("topology is disconnected or disconnecting")]
    TopologyDisconnected,

    #[error("topology is closed")]
    TopologyClosed,

    #[error("topology subscriptions are closed")]
    SubscriptionsClosed,

    #[error("server selection timed out; current topology: {topology}")]
    ServerSelectionTimeout { topology: String },

    #[error("{reason}")]
    Incompatible { reason: String },

    #[error("server selector failed; current topology: {topology}")]
    Selector {
        topology: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::TopologyConnected => "TopologyConnected",
            Error::TopologyDisconnected => "TopologyDisconnected",
            Error::TopologyClosed => "TopologyClosed",
            Error::SubscriptionsClosed => "SubscriptionsClosed",
            Error::ServerSelectionTimeout { .. } => "ServerSelectionTimeout",
            Error::Incompatible { .. } => "Incompatible",
            Error::Selector { .. } => "Selector",
            Error::Context(_) => "Context",
            Error::Policy(_) => "Policy",
        }
    }
}

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const DISCONNECTING: u8 = 3;

type Servers = Arc<Mutex<HashMap<ServerAddress, Arc<Server>>>>;

// Builds the servers of one topology, all sharing its settings.
#[derive(Clone)]
struct ServerFactory {
    connector: SharedConnector,
    handshaker: SharedHandshaker,
    policy: Arc<Policy>,
    request_ids: Arc<RequestIds>,
}

impl ServerFactory {
    fn build(&self, address: &ServerAddress) -> Arc<Server> {
        let dialer = Dialer {
            address: address.clone(),
            connector: self.connector.clone(),
            handshaker: self.handshaker.clone(),
            config: Arc::new(self.policy.connection.clone()),
            request_ids: self.request_ids.clone(),
        };
        let server = Arc::new(Server::new(
            dialer,
            self.policy.pool.clone(),
            self.policy.monitor.clone(),
        ));
        if let Err(err) = server.connect() {
            event!(Level::ERROR, address = %address, err = %err, "Failed to start server");
        }
        server
    }
}

enum Request {
    Terminate,
}

// Owns the state machine. All changes to the topology happen here.
struct Worker {
    fsm: Fsm,
    factory: ServerFactory,
    servers: Servers,
    snapshot: Arc<watch::Sender<Arc<TopologyDescription>>>,
    rx: mpsc::Receiver<Request>,
    updates: StreamMap<ServerAddress, WatchStream<ServerDescription>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(Request::Terminate) | None => {
                            event!(Level::DEBUG, "Topology worker exiting");
                            return;
                        }
                    }
                }
                Some((_, description)) = self.updates.next() => {
                    self.apply(description);
                }
            }
        }
    }

    fn apply(&mut self, description: ServerDescription) {
        let old = self.snapshot.borrow().clone();
        let new = self.fsm.apply(description);
        let diff = TopologyDescription::diff(&old, &new);

        let mut removed = vec![];
        {
            let mut servers = self.servers.lock().unwrap();
            for address in &diff.added {
                if servers.contains_key(address) {
                    continue;
                }
                event!(Level::INFO, address = %address, "Discovered server");
                let server = self.factory.build(address);
                self.updates
                    .insert(address.clone(), WatchStream::new(server.subscribe()));
                servers.insert(address.clone(), server);
            }
            for address in &diff.removed {
                self.updates.remove(address);
                if let Some(server) = servers.remove(address) {
                    removed.push(server);
                }
            }
        }
        for server in removed {
            event!(Level::INFO, address = %server.address(), "Removing server");
            tokio::task::spawn(async move {
                if let Err(err) = server.disconnect(&Context::background()).await {
                    event!(Level::WARN, address = %server.address(), err = %err, "Failed to disconnect removed server");
                }
            });
        }

        if old.kind != new.kind {
            event!(Level::INFO, from = %old.kind, to = %new.kind, "Topology kind changed");
        }
        #[cfg(feature = "probes")]
        probes::topology__changed!(|| (new.kind.as_str(), new.servers.len() as u64));
        self.snapshot.send_replace(Arc::new(new));
    }
}

/// A stream of topology snapshots.
///
/// The first call to [Subscription::next] returns the snapshot current at
/// the time of subscribing. Later calls wait for a newer one. Snapshots
/// which arrive while nobody is waiting are replaced, not queued.
pub struct Subscription {
    rx: watch::Receiver<Arc<TopologyDescription>>,
    closed: CancellationToken,
    primed: bool,
}

impl Subscription {
    pub async fn next(&mut self) -> Result<Arc<TopologyDescription>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::TopologyClosed);
        }
        if !self.primed {
            self.primed = true;
            return Ok(self.rx.borrow_and_update().clone());
        }
        let changed = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::TopologyClosed),
            changed = self.rx.changed() => changed,
        };
        changed.map_err(|_| Error::SubscriptionsClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// A server chosen by [Topology::select_server].
#[derive(Clone, Debug)]
pub struct SelectedServer {
    pub server: Arc<Server>,

    /// The topology kind at the time of selection.
    pub kind: TopologyKind,
}

impl SelectedServer {
    pub async fn connection(&self, ctx: &Context) -> Result<claim::Handle, server::Error> {
        self.server.connection(ctx).await
    }
}

/// Error which may be returned from [Topology::new].
///
/// Holds the topology, which is usable without probes.
pub struct RegistrationError(Topology);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained topology.
    pub fn into_inner(self) -> Topology {
        self.0
    }
}

/// Monitors a deployment and selects servers from it.
///
/// [Topology::connect] starts one [Server] per seed. A single worker task
/// folds each server's heartbeat results into the topology description,
/// adding servers as they are discovered and dropping those which leave.
/// Readers only ever see whole, immutable snapshots.
pub struct Topology {
    factory: ServerFactory,
    state: AtomicU8,

    servers: Servers,
    snapshot: Arc<watch::Sender<Arc<TopologyDescription>>>,
    sessions: Arc<SessionPool>,

    // Cancelled when the current connect/disconnect cycle ends.
    lifecycle: Mutex<CancellationToken>,
    tx: Mutex<Option<mpsc::Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    session_sync: Mutex<Option<JoinHandle<()>>>,

    #[cfg(feature = "probes")]
    next_select_id: AtomicU64,
}

impl Topology {
    /// Creates a topology which will monitor the seeds named in `policy`.
    ///
    /// - connector: Opens byte streams to servers.
    /// - handshaker: Speaks the handshake and heartbeat commands.
    ///
    /// ```no_run
    /// use sdam::connectors::tcp::TcpConnector;
    /// use sdam::context::Context;
    /// use sdam::policy::Policy;
    /// use sdam::selector::WriteSelector;
    /// use sdam::topology::Topology;
    /// use std::sync::Arc;
    ///
    /// # async fn example(handshaker: sdam::connector::SharedHandshaker) {
    /// let policy = Policy::from_uri("mongodb://db1,db2/?replicaSet=rs0").unwrap();
    /// let topology = Topology::new(policy, Arc::new(TcpConnector {}), handshaker).unwrap();
    /// topology.connect().unwrap();
    ///
    /// let ctx = Context::background();
    /// let selected = topology.select_server(&ctx, &WriteSelector).await.unwrap();
    /// let conn = selected.connection(&ctx).await.unwrap();
    /// # }
    /// ```
    pub fn new(
        policy: Policy,
        connector: SharedConnector,
        handshaker: SharedHandshaker,
    ) -> Result<Self, RegistrationError> {
        let policy = Arc::new(policy);
        let (snapshot, _) = watch::channel(Arc::new(initial_description(&policy)));
        let lifecycle = CancellationToken::new();
        lifecycle.cancel();

        let self_ = Self {
            factory: ServerFactory {
                connector,
                handshaker,
                policy,
                request_ids: Arc::new(RequestIds::new()),
            },
            state: AtomicU8::new(DISCONNECTED),
            servers: Arc::new(Mutex::new(HashMap::new())),
            snapshot: Arc::new(snapshot),
            sessions: Arc::new(SessionPool::new()),
            lifecycle: Mutex::new(lifecycle),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            session_sync: Mutex::new(None),
            #[cfg(feature = "probes")]
            next_select_id: AtomicU64::new(1),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    pub fn policy(&self) -> &Policy {
        &self.factory.policy
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    /// The current topology snapshot.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.snapshot.borrow().clone()
    }

    /// Server sessions, available while the deployment supports them.
    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Starts monitoring the seed list.
    pub fn connect(&self) -> Result<(), Error> {
        self.state
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::TopologyConnected)?;
        let policy = self.factory.policy.clone();
        if let Err(err) = policy.validate() {
            self.state.store(DISCONNECTED, Ordering::SeqCst);
            return Err(err.into());
        }

        let fsm = Fsm::new(
            initial_kind(&policy),
            policy.replica_set.clone(),
            policy.seeds.iter().cloned(),
        );
        self.snapshot.send_replace(Arc::new(fsm.description().clone()));

        let mut updates = StreamMap::new();
        {
            let mut servers = self.servers.lock().unwrap();
            for address in fsm.description().servers.keys() {
                let server = self.factory.build(address);
                updates.insert(address.clone(), WatchStream::new(server.subscribe()));
                servers.insert(address.clone(), server);
            }
        }

        let lifecycle = CancellationToken::new();
        *self.lifecycle.lock().unwrap() = lifecycle.clone();

        let (tx, rx) = mpsc::channel(1);
        let worker = Worker {
            fsm,
            factory: self.factory.clone(),
            servers: self.servers.clone(),
            snapshot: self.snapshot.clone(),
            rx,
            updates,
        };
        *self.tx.lock().unwrap() = Some(tx);
        *self.worker.lock().unwrap() = Some(tokio::task::spawn(worker.run()));

        let mut subscription = Subscription {
            rx: self.snapshot.subscribe(),
            closed: lifecycle,
            primed: false,
        };
        let sessions = self.sessions.clone();
        let session_sync = tokio::task::spawn(async move {
            while let Ok(description) = subscription.next().await {
                if description.sessions_supported() {
                    sessions.update_timeout(description.session_timeout);
                } else {
                    sessions.update_timeout(None);
                    sessions.clear();
                }
            }
        });
        *self.session_sync.lock().unwrap() = Some(session_sync);

        self.state.store(CONNECTED, Ordering::SeqCst);
        event!(Level::INFO, seeds = policy.seeds.len(), "Topology connected");
        Ok(())
    }

    /// Observes topology snapshots, starting with the current one.
    pub fn subscribe(&self) -> Result<Subscription, Error> {
        if !self.is_connected() {
            return Err(Error::TopologyClosed);
        }
        Ok(Subscription {
            rx: self.snapshot.subscribe(),
            closed: self.lifecycle.lock().unwrap().clone(),
            primed: false,
        })
    }

    /// Finds the live server matching `description`.
    ///
    /// Returns `None` if the server has since left the topology.
    pub fn find_server(&self, description: &ServerDescription) -> Option<SelectedServer> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&description.address)
            .cloned()?;
        Some(SelectedServer {
            server,
            kind: self.snapshot.borrow().kind,
        })
    }

    fn request_immediate_checks(&self) {
        for server in self.servers.lock().unwrap().values() {
            server.request_immediate_check();
        }
    }

    /// Waits for a server which `selector` accepts.
    ///
    /// Selection is retried against every new snapshot until a server is
    /// found, `ctx` is done, or the server selection timeout passes.
    #[instrument(level = "debug", skip_all, err, name = "Topology::select_server")]
    pub async fn select_server(
        &self,
        ctx: &Context,
        selector: &dyn ServerSelector,
    ) -> Result<SelectedServer, Error> {
        #[cfg(feature = "probes")]
        let select_id = self.next_select_id.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "probes")]
        probes::select__start!(|| select_id);

        let result = self.do_select(ctx, selector).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(selected) => probes::select__done!(|| (select_id, selected.server.address().as_str())),
            Err(err) => probes::select__failed!(|| (select_id, err.as_str())),
        }
        result
    }

    async fn do_select(
        &self,
        ctx: &Context,
        selector: &dyn ServerSelector,
    ) -> Result<SelectedServer, Error> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let mut subscription = self.subscribe()?;

        let timeout = self.factory.policy.server_selection_timeout;
        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        loop {
            let description = tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                _ = &mut expired => {
                    return Err(Error::ServerSelectionTimeout {
                        topology: self.description().to_string(),
                    });
                }
                description = subscription.next() => description?,
            };

            // No server can be used until the deployment is upgraded.
            if let Some(reason) = &description.compatibility_error {
                return Err(Error::Incompatible {
                    reason: reason.to_string(),
                });
            }

            let candidates: Vec<ServerDescription> = description
                .servers
                .values()
                .filter(|s| s.kind != ServerKind::Unknown)
                .cloned()
                .collect();
            let eligible = selector
                .select(&description, &candidates)
                .map_err(|source| Error::Selector {
                    topology: description.to_string(),
                    source,
                })?;

            if eligible.is_empty() {
                event!(Level::TRACE, "No eligible servers; requesting checks");
                self.request_immediate_checks();
                continue;
            }
            let pick = &eligible[rand::rng().random_range(0..eligible.len())];
            if let Some(selected) = self.find_server(pick) {
                return Ok(selected);
            }
            event!(Level::DEBUG, address = %pick.address, "Selected server is gone; retrying");
        }
    }

    /// Selects a server which accepts writes, within the latency window.
    pub async fn select_server_for_write(&self, ctx: &Context) -> Result<SelectedServer, Error> {
        let selector = CompositeSelector(vec![
            Arc::new(WriteSelector),
            Arc::new(self.latency_selector()),
        ]);
        self.select_server(ctx, &selector).await
    }

    /// Selects a server for a read, within the latency window.
    pub async fn select_server_for_read(
        &self,
        ctx: &Context,
        read_pref: ReadPref,
    ) -> Result<SelectedServer, Error> {
        let selector = CompositeSelector(vec![
            Arc::new(ReadPrefSelector(read_pref)),
            Arc::new(self.latency_selector()),
        ]);
        self.select_server(ctx, &selector).await
    }

    fn latency_selector(&self) -> LatencySelector {
        LatencySelector {
            threshold: self.factory.policy.local_threshold,
        }
    }

    /// Stops monitoring and disconnects every server.
    ///
    /// Pending selections and subscriptions fail with
    /// [Error::TopologyClosed]. `ctx` bounds how long each server's pool
    /// waits for checked-out connections.
    #[instrument(skip(self, ctx), name = "Topology::disconnect")]
    pub async fn disconnect(&self, ctx: &Context) -> Result<(), Error> {
        self.state
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::TopologyDisconnected)?;

        self.lifecycle.lock().unwrap().cancel();
        let tx = self.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            // The worker may already be gone.
            let _ = tx.send(Request::Terminate).await;
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            join::join(worker).await;
        }
        let session_sync = self.session_sync.lock().unwrap().take();
        if let Some(session_sync) = session_sync {
            join::join(session_sync).await;
        }

        let servers: Vec<Arc<Server>> = self
            .servers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, server)| server)
            .collect();
        let mut disconnects: FuturesUnordered<_> = servers
            .iter()
            .map(|server| async move { (server.address(), server.disconnect(ctx).await) })
            .collect();
        while let Some((address, result)) = disconnects.next().await {
            if let Err(err) = result {
                event!(Level::WARN, address = %address, err = %err, "Failed to disconnect server");
            }
        }

        self.sessions.update_timeout(None);
        self.sessions.clear();
        self.state.store(DISCONNECTED, Ordering::SeqCst);
        event!(Level::INFO, "Topology disconnected");
        Ok(())
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        self.lifecycle.lock().unwrap().cancel();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        if let Some(session_sync) = self.session_sync.lock().unwrap().take() {
            session_sync.abort();
        }
    }
}

fn initial_kind(policy: &Policy) -> TopologyKind {
    match (policy.mode, &policy.replica_set) {
        (MonitorMode::Single, _) => TopologyKind::Single,
        (MonitorMode::Automatic, Some(_)) => TopologyKind::ReplicaSetNoPrimary,
        (MonitorMode::Automatic, None) => TopologyKind::Unknown,
    }
}

fn initial_description(policy: &Policy) -> TopologyDescription {
    TopologyDescription::new(
        initial_kind(policy),
        policy.replica_set.clone(),
        policy.seeds.iter().cloned(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::description::WireVersionRange;
    use crate::test_utils::{
        addr, rs_member, setup_tracing_subscriber, standalone, wait_for, MemoryConnector,
        ScriptedHandshaker,
    };
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        topology: Topology,
        connector: Arc<MemoryConnector>,
        handshaker: Arc<ScriptedHandshaker>,
    }

    fn setup(policy: Policy) -> Harness {
        setup_tracing_subscriber();
        let connector = Arc::new(MemoryConnector::new());
        let handshaker = Arc::new(ScriptedHandshaker::new());
        let topology = Topology::new(policy, connector.clone(), handshaker.clone())
            .unwrap_or_else(|err| err.into_inner());
        Harness {
            topology,
            connector,
            handshaker,
        }
    }

    fn policy(seeds: &[&str]) -> Policy {
        let mut policy = Policy {
            seeds: seeds.iter().map(|s| addr(s)).collect(),
            ..Default::default()
        };
        policy.monitor.min_heartbeat_interval = Duration::from_millis(10);
        policy
    }

    async fn wait_for_description<F>(topology: &Topology, f: F) -> Arc<TopologyDescription>
    where
        F: Fn(&TopologyDescription) -> bool,
    {
        let mut subscription = topology.subscribe().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let description = subscription.next().await.unwrap();
                if f(&description) {
                    return description;
                }
            }
        })
        .await
        .expect("topology did not converge")
    }

    fn never(_: &TopologyDescription, _: &[ServerDescription]) -> Result<Vec<ServerDescription>, anyhow::Error> {
        Ok(vec![])
    }

    #[tokio::test]
    async fn test_selection_fails_fast_on_incompatible_servers() {
        let h = setup(policy(&["a"]));
        h.handshaker.reply(ServerDescription {
            wire_version: Some(WireVersionRange { min: 0, max: 5 }),
            ..standalone(&addr("a"))
        });
        h.topology.connect().unwrap();

        let start = Instant::now();
        let err = h
            .topology
            .select_server_for_write(&Context::background())
            .await
            .unwrap_err();
        let Error::Incompatible { reason } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(reason.contains("a:27017"), "{reason}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_selection_times_out() {
        let timeout = Duration::from_millis(200);
        let h = setup(Policy {
            server_selection_timeout: Some(timeout),
            ..policy(&["a"])
        });
        h.topology.connect().unwrap();

        let start = Instant::now();
        let err = h
            .topology
            .select_server(&Context::background(), &never)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout * 10, "returned after {elapsed:?}");
        let Error::ServerSelectionTimeout { topology } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(topology.contains("a:27017"), "{topology}");
    }

    #[tokio::test]
    async fn test_selects_the_primary() {
        let h = setup(Policy {
            replica_set: Some("rs0".to_string()),
            ..policy(&["a"])
        });
        h.handshaker
            .reply(rs_member(&addr("a"), ServerKind::RSPrimary, "rs0", &["a"]));
        h.topology.connect().unwrap();

        let ctx = Context::background();
        let selected = h.topology.select_server(&ctx, &WriteSelector).await.unwrap();
        assert_eq!(selected.server.address(), &addr("a"));
        assert_eq!(selected.kind, TopologyKind::ReplicaSetWithPrimary);
        selected.connection(&ctx).await.unwrap();

        let selected = h.topology.select_server_for_write(&ctx).await.unwrap();
        assert_eq!(selected.server.address(), &addr("a"));
        let selected = h
            .topology
            .select_server_for_read(&ctx, ReadPref::PrimaryPreferred { tag_sets: vec![] })
            .await
            .unwrap();
        assert_eq!(selected.server.address(), &addr("a"));
    }

    #[tokio::test]
    async fn test_cancelled_context_returns_immediately() {
        let h = setup(policy(&["a"]));
        h.topology.connect().unwrap();

        let ctx = Context::background();
        ctx.cancel();
        let start = Instant::now();
        let err = h.topology.select_server(&ctx, &never).await.unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = h.topology.select_server(&ctx, &never).await.unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_selector_errors_are_not_retried() {
        let h = setup(policy(&["a"]));
        h.topology.connect().unwrap();
        let failing = |_: &TopologyDescription,
                       _: &[ServerDescription]|
         -> Result<Vec<ServerDescription>, anyhow::Error> {
            Err(anyhow::anyhow!("broken selector"))
        };
        let err = h
            .topology
            .select_server(&Context::background(), &failing)
            .await
            .unwrap_err();
        let Error::Selector { topology, source } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(topology.starts_with("Type: "));
        assert_eq!(source.to_string(), "broken selector");
    }

    #[tokio::test]
    async fn test_discovers_and_demotes_replica_set() {
        let h = setup(policy(&["a"]));
        h.handshaker
            .reply(rs_member(&addr("a"), ServerKind::RSPrimary, "rs0", &["a", "b"]));
        h.connector.refuse(&addr("b"));
        h.topology.connect().unwrap();

        let description = wait_for_description(&h.topology, |d| {
            d.kind == TopologyKind::ReplicaSetWithPrimary
        })
        .await;
        assert_eq!(description.servers.len(), 2);
        assert_eq!(description.server(&addr("b")).unwrap().kind, ServerKind::Unknown);
        assert!(h
            .topology
            .find_server(&ServerDescription::new(addr("b")))
            .is_some());

        h.handshaker.fail(&addr("a"), "primary went away");
        h.topology
            .find_server(&ServerDescription::new(addr("a")))
            .unwrap()
            .server
            .request_immediate_check();

        let description = wait_for_description(&h.topology, |d| {
            d.kind == TopologyKind::ReplicaSetNoPrimary
        })
        .await;
        assert_eq!(description.servers.len(), 2);
        assert_eq!(description.server(&addr("a")).unwrap().kind, ServerKind::Unknown);
        assert!(description.server(&addr("b")).is_some());
    }

    #[tokio::test]
    async fn test_members_missing_from_primary_are_removed() {
        let h = setup(Policy {
            replica_set: Some("rs0".to_string()),
            ..policy(&["a", "c"])
        });
        h.handshaker
            .reply(rs_member(&addr("a"), ServerKind::RSPrimary, "rs0", &["a"]));
        h.connector.refuse(&addr("c"));
        h.topology.connect().unwrap();

        let description = wait_for_description(&h.topology, |d| {
            d.kind == TopologyKind::ReplicaSetWithPrimary
        })
        .await;
        assert!(description.server(&addr("c")).is_none());
        assert!(h
            .topology
            .find_server(&ServerDescription::new(addr("c")))
            .is_none());
    }

    #[tokio::test]
    async fn test_sessions_follow_topology() {
        let h = setup(Policy {
            replica_set: Some("rs0".to_string()),
            ..policy(&["a"])
        });
        assert!(h.topology.sessions().check_out().is_err());
        h.handshaker
            .reply(rs_member(&addr("a"), ServerKind::RSPrimary, "rs0", &["a"]));
        h.topology.connect().unwrap();

        wait_for(Duration::from_secs(5), || h.topology.sessions().timeout().is_some()).await;
        let session = h.topology.sessions().check_out().unwrap();
        h.topology.sessions().check_in(session);
        assert_eq!(h.topology.sessions().len(), 1);

        h.topology.disconnect(&Context::background()).await.unwrap();
        assert!(h.topology.sessions().is_empty());
        assert!(h.topology.sessions().check_out().is_err());
    }

    #[tokio::test]
    async fn test_single_topology_has_no_sessions() {
        let h = setup(Policy {
            mode: MonitorMode::Single,
            ..policy(&["a"])
        });
        h.handshaker
            .reply(rs_member(&addr("a"), ServerKind::RSSecondary, "rs0", &["a", "b"]));
        h.topology.connect().unwrap();

        let description = wait_for_description(&h.topology, |d| {
            d.servers.values().any(|s| s.kind == ServerKind::RSSecondary)
        })
        .await;
        assert_eq!(description.kind, TopologyKind::Single);
        assert_eq!(description.servers.len(), 1);
        assert!(h.topology.sessions().check_out().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let h = setup(policy(&["a"]));
        let ctx = Context::background();
        assert!(matches!(h.topology.subscribe(), Err(Error::TopologyClosed)));
        assert!(matches!(
            h.topology.disconnect(&ctx).await,
            Err(Error::TopologyDisconnected)
        ));

        h.topology.connect().unwrap();
        assert!(matches!(h.topology.connect(), Err(Error::TopologyConnected)));
        let selected = h.topology.select_server(&ctx, &WriteSelector).await.unwrap();
        drop(selected.connection(&ctx).await.unwrap());

        let topology = Arc::new(h.topology);
        let pending = tokio::spawn({
            let topology = topology.clone();
            async move {
                topology
                    .select_server(&Context::background(), &never)
                    .await
                    .map(|_| ())
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        topology.disconnect(&ctx).await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(Error::TopologyClosed)));
        assert!(matches!(topology.subscribe(), Err(Error::TopologyClosed)));
        wait_for(Duration::from_secs(5), || h.connector.live() == 0).await;
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected() {
        let h = setup(Policy::default());
        assert!(matches!(
            h.topology.connect(),
            Err(Error::Policy(policy::Error::NoSeeds))
        ));
        assert!(!h.topology.is_connected());
    }
}

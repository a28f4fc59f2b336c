//! sdam discovers and monitors MongoDB deployments, selects servers from
//! them, and pools connections to each server.
//!
//! It uses the following terminology:
//! * A topology is the whole deployment: a standalone server, a replica
//!   set, or a sharded cluster reached through mongos routers.
//! * A server description is what one heartbeat learned about one server.
//!   A topology description is the set of server descriptions, folded
//!   together by the state machine in [fsm].
//!
//! # Usage
//!
//! * The main interface for this crate is [topology::Topology].
//! * To construct a topology, you must supply a [policy::Policy], a
//!   [connector::Connector] and a [connector::Handshaker]. These describe
//!   "which servers to start from", "how to open a byte stream to a server"
//!   and "how to ask a server what it is", respectively.
//! * [topology::Topology::select_server] waits for a server accepted by a
//!   [selector::ServerSelector], and the selected server hands out pooled
//!   connections.
//!
//! # DTrace probes
//!
//! sdam contains a number of DTrace USDT probes, which fire as servers are
//! selected, checked and connected to. The full list of probes is:
//!
//! - `select-start`: Fires before server selection begins.
//! - `select-done`: Fires when a server has been selected.
//! - `select-failed`: Fires when server selection fails.
//! - `checkout-start`: Fires before checking a connection out of a pool.
//! - `checkout-done`: Fires before returning a checked-out connection.
//! - `checkout-failed`: Fires when a checkout fails.
//! - `connect-start`: Fires before dialing a new connection.
//! - `connect-done`: Fires after a connection is dialed and handshaken.
//! - `connect-failed`: Fires after failing to establish a connection.
//! - `connection-returned`: Fires when a checked-out connection is dropped.
//! - `pool-drained`: Fires when a pool's generation is bumped.
//! - `heartbeat-start`: Fires when the monitor starts checking a server.
//! - `heartbeat-done`: Fires when a server check succeeds.
//! - `heartbeat-failed`: Fires when a server check fails.
//! - `topology-changed`: Fires each time a new topology description is
//!   published.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is technically fallible. The `Result` returned from
//! `topology::Topology::new` gives access to the topology in both the `Ok`
//! and `Err` variant, so callers may choose between failing and running
//! uninstrumented.

// Public API
pub mod address;
pub mod claim;
pub mod connection;
pub mod connector;
pub mod context;
pub mod description;
pub mod fsm;
pub mod policy;
pub mod pool;
pub mod selector;
pub mod server;
pub mod session;
pub mod topology;
pub mod wire;

// Necessary for implementation
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;

/// USDT probes for tracing how sdam watches servers and hands out
/// connections.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "sdam")]
mod probes {
    /// Fires right before server selection begins.
    fn select__start(select_id: u64) {}

    /// Fires when a server is selected, with its address.
    fn select__done(select_id: u64, addr: &str) {}

    /// Fires when selection fails, with a string identifying the reason.
    fn select__failed(select_id: u64, reason: &str) {}

    /// Fires right before checking a connection out of a server's pool.
    fn checkout__start(addr: &str, checkout_id: u64) {}

    /// Fires when a checkout succeeds, identifying the connection.
    fn checkout__done(addr: &str, checkout_id: u64, conn_id: u64) {}

    /// Fires when a checkout fails, with a string identifying the reason.
    fn checkout__failed(addr: &str, checkout_id: u64, reason: &str) {}

    /// Fires right before dialing a new connection.
    fn connect__start(addr: &str, conn_id: u64) {}

    /// Fires after a new connection completes its handshake.
    fn connect__done(addr: &str, conn_id: u64) {}

    /// Fires after failing to establish a connection, with a string
    /// identifying the reason.
    fn connect__failed(addr: &str, conn_id: u64, reason: &str) {}

    /// Fires when a checked-out connection comes back to its pool, before
    /// the pool decides whether to keep it.
    fn connection__returned(addr: &str, conn_id: u64) {}

    /// Fires when a pool is drained, with its new generation.
    fn pool__drained(addr: &str, generation: u64) {}

    /// Fires when the monitor starts checking a server.
    fn heartbeat__start(addr: &str) {}

    /// Fires when a check succeeds, with the kind the server reported and
    /// the round trip in microseconds.
    fn heartbeat__done(addr: &str, kind: &str, rtt_us: u64) {}

    /// Fires when a check fails, with a string identifying the reason.
    fn heartbeat__failed(addr: &str, reason: &str) {}

    /// Fires when a new topology description is published.
    fn topology__changed(kind: &str, servers: u64) {}
}

//! The interface for dialing servers and describing them.

use crate::address::ServerAddress;
use crate::connection::Connection;
use crate::context::Context;
use crate::description::ServerDescription;
use crate::wire::Compressor;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Interface for raw byte streams to a server.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Describes how a byte stream to a server should be opened.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a stream to a server.
    async fn connect(&self, address: &ServerAddress) -> Result<BoxedStream, Error>;
}

/// What a server reports about itself when a connection is established.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub description: ServerDescription,

    /// Compressors the server is willing to use, in no particular order.
    pub compressors: Vec<Compressor>,
}

/// Speaks the server's handshake and heartbeat commands.
///
/// Message bodies are opaque to this crate; implementations own the
/// encoding and use [Connection::write_wire_message] and
/// [Connection::read_wire_message] to exchange them.
#[async_trait]
pub trait Handshaker: Send + Sync {
    /// Performs the initial handshake on a newly dialed connection.
    async fn handshake(&self, conn: &Connection, ctx: &Context) -> Result<Handshake, Error>;

    /// Checks the server on the monitoring connection.
    ///
    /// By default this repeats the handshake.
    async fn heartbeat(
        &self,
        conn: &Connection,
        ctx: &Context,
    ) -> Result<ServerDescription, Error> {
        self.handshake(conn, ctx).await.map(|h| h.description)
    }
}

pub type SharedConnector = Arc<dyn Connector>;
pub type SharedHandshaker = Arc<dyn Handshaker>;

//! Utilities to help with testing sdam

use crate::address::ServerAddress;
use crate::connection::Connection;
use crate::connector::{self, BoxedStream, Connector, Handshake, Handshaker};
use crate::context::Context;
use crate::description::{ServerDescription, ServerKind, WireVersionRange};
use crate::wire::{self, Compressor, OpCode};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Waits until `f` returns true, polling every few milliseconds.
pub async fn wait_for<F>(timeout: Duration, f: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Serves one end of a duplex pipe, echoing every framed message back.
///
/// `live` counts the server-side sockets still open.
pub fn spawn_echo_server(mut server: DuplexStream, live: Arc<AtomicUsize>) {
    live.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        loop {
            let mut len = [0u8; 4];
            if server.read_exact(&mut len).await.is_err() {
                break;
            }
            let len = i32::from_le_bytes(len);
            if len < wire::HEADER_LEN as i32 {
                break;
            }
            let mut message = vec![0u8; len as usize];
            message[..4].copy_from_slice(&len.to_le_bytes());
            if server.read_exact(&mut message[4..]).await.is_err() {
                break;
            }
            if server.write_all(&message).await.is_err() {
                break;
            }
        }
        live.fetch_sub(1, Ordering::SeqCst);
    });
}

/// A pair of connected in-memory streams, one of them served by an echo
/// server.
pub fn echo_stream(live: &Arc<AtomicUsize>) -> BoxedStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    spawn_echo_server(server, live.clone());
    Box::new(client)
}

/// An in-memory connector. Every dial gets its own echo server.
#[derive(Default)]
pub struct MemoryConnector {
    live: Arc<AtomicUsize>,
    dials: AtomicUsize,
    refused: Mutex<HashSet<ServerAddress>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of server-side sockets which are still open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, address: &ServerAddress) {
        self.refused.lock().unwrap().insert(address.clone());
    }

    pub fn accept(&self, address: &ServerAddress) {
        self.refused.lock().unwrap().remove(address);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<BoxedStream, connector::Error> {
        if self.refused.lock().unwrap().contains(address) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(echo_stream(&self.live))
    }
}

#[derive(Clone)]
enum Script {
    Reply(ServerDescription),
    Fail(String),
}

/// A handshaker which pings the echo server and then reports whatever has
/// been scripted for the address it is talking to.
///
/// Addresses without a script report a standalone server.
#[derive(Default)]
pub struct ScriptedHandshaker {
    scripts: Mutex<HashMap<ServerAddress, Script>>,
    checks: Mutex<HashMap<ServerAddress, usize>>,
    compressors: Mutex<Vec<Compressor>>,
}

impl ScriptedHandshaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, description: ServerDescription) {
        self.scripts
            .lock()
            .unwrap()
            .insert(description.address.clone(), Script::Reply(description));
    }

    pub fn fail(&self, address: &ServerAddress, reason: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.clone(), Script::Fail(reason.to_string()));
    }

    pub fn offer_compressors(&self, compressors: Vec<Compressor>) {
        *self.compressors.lock().unwrap() = compressors;
    }

    /// How many handshakes and heartbeats `address` has seen.
    pub fn checks(&self, address: &ServerAddress) -> usize {
        self.checks
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

pub fn standalone(address: &ServerAddress) -> ServerDescription {
    ServerDescription {
        kind: ServerKind::Standalone,
        wire_version: Some(WireVersionRange { min: 0, max: 21 }),
        ..ServerDescription::new(address.clone())
    }
}

pub fn rs_member(
    address: &ServerAddress,
    kind: ServerKind,
    set_name: &str,
    hosts: &[&str],
) -> ServerDescription {
    ServerDescription {
        kind,
        set_name: Some(set_name.to_string()),
        hosts: hosts.iter().map(|h| addr(h)).collect(),
        wire_version: Some(WireVersionRange { min: 0, max: 21 }),
        session_timeout: Some(Duration::from_secs(30 * 60)),
        ..ServerDescription::new(address.clone())
    }
}

#[async_trait]
impl Handshaker for ScriptedHandshaker {
    async fn handshake(&self, conn: &Connection, ctx: &Context) -> Result<Handshake, connector::Error> {
        let address = conn.address().clone();
        *self.checks.lock().unwrap().entry(address.clone()).or_default() += 1;

        let ping = wire::frame(conn.next_request_id(), 0, OpCode::Msg, b"hello");
        conn.write_wire_message(ctx, &ping)
            .await
            .map_err(|e| connector::Error::Other(e.into()))?;
        let pong = conn
            .read_wire_message(ctx)
            .await
            .map_err(|e| connector::Error::Other(e.into()))?;
        assert_eq!(ping, pong);

        let script = self.scripts.lock().unwrap().get(&address).cloned();
        let description = match script {
            Some(Script::Reply(description)) => description,
            Some(Script::Fail(reason)) => {
                return Err(connector::Error::Other(anyhow::anyhow!(reason)));
            }
            None => standalone(&address),
        };
        Ok(Handshake {
            description,
            compressors: self.compressors.lock().unwrap().clone(),
        })
    }
}

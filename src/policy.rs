//! Configuration options which can alter the behavior of the topology.

use crate::address::{self, ServerAddress};
use crate::wire::Compressor;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection string must start with mongodb://, got {0:?}")]
    InvalidScheme(String),

    #[error("mongodb+srv:// connection strings are not supported")]
    SrvNotSupported,

    #[error(transparent)]
    Address(#[from] address::Error),

    #[error("invalid value {value:?} for option {name}")]
    InvalidOption { name: String, value: String },

    #[error("at least one seed address is required")]
    NoSeeds,

    #[error("single mode requires exactly one seed, got {0}")]
    TooManySeedsForSingle(usize),

    #[error("max_pool_size must be greater than zero")]
    ZeroPoolSize,

    #[error("prune_interval must be greater than zero")]
    ZeroPruneInterval,

    #[error("rtt_alpha must be between 0 and 1, got {0}")]
    InvalidRttAlpha(f64),
}

/// How the topology treats its seed list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MonitorMode {
    /// Discover the deployment from the seeds.
    #[default]
    Automatic,

    /// Talk to exactly one server, whatever it reports.
    Single,
}

/// TLS settings for connections to every server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file of trusted roots. Without one, the bundled web PKI roots
    /// are trusted.
    pub ca_file: Option<PathBuf>,
}

/// Configuration for individual connections.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// How long to wait while dialing and handshaking.
    pub connect_timeout: Duration,

    /// Upper bound on each read, if any.
    pub read_timeout: Option<Duration>,

    /// Upper bound on each write, if any.
    pub write_timeout: Option<Duration>,

    /// Connections unused for this long are closed.
    pub idle_timeout: Option<Duration>,

    /// Connections older than this are closed.
    pub lifetime: Option<Duration>,

    /// Messages larger than this are rejected.
    pub max_message_size: usize,

    /// Compressors to offer, most preferred first.
    pub compressors: Vec<Compressor>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            lifetime: None,
            max_message_size: crate::wire::DEFAULT_MAX_MESSAGE_SIZE,
            compressors: vec![],
        }
    }
}

/// Configuration for the per-server connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// The maximum number of connections checked out at once.
    pub max_pool_size: usize,

    /// The maximum number of idle connections kept for reuse.
    pub max_idle: usize,

    /// How often idle connections are scanned for expiry.
    pub prune_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            max_idle: 100,
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for the heartbeat monitor of each server.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorConfig {
    pub heartbeat_interval: Duration,

    /// Immediate checks are never run more often than this.
    pub min_heartbeat_interval: Duration,

    /// Weight of the newest sample in the round-trip time average.
    pub rtt_alpha: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            min_heartbeat_interval: Duration::from_millis(500),
            rtt_alpha: 0.2,
        }
    }
}

/// Policy which is applicable to a topology and every server in it.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub seeds: Vec<ServerAddress>,

    /// The replica set every member must belong to, if any.
    pub replica_set: Option<String>,

    pub mode: MonitorMode,

    /// How long server selection may take. `None` waits forever.
    pub server_selection_timeout: Option<Duration>,

    /// Width of the latency window used to choose among eligible servers.
    pub local_threshold: Duration,

    pub app_name: Option<String>,

    pub tls: Option<TlsConfig>,

    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            seeds: vec![],
            replica_set: None,
            mode: MonitorMode::Automatic,
            server_selection_timeout: Some(Duration::from_secs(30)),
            local_threshold: Duration::from_millis(15),
            app_name: None,
            tls: None,
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidOption {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn parse_ms(name: &str, value: &str) -> Result<Duration, Error> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(name, value))
}

// Zero means "no limit" for the socket-level timeouts.
fn parse_optional_ms(name: &str, value: &str) -> Result<Option<Duration>, Error> {
    let d = parse_ms(name, value)?;
    Ok((!d.is_zero()).then_some(d))
}

impl Policy {
    /// Builds a policy from a `mongodb://` connection string.
    ///
    /// Credentials and the database path are accepted but ignored.
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        if uri.starts_with("mongodb+srv://") {
            return Err(Error::SrvNotSupported);
        }
        let Some(rest) = uri.strip_prefix("mongodb://") else {
            return Err(Error::InvalidScheme(uri.to_string()));
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let hosts = match rest.split_once('/') {
            Some((hosts, _database)) => hosts,
            None => rest,
        };
        let hosts = match hosts.rsplit_once('@') {
            Some((_credentials, hosts)) => {
                event!(Level::WARN, "Ignoring credentials in connection string");
                hosts
            }
            None => hosts,
        };

        let mut policy = Policy {
            seeds: hosts
                .split(',')
                .filter(|h| !h.is_empty())
                .map(ServerAddress::parse)
                .collect::<Result<_, _>>()?,
            ..Default::default()
        };

        let mut zlib_level = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name.to_ascii_lowercase().as_str() {
                "replicaset" => policy.replica_set = Some(value.to_string()),
                "connect" => {
                    policy.mode = match value.to_ascii_lowercase().as_str() {
                        "direct" => MonitorMode::Single,
                        "automatic" => MonitorMode::Automatic,
                        _ => return Err(invalid(name, value)),
                    }
                }
                "directconnection" => {
                    policy.mode = if parse_bool(name, value)? {
                        MonitorMode::Single
                    } else {
                        MonitorMode::Automatic
                    }
                }
                "serverselectiontimeoutms" => {
                    policy.server_selection_timeout = Some(parse_ms(name, value)?)
                }
                "localthresholdms" => policy.local_threshold = parse_ms(name, value)?,
                "heartbeatfrequencyms" => {
                    policy.monitor.heartbeat_interval = parse_ms(name, value)?
                }
                "connecttimeoutms" => policy.connection.connect_timeout = parse_ms(name, value)?,
                "sockettimeoutms" => {
                    let timeout = parse_optional_ms(name, value)?;
                    policy.connection.read_timeout = timeout;
                    policy.connection.write_timeout = timeout;
                }
                "maxidletimems" => policy.connection.idle_timeout = parse_optional_ms(name, value)?,
                "maxpoolsize" => {
                    policy.pool.max_pool_size =
                        value.parse().map_err(|_| invalid(name, value))?
                }
                "compressors" => {
                    policy.connection.compressors = value
                        .split(',')
                        .filter(|c| !c.is_empty())
                        .map(|c| c.parse().map_err(|_| invalid(name, c)))
                        .collect::<Result<_, _>>()?
                }
                "zlibcompressionlevel" => {
                    let level: i32 = value.parse().map_err(|_| invalid(name, value))?;
                    if !(-1..=9).contains(&level) {
                        return Err(invalid(name, value));
                    }
                    zlib_level = Some(level);
                }
                "tls" | "ssl" => {
                    policy.tls = if parse_bool(name, value)? {
                        Some(policy.tls.take().unwrap_or_default())
                    } else {
                        None
                    }
                }
                "tlscafile" => {
                    policy.tls.get_or_insert_with(TlsConfig::default).ca_file =
                        Some(PathBuf::from(value))
                }
                "appname" => policy.app_name = Some(value.to_string()),
                _ => {
                    event!(Level::WARN, option = name, "Ignoring unknown connection string option");
                }
            }
        }

        if let Some(level) = zlib_level {
            for compressor in &mut policy.connection.compressors {
                if let Compressor::Zlib { level: l } = compressor {
                    *l = Some(level);
                }
            }
        }

        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.seeds.is_empty() {
            return Err(Error::NoSeeds);
        }
        if self.mode == MonitorMode::Single && self.seeds.len() != 1 {
            return Err(Error::TooManySeedsForSingle(self.seeds.len()));
        }
        if self.pool.max_pool_size == 0 {
            return Err(Error::ZeroPoolSize);
        }
        if self.pool.prune_interval.is_zero() {
            return Err(Error::ZeroPruneInterval);
        }
        if !(0.0..=1.0).contains(&self.monitor.rtt_alpha) {
            return Err(Error::InvalidRttAlpha(self.monitor.rtt_alpha));
        }
        Ok(())
    }
}

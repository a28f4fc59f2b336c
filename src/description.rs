//! Immutable snapshots of servers and of the deployment as a whole.

use crate::address::ServerAddress;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// The range of wire versions this crate can speak.
pub const SUPPORTED_WIRE_VERSIONS: WireVersionRange = WireVersionRange { min: 6, max: 25 };

/// The minimum and maximum wire versions a server accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WireVersionRange {
    pub min: i32,
    pub max: i32,
}

impl WireVersionRange {
    pub fn overlaps(&self, other: &WireVersionRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

/// The role a single server plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ServerKind {
    Standalone,
    RSPrimary,
    RSSecondary,
    RSArbiter,
    RSGhost,
    RSOther,
    Mongos,
    Unknown,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Standalone => "Standalone",
            ServerKind::RSPrimary => "RSPrimary",
            ServerKind::RSSecondary => "RSSecondary",
            ServerKind::RSArbiter => "RSArbiter",
            ServerKind::RSGhost => "RSGhost",
            ServerKind::RSOther => "RSOther",
            ServerKind::Mongos => "Mongos",
            ServerKind::Unknown => "Unknown",
        }
    }

    /// Members which report a replica set name.
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerKind::RSPrimary
                | ServerKind::RSSecondary
                | ServerKind::RSArbiter
                | ServerKind::RSOther
        )
    }

    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerKind::Standalone
                | ServerKind::RSPrimary
                | ServerKind::RSSecondary
                | ServerKind::Mongos
        )
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of one server, produced by a handshake or heartbeat.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServerDescription {
    /// The address this server was contacted at.
    pub address: ServerAddress,
    pub kind: ServerKind,

    /// The address the server believes it has (`me`), if it reported one.
    pub canonical_address: Option<ServerAddress>,
    pub set_name: Option<String>,
    pub set_version: Option<u32>,
    pub election_id: Option<[u8; 12]>,

    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,

    pub wire_version: Option<WireVersionRange>,
    pub session_timeout: Option<Duration>,
    pub tags: BTreeMap<String, String>,

    pub average_rtt: Option<Duration>,

    /// Why the last check of this server failed.
    pub last_error: Option<Arc<str>>,
}

impl ServerDescription {
    /// A server which has not been checked yet.
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            kind: ServerKind::Unknown,
            canonical_address: None,
            set_name: None,
            set_version: None,
            election_id: None,
            hosts: vec![],
            passives: vec![],
            arbiters: vec![],
            wire_version: None,
            session_timeout: None,
            tags: BTreeMap::new(),
            average_rtt: None,
            last_error: None,
        }
    }

    /// A server which could not be checked.
    pub fn unknown_with_error(address: ServerAddress, error: impl ToString) -> Self {
        Self {
            last_error: Some(error.to_string().into()),
            ..Self::new(address)
        }
    }

    /// Every member of the replica set this server reports.
    pub fn members(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
    }

    pub fn is_data_bearing(&self) -> bool {
        self.kind.is_data_bearing()
    }

    pub fn is_compatible(&self) -> bool {
        match self.wire_version {
            Some(range) => range.overlaps(&SUPPORTED_WIRE_VERSIONS),
            None => true,
        }
    }
}

/// The shape of the whole deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TopologyKind {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

impl TopologyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Single => "Single",
            TopologyKind::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            TopologyKind::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            TopologyKind::Sharded => "Sharded",
            TopologyKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of the whole deployment.
///
/// Replaced, never mutated, each time a server description is applied.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TopologyDescription {
    pub kind: TopologyKind,
    pub set_name: Option<String>,
    pub servers: BTreeMap<ServerAddress, ServerDescription>,

    /// The smallest session timeout reported by a data-bearing member.
    pub session_timeout: Option<Duration>,

    /// Set when some member speaks no wire version this crate supports.
    pub compatibility_error: Option<Arc<str>>,
}

impl TopologyDescription {
    pub fn new(
        kind: TopologyKind,
        set_name: Option<String>,
        seeds: impl IntoIterator<Item = ServerAddress>,
    ) -> Self {
        Self {
            kind,
            set_name,
            servers: seeds
                .into_iter()
                .map(|address| (address.clone(), ServerDescription::new(address)))
                .collect(),
            session_timeout: None,
            compatibility_error: None,
        }
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.kind == ServerKind::RSPrimary)
    }

    /// Sessions need a timeout from every data-bearing member, and are never
    /// used against a single directly-connected server.
    pub fn sessions_supported(&self) -> bool {
        self.session_timeout.is_some() && self.kind != TopologyKind::Single
    }

    /// Members present in exactly one of `old` and `new`.
    pub fn diff(old: &TopologyDescription, new: &TopologyDescription) -> TopologyDiff {
        let old_members: BTreeSet<_> = old.servers.keys().collect();
        let new_members: BTreeSet<_> = new.servers.keys().collect();
        TopologyDiff {
            added: new_members
                .difference(&old_members)
                .map(|a| (*a).clone())
                .collect(),
            removed: old_members
                .difference(&new_members)
                .map(|a| (*a).clone())
                .collect(),
        }
    }
}

impl std::fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Type: {}", self.kind)?;
        if let Some(set_name) = &self.set_name {
            write!(f, ", Set name: {set_name}")?;
        }
        f.write_str(", Servers: [")?;
        for (i, server) in self.servers.values().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{{ Addr: {}, Type: {}", server.address, server.kind)?;
            if let Some(rtt) = server.average_rtt {
                write!(f, ", Average RTT: {rtt:?}")?;
            }
            if let Some(err) = &server.last_error {
                write!(f, ", Last error: {err}")?;
            }
            f.write_str(" }")?;
        }
        f.write_str("]")?;
        if let Some(err) = &self.compatibility_error {
            write!(f, ", Compatibility error: {err}")?;
        }
        Ok(())
    }
}

/// Membership changes between two topology snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added: Vec<ServerAddress>,
    pub removed: Vec<ServerAddress>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

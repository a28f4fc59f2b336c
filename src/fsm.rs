//! The topology state machine.
//!
//! [Fsm::apply] folds one server description into the current topology
//! description. It is deterministic and total: malformed or inconsistent
//! reports degrade that member to Unknown rather than failing.

use crate::address::ServerAddress;
use crate::description::{
    ServerDescription, ServerKind, TopologyDescription, TopologyKind, SUPPORTED_WIRE_VERSIONS,
};

use std::collections::BTreeSet;
use std::time::Duration;

pub struct Fsm {
    description: TopologyDescription,
    max_set_version: Option<u32>,
    max_election_id: Option<[u8; 12]>,
}

impl Fsm {
    pub fn new(
        kind: TopologyKind,
        set_name: Option<String>,
        seeds: impl IntoIterator<Item = ServerAddress>,
    ) -> Self {
        Self {
            description: TopologyDescription::new(kind, set_name, seeds),
            max_set_version: None,
            max_election_id: None,
        }
    }

    pub fn description(&self) -> &TopologyDescription {
        &self.description
    }

    /// Applies a fresh description of one server, returning the new
    /// topology description.
    ///
    /// Reports from servers which are no longer members are ignored.
    pub fn apply(&mut self, server: ServerDescription) -> TopologyDescription {
        if !self.description.servers.contains_key(&server.address) {
            return self.description.clone();
        }
        let server = sanitize(server);

        match self.description.kind {
            TopologyKind::Single => self.apply_to_single(server),
            TopologyKind::Unknown => self.apply_to_unknown(server),
            TopologyKind::Sharded => self.apply_to_sharded(server),
            TopologyKind::ReplicaSetNoPrimary => self.apply_to_rs_no_primary(server),
            TopologyKind::ReplicaSetWithPrimary => self.apply_to_rs_with_primary(server),
        }

        self.update_compatibility();
        self.update_session_timeout();
        self.description.clone()
    }

    fn apply_to_single(&mut self, server: ServerDescription) {
        let in_replica_set =
            server.kind.is_replica_set_member() || server.kind == ServerKind::RSGhost;
        let server = match &self.description.set_name {
            Some(expected) if in_replica_set && server.set_name.as_ref() != Some(expected) => {
                ServerDescription::unknown_with_error(
                    server.address,
                    format!(
                        "replica set name mismatch: expected {expected:?}, server reported {:?}",
                        server.set_name
                    ),
                )
            }
            _ => server,
        };
        self.replace(server);
    }

    fn apply_to_unknown(&mut self, server: ServerDescription) {
        match server.kind {
            ServerKind::Mongos => {
                self.description.kind = TopologyKind::Sharded;
                self.replace(server);
            }
            ServerKind::RSPrimary => self.update_rs_from_primary(server),
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.description.kind = TopologyKind::ReplicaSetNoPrimary;
                self.update_rs_without_primary(server);
            }
            ServerKind::Standalone => {
                if self.description.servers.len() == 1 {
                    self.description.kind = TopologyKind::Single;
                    self.replace(server);
                } else {
                    self.remove(&server.address);
                }
            }
            ServerKind::Unknown | ServerKind::RSGhost => self.replace(server),
        }
    }

    fn apply_to_sharded(&mut self, server: ServerDescription) {
        match server.kind {
            ServerKind::Mongos | ServerKind::Unknown => self.replace(server),
            _ => self.remove(&server.address),
        }
    }

    fn apply_to_rs_no_primary(&mut self, server: ServerDescription) {
        match server.kind {
            ServerKind::Standalone | ServerKind::Mongos => self.remove(&server.address),
            ServerKind::RSPrimary => self.update_rs_from_primary(server),
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.update_rs_without_primary(server)
            }
            ServerKind::Unknown | ServerKind::RSGhost => self.replace(server),
        }
    }

    fn apply_to_rs_with_primary(&mut self, server: ServerDescription) {
        match server.kind {
            ServerKind::Standalone | ServerKind::Mongos => {
                self.remove(&server.address);
                self.check_if_has_primary();
            }
            ServerKind::RSPrimary => self.update_rs_from_primary(server),
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.update_rs_with_primary_from_member(server)
            }
            ServerKind::Unknown | ServerKind::RSGhost => {
                self.replace(server);
                self.check_if_has_primary();
            }
        }
    }

    // The first member heard from names the set. Returns false for members
    // of some other set.
    fn adopt_set_name(&mut self, server: &ServerDescription) -> bool {
        if self.description.set_name.is_none() {
            self.description.set_name = server.set_name.clone();
        }
        self.description.set_name == server.set_name
    }

    fn update_rs_from_primary(&mut self, server: ServerDescription) {
        if !self.adopt_set_name(&server) {
            self.remove(&server.address);
            self.check_if_has_primary();
            return;
        }

        if let (Some(election_id), Some(set_version)) = (server.election_id, server.set_version) {
            let incoming = (Some(election_id), Some(set_version));
            let newest = (self.max_election_id, self.max_set_version);
            if incoming < newest {
                self.replace(ServerDescription::unknown_with_error(
                    server.address,
                    "was a primary, but its set version or election id is stale",
                ));
                self.check_if_has_primary();
                return;
            }
            // The accepted primary defines the newest pair, even when its
            // set version is lower than one seen under an older election.
            self.max_election_id = Some(election_id);
            self.max_set_version = Some(set_version);
        } else if server.set_version > self.max_set_version {
            self.max_set_version = server.set_version;
        }

        // The newest primary wins; any other primary is demoted.
        let demoted: Vec<ServerAddress> = self
            .description
            .servers
            .values()
            .filter(|s| s.kind == ServerKind::RSPrimary && s.address != server.address)
            .map(|s| s.address.clone())
            .collect();
        for address in demoted {
            self.replace(ServerDescription::unknown_with_error(
                address,
                "was a primary, but a new primary was discovered",
            ));
        }

        let members: BTreeSet<ServerAddress> = server.members().cloned().collect();
        self.replace(server);
        for member in &members {
            self.add_if_missing(member);
        }
        self.description
            .servers
            .retain(|address, _| members.contains(address));

        self.check_if_has_primary();
    }

    fn update_rs_without_primary(&mut self, server: ServerDescription) {
        if !self.adopt_set_name(&server) {
            self.remove(&server.address);
            return;
        }

        let members: Vec<ServerAddress> = server.members().cloned().collect();
        for member in &members {
            self.add_if_missing(member);
        }

        if has_foreign_canonical_address(&server) {
            self.remove(&server.address);
            return;
        }
        self.replace(server);
    }

    fn update_rs_with_primary_from_member(&mut self, server: ServerDescription) {
        if self.description.set_name != server.set_name || has_foreign_canonical_address(&server) {
            self.remove(&server.address);
            self.check_if_has_primary();
            return;
        }
        self.replace(server);
        self.check_if_has_primary();
    }

    fn check_if_has_primary(&mut self) {
        self.description.kind = if self.description.primary().is_some() {
            TopologyKind::ReplicaSetWithPrimary
        } else {
            TopologyKind::ReplicaSetNoPrimary
        };
    }

    fn replace(&mut self, server: ServerDescription) {
        if let Some(existing) = self.description.servers.get_mut(&server.address) {
            *existing = server;
        }
    }

    fn add_if_missing(&mut self, address: &ServerAddress) {
        if !self.description.servers.contains_key(address) {
            self.description
                .servers
                .insert(address.clone(), ServerDescription::new(address.clone()));
        }
    }

    fn remove(&mut self, address: &ServerAddress) {
        self.description.servers.remove(address);
    }

    fn update_compatibility(&mut self) {
        self.description.compatibility_error = self
            .description
            .servers
            .values()
            .find_map(|s| match s.wire_version {
                Some(range) if !range.overlaps(&SUPPORTED_WIRE_VERSIONS) => Some(
                    format!(
                        "server at {} supports wire versions {} through {}, but this driver \
                         requires {} through {}",
                        s.address,
                        range.min,
                        range.max,
                        SUPPORTED_WIRE_VERSIONS.min,
                        SUPPORTED_WIRE_VERSIONS.max
                    )
                    .into(),
                ),
                _ => None,
            });
    }

    fn update_session_timeout(&mut self) {
        if self.description.kind == TopologyKind::Single {
            self.description.session_timeout = None;
            return;
        }
        let mut timeout: Option<Duration> = None;
        for server in self.description.servers.values() {
            if !server.is_data_bearing() {
                continue;
            }
            match server.session_timeout {
                None => {
                    self.description.session_timeout = None;
                    return;
                }
                Some(t) => timeout = Some(timeout.map_or(t, |current| current.min(t))),
            }
        }
        self.description.session_timeout = timeout;
    }
}

fn has_foreign_canonical_address(server: &ServerDescription) -> bool {
    matches!(&server.canonical_address, Some(me) if *me != server.address)
}

// Degrades reports which cannot be trusted to Unknown. Incompatible servers
// keep their wire version range so the topology can report why.
fn sanitize(server: ServerDescription) -> ServerDescription {
    let problem = if server.kind.is_replica_set_member() && server.set_name.is_none() {
        Some(format!("{} reported no replica set name", server.kind))
    } else if server.kind == ServerKind::RSPrimary && server.hosts.is_empty() {
        Some("primary reported no replica set members".to_string())
    } else if !server.is_compatible() {
        Some("incompatible wire version".to_string())
    } else {
        None
    };

    match problem {
        Some(problem) => ServerDescription {
            wire_version: server.wire_version,
            ..ServerDescription::unknown_with_error(server.address, problem)
        },
        None => server,
    }
}

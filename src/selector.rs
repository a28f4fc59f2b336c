//! Policies which choose the servers eligible for an operation.

use crate::description::{ServerDescription, ServerKind, TopologyDescription, TopologyKind};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Narrows a list of candidate servers to the ones an operation may use.
///
/// Candidates never include servers of kind [ServerKind::Unknown]. An error
/// is treated as a programming mistake and ends selection immediately.
pub trait ServerSelector: Send + Sync {
    fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error>;
}

impl<F> ServerSelector for F
where
    F: Fn(&TopologyDescription, &[ServerDescription]) -> Result<Vec<ServerDescription>, anyhow::Error>
        + Send
        + Sync,
{
    fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error> {
        self(topology, candidates)
    }
}

fn of_kind(candidates: &[ServerDescription], kind: ServerKind) -> Vec<ServerDescription> {
    candidates.iter().filter(|s| s.kind == kind).cloned().collect()
}

fn data_bearing(topology: &TopologyDescription, candidates: &[ServerDescription]) -> Option<Vec<ServerDescription>> {
    match topology.kind {
        TopologyKind::Single => Some(candidates.to_vec()),
        TopologyKind::Sharded => Some(of_kind(candidates, ServerKind::Mongos)),
        _ => None,
    }
}

/// Selects servers which accept writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteSelector;

impl ServerSelector for WriteSelector {
    fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error> {
        Ok(data_bearing(topology, candidates)
            .unwrap_or_else(|| of_kind(candidates, ServerKind::RSPrimary)))
    }
}

/// A set of tags a server must carry, all of them.
pub type TagSet = BTreeMap<String, String>;

/// Which replica set members a read may go to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadPref {
    Primary,
    PrimaryPreferred { tag_sets: Vec<TagSet> },
    Secondary { tag_sets: Vec<TagSet> },
    SecondaryPreferred { tag_sets: Vec<TagSet> },
    Nearest { tag_sets: Vec<TagSet> },
}

impl ReadPref {
    fn tag_sets(&self) -> &[TagSet] {
        match self {
            ReadPref::Primary => &[],
            ReadPref::PrimaryPreferred { tag_sets }
            | ReadPref::Secondary { tag_sets }
            | ReadPref::SecondaryPreferred { tag_sets }
            | ReadPref::Nearest { tag_sets } => tag_sets,
        }
    }
}

// Keeps the servers matching the first tag set which matches anything.
fn filter_by_tags(servers: Vec<ServerDescription>, tag_sets: &[TagSet]) -> Vec<ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }
    for tag_set in tag_sets {
        let matched: Vec<_> = servers
            .iter()
            .filter(|s| tag_set.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    vec![]
}

/// Selects servers for a read according to a [ReadPref].
#[derive(Clone, Debug)]
pub struct ReadPrefSelector(pub ReadPref);

impl ServerSelector for ReadPrefSelector {
    fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error> {
        if let Some(servers) = data_bearing(topology, candidates) {
            return Ok(servers);
        }
        let primaries = || of_kind(candidates, ServerKind::RSPrimary);
        let secondaries =
            || filter_by_tags(of_kind(candidates, ServerKind::RSSecondary), self.0.tag_sets());

        Ok(match &self.0 {
            ReadPref::Primary => primaries(),
            ReadPref::PrimaryPreferred { .. } => {
                let primaries = primaries();
                if primaries.is_empty() {
                    secondaries()
                } else {
                    primaries
                }
            }
            ReadPref::Secondary { .. } => secondaries(),
            ReadPref::SecondaryPreferred { .. } => {
                let secondaries = secondaries();
                if secondaries.is_empty() {
                    primaries()
                } else {
                    secondaries
                }
            }
            ReadPref::Nearest { tag_sets } => {
                let mut servers = of_kind(candidates, ServerKind::RSPrimary);
                servers.extend(of_kind(candidates, ServerKind::RSSecondary));
                filter_by_tags(servers, tag_sets)
            }
        })
    }
}

/// Keeps the servers whose round-trip time is within `threshold` of the
/// fastest one. Servers with no measurement count as instantaneous.
#[derive(Clone, Copy, Debug)]
pub struct LatencySelector {
    pub threshold: Duration,
}

impl ServerSelector for LatencySelector {
    fn select(
        &self,
        _topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error> {
        let rtt = |s: &ServerDescription| s.average_rtt.unwrap_or_default();
        let Some(fastest) = candidates.iter().map(rtt).min() else {
            return Ok(vec![]);
        };
        let limit = fastest + self.threshold;
        Ok(candidates
            .iter()
            .filter(|s| rtt(s) <= limit)
            .cloned()
            .collect())
    }
}

/// Runs selectors in order, each narrowing the previous one's output.
#[derive(Clone, Default)]
pub struct CompositeSelector(pub Vec<Arc<dyn ServerSelector>>);

impl ServerSelector for CompositeSelector {
    fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Result<Vec<ServerDescription>, anyhow::Error> {
        let mut servers = candidates.to_vec();
        for selector in &self.0 {
            servers = selector.select(topology, &servers)?;
        }
        Ok(servers)
    }
}

//! Default implementations of [crate::connector::Connector]

use crate::connector::{Error, SharedConnector};
use crate::policy::Policy;

use std::sync::Arc;

pub mod tcp;

#[cfg(feature = "tls")]
pub mod tls;

/// Picks the connector `policy` asks for: TLS when configured, otherwise
/// plain TCP.
pub fn for_policy(policy: &Policy) -> Result<SharedConnector, Error> {
    match &policy.tls {
        None => Ok(Arc::new(tcp::TcpConnector {})),
        #[cfg(feature = "tls")]
        Some(config) => Ok(Arc::new(tls::TlsConnector::new(config)?)),
        #[cfg(not(feature = "tls"))]
        Some(_) => Err(Error::Other(anyhow::anyhow!(
            "TLS was requested, but sdam was built without the \"tls\" feature"
        ))),
    }
}

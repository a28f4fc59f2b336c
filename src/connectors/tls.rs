//! Implementation of [Connector] for TLS over TCP.

use crate::address::ServerAddress;
use crate::connector::{BoxedStream, Connector, Error};
use crate::connectors::tcp::TcpConnector;
use crate::policy::TlsConfig;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io::BufReader;
use std::sync::Arc;

pub struct TlsConnector {
    tcp: TcpConnector,
    config: Arc<ClientConfig>,
}

fn other(err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Other(anyhow::Error::new(err))
}

impl TlsConnector {
    /// Builds a connector trusting the roots named by `config`.
    pub fn new(config: &TlsConfig) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        match &config.ca_file {
            Some(path) => {
                let mut reader = BufReader::new(std::fs::File::open(path)?);
                for cert in rustls_pemfile::certs(&mut reader) {
                    roots.add(cert?).map_err(other)?;
                }
                if roots.is_empty() {
                    return Err(Error::Other(anyhow::anyhow!(
                        "no certificates found in {}",
                        path.display()
                    )));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(other)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            tcp: TcpConnector {},
            config: Arc::new(client),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<BoxedStream, Error> {
        let name = ServerName::try_from(address.resolvable_host().to_string()).map_err(other)?;
        let tcp = self.tcp.connect_tcp(address).await?;
        let stream = tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(name, tcp)
            .await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_roots() {
        TlsConnector::new(&TlsConfig::default()).unwrap();
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
        };
        assert!(matches!(TlsConnector::new(&config), Err(Error::Io(_))));
    }
}

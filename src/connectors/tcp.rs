//! Implementation of [Connector] for TCP.

use crate::address::ServerAddress;
use crate::connector::{BoxedStream, Connector, Error};

use async_trait::async_trait;
use tokio::net::TcpStream;

pub struct TcpConnector {}

impl TcpConnector {
    pub(crate) async fn connect_tcp(&self, address: &ServerAddress) -> Result<TcpStream, Error> {
        let stream = TcpStream::connect((address.resolvable_host(), address.port())).await?;
        // Wire messages are written whole, so there is nothing to coalesce.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<BoxedStream, Error> {
        Ok(Box::new(self.connect_tcp(address).await?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut stream = TcpConnector {}.connect(&address).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let Err(err) = TcpConnector {}.connect(&address).await else {
            panic!("connected to a closed port");
        };
        assert!(matches!(err, Error::Io(_)));
    }
}

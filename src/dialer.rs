use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability interface for opening upstream connections, so the relay can
/// be exercised against in-memory upstreams.
#[async_trait]
pub trait Dialer: Send + Sync + std::fmt::Debug {
    async fn dial(&self, location: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>>;
}

/// Dials over the host network, resolving hostnames with the OS resolver.
#[derive(Debug)]
pub struct NativeDialer;

impl NativeDialer {
    async fn resolve(&self, location: &NetLocation) -> std::io::Result<SocketAddr> {
        if let Some(socket_addr) = location.to_socket_addr_nonblocking() {
            return Ok(socket_addr);
        }

        let (address, port) = (location.address().to_string(), location.port());
        let resolved = tokio::net::lookup_host((address.as_str(), port))
            .await?
            .find(|addr| !addr.ip().is_unspecified());
        debug!("resolved {address}:{port} -> {resolved:?}");

        resolved.ok_or_else(|| {
            std::io::Error::other(format!("could not resolve location: {location}"))
        })
    }
}

#[async_trait]
impl Dialer for NativeDialer {
    async fn dial(&self, location: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
        let socket_addr = self.resolve(location).await?;

        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("failed to connect to {location}: {e}"),
                ));
            }
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {location} timed out"),
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP nodelay: {e}");
        }

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_ip_literal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let location = NetLocation::from_ip_addr(addr.ip(), addr.port());
        let mut stream = NativeDialer.dial(&location).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 on loopback is essentially never listening.
        let location = NetLocation::new(Address::from("127.0.0.1").unwrap(), 1);
        assert!(NativeDialer.dial(&location).await.is_err());
    }
}

//! Network dialer abstraction.
//!
//! A [`Dialer`] establishes a connection to an [`Endpoint`] and returns a
//! boxed [`IoStream`], erasing the underlying transport so wrappers (NAT64
//! rewriting, pooling) compose freely. [`TcpDialer`] is the base
//! implementation; [`FnDialer`] injects closures, mostly for tests.

use async_trait::async_trait;
use std::net::SocketAddr;
use sy_core::adapter::BoxPacketConn;
use sy_core::types::{Endpoint, Host, Network};
use thiserror::Error;

pub use sy_core::adapter::{AsyncReadWrite, IoStream};

/// Errors surfaced by dial operations.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("not supported")]
    NotSupported,

    #[error("other: {0}")]
    Other(String),
}

impl From<tokio::time::error::Elapsed> for DialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DialError::Other("timeout".into())
    }
}

/// Asynchronous connection factory for stream and packet transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(
        &self,
        network: Network,
        destination: &Endpoint,
    ) -> Result<IoStream, DialError>;

    async fn listen_packet(&self, destination: &Endpoint) -> Result<BoxPacketConn, DialError> {
        let _ = destination;
        Err(DialError::NotSupported)
    }
}

/// Plain TCP dialer; domain hosts resolve through the system resolver.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(
        &self,
        network: Network,
        destination: &Endpoint,
    ) -> Result<IoStream, DialError> {
        if network != Network::Tcp {
            return Err(DialError::NotSupported);
        }
        let stream = match &destination.host {
            Host::Ip(ip) => {
                tokio::net::TcpStream::connect(SocketAddr::new(*ip, destination.port)).await?
            }
            Host::Name(name) => {
                tokio::net::TcpStream::connect((name.as_ref(), destination.port)).await?
            }
        };
        Ok(Box::new(stream))
    }
}

/// Closure-backed dialer for injecting custom connect logic.
pub struct FnDialer<F>(pub F);

impl<F> FnDialer<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Dialer for FnDialer<F>
where
    F: Send
        + Sync
        + Fn(
            Network,
            &Endpoint,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<IoStream, DialError>> + Send>,
        >,
{
    async fn connect(
        &self,
        network: Network,
        destination: &Endpoint,
    ) -> Result<IoStream, DialError> {
        (self.0)(network, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_dialer_rejects_udp() {
        let err = TcpDialer
            .connect(Network::Udp, &Endpoint::new("127.0.0.1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::NotSupported));
    }

    #[tokio::test]
    async fn tcp_dialer_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let stream = TcpDialer
            .connect(Network::Tcp, &Endpoint::from_socket_addr(addr))
            .await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fn_dialer_invokes_closure() {
        let dialer = FnDialer::new(|_network, destination: &Endpoint| {
            let port = destination.port;
            Box::pin(async move {
                Err::<IoStream, _>(DialError::Other(format!("port {port}")))
            })
                as std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<IoStream, DialError>> + Send>,
                >
        });
        let err = dialer
            .connect(Network::Tcp, &Endpoint::new("example.com", 8443))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Other(msg) if msg == "port 8443"));
    }

    #[tokio::test]
    async fn default_listen_packet_is_unsupported() {
        let err = TcpDialer
            .listen_packet(&Endpoint::new("127.0.0.1", 53))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::NotSupported));
    }
}

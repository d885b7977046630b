use std::fmt::{Display, Formatter};
use std::future::Future;
use std::net::SocketAddrV4;
use std::time::Duration;

use crate::origdst::DestinationResolver;
use crate::tunnel::connect::ProxyConnector;

pub mod connect;
pub mod relay;
pub mod tcp;

/// Process-wide settings shared read-only by every connection.
pub struct Tunnel<R> {
    /// The upstream proxy, resolved once at startup.
    proxy_addr: SocketAddrV4,
    resolver: R,
    connector: ProxyConnector,
    setup_timeout: Option<Duration>,
}

impl<R: DestinationResolver> Tunnel<R> {
    pub fn new(proxy_addr: SocketAddrV4, resolver: R, connector: ProxyConnector) -> Self {
        Self {
            proxy_addr,
            resolver,
            connector,
            setup_timeout: None,
        }
    }

    /// Bounds dialing the proxy and the CONNECT handshake. `None` waits forever.
    pub fn with_setup_timeout(mut self, setup_timeout: Option<Duration>) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }
}

/// Sequential number assigned to each accepted connection, used to tag its log lines.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[#{}]", self.0)
    }
}

/// Lifecycle of a single tunnelled connection.
///
/// `Accepted -> Resolving -> Dialing -> Handshaking -> Relaying -> Closed`; any stage may
/// jump straight to `Closed` on failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Accepted,
    Resolving,
    Dialing,
    Handshaking,
    Relaying,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::Resolving => write!(f, "resolving original destination"),
            ConnectionState::Dialing => write!(f, "dialing proxy"),
            ConnectionState::Handshaking => write!(f, "proxy handshake"),
            ConnectionState::Relaying => write!(f, "relaying"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// A connection that failed before its relay started, and the stage it failed in.
#[derive(Debug)]
pub struct ConnectionError {
    pub state: ConnectionState,
    pub error: anyhow::Error,
}

impl ConnectionError {
    fn at(state: ConnectionState) -> impl FnOnce(anyhow::Error) -> Self {
        move |error| Self { state, error }
    }
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {:#}", self.state, self.error)
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.error)
    }
}

/// Awaits `fut`, giving up after `limit` if one is set.
async fn within<F, T, E>(limit: Option<Duration>, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(anyhow::anyhow!("Timed out after {:?}", limit)),
        },
        None => fut.await.map_err(Into::into),
    }
}

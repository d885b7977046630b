use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::AcceptPolicy;
use crate::origdst::DestinationResolver;
use crate::tunnel::relay::{relay, RelayBuffer, RelayEnd, RelayOutcome};
use crate::tunnel::{within, ConnectionError, ConnectionId, ConnectionState, Tunnel};

const LISTEN_BACKLOG: u32 = 128;

/// Binds the listening socket that the firewall redirects connections to.
pub fn bind_listener(addr: SocketAddrV4) -> anyhow::Result<TcpListener> {
    let socket = TcpSocket::new_v4().with_context(|| "Failed to create listening socket")?;
    socket
        .set_reuseaddr(true)
        .with_context(|| "Failed to set SO_REUSEADDR on listening socket")?;
    socket
        .bind(addr.into())
        .with_context(|| format!("Failed to bind listening socket to {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("Failed to listen on {}", addr))
}

/// Accepts redirected connections forever, tunnelling each one in its own task.
pub async fn serve<R: DestinationResolver>(
    listener: TcpListener,
    tunnel: Arc<Tunnel<R>>,
    accept_policy: AcceptPolicy,
) -> anyhow::Result<()> {
    let mut next_id = 0;
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_error(accept_policy, e)?;
                // Avoid spinning on persistent failures such as fd exhaustion.
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let id = ConnectionId(next_id);
        next_id += 1;

        info!("{} Incoming connection from {}", id, peer_addr);
        spawn_connection(tunnel.clone(), id, socket);
    }
}

/// Decides whether a failed `accept` stops the listener.
fn accept_error(accept_policy: AcceptPolicy, e: std::io::Error) -> anyhow::Result<()> {
    match accept_policy {
        AcceptPolicy::KeepAccepting => {
            error!("Error accepting connection: {:?}", e);
            Ok(())
        }
        AcceptPolicy::FailFast => Err(e).with_context(|| "Error accepting connection"),
    }
}

/// Runs the connection in a detached task that owns both of its sockets.
pub fn spawn_connection<R: DestinationResolver>(
    tunnel: Arc<Tunnel<R>>,
    id: ConnectionId,
    socket: TcpStream,
) {
    tokio::spawn(async move {
        match handle_connection(&tunnel, id, socket).await {
            Ok(outcome) => {
                let RelayOutcome {
                    end,
                    client_to_upstream,
                    upstream_to_client,
                } = outcome;
                match end {
                    RelayEnd::Closed(_) => info!(
                        "{} Connection {} (sent {} bytes, received {} bytes)",
                        id, end, client_to_upstream, upstream_to_client
                    ),
                    _ => warn!(
                        "{} Connection dropped: {} (sent {} bytes, received {} bytes)",
                        id, end, client_to_upstream, upstream_to_client
                    ),
                }
            }
            Err(e) => error!("{} Connection dropped: {}", id, e),
        }
        trace!("{} {}", id, ConnectionState::Closed);
    });
}

/// Resolves, dials, handshakes and relays one client connection.
///
/// Both sockets are dropped together when this returns, whichever stage it stopped at.
pub async fn handle_connection<R: DestinationResolver>(
    tunnel: &Tunnel<R>,
    id: ConnectionId,
    mut client: TcpStream,
) -> Result<RelayOutcome, ConnectionError> {
    trace!("{} {}", id, ConnectionState::Accepted);

    trace!("{} {}", id, ConnectionState::Resolving);
    let target = tunnel
        .resolver
        .resolve(&client)
        .map_err(ConnectionError::at(ConnectionState::Resolving))?;
    info!("{} Handling connection to {}", id, target);

    trace!("{} {}", id, ConnectionState::Dialing);
    let mut upstream = within(tunnel.setup_timeout, TcpStream::connect(tunnel.proxy_addr))
        .await
        .with_context(|| format!("Unable to connect to proxy {}", tunnel.proxy_addr))
        .map_err(ConnectionError::at(ConnectionState::Dialing))?;

    trace!("{} {}", id, ConnectionState::Handshaking);
    let reply = within(
        tunnel.setup_timeout,
        tunnel.connector.handshake(&mut upstream, target, &mut client),
    )
    .await
    .with_context(|| format!("CONNECT to {} via {} failed", target, tunnel.proxy_addr))
    .map_err(ConnectionError::at(ConnectionState::Handshaking))?;
    debug!(
        "{} Tunnel to {} established ({} byte header, {} bytes ahead)",
        id,
        target,
        reply.header_len,
        reply.leftover.len()
    );

    trace!("{} {}", id, ConnectionState::Relaying);
    let mut buffer = RelayBuffer::new();
    Ok(relay(&mut client, &mut upstream, &mut buffer).await)
}

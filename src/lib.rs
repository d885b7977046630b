#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::Context;

use crate::config::Config;
use crate::origdst::OriginalDst;
use crate::tunnel::connect::ProxyConnector;
use crate::tunnel::Tunnel;

pub mod config;
pub mod origdst;
pub mod tunnel;

/// Resolves the proxy, binds the listener and tunnels redirected connections until the
/// accept loop fails.
///
/// Nothing is accepted unless the proxy address resolves.
pub async fn start_tunnel(config: Config) -> anyhow::Result<()> {
    let proxy_addr = config
        .proxy
        .resolve()
        .await
        .with_context(|| "Error resolving proxy address")?;

    let listen_addr = config.listen_addr().await?;
    let listener = tunnel::tcp::bind_listener(listen_addr)
        .with_context(|| "Error opening server socket")?;

    info!(
        "Tunnelling connections redirected to [{}] via proxy [{}] ({})",
        listen_addr, config.proxy, proxy_addr
    );

    let tunnel = Tunnel::new(
        proxy_addr,
        OriginalDst,
        ProxyConnector::new(config.require_success),
    )
    .with_setup_timeout(config.setup_timeout);

    tunnel::tcp::serve(listener, Arc::new(tunnel), config.accept_policy)
        .await
        .with_context(|| "Error in accept loop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyTarget;

    #[tokio::test]
    async fn test_unresolvable_proxy_is_fatal() {
        let config = Config::new(ProxyTarget::new("proxy.invalid", 3128), "127.0.0.1", 0);
        assert!(start_tunnel(config).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = Config::new(ProxyTarget::new("127.0.0.1", 3128), "127.0.0.1", port);
        assert!(start_tunnel(config).await.is_err());
    }
}

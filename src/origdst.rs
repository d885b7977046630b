//! Recovers the destination a client intended to reach before the firewall redirected it.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::TcpStream;

/// `SO_ORIGINAL_DST` from `linux/netfilter_ipv4.h`.
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Finds out where an accepted connection was originally headed.
pub trait DestinationResolver: Send + Sync + 'static {
    fn resolve(&self, socket: &TcpStream) -> anyhow::Result<SocketAddrV4>;
}

/// Asks netfilter for the pre-NAT destination of a `REDIRECT`ed socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct OriginalDst;

impl DestinationResolver for OriginalDst {
    fn resolve(&self, socket: &TcpStream) -> anyhow::Result<SocketAddrV4> {
        let destination = original_dst(socket)
            .with_context(|| "Unable to get original destination of connection")?;

        // conntrack answers with our own address for connections that were never NATed.
        let local = socket
            .local_addr()
            .with_context(|| "Failed to read local address of connection")?;
        if SocketAddr::V4(destination) == local {
            anyhow::bail!(
                "Connection to {} was not redirected by the firewall",
                destination
            );
        }

        Ok(destination)
    }
}

#[cfg(target_os = "linux")]
fn original_dst(socket: &TcpStream) -> io::Result<SocketAddrV4> {
    use std::os::unix::io::AsRawFd;

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut libc::sockaddr_in as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination is not an IPv4 address",
        ));
    }
    Ok(sockaddr_to_v4(&addr))
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_socket: &TcpStream) -> io::Result<SocketAddrV4> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on Linux",
    ))
}

#[cfg(target_os = "linux")]
fn sockaddr_to_v4(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        u32::from_be(addr.sin_addr.s_addr).into(),
        u16::from_be(addr.sin_port),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sockaddr_network_order() {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 443u16.to_be();
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::new(93, 184, 216, 34)).to_be();

        assert_eq!(
            sockaddr_to_v4(&addr),
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443)
        );
    }

    #[tokio::test]
    async fn test_unredirected_connection_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        assert!(OriginalDst.resolve(&accepted).is_err());
    }
}

use std::net::SocketAddrV4;

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{char, digit1, space1};
use nom::combinator::map;
use nom::sequence::tuple;
use nom::IResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of the proxy's response header, terminator included.
pub const HEADER_CAPACITY: usize = 512;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Renders the request asking the proxy to open a tunnel to `target`.
pub fn connect_request(target: SocketAddrV4) -> String {
    format!("CONNECT {}:{} HTTP/1.0\r\n\r\n", target.ip(), target.port())
}

/// What the proxy sent back before the tunnel became a plain byte pipe.
#[derive(Debug)]
pub struct ProxyReply {
    /// Status code from the reply's status line, if it could be parsed.
    pub status: Option<u16>,
    /// Length of the response header, terminator included.
    pub header_len: usize,
    /// Tunnelled bytes that arrived in the same read as the end of the header.
    pub leftover: Bytes,
}

impl ProxyReply {
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }
}

/// Opens CONNECT tunnels on connections to the upstream proxy.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyConnector {
    require_success: bool,
}

impl ProxyConnector {
    /// With `require_success` unset, any reply that ends its header is accepted,
    /// whatever its status.
    pub fn new(require_success: bool) -> Self {
        Self { require_success }
    }

    /// Asks the proxy behind `upstream` for a tunnel to `target`, waits for the end of its
    /// response header and hands any bytes that came after it to `client`.
    ///
    /// Once this returns `Ok`, both streams carry nothing but tunnelled data.
    pub async fn handshake<U, C>(
        &self,
        upstream: &mut U,
        target: SocketAddrV4,
        client: &mut C,
    ) -> anyhow::Result<ProxyReply>
    where
        U: AsyncRead + AsyncWrite + Unpin,
        C: AsyncWrite + Unpin,
    {
        upstream
            .write_all(connect_request(target).as_bytes())
            .await
            .with_context(|| "Error writing to proxy")?;
        upstream
            .flush()
            .await
            .with_context(|| "Error writing to proxy")?;

        let reply = read_reply(upstream).await?;
        match reply.status {
            Some(status) => debug!("Proxy answered {} for {}", status, target),
            None => debug!("Proxy sent an unrecognized status line for {}", target),
        }

        if self.require_success && !reply.is_success() {
            anyhow::bail!(
                "Proxy refused tunnel to {} (status {})",
                target,
                reply
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into())
            );
        }

        if !reply.leftover.is_empty() {
            trace!(
                "Forwarding {} bytes received along with the proxy header",
                reply.leftover.len()
            );
            client
                .write_all(&reply.leftover)
                .await
                .with_context(|| "Error writing to client")?;
        }

        Ok(reply)
    }
}

/// Reads from `upstream` until the response header ends, within [`HEADER_CAPACITY`] bytes.
pub async fn read_reply<U>(upstream: &mut U) -> anyhow::Result<ProxyReply>
where
    U: AsyncRead + Unpin,
{
    let mut header = BytesMut::with_capacity(HEADER_CAPACITY);
    loop {
        let remaining = HEADER_CAPACITY - header.len();
        if remaining == 0 {
            anyhow::bail!(
                "Proxy response header does not end within {} bytes",
                HEADER_CAPACITY
            );
        }

        // The terminator may straddle the previous read.
        let scan_from = header.len().saturating_sub(HEADER_END.len() - 1);
        let read = {
            let mut limited = (&mut header).limit(remaining);
            upstream
                .read_buf(&mut limited)
                .await
                .with_context(|| "Error reading from proxy")?
        };
        if read == 0 {
            anyhow::bail!("Proxy closed the connection before ending its response header");
        }

        if let Some(pos) = find_header_end(&header[scan_from..]) {
            let header_len = scan_from + pos + HEADER_END.len();
            let leftover = header.split_off(header_len).freeze();
            return Ok(ProxyReply {
                status: parse_status(&header),
                header_len,
                leftover,
            });
        }
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
}

fn parse_status(header: &[u8]) -> Option<u16> {
    status_line(header).ok().map(|(_, status)| status)
}

/// `HTTP/<major>.<minor> <3-digit status>`
fn status_line(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _) = tuple((tag("HTTP/"), digit1, char('.'), digit1, space1))(input)?;
    map(
        take_while_m_n(3, 3, |c: u8| c.is_ascii_digit()),
        |code: &[u8]| {
            code.iter()
                .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'))
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    #[test]
    fn test_connect_request() {
        assert_eq!(
            connect_request(target()),
            "CONNECT 93.184.216.34:443 HTTP/1.0\r\n\r\n"
        );
        assert_eq!(
            connect_request(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8)),
            "CONNECT 10.0.0.1:8 HTTP/1.0\r\n\r\n"
        );
        assert_eq!(
            connect_request(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 65535)),
            "CONNECT 0.0.0.0:65535 HTTP/1.0\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.0 200 OK\r\n\r\n"), Some(200));
        assert_eq!(
            parse_status(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"),
            Some(407)
        );
        assert_eq!(parse_status(b"HTTP/1.1 200\r\n\r\n"), Some(200));
        assert_eq!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n"), None);
        assert_eq!(parse_status(b"HTTP/1.0 2x0 OK\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn test_handshake_forwards_leftover() {
        let (mut upstream, mut proxy) = duplex(4096);
        let (mut client, mut client_peer) = duplex(4096);

        let proxy_task = tokio::spawn(async move {
            let expected = connect_request(target());
            let mut request = vec![0u8; expected.len()];
            proxy.read_exact(&mut request).await.unwrap();
            assert_eq!(request, expected.as_bytes());
            proxy
                .write_all(b"HTTP/1.0 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            proxy
        });

        let reply = ProxyConnector::default()
            .handshake(&mut upstream, target(), &mut client)
            .await
            .unwrap();
        assert_eq!(reply.status, Some(200));
        assert_eq!(reply.leftover.as_ref(), b"hello");

        let mut received = [0u8; 5];
        client_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello");

        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_without_leftover() {
        let (mut upstream, mut proxy) = duplex(4096);
        let (mut client, mut client_peer) = duplex(4096);

        proxy.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        let reply = ProxyConnector::default()
            .handshake(&mut upstream, target(), &mut client)
            .await
            .unwrap();
        assert!(reply.leftover.is_empty());
        assert_eq!(reply.header_len, 19);

        // Nothing was written to the client.
        drop(client);
        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_terminator_split_across_reads() {
        let (mut upstream, mut proxy) = duplex(4096);

        let proxy_task = tokio::spawn(async move {
            proxy.write_all(b"HTTP/1.1 200 OK\r\n\r").await.unwrap();
            tokio::task::yield_now().await;
            proxy.write_all(b"\nabc").await.unwrap();
            proxy
        });

        let reply = read_reply(&mut upstream).await.unwrap();
        assert_eq!(reply.status, Some(200));
        assert_eq!(reply.header_len, 19);
        assert_eq!(reply.leftover.as_ref(), b"abc");

        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_header_overflow() {
        let (mut upstream, mut proxy) = duplex(4096);
        proxy.write_all(&[b'x'; HEADER_CAPACITY + 88]).await.unwrap();

        assert!(read_reply(&mut upstream).await.is_err());
    }

    #[tokio::test]
    async fn test_terminator_at_capacity_boundary() {
        let (mut upstream, mut proxy) = duplex(4096);
        let mut reply = b"HTTP/1.0 200 OK\r\n".to_vec();
        reply.resize(HEADER_CAPACITY - HEADER_END.len(), b'x');
        reply.extend_from_slice(HEADER_END);
        proxy.write_all(&reply).await.unwrap();

        let reply = read_reply(&mut upstream).await.unwrap();
        assert_eq!(reply.header_len, HEADER_CAPACITY);
        assert!(reply.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_closes_early() {
        let (mut upstream, mut proxy) = duplex(4096);
        proxy.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        drop(proxy);

        assert!(read_reply(&mut upstream).await.is_err());
    }

    #[tokio::test]
    async fn test_status_not_inspected_by_default() {
        let (mut upstream, mut proxy) = duplex(4096);
        let (mut client, _client_peer) = duplex(4096);
        proxy
            .write_all(b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        let reply = ProxyConnector::default()
            .handshake(&mut upstream, target(), &mut client)
            .await
            .unwrap();
        assert_eq!(reply.status, Some(407));
    }

    #[tokio::test]
    async fn test_require_success_rejects_refusal() {
        let (mut upstream, mut proxy) = duplex(4096);
        let (mut client, mut client_peer) = duplex(4096);
        proxy
            .write_all(b"HTTP/1.0 403 Forbidden\r\n\r\nblocked")
            .await
            .unwrap();

        let result = ProxyConnector::new(true)
            .handshake(&mut upstream, target(), &mut client)
            .await;
        assert!(result.is_err());

        // The refusal body must not reach the client.
        drop(client);
        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }
}

use std::fmt::{Display, Formatter};
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes moved per read in each direction.
pub const RELAY_CHUNK: usize = 2048;

/// Scratch space for one relay: one chunk per direction, owned by a single connection.
pub struct RelayBuffer {
    inner: Box<[u8]>,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self {
            inner: vec![0u8; 2 * RELAY_CHUNK].into_boxed_slice(),
        }
    }

    /// Splits the buffer into the client->upstream and upstream->client chunks.
    fn halves(&mut self) -> (&mut [u8], &mut [u8]) {
        self.inner.split_at_mut(RELAY_CHUNK)
    }
}

/// One end of a relayed connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    fn peer(self) -> Self {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// Why the relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The given side reached end-of-stream.
    Closed(Side),
    /// Reading from the given side failed.
    ReadFailed(Side, io::Error),
    /// Writing to the given side failed.
    WriteFailed(Side, io::Error),
}

impl Display for RelayEnd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayEnd::Closed(side) => write!(f, "closed by {}", side),
            RelayEnd::ReadFailed(side, e) => write!(f, "failed to read from {}: {}", side, e),
            RelayEnd::WriteFailed(side, e) => write!(f, "failed to write to {}: {}", side, e),
        }
    }
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pumps bytes between `client` and `upstream` until either side closes or fails.
///
/// Nothing is drained from the surviving side once the other one is gone.
pub async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    buffer: &mut RelayBuffer,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (to_upstream, to_client) = buffer.halves();
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    let end = tokio::select! {
        end = pump(Side::Client, &mut client_rx, &mut upstream_tx, to_upstream, &mut client_to_upstream) => end,
        end = pump(Side::Upstream, &mut upstream_rx, &mut client_tx, to_client, &mut upstream_to_client) => end,
    };

    RelayOutcome {
        end,
        client_to_upstream,
        upstream_to_client,
    }
}

/// Copies chunks from `reader` to `writer`, one read at a time.
async fn pump<R, W>(
    from: Side,
    reader: &mut R,
    writer: &mut W,
    chunk: &mut [u8],
    total: &mut u64,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size = match reader.read(chunk).await {
            Ok(0) => return RelayEnd::Closed(from),
            Ok(size) => size,
            Err(e) => return RelayEnd::ReadFailed(from, e),
        };
        if let Err(e) = writer.write_all(&chunk[..size]).await {
            return RelayEnd::WriteFailed(from.peer(), e);
        }
        *total += size as u64;
    }
}

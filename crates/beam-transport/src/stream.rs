use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};

use crate::codec::{OpenCodec, SealCodec};
use crate::handshake::{self, SessionKeys, CONFIRM};
use crate::{Keypair, PublicKey, TransportConfig, TransportError};

/// Decrypted inbound byte stream.
pub type SecureReader = StreamReader<FramedRead<OwnedReadHalf, OpenCodec>, Bytes>;

/// Encrypting outbound byte stream. Shutting it down half-closes the TCP connection.
pub type SecureWriter = SinkWriter<CopyToBytes<FramedWrite<OwnedWriteHalf, SealCodec>>>;

/// An authenticated, encrypted connection to a known peer.
pub struct SecureStream {
    remote: PublicKey,
    peer_addr: SocketAddr,
    reader: FramedRead<OwnedReadHalf, OpenCodec>,
    writer: FramedWrite<OwnedWriteHalf, SealCodec>,
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("remote", &self.remote)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl SecureStream {
    /// The authenticated static key of the remote peer.
    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    /// The socket address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (
            StreamReader::new(self.reader),
            SinkWriter::new(CopyToBytes::new(self.writer)),
        )
    }

    /// Wrap a TCP stream after the handshake and run key confirmation.
    ///
    /// The initiator seals first; each side verifies the other's frame before
    /// the stream is handed out.
    pub(crate) async fn confirm(
        tcp: TcpStream,
        keys: SessionKeys,
        remote: PublicKey,
        initiator: bool,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let peer_addr = tcp.peer_addr()?;
        let (read_half, write_half) = tcp.into_split();
        let mut reader = FramedRead::new(read_half, OpenCodec::new(keys.recv, config.max_frame_size));
        let mut writer = FramedWrite::new(write_half, SealCodec::new(keys.send, config.max_frame_size));

        if initiator {
            writer.send(Bytes::from_static(CONFIRM)).await?;
            expect_confirm(&mut reader).await?;
        } else {
            expect_confirm(&mut reader).await?;
            writer.send(Bytes::from_static(CONFIRM)).await?;
        }

        Ok(Self {
            remote,
            peer_addr,
            reader,
            writer,
        })
    }
}

async fn expect_confirm(
    reader: &mut FramedRead<OwnedReadHalf, OpenCodec>,
) -> Result<(), TransportError> {
    match reader.next().await {
        Some(Ok(frame)) if frame.as_ref() == CONFIRM => Ok(()),
        Some(Ok(_)) => Err(TransportError::Handshake("unexpected confirmation frame".into())),
        Some(Err(e)) => Err(TransportError::Handshake(format!("key confirmation failed: {e}"))),
        None => Err(TransportError::Handshake("peer closed during key confirmation".into())),
    }
}

/// Connect to `addr` and authenticate it as `expected`, using `local` as our identity.
pub async fn connect(
    addr: SocketAddr,
    local: &Keypair,
    expected: &PublicKey,
    config: &TransportConfig,
) -> Result<SecureStream, TransportError> {
    let attempt = async {
        let mut tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        tcp.set_nodelay(true)?;

        let keys = handshake::initiate(&mut tcp, local, expected).await?;
        SecureStream::confirm(tcp, keys, *expected, true, config).await
    };

    let stream = tokio::time::timeout(config.handshake_timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout)??;

    tracing::debug!(%addr, remote = %expected, "secure stream established");
    Ok(stream)
}

/// Learn the static key a listener at `addr` advertises, without authenticating.
///
/// The connection is dropped right after the hello.
pub async fn probe(addr: SocketAddr, config: &TransportConfig) -> Result<PublicKey, TransportError> {
    let attempt = async {
        let mut tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        handshake::read_hello(&mut tcp).await
    };

    tokio::time::timeout(config.handshake_timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout)?
}

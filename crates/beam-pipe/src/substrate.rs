//! Discovery substrate consumed by the rendezvous controller.
//!
//! In production: impl by [`Swarm`](crate::Swarm) (mainline DHT + TCP).
//! In tests: impl by [`MemoryNode`](crate::memory::MemoryNode).
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

use beam_transport::{Firewall, Keypair, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::derive::Topic;

/// Externally observed address of this node. Either part may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteAddress {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: Some(addr.ip()),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{}", SocketAddr::new(host, port)),
            (Some(host), None) => write!(f, "{host}"),
            (None, _) => f.write_str("unknown"),
        }
    }
}

/// A peer reported by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// The static key the peer advertises.
    pub public_key: PublicKey,
    /// Addresses the peer may be reached at.
    pub hints: Vec<SocketAddr>,
}

/// An authenticated byte stream to a peer.
///
/// Dropping either half destroys that direction; shutting the writer down
/// signals end-of-data to the peer.
pub struct CandidateTransport {
    pub remote: PublicKey,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub writer: Pin<Box<dyn AsyncWrite + Send>>,
}

impl CandidateTransport {
    pub fn new<R, W>(remote: PublicKey, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            remote,
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

impl fmt::Debug for CandidateTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateTransport")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Result of starting to listen.
#[derive(Debug)]
pub struct Listening {
    /// Our external address, if the substrate already knows it.
    pub address: Option<RemoteAddress>,
    /// Authenticated inbound transports that passed the firewall.
    pub incoming: mpsc::Receiver<CandidateTransport>,
}

/// Peer discovery and connection establishment.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Accept inbound transports authenticated as `keypair`, filtered by `firewall`.
    async fn listen(&self, keypair: &Keypair, firewall: Firewall) -> anyhow::Result<Listening>;

    /// Announce that `keypair` can be reached under `topic`.
    async fn announce(&self, topic: &Topic, keypair: &Keypair) -> anyhow::Result<()>;

    /// Present `new` instead of `old` on the listener and in every announcement.
    ///
    /// Transports already handed out are unaffected.
    async fn rekey(&self, old: &Keypair, new: &Keypair) -> anyhow::Result<()>;

    /// Stop announcing `keypair` under `topic`.
    async fn unannounce(&self, topic: &Topic, keypair: &Keypair) -> anyhow::Result<()>;

    /// Find peers announced under `topic`.
    async fn lookup(&self, topic: &Topic) -> anyhow::Result<Vec<PeerRecord>>;

    /// Open a transport to `remote`, presenting `local` as our identity.
    async fn connect(
        &self,
        remote: &PublicKey,
        local: &Keypair,
        hints: &[SocketAddr],
    ) -> anyhow::Result<CandidateTransport>;

    /// Our external address as currently observed.
    async fn address(&self) -> Option<RemoteAddress>;

    /// Release every resource: listeners, announcements, sockets.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

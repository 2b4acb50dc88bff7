//! In-process discovery substrate.
//!
//! A [`MemoryNetwork`] is a shared registry of listeners and announcements;
//! each peer gets its own [`MemoryNode`] view. Transports are
//! `tokio::io::duplex` pairs, so backpressure behaves like a real socket with
//! a bounded buffer. The firewall passed to `listen` is enforced on connect.
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use beam_transport::{Firewall, Keypair, PublicKey};
use tokio::sync::mpsc;

use crate::derive::Topic;
use crate::substrate::{CandidateTransport, Discovery, Listening, PeerRecord, RemoteAddress};

/// Default per-direction buffer of a memory transport.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

struct Endpoint {
    firewall: Firewall,
    incoming: mpsc::Sender<CandidateTransport>,
    addr: SocketAddr,
}

struct NetworkState {
    listeners: HashMap<PublicKey, Endpoint>,
    announcements: HashMap<Topic, Vec<(PublicKey, SocketAddr)>>,
    calls: usize,
    unreachable: bool,
    next_port: u16,
    capacity: usize,
}

/// Shared in-memory network. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Network whose transports buffer at most `capacity` bytes per direction.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                listeners: HashMap::new(),
                announcements: HashMap::new(),
                calls: 0,
                unreachable: false,
                next_port: 40_000,
                capacity,
            })),
        }
    }

    /// A node that cannot observe its external address.
    pub fn node(&self) -> MemoryNode {
        MemoryNode {
            network: self.clone(),
            address: None,
            owned: Mutex::new(Vec::new()),
        }
    }

    /// A node whose external address is `addr`.
    pub fn node_at(&self, addr: SocketAddr) -> MemoryNode {
        MemoryNode {
            network: self.clone(),
            address: Some(addr),
            owned: Mutex::new(Vec::new()),
        }
    }

    /// Total substrate calls made by all nodes.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// Make every subsequent substrate call fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Keys currently announced under `topic`.
    pub fn announced(&self, topic: &Topic) -> Vec<PublicKey> {
        self.lock()
            .announcements
            .get(topic)
            .map(|entries| entries.iter().map(|(key, _)| *key).collect())
            .unwrap_or_default()
    }

    /// Number of open listeners.
    pub fn listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_call(&self, op: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.calls += 1;
        if state.unreachable {
            bail!("memory network unreachable ({op})");
        }
        Ok(())
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryNode {
    network: MemoryNetwork,
    address: Option<SocketAddr>,
    /// Keys this node listens on, released at shutdown.
    owned: Mutex<Vec<PublicKey>>,
}

impl MemoryNode {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait::async_trait]
impl Discovery for MemoryNode {
    async fn listen(&self, keypair: &Keypair, firewall: Firewall) -> anyhow::Result<Listening> {
        self.network.record_call("listen")?;
        let (tx, incoming) = mpsc::channel(16);

        let mut state = self.network.lock();
        let addr = match self.address {
            Some(addr) => addr,
            None => {
                state.next_port += 1;
                SocketAddr::from((Ipv4Addr::LOCALHOST, state.next_port))
            }
        };
        state.listeners.insert(
            keypair.public(),
            Endpoint {
                firewall,
                incoming: tx,
                addr,
            },
        );
        drop(state);

        self.owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(keypair.public());

        Ok(Listening {
            address: self.address.map(RemoteAddress::from),
            incoming,
        })
    }

    async fn announce(&self, topic: &Topic, keypair: &Keypair) -> anyhow::Result<()> {
        self.network.record_call("announce")?;
        let mut state = self.network.lock();
        let addr = state
            .listeners
            .get(&keypair.public())
            .map(|endpoint| endpoint.addr)
            .ok_or_else(|| anyhow!("announce before listen"))?;

        let entries = state.announcements.entry(*topic).or_default();
        if !entries.iter().any(|(key, _)| *key == keypair.public()) {
            entries.push((keypair.public(), addr));
        }
        Ok(())
    }

    async fn rekey(&self, old: &Keypair, new: &Keypair) -> anyhow::Result<()> {
        self.network.record_call("rekey")?;
        let (old, new) = (old.public(), new.public());
        {
            let mut state = self.network.lock();
            let endpoint = state
                .listeners
                .remove(&old)
                .ok_or_else(|| anyhow!("rekey before listen"))?;
            state.listeners.insert(new, endpoint);
            for entries in state.announcements.values_mut() {
                for (key, _) in entries.iter_mut().filter(|(key, _)| *key == old) {
                    *key = new;
                }
            }
        }

        let mut owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
        owned.retain(|key| *key != old);
        owned.push(new);
        Ok(())
    }

    async fn unannounce(&self, topic: &Topic, keypair: &Keypair) -> anyhow::Result<()> {
        self.network.record_call("unannounce")?;
        let mut state = self.network.lock();
        if let Some(entries) = state.announcements.get_mut(topic) {
            entries.retain(|(key, _)| *key != keypair.public());
        }
        Ok(())
    }

    async fn lookup(&self, topic: &Topic) -> anyhow::Result<Vec<PeerRecord>> {
        self.network.record_call("lookup")?;
        let state = self.network.lock();
        Ok(state
            .announcements
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, addr)| PeerRecord {
                        public_key: *key,
                        hints: vec![*addr],
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn connect(
        &self,
        remote: &PublicKey,
        local: &Keypair,
        hints: &[SocketAddr],
    ) -> anyhow::Result<CandidateTransport> {
        self.network.record_call("connect")?;

        let (incoming, firewall, capacity) = {
            let state = self.network.lock();
            let endpoint = state
                .listeners
                .get(remote)
                .ok_or_else(|| anyhow!("no listener for {remote}"))?;
            if !hints.is_empty() && !hints.contains(&endpoint.addr) {
                bail!("{remote} is not reachable at {hints:?}");
            }
            (endpoint.incoming.clone(), endpoint.firewall.clone(), state.capacity)
        };

        if !firewall(&local.public()) {
            bail!("{remote} rejected our identity");
        }

        let (near, far) = tokio::io::duplex(capacity);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);

        incoming
            .send(CandidateTransport::new(local.public(), far_read, far_write))
            .await
            .map_err(|_| anyhow!("listener for {remote} closed"))?;

        Ok(CandidateTransport::new(*remote, near_read, near_write))
    }

    async fn address(&self) -> Option<RemoteAddress> {
        self.network.record_call("address").ok()?;
        self.address.map(RemoteAddress::from)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let owned = std::mem::take(&mut *self.owned.lock().unwrap_or_else(|e| e.into_inner()));
        let mut state = self.network.lock();
        for key in &owned {
            state.listeners.remove(key);
            for entries in state.announcements.values_mut() {
                entries.retain(|(announced, _)| announced != key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn allow_all() -> Firewall {
        Arc::new(|_: &PublicKey| true)
    }

    #[tokio::test]
    async fn test_connect_delivers_both_ends() {
        let network = MemoryNetwork::new();
        let server = network.node();
        let client = network.node();
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();

        let mut listening = server.listen(&server_key, allow_all()).await.unwrap();
        let mut near = client.connect(&server_key.public(), &client_key, &[]).await.unwrap();
        let mut far = listening.incoming.recv().await.unwrap();

        assert_eq!(near.remote, server_key.public());
        assert_eq!(far.remote, client_key.public());

        near.writer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        far.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_firewall_enforced() {
        let network = MemoryNetwork::new();
        let server = network.node();
        let server_key = Keypair::generate();
        let deny: Firewall = Arc::new(|_: &PublicKey| false);
        let _listening = server.listen(&server_key, deny).await.unwrap();

        let result = network
            .node()
            .connect(&server_key.public(), &Keypair::generate(), &[])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_announce_lookup_unannounce() {
        let network = MemoryNetwork::new();
        let node = network.node_at("203.0.113.5:51413".parse().unwrap());
        let key = Keypair::generate();
        let topic = Topic::from_bytes([5; 32]);

        let _listening = node.listen(&key, allow_all()).await.unwrap();
        node.announce(&topic, &key).await.unwrap();
        node.announce(&topic, &key).await.unwrap();

        let peers = network.node().lookup(&topic).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, key.public());
        assert_eq!(peers[0].hints, vec!["203.0.113.5:51413".parse().unwrap()]);

        node.unannounce(&topic, &key).await.unwrap();
        assert!(network.announced(&topic).is_empty());
    }

    #[tokio::test]
    async fn test_rekey_moves_listener_and_announcements() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let old = Keypair::generate();
        let new = Keypair::generate();
        let topic = Topic::from_bytes([3; 32]);

        let mut listening = node.listen(&old, allow_all()).await.unwrap();
        node.announce(&topic, &old).await.unwrap();
        node.rekey(&old, &new).await.unwrap();

        assert_eq!(network.announced(&topic), vec![new.public()]);
        let client = network.node();
        assert!(client.connect(&old.public(), &Keypair::generate(), &[]).await.is_err());
        let _near = client.connect(&new.public(), &Keypair::generate(), &[]).await.unwrap();
        assert!(listening.incoming.recv().await.is_some());

        node.shutdown().await.unwrap();
        assert_eq!(network.listeners(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_fails_and_counts() {
        let network = MemoryNetwork::new();
        network.set_unreachable(true);
        let node = network.node();

        assert!(node.lookup(&Topic::from_bytes([0; 32])).await.is_err());
        assert!(node.address().await.is_none());
        assert_eq!(network.calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_listener() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let key = Keypair::generate();
        let topic = Topic::from_bytes([1; 32]);

        let mut listening = node.listen(&key, allow_all()).await.unwrap();
        node.announce(&topic, &key).await.unwrap();
        assert_eq!(network.listeners(), 1);

        node.shutdown().await.unwrap();
        assert_eq!(network.listeners(), 0);
        assert!(network.announced(&topic).is_empty());
        assert!(listening.incoming.recv().await.is_none());
    }
}

//! DHT-based rendezvous for Beam.
//! Uses Mainline DHT (BEP-0005) peer announcements keyed by a derived topic.
//!
//! The DHT only knows socket addresses; who is listening behind an address
//! is established later by the transport handshake.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{anyhow, Context, Result};
use mainline::{Dht, Id};

/// Length of a BEP-0005 info hash.
pub const INFO_HASH_LEN: usize = 20;

/// DHT discovery service.
///
/// Cheap to clone; all clones share one DHT node.
#[derive(Clone)]
pub struct DhtDiscovery {
    dht: Dht,
}

impl std::fmt::Debug for DhtDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtDiscovery").finish_non_exhaustive()
    }
}

impl DhtDiscovery {
    /// Create a DHT client using the default public bootstrap nodes.
    pub fn new() -> Result<Self> {
        let dht = Dht::client().context("failed to start DHT client")?;
        tracing::info!("DHT client created");
        Ok(Self { dht })
    }

    /// Create a DHT client bootstrapping from explicit `host:port` nodes
    /// (private testnets, firewalled environments).
    pub fn with_bootstrap(nodes: &[String]) -> Result<Self> {
        let dht = Dht::builder()
            .bootstrap(nodes)
            .build()
            .context("failed to start DHT client")?;
        tracing::info!(nodes = nodes.len(), "DHT client created with custom bootstrap");
        Ok(Self { dht })
    }

    /// Announce that we accept connections on `port` under `topic`.
    pub async fn announce(&self, topic: &[u8], port: u16) -> Result<()> {
        let info_hash = info_hash(topic)?;
        let dht = self.dht.clone();

        tokio::task::spawn_blocking(move || dht.announce_peer(info_hash, Some(port)))
            .await
            .context("DHT announce task panicked")?
            .map_err(|e| anyhow!("DHT announce failed: {e}"))?;

        tracing::debug!(%info_hash, port, "DHT announce stored");
        Ok(())
    }

    /// Collect every address announced under `topic`.
    ///
    /// Duplicates reported by several DHT nodes are removed; order follows
    /// the order in which responses arrived.
    pub async fn lookup(&self, topic: &[u8]) -> Result<Vec<SocketAddr>> {
        let info_hash = info_hash(topic)?;
        let dht = self.dht.clone();

        let found = tokio::task::spawn_blocking(move || {
            let mut found: Vec<SocketAddrV4> = Vec::new();
            for batch in dht.get_peers(info_hash) {
                for addr in batch {
                    if !found.contains(&addr) {
                        found.push(addr);
                    }
                }
            }
            found
        })
        .await
        .context("DHT lookup task panicked")?;

        tracing::debug!(%info_hash, peers = found.len(), "DHT lookup finished");
        Ok(found.into_iter().map(SocketAddr::from).collect())
    }

    /// Wait for the initial bootstrap query to finish.
    ///
    /// Returns false if no node answered.
    pub async fn bootstrapped(&self) -> bool {
        let dht = self.dht.clone();
        let done = tokio::task::spawn_blocking(move || dht.bootstrapped())
            .await
            .unwrap_or(false);
        tracing::debug!(done, "DHT bootstrap finished");
        done
    }

    /// Our public address as observed by other DHT nodes, if known yet.
    pub async fn public_address(&self) -> Option<SocketAddr> {
        let dht = self.dht.clone();
        tokio::task::spawn_blocking(move || dht.info().public_address())
            .await
            .ok()
            .flatten()
            .map(SocketAddr::from)
    }
}

/// Truncate a derived topic to a 20-byte info hash.
pub fn info_hash(topic: &[u8]) -> Result<Id> {
    if topic.len() < INFO_HASH_LEN {
        return Err(anyhow!(
            "topic too short for an info hash: {} bytes",
            topic.len()
        ));
    }
    Id::from_bytes(&topic[..INFO_HASH_LEN]).map_err(|e| anyhow!("invalid info hash: {e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_deterministic() {
        let topic = [0xabu8; 32];
        assert_eq!(info_hash(&topic).unwrap(), info_hash(&topic).unwrap());
    }

    #[test]
    fn test_info_hash_uses_topic_prefix() {
        let mut a = [1u8; 32];
        let mut b = [1u8; 32];
        // Only the first 20 bytes matter.
        a[31] = 9;
        b[31] = 7;
        assert_eq!(info_hash(&a).unwrap(), info_hash(&b).unwrap());

        b[0] = 2;
        assert_ne!(info_hash(&a).unwrap(), info_hash(&b).unwrap());
    }

    #[test]
    fn test_info_hash_rejects_short_topic() {
        assert!(info_hash(&[0u8; 8]).is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_and_lookup_on_local_testnet() {
        let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
        let testnet = mainline::Testnet::builder(10).build().unwrap();

        let a = DhtDiscovery::with_bootstrap(&testnet.bootstrap).unwrap();
        let b = DhtDiscovery::with_bootstrap(&testnet.bootstrap).unwrap();
        assert!(a.bootstrapped().await);

        let topic = [0x5au8; 32];
        a.announce(&topic, 45555).await.unwrap();
        let found = b.lookup(&topic).await.unwrap();
        assert!(found.iter().any(|addr| addr.port() == 45555));
    }

    #[tokio::test]
    #[ignore] // Needs network access to public bootstrap nodes.
    async fn test_dht_discovery_creation() {
        let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
        let dht = DhtDiscovery::new().unwrap();
        let _ = dht.public_address().await;
    }
}

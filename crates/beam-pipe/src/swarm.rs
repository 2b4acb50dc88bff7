//! Production discovery: mainline DHT for rendezvous, authenticated TCP for transport.
//!
//! The DHT stores only addresses, so a lookup probes every reported address
//! for the static key its listener advertises. Whoever answers with a key
//! outside the candidate set is filtered out by the rendezvous controller.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use beam_dht::DhtDiscovery;
use beam_transport::{
    Firewall, Keypair, Listener, ListenerIdentity, PublicKey, TransportConfig, TransportError,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::derive::Topic;
use crate::substrate::{CandidateTransport, Discovery, Listening, PeerRecord, RemoteAddress};

/// TCP port tried first when listening.
pub const PREFERRED_PORT: u16 = 49737;

/// Configuration for a [`Swarm`].
///
/// ```rust
/// use std::time::Duration;
/// use beam_pipe::SwarmConfig;
///
/// let config = SwarmConfig::new()
///     .preferred_port(0)
///     .probe_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Port tried first; falls back to an ephemeral port when taken.
    pub(crate) preferred_port: u16,
    pub(crate) bind_addr: IpAddr,
    /// How often announcements are refreshed while listening.
    pub(crate) announce_interval: Duration,
    /// Upper bound for learning the key behind one looked-up address.
    pub(crate) probe_timeout: Duration,
    /// Custom DHT bootstrap nodes (`host:port`). Default public nodes if `None`.
    pub(crate) bootstrap: Option<Vec<String>>,
    pub(crate) transport: TransportConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmConfig {
    /// Create a new config with defaults.
    ///
    /// If the `BEAM_PORT` environment variable is set, it replaces the
    /// preferred port. This can be overridden with [`.preferred_port()`](Self::preferred_port).
    pub fn new() -> Self {
        let preferred_port = std::env::var("BEAM_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(PREFERRED_PORT);

        Self {
            preferred_port,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announce_interval: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
            bootstrap: None,
            transport: TransportConfig::new(),
        }
    }

    /// Set the preferred listening port (default: 49737). `0` means ephemeral.
    pub fn preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    /// Set the local bind address (default: all interfaces).
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the re-announce interval (default: 5 minutes).
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the probe timeout (default: 5s).
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Bootstrap from these DHT nodes instead of the public ones.
    pub fn bootstrap(mut self, nodes: Vec<String>) -> Self {
        self.bootstrap = Some(nodes);
        self
    }

    /// Set the secure transport configuration.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

#[derive(Default)]
struct SwarmState {
    /// Forwards accepted streams; aborting it closes the listener.
    accept_task: Option<JoinHandle<()>>,
    identity: Option<ListenerIdentity>,
    local_port: Option<u16>,
    announcers: HashMap<Topic, JoinHandle<()>>,
}

/// Mainline DHT + TCP discovery substrate.
pub struct Swarm {
    dht: DhtDiscovery,
    config: SwarmConfig,
    state: Mutex<SwarmState>,
}

impl Swarm {
    /// Start a DHT client. Does not bind anything until `listen`.
    pub fn new(config: SwarmConfig) -> anyhow::Result<Self> {
        let dht = match &config.bootstrap {
            Some(nodes) => DhtDiscovery::with_bootstrap(nodes)?,
            None => DhtDiscovery::new()?,
        };
        Ok(Self {
            dht,
            config,
            state: Mutex::new(SwarmState::default()),
        })
    }

    async fn bind(&self, keypair: &Keypair, firewall: Firewall) -> anyhow::Result<Listener> {
        let preferred = SocketAddr::new(self.config.bind_addr, self.config.preferred_port);
        match Listener::bind(preferred, keypair.clone(), firewall.clone(), self.config.transport.clone()).await {
            Ok(listener) => Ok(listener),
            Err(TransportError::Bind(e)) if self.config.preferred_port != 0 => {
                tracing::debug!(port = self.config.preferred_port, "preferred port unavailable: {e}");
                let fallback = SocketAddr::new(self.config.bind_addr, 0);
                Listener::bind(fallback, keypair.clone(), firewall, self.config.transport.clone())
                    .await
                    .context("failed to bind listener")
            }
            Err(e) => Err(e).context("failed to bind listener"),
        }
    }
}

#[async_trait::async_trait]
impl Discovery for Swarm {
    async fn listen(&self, keypair: &Keypair, firewall: Firewall) -> anyhow::Result<Listening> {
        let mut state = self.state.lock().await;
        if state.accept_task.is_some() {
            bail!("already listening");
        }

        let mut listener = self.bind(keypair, firewall).await?;
        let port = listener.local_addr().port();
        let (tx, incoming) = mpsc::channel(16);

        state.local_port = Some(port);
        state.identity = Some(listener.identity());
        state.accept_task = Some(tokio::spawn(async move {
            while let Some(stream) = listener.accept().await {
                let remote = stream.remote();
                let (reader, writer) = stream.into_split();
                if tx.send(CandidateTransport::new(remote, reader, writer)).await.is_err() {
                    break;
                }
            }
        }));
        drop(state);

        tracing::info!(port, "swarm listening");
        Ok(Listening {
            address: self.address().await,
            incoming,
        })
    }

    async fn announce(&self, topic: &Topic, _keypair: &Keypair) -> anyhow::Result<()> {
        let port = self
            .state
            .lock()
            .await
            .local_port
            .ok_or_else(|| anyhow!("announce before listen"))?;

        self.dht.announce(topic.as_bytes(), port).await?;

        // BEP-0005 announcements expire; keep refreshing until unannounced.
        let dht = self.dht.clone();
        let bytes = *topic.as_bytes();
        let every = self.config.announce_interval;
        let refresh = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = dht.announce(&bytes, port).await {
                    tracing::warn!("DHT re-announce failed: {e}");
                }
            }
        });
        if let Some(previous) = self.state.lock().await.announcers.insert(*topic, refresh) {
            previous.abort();
        }
        tracing::debug!(%topic, port, "announced");
        Ok(())
    }

    async fn rekey(&self, old: &Keypair, new: &Keypair) -> anyhow::Result<()> {
        // Announcements carry only the port; probes pick up the new key.
        let state = self.state.lock().await;
        let identity = state
            .identity
            .as_ref()
            .ok_or_else(|| anyhow!("rekey before listen"))?;
        if identity.public() != old.public() {
            bail!("listener does not present {}", old.public());
        }
        identity.set(new.clone());
        Ok(())
    }

    async fn unannounce(&self, topic: &Topic, _keypair: &Keypair) -> anyhow::Result<()> {
        // There is no DHT delete; stopping the refresh lets the entry expire.
        if let Some(refresh) = self.state.lock().await.announcers.remove(topic) {
            refresh.abort();
        }
        Ok(())
    }

    async fn lookup(&self, topic: &Topic) -> anyhow::Result<Vec<PeerRecord>> {
        let addrs = self.dht.lookup(topic.as_bytes()).await?;

        let mut probes = JoinSet::new();
        for addr in addrs {
            let config = self.config.transport.clone().handshake_timeout(self.config.probe_timeout);
            probes.spawn(async move { (addr, beam_transport::probe(addr, &config).await) });
        }

        let mut records: Vec<PeerRecord> = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((addr, probed)) = joined else { continue };
            match probed {
                Ok(public_key) => match records.iter_mut().find(|r| r.public_key == public_key) {
                    Some(record) => record.hints.push(addr),
                    None => records.push(PeerRecord {
                        public_key,
                        hints: vec![addr],
                    }),
                },
                Err(e) => tracing::debug!(%addr, "probe failed: {e}"),
            }
        }
        Ok(records)
    }

    async fn connect(
        &self,
        remote: &PublicKey,
        local: &Keypair,
        hints: &[SocketAddr],
    ) -> anyhow::Result<CandidateTransport> {
        let mut last_error = None;
        for addr in hints {
            match beam_transport::connect(*addr, local, remote, &self.config.transport).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(CandidateTransport::new(*remote, reader, writer));
                }
                Err(e) => {
                    tracing::debug!(%addr, "connect failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e).context(format!("could not reach {remote}")),
            None => bail!("no addresses for {remote}"),
        }
    }

    async fn address(&self) -> Option<RemoteAddress> {
        // Other nodes report our address only once bootstrap has finished.
        if !self.dht.bootstrapped().await {
            tracing::warn!("DHT bootstrap reached no nodes");
        }
        let host = self.dht.public_address().await.map(|addr| addr.ip());
        let port = self.state.lock().await.local_port;
        Some(RemoteAddress { host, port })
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        for (_, refresh) in state.announcers.drain() {
            refresh.abort();
        }
        if let Some(accept) = state.accept_task.take() {
            accept.abort();
        }
        state.identity = None;
        state.local_port = None;
        tracing::debug!("swarm shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SwarmConfig::new().preferred_port(PREFERRED_PORT);
        assert_eq!(config.preferred_port, PREFERRED_PORT);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = SwarmConfig::new()
            .preferred_port(0)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .announce_interval(Duration::from_secs(60))
            .bootstrap(vec!["127.0.0.1:6881".into()]);
        assert_eq!(config.preferred_port, 0);
        assert_eq!(config.announce_interval, Duration::from_secs(60));
        assert_eq!(config.bootstrap.as_deref(), Some(&["127.0.0.1:6881".to_string()][..]));
    }

    fn local_swarm(testnet: &mainline::Testnet) -> Swarm {
        Swarm::new(
            SwarmConfig::new()
                .preferred_port(0)
                .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .bootstrap(testnet.bootstrap.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_listen_announce_lookup_on_local_testnet() {
        let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
        let testnet = mainline::Testnet::builder(10).build().unwrap();
        let responder = local_swarm(&testnet);
        let initiator = local_swarm(&testnet);

        let key = Keypair::generate();
        let allow_all: Firewall = std::sync::Arc::new(|_: &PublicKey| true);
        let listening = responder.listen(&key, allow_all).await.unwrap();
        let address = listening.address.expect("swarm always reports an address");
        assert!(address.port.is_some());

        let secret = crate::SharedSecret::parse("correct horse battery staple").unwrap();
        let topic = crate::KeyDerivation::new(secret).discovery_ids(1_700_000_000_000)[0];
        responder.announce(&topic, &key).await.unwrap();

        let records = initiator.lookup(&topic).await.unwrap();
        assert!(records.iter().any(|r| r.public_key == key.public()));

        responder.shutdown().await.unwrap();
    }
}

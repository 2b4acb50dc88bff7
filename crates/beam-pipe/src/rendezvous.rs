//! Rendezvous controller.
//!
//! A single task that exclusively owns the discovery substrate. It turns the
//! derived topics and identities into authenticated transports and hands
//! them to the tunnel as events.
//!
//! ```text
//! Idle -> Listening  (responder) -> Authenticating -> Established
//!      -> LookingUp  (initiator) -> Authenticating -> Established
//!                                        any step  -> Failed
//! ```
use std::sync::Arc;
use std::time::Duration;

use beam_transport::{Firewall, Keypair, PublicKey};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Clock;
use crate::derive::{accepts, KeyDerivation, Role, Topic};
use crate::substrate::{CandidateTransport, Discovery, PeerRecord, RemoteAddress};
use crate::BeamError;

/// Progress of a rendezvous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Idle,
    Listening,
    LookingUp,
    Authenticating,
    Established,
    Failed,
}

/// Events the controller reports to the tunnel.
pub(crate) enum RendezvousEvent {
    /// Our externally observed address (host may be unknown).
    RemoteAddress(RemoteAddress),
    /// An authenticated transport.
    Candidate(CandidateTransport),
    /// Rendezvous failed; no further candidates will arrive.
    Failed(BeamError),
}

pub(crate) enum RendezvousCommand {
    /// Release the substrate and stop the task.
    Shutdown {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Handle to a running controller task.
pub(crate) struct RendezvousHandle {
    cmd_tx: mpsc::Sender<RendezvousCommand>,
    state: watch::Receiver<RendezvousState>,
}

impl RendezvousHandle {
    /// Tear the controller down, waiting for the substrate to shut down.
    pub(crate) async fn shutdown(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RendezvousCommand::Shutdown { reply: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    pub(crate) fn state(&self) -> RendezvousState {
        *self.state.borrow()
    }
}

/// One rendezvous attempt for one pipe.
pub(crate) struct Rendezvous {
    discovery: Arc<dyn Discovery>,
    derivation: KeyDerivation,
    role: Role,
    clock: Arc<dyn Clock>,
    /// Captured once; both topics derive from it for the whole attempt.
    reference_ms: u64,
    rekey_interval: Duration,
}

impl Rendezvous {
    pub(crate) fn new(
        discovery: Arc<dyn Discovery>,
        derivation: KeyDerivation,
        role: Role,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reference_ms = clock.now_ms();
        Self {
            discovery,
            derivation,
            role,
            clock,
            reference_ms,
            rekey_interval: Duration::from_secs(1),
        }
    }

    /// How often a waiting responder re-derives its identity.
    pub(crate) fn rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval = interval;
        self
    }

    /// Spawn the controller task.
    pub(crate) fn spawn(self) -> (RendezvousHandle, mpsc::Receiver<RendezvousEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(RendezvousState::Idle);

        tokio::spawn(self.run(cmd_rx, event_tx, state_tx));

        (RendezvousHandle { cmd_tx, state }, event_rx)
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<RendezvousCommand>,
        events: mpsc::Sender<RendezvousEvent>,
        state: watch::Sender<RendezvousState>,
    ) {
        let topics = self.derivation.discovery_ids(self.reference_ms);
        tracing::debug!(role = %self.role, topic = %topics[0], "rendezvous starting");

        let establish = self.establish(&topics, &events, &state);
        tokio::pin!(establish);
        let mut settled = false;

        loop {
            tokio::select! {
                result = &mut establish, if !settled => {
                    settled = true;
                    if let Err(e) = result {
                        tracing::debug!(role = %self.role, "rendezvous failed: {e}");
                        state.send_replace(RendezvousState::Failed);
                        let _ = events.send(RendezvousEvent::Failed(e)).await;
                    }
                }
                cmd = cmd_rx.recv() => {
                    let result = self.discovery.shutdown().await;
                    if let Err(e) = &result {
                        tracing::warn!("discovery shutdown failed: {e}");
                    }
                    if let Some(RendezvousCommand::Shutdown { reply }) = cmd {
                        let _ = reply.send(result);
                    }
                    tracing::debug!(role = %self.role, "rendezvous closed");
                    return;
                }
            }
        }
    }

    async fn establish(
        &self,
        topics: &[Topic; 2],
        events: &mpsc::Sender<RendezvousEvent>,
        state: &watch::Sender<RendezvousState>,
    ) -> Result<(), BeamError> {
        match self.role {
            Role::Responder => self.respond(topics, events, state).await,
            Role::Initiator => self.initiate(topics, events, state).await,
        }
    }

    // ── Responder ─────────────────────────────────────────────────────

    async fn respond(
        &self,
        topics: &[Topic; 2],
        events: &mpsc::Sender<RendezvousEvent>,
        state: &watch::Sender<RendezvousState>,
    ) -> Result<(), BeamError> {
        let mut identity = self.own_identity();

        state.send_replace(RendezvousState::Listening);
        let mut listening = self
            .discovery
            .listen(&identity, self.firewall())
            .await
            .map_err(BeamError::Rendezvous)?;

        let address = match listening.address {
            Some(address) => address,
            None => self.discovery.address().await.unwrap_or_default(),
        };
        let _ = events.send(RendezvousEvent::RemoteAddress(address)).await;

        for topic in topics {
            self.discovery
                .announce(topic, &identity)
                .await
                .map_err(BeamError::Rendezvous)?;
        }
        tracing::info!(identity = %identity.public(), "listening for initiator");
        state.send_replace(RendezvousState::Authenticating);

        let mut rekey = tokio::time::interval(self.rekey_interval);
        rekey.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut announced = true;

        loop {
            tokio::select! {
                candidate = listening.incoming.recv() => {
                    let Some(candidate) = candidate else { break };
                    tracing::debug!(remote = %candidate.remote, "initiator authenticated");
                    if announced {
                        announced = false;
                        self.unannounce(topics, &identity).await;
                        state.send_replace(RendezvousState::Established);
                    }
                    if events.send(RendezvousEvent::Candidate(candidate)).await.is_err() {
                        break;
                    }
                }
                _ = rekey.tick(), if announced => {
                    identity = self.rotate(identity).await?;
                }
            }
        }
        Ok(())
    }

    /// Move the listener and announcements to the current identity once the
    /// authentication window has rolled over.
    async fn rotate(&self, identity: Keypair) -> Result<Keypair, BeamError> {
        let current = self.own_identity();
        if current.public() == identity.public() {
            return Ok(identity);
        }
        self.discovery
            .rekey(&identity, &current)
            .await
            .map_err(BeamError::Rendezvous)?;
        tracing::debug!(identity = %current.public(), "responder identity rotated");
        Ok(current)
    }

    /// Admits an initiator only if its key is in the candidate set for the
    /// current time. Recomputed on every check.
    fn firewall(&self) -> Firewall {
        let derivation = self.derivation.clone();
        let clock = self.clock.clone();
        let expected = self.role.peer();
        Arc::new(move |remote: &PublicKey| {
            let candidates = derivation.auth_identities(expected, clock.now_ms());
            accepts(&candidates, remote)
        })
    }

    async fn unannounce(&self, topics: &[Topic; 2], identity: &Keypair) {
        for topic in topics {
            if let Err(e) = self.discovery.unannounce(topic, identity).await {
                tracing::warn!(%topic, "unannounce failed: {e}");
            }
        }
    }

    // ── Initiator ─────────────────────────────────────────────────────

    async fn initiate(
        &self,
        topics: &[Topic; 2],
        events: &mpsc::Sender<RendezvousEvent>,
        state: &watch::Sender<RendezvousState>,
    ) -> Result<(), BeamError> {
        state.send_replace(RendezvousState::LookingUp);
        let address = self.discovery.address().await.unwrap_or_default();
        let _ = events.send(RendezvousEvent::RemoteAddress(address)).await;

        let expected = self
            .derivation
            .auth_identities(self.role.peer(), self.clock.now_ms());

        let mut matches: Vec<PeerRecord> = Vec::new();
        for topic in topics {
            let peers = self
                .discovery
                .lookup(topic)
                .await
                .map_err(BeamError::Rendezvous)?;
            tracing::debug!(%topic, peers = peers.len(), "lookup finished");
            matches.extend(peers.into_iter().filter(|p| accepts(&expected, &p.public_key)));
        }

        let Some(peer) = matches.into_iter().next() else {
            return Err(BeamError::PeerNotFound);
        };

        state.send_replace(RendezvousState::Authenticating);
        let identity = self.own_identity();
        let transport = self
            .discovery
            .connect(&peer.public_key, &identity, &peer.hints)
            .await
            .map_err(BeamError::Rendezvous)?;

        tracing::info!(remote = %peer.public_key, "connected to responder");
        state.send_replace(RendezvousState::Established);
        let _ = events.send(RendezvousEvent::Candidate(transport)).await;
        Ok(())
    }

    /// The middle candidate keypair: the identity we present right now.
    fn own_identity(&self) -> Keypair {
        let [_, current, _] = self.derivation.auth_keys(self.role, self.clock.now_ms());
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManualClock;
    use crate::memory::MemoryNetwork;
    use crate::secret::SharedSecret;

    const NOW: u64 = 1_700_000_000_000;

    fn derivation(phrase: &str) -> KeyDerivation {
        KeyDerivation::new(SharedSecret::parse(phrase).unwrap())
    }

    fn controller(
        network: &MemoryNetwork,
        phrase: &str,
        role: Role,
        clock: &ManualClock,
    ) -> Rendezvous {
        Rendezvous::new(
            Arc::new(network.node()),
            derivation(phrase),
            role,
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_responder_announces_both_topics() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::new(NOW);
        let phrase = "correct horse battery staple";

        let (handle, mut events) = controller(&network, phrase, Role::Responder, &clock).spawn();
        assert!(matches!(
            events.recv().await,
            Some(RendezvousEvent::RemoteAddress(_))
        ));

        // Wait for the announcements to land.
        let topics = derivation(phrase).discovery_ids(NOW);
        while network.announced(&topics[1]).is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(network.announced(&topics[0]).len(), 1);
        assert_eq!(handle.state(), RendezvousState::Authenticating);

        handle.shutdown().await.unwrap();
        assert!(network.announced(&topics[0]).is_empty());
        assert_eq!(network.listeners(), 0);
    }

    #[tokio::test]
    async fn test_initiator_without_responder_fails() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::new(NOW);

        let (handle, mut events) =
            controller(&network, "correct horse battery staple", Role::Initiator, &clock).spawn();
        assert!(matches!(
            events.recv().await,
            Some(RendezvousEvent::RemoteAddress(_))
        ));
        assert!(matches!(
            events.recv().await,
            Some(RendezvousEvent::Failed(BeamError::PeerNotFound))
        ));
        assert_eq!(handle.state(), RendezvousState::Failed);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_substrate_is_rendezvous_error() {
        let network = MemoryNetwork::new();
        network.set_unreachable(true);
        let clock = ManualClock::new(NOW);

        let (handle, mut events) =
            controller(&network, "correct horse battery staple", Role::Responder, &clock).spawn();
        match events.recv().await {
            Some(RendezvousEvent::Failed(BeamError::Rendezvous(_))) => {}
            _ => panic!("expected a rendezvous failure"),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pair_meets_and_stops_announcing() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::new(NOW);
        let phrase = "correct horse battery staple";

        let (responder, mut responder_events) =
            controller(&network, phrase, Role::Responder, &clock).spawn();
        assert!(matches!(
            responder_events.recv().await,
            Some(RendezvousEvent::RemoteAddress(_))
        ));
        let topics = derivation(phrase).discovery_ids(NOW);
        while network.announced(&topics[1]).is_empty() {
            tokio::task::yield_now().await;
        }

        let (initiator, mut initiator_events) =
            controller(&network, phrase, Role::Initiator, &clock).spawn();
        initiator_events.recv().await; // address
        let outbound = match initiator_events.recv().await {
            Some(RendezvousEvent::Candidate(t)) => t,
            _ => panic!("initiator should connect"),
        };
        let inbound = match responder_events.recv().await {
            Some(RendezvousEvent::Candidate(t)) => t,
            _ => panic!("responder should accept"),
        };

        let d = derivation(phrase);
        assert_eq!(outbound.remote, d.auth_identities(Role::Responder, NOW)[1]);
        assert_eq!(inbound.remote, d.auth_identities(Role::Initiator, NOW)[1]);

        while !network.announced(&topics[0]).is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(initiator.state(), RendezvousState::Established);

        responder.shutdown().await.unwrap();
        initiator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_responder_rotates_identity() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::new(NOW);
        let phrase = "correct horse battery staple";

        let (handle, mut events) = controller(&network, phrase, Role::Responder, &clock)
            .rekey_interval(Duration::from_millis(5))
            .spawn();
        events.recv().await; // address

        let d = derivation(phrase);
        let topics = d.discovery_ids(NOW);
        while network.announced(&topics[0]).is_empty() {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_secs(5 * 60));
        let rotated = d.auth_identities(Role::Responder, clock.now_ms())[1];
        tokio::time::timeout(Duration::from_secs(5), async {
            while network.announced(&topics[0]) != vec![rotated] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("identity never rotated");
        assert_eq!(network.announced(&topics[1]), vec![rotated]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_firewall_follows_clock() {
        let network = MemoryNetwork::new();
        let clock = ManualClock::new(NOW);
        let rendezvous = controller(&network, "correct horse battery staple", Role::Responder, &clock);
        let firewall = rendezvous.firewall();

        let initiator_now = rendezvous.derivation.auth_identities(Role::Initiator, NOW)[1];
        assert!(firewall(&initiator_now));

        // Three windows later the old identity is stale.
        clock.advance(Duration::from_secs(3 * 120));
        assert!(!firewall(&initiator_now));
    }
}

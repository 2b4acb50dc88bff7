use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handshake;
use crate::stream::SecureStream;
use crate::{Firewall, Keypair, PublicKey, TransportConfig, TransportError};

/// The static keypair a listener presents, replaceable while it runs.
///
/// Handshakes already in progress keep the keypair they started with.
#[derive(Clone)]
pub struct ListenerIdentity(Arc<RwLock<Keypair>>);

impl ListenerIdentity {
    fn new(keypair: Keypair) -> Self {
        Self(Arc::new(RwLock::new(keypair)))
    }

    /// Present `keypair` to every connection accepted from now on.
    pub fn set(&self, keypair: Keypair) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = keypair;
    }

    /// The key currently presented.
    pub fn public(&self) -> PublicKey {
        self.current().public()
    }

    fn current(&self) -> Keypair {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for ListenerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ListenerIdentity").field(&self.public()).finish()
    }
}

/// Accepts inbound connections, authenticates them and queues the survivors.
///
/// Every inbound handshake runs in its own task, so a slow or hostile peer
/// cannot stall the accept loop. Dropping the listener stops accepting.
pub struct Listener {
    local_addr: SocketAddr,
    identity: ListenerIdentity,
    incoming: mpsc::Receiver<SecureStream>,
    accept_task: JoinHandle<()>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Bind to `addr` and start accepting peers that pass `firewall`.
    pub async fn bind(
        addr: SocketAddr,
        keypair: Keypair,
        firewall: Firewall,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        let (tx, incoming) = mpsc::channel(config.accept_backlog);

        tracing::info!(%local_addr, identity = %keypair.public(), "listening");

        let identity = ListenerIdentity::new(keypair);
        let accept_task = tokio::spawn(accept_loop(listener, identity.clone(), firewall, config, tx));

        Ok(Self {
            local_addr,
            identity,
            incoming,
            accept_task,
        })
    }

    /// The bound local address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for rotating the presented keypair.
    pub fn identity(&self) -> ListenerIdentity {
        self.identity.clone()
    }

    /// Wait for the next authenticated stream. `None` once the listener is closed.
    pub async fn accept(&mut self) -> Option<SecureStream> {
        self.incoming.recv().await
    }

    /// Stop accepting new connections. Streams already handed out are unaffected.
    pub fn close(&mut self) {
        self.accept_task.abort();
        self.incoming.close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    identity: ListenerIdentity,
    firewall: Firewall,
    config: TransportConfig,
    tx: mpsc::Sender<SecureStream>,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        let keypair = identity.current();
        let firewall = firewall.clone();
        let config = config.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let attempt = authenticate(tcp, &keypair, &firewall, &config);
            match tokio::time::timeout(config.handshake_timeout, attempt).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(%peer, remote = %stream.remote(), "inbound stream authenticated");
                    let _ = tx.send(stream).await;
                }
                Ok(Err(e)) => tracing::debug!(%peer, "inbound handshake failed: {e}"),
                Err(_) => tracing::debug!(%peer, "inbound handshake timed out"),
            }
        });
    }
}

async fn authenticate(
    mut tcp: TcpStream,
    keypair: &Keypair,
    firewall: &Firewall,
    config: &TransportConfig,
) -> Result<SecureStream, TransportError> {
    tcp.set_nodelay(true)?;
    let (keys, remote) = handshake::respond(&mut tcp, keypair, firewall).await?;
    SecureStream::confirm(tcp, keys, remote, false, config).await
}

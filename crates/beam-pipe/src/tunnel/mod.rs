//! Duplex tunnel: one byte stream over whichever transports rendezvous produces.
//!
//! The tunnel state is owned by one task. [`Beam`] and its split halves talk
//! to it over a command channel; every operation resolves through a oneshot,
//! and a destroyed tunnel resolves whatever is still pending with
//! [`BeamError::Destroyed`].
mod link;
mod r#loop;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::BeamConfig;
use crate::derive::{KeyDerivation, Role};
use crate::secret::SharedSecret;
use crate::substrate::{Discovery, RemoteAddress};
use crate::BeamError;

// ── Events & state ──────────────────────────────────────────────────

/// Observable pipe events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    /// Our external address as seen by the substrate.
    RemoteAddress(RemoteAddress),
    /// A canonical outgoing transport is pinned.
    Connected,
    /// The remote side finished writing. Emitted once.
    End,
    /// A fatal error. Always followed by `Close`.
    Error { description: String },
    /// The pipe is torn down. Emitted once.
    Close,
}

/// Lifecycle of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Idle,
    Opening,
    Connected,
    HalfClosing,
    Closed,
    Destroyed,
}

impl PipeState {
    /// `Closed` and `Destroyed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipeState::Closed | PipeState::Destroyed)
    }
}

// ── Commands (handle → tunnel) ──────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, BeamError>>;

pub(crate) enum TunnelCommand {
    Open { reply: Reply<()> },
    Read { reply: Reply<Option<Bytes>> },
    Write { data: Bytes, reply: Reply<()> },
    Finish { reply: Reply<()> },
    Destroy { reply: oneshot::Sender<()> },
}

// ── BeamHandle ──────────────────────────────────────────────────────

/// Cloneable control handle: events, state and teardown.
#[derive(Clone)]
pub struct BeamHandle {
    cmd_tx: mpsc::Sender<TunnelCommand>,
    events: broadcast::Sender<PipeEvent>,
    state: watch::Receiver<PipeState>,
    secret: SharedSecret,
    role: Role,
}

impl BeamHandle {
    /// The passphrase this pipe derives from.
    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Subscribe to events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<PipeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PipeState {
        *self.state.borrow()
    }

    /// Whether a canonical outgoing transport is pinned and not yet closed.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), PipeState::Connected | PipeState::HalfClosing)
    }

    /// Tear the pipe down. Returns once `Close` has been emitted.
    ///
    /// Safe from any state and idempotent.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TunnelCommand::Destroy { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.closed().await;
    }

    /// Wait until the pipe reaches a terminal state.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> TunnelCommand,
    ) -> Result<T, BeamError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| BeamError::Destroyed)?;
        rx.await.unwrap_or(Err(BeamError::Destroyed))
    }
}

impl std::fmt::Debug for BeamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamHandle")
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ── Beam ────────────────────────────────────────────────────────────

/// A 1-to-1 encrypted pipe.
///
/// Reading, writing or finishing opens the pipe implicitly; call
/// [`open`](Beam::open) to wait for the connection explicitly. Dropping every
/// handle destroys the pipe.
#[derive(Debug)]
pub struct Beam {
    handle: BeamHandle,
    eof: bool,
}

impl Beam {
    /// Responder side. Generates a passphrase unless one is given (restart).
    pub fn responder(
        discovery: impl Discovery,
        secret: Option<&str>,
        config: BeamConfig,
    ) -> Result<Self, BeamError> {
        let secret = match secret {
            Some(phrase) => SharedSecret::parse(phrase)?,
            None => SharedSecret::generate(config.passphrase_words),
        };
        Self::new(discovery, secret, Role::Responder, config)
    }

    /// Initiator side. Fails with `InvalidSecret` before touching the network.
    pub fn initiator(
        discovery: impl Discovery,
        secret: &str,
        config: BeamConfig,
    ) -> Result<Self, BeamError> {
        let secret = SharedSecret::parse(secret)?;
        Self::new(discovery, secret, Role::Initiator, config)
    }

    /// Build a pipe and spawn its tunnel task. Must be called within a tokio runtime.
    pub fn new(
        discovery: impl Discovery,
        secret: SharedSecret,
        role: Role,
        config: BeamConfig,
    ) -> Result<Self, BeamError> {
        config.validate()?;

        let derivation =
            KeyDerivation::with_drift(secret.clone(), config.short_drift, config.long_drift);

        let (cmd_tx, cmd_rx) = mpsc::channel::<TunnelCommand>(16);
        let (link_tx, link_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (state_tx, state) = watch::channel(PipeState::Idle);

        let tunnel = r#loop::Tunnel::new(
            role,
            Arc::new(discovery),
            derivation,
            config,
            events.clone(),
            state_tx,
            link_tx,
        );
        tokio::spawn(r#loop::tunnel_loop(tunnel, cmd_rx, link_rx));

        Ok(Self {
            handle: BeamHandle {
                cmd_tx,
                events,
                state,
                secret,
                role,
            },
            eof: false,
        })
    }

    /// A cloneable control handle for this pipe.
    pub fn handle(&self) -> BeamHandle {
        self.handle.clone()
    }

    pub fn secret(&self) -> &SharedSecret {
        self.handle.secret()
    }

    pub fn events(&self) -> broadcast::Receiver<PipeEvent> {
        self.handle.events()
    }

    pub fn state(&self) -> PipeState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Run rendezvous and wait for a canonical outgoing transport.
    pub async fn open(&mut self) -> Result<(), BeamError> {
        self.handle
            .request(|reply| TunnelCommand::Open { reply })
            .await
    }

    /// Next chunk from the peer, or `None` at end-of-stream.
    pub async fn read(&mut self) -> Result<Option<Bytes>, BeamError> {
        read(&self.handle, &mut self.eof).await
    }

    /// Write bytes. Resolves once the transport has flushed them.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), BeamError> {
        write(&self.handle, data.into()).await
    }

    /// Half-close: no more output from this side.
    pub async fn finish(&mut self) -> Result<(), BeamError> {
        finish(&self.handle).await
    }

    pub async fn destroy(&self) {
        self.handle.destroy().await
    }

    /// Split into halves that can be driven from different tasks.
    pub fn into_split(self) -> (BeamReader, BeamWriter) {
        (
            BeamReader {
                handle: self.handle.clone(),
                eof: self.eof,
            },
            BeamWriter {
                handle: self.handle,
            },
        )
    }
}

/// Read half of a split [`Beam`].
#[derive(Debug)]
pub struct BeamReader {
    handle: BeamHandle,
    eof: bool,
}

impl BeamReader {
    pub async fn read(&mut self) -> Result<Option<Bytes>, BeamError> {
        read(&self.handle, &mut self.eof).await
    }

    pub fn handle(&self) -> BeamHandle {
        self.handle.clone()
    }
}

/// Write half of a split [`Beam`].
#[derive(Debug)]
pub struct BeamWriter {
    handle: BeamHandle,
}

impl BeamWriter {
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), BeamError> {
        write(&self.handle, data.into()).await
    }

    pub async fn finish(&mut self) -> Result<(), BeamError> {
        finish(&self.handle).await
    }

    pub fn handle(&self) -> BeamHandle {
        self.handle.clone()
    }
}

async fn read(handle: &BeamHandle, eof: &mut bool) -> Result<Option<Bytes>, BeamError> {
    if *eof {
        return Ok(None);
    }
    let chunk = handle
        .request(|reply| TunnelCommand::Read { reply })
        .await?;
    if chunk.is_none() {
        *eof = true;
    }
    Ok(chunk)
}

async fn write(handle: &BeamHandle, data: Bytes) -> Result<(), BeamError> {
    handle
        .request(|reply| TunnelCommand::Write { data, reply })
        .await
}

async fn finish(handle: &BeamHandle) -> Result<(), BeamError> {
    handle
        .request(|reply| TunnelCommand::Finish { reply })
        .await
}

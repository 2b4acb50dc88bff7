//! The tunnel event loop.
//!
//! A single task that owns all tunnel state and multiplexes over handle
//! commands, rendezvous events and link reports.
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use beam_transport::PublicKey;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::BeamConfig;
use crate::derive::{KeyDerivation, Role};
use crate::rendezvous::{Rendezvous, RendezvousEvent, RendezvousHandle};
use crate::substrate::{CandidateTransport, Discovery};
use crate::BeamError;

use super::link::{LinkEvent, LinkId, ReaderPump, WriteOp, Writer};
use super::{PipeEvent, PipeState, Reply, TunnelCommand};

/// A transport handed over by rendezvous.
struct Candidate {
    remote: PublicKey,
    /// `None` once the read side is closed.
    pump: Option<ReaderPump>,
    /// A read was granted and its chunk has not arrived yet.
    granted: bool,
    /// Held (unused) until the candidate is dropped; `None` for the outgoing one.
    _writer: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl Candidate {
    fn new(
        remote: PublicKey,
        pump: ReaderPump,
        writer: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    ) -> Self {
        Self {
            remote,
            pump: Some(pump),
            granted: false,
            _writer: writer,
        }
    }

    /// At most one grant is outstanding per pump.
    fn grant(&mut self) {
        if let Some(pump) = &self.pump {
            if !self.granted {
                pump.grant();
                self.granted = true;
            }
        }
    }
}

pub(super) struct Tunnel {
    role: Role,
    discovery: Arc<dyn Discovery>,
    derivation: KeyDerivation,
    config: BeamConfig,
    events: broadcast::Sender<PipeEvent>,
    state: watch::Sender<PipeState>,
    link_tx: mpsc::Sender<LinkEvent>,

    rendezvous: Option<RendezvousHandle>,
    candidates: HashMap<LinkId, Candidate>,
    next_id: LinkId,
    outgoing: Option<(LinkId, Writer)>,
    incoming: Option<LinkId>,

    // ── Pending completions (at most one each) ──
    pending_open: Option<Reply<()>>,
    pending_read: Option<Reply<Option<Bytes>>>,
    /// Write or finish issued before the outgoing transport existed.
    queued_output: Option<WriteOp>,

    /// A chunk that arrived after its reader went away.
    held: Option<Bytes>,
    /// `finish` was issued; later writes are refused.
    output_closed: bool,
    /// Remote end-of-stream delivered.
    ended: bool,
    /// Local finish acknowledged by the transport.
    finished: bool,
    failure: Option<BeamError>,
}

impl Tunnel {
    pub(super) fn new(
        role: Role,
        discovery: Arc<dyn Discovery>,
        derivation: KeyDerivation,
        config: BeamConfig,
        events: broadcast::Sender<PipeEvent>,
        state: watch::Sender<PipeState>,
        link_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            role,
            discovery,
            derivation,
            config,
            events,
            state,
            link_tx,
            rendezvous: None,
            candidates: HashMap::new(),
            next_id: 0,
            outgoing: None,
            incoming: None,
            pending_open: None,
            pending_read: None,
            queued_output: None,
            held: None,
            output_closed: false,
            ended: false,
            finished: false,
            failure: None,
        }
    }

    fn emit(&self, event: PipeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: PipeState) {
        self.state.send_replace(state);
    }

    /// Start rendezvous on first use. Returns its event stream when started.
    fn ensure_open(&mut self) -> Option<mpsc::Receiver<RendezvousEvent>> {
        if self.rendezvous.is_some() {
            return None;
        }
        tracing::debug!(role = %self.role, "opening pipe");
        self.set_state(PipeState::Opening);

        let (handle, events) = Rendezvous::new(
            self.discovery.clone(),
            self.derivation.clone(),
            self.role,
            self.config.clock.clone(),
        )
        .rekey_interval(self.config.rekey_interval)
        .spawn();
        self.rendezvous = Some(handle);
        Some(events)
    }

    // ── Commands ────────────────────────────────────────────────────

    fn on_open(&mut self, reply: Reply<()>) -> Option<mpsc::Receiver<RendezvousEvent>> {
        if self.outgoing.is_some() {
            let _ = reply.send(Ok(()));
            return None;
        }
        self.pending_open = Some(reply);
        self.ensure_open()
    }

    fn on_read(&mut self, reply: Reply<Option<Bytes>>) -> Option<mpsc::Receiver<RendezvousEvent>> {
        if let Some(chunk) = self.held.take() {
            let _ = reply.send(Ok(Some(chunk)));
            return None;
        }
        if self.ended {
            let _ = reply.send(Ok(None));
            return None;
        }
        // A read whose caller gave up is replaced; its grant carries over.
        self.pending_read = Some(reply);
        let started = self.ensure_open();
        self.grant_reads();
        started
    }

    fn on_output(&mut self, op: WriteOp) -> Option<mpsc::Receiver<RendezvousEvent>> {
        if self.output_closed {
            reject(op, BeamError::Finished);
            return None;
        }
        if matches!(op, WriteOp::Finish { .. }) {
            self.output_closed = true;
        }
        let started = self.ensure_open();
        self.submit_output(op);
        started
    }

    fn submit_output(&mut self, op: WriteOp) {
        let Some((_, writer)) = &self.outgoing else {
            self.queued_output = Some(op);
            return;
        };
        let finishing = matches!(op, WriteOp::Finish { .. });
        if let Err(op) = writer.submit(op) {
            reject(op, BeamError::Destroyed);
            return;
        }
        if finishing {
            self.set_state(PipeState::HalfClosing);
        }
    }

    /// Ask for one chunk: from the canonical incoming transport once pinned,
    /// otherwise from every candidate still racing for it.
    fn grant_reads(&mut self) {
        let incoming = self.incoming;
        for (id, candidate) in self.candidates.iter_mut() {
            if incoming.map_or(true, |pinned| pinned == *id) {
                candidate.grant();
            }
        }
    }

    /// Park a chunk nobody is waiting for, after any chunk already parked.
    fn hold(&mut self, chunk: Bytes) {
        self.held = Some(match self.held.take() {
            None => chunk,
            Some(parked) => {
                let mut joined = BytesMut::with_capacity(parked.len() + chunk.len());
                joined.extend_from_slice(&parked);
                joined.extend_from_slice(&chunk);
                joined.freeze()
            }
        });
    }

    // ── Rendezvous events ───────────────────────────────────────────

    fn on_rendezvous(&mut self, event: RendezvousEvent) {
        match event {
            RendezvousEvent::RemoteAddress(address) => {
                tracing::debug!(%address, "remote address");
                self.emit(PipeEvent::RemoteAddress(address));
            }
            RendezvousEvent::Candidate(transport) => self.add_candidate(transport),
            RendezvousEvent::Failed(error) => self.failure = Some(error),
        }
    }

    fn add_candidate(&mut self, transport: CandidateTransport) {
        let CandidateTransport {
            remote,
            reader,
            writer,
        } = transport;

        if self.incoming.is_some() {
            // Both directions pinned: nothing left to race for.
            tracing::debug!(%remote, "dropping late transport");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        let pump = ReaderPump::spawn(id, reader, self.config.read_chunk_size, self.link_tx.clone());

        if self.outgoing.is_none() {
            let writer = Writer::spawn(id, writer, self.link_tx.clone());
            self.outgoing = Some((id, writer));
            self.candidates.insert(id, Candidate::new(remote, pump, None));

            tracing::info!(%remote, role = %self.role, "pipe connected");
            self.set_state(PipeState::Connected);
            self.emit(PipeEvent::Connected);
            if let Some(reply) = self.pending_open.take() {
                let _ = reply.send(Ok(()));
            }
            if let Some(op) = self.queued_output.take() {
                self.submit_output(op);
            }
        } else {
            tracing::debug!(%remote, id, "additional transport racing for incoming");
            self.candidates.insert(id, Candidate::new(remote, pump, Some(writer)));
        }

        if self.pending_read.is_some() {
            if let Some(candidate) = self.candidates.get_mut(&id) {
                candidate.grant();
            }
        }
    }

    // ── Link events ─────────────────────────────────────────────────

    fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Data(id, chunk) => {
                if let Some(candidate) = self.candidates.get_mut(&id) {
                    candidate.granted = false;
                }
                if !self.claim_incoming(id) {
                    tracing::trace!(id, bytes = chunk.len(), "discarding data from non-canonical transport");
                    return;
                }
                match self.pending_read.take() {
                    Some(reply) => {
                        if let Err(Ok(Some(chunk))) = reply.send(Ok(Some(chunk))) {
                            self.hold(chunk);
                        }
                    }
                    None => self.hold(chunk),
                }
            }
            LinkEvent::End(id) => {
                if !self.claim_incoming(id) || self.ended {
                    return;
                }
                tracing::debug!(id, "remote end of stream");
                self.ended = true;
                if let Some(candidate) = self.candidates.get_mut(&id) {
                    candidate.pump = None;
                }
                self.emit(PipeEvent::End);
                if let Some(reply) = self.pending_read.take() {
                    let _ = reply.send(Ok(None));
                }
            }
            LinkEvent::ReadFailed(id, error) => {
                if self.is_canonical(id) {
                    self.failure = Some(BeamError::Transport(error));
                } else {
                    tracing::debug!(id, "non-canonical transport failed: {error}");
                    self.candidates.remove(&id);
                }
            }
            LinkEvent::WriteFailed(id, error) => {
                if self.is_canonical(id) {
                    self.failure = Some(BeamError::Transport(error));
                }
            }
            LinkEvent::Finished(id) => {
                tracing::debug!(id, "local end of stream acknowledged");
                self.finished = true;
            }
        }
    }

    fn is_canonical(&self, id: LinkId) -> bool {
        self.incoming == Some(id) || self.outgoing.as_ref().map(|(out, _)| *out) == Some(id)
    }

    /// Whether `id` is (or just became) the canonical incoming transport.
    ///
    /// The first candidate to produce data or end-of-data wins; every other
    /// candidate except the outgoing one is dropped, and the outgoing one
    /// keeps only its write side.
    fn claim_incoming(&mut self, id: LinkId) -> bool {
        if let Some(incoming) = self.incoming {
            return incoming == id;
        }
        if !self.candidates.contains_key(&id) {
            return false;
        }

        self.incoming = Some(id);
        let outgoing = self.outgoing.as_ref().map(|(out, _)| *out);
        self.candidates
            .retain(|candidate, _| *candidate == id || Some(*candidate) == outgoing);
        if let Some(out) = outgoing.filter(|out| *out != id) {
            if let Some(candidate) = self.candidates.get_mut(&out) {
                candidate.pump = None;
            }
        }

        if let Some(candidate) = self.candidates.get(&id) {
            tracing::debug!(id, remote = %candidate.remote, "incoming transport pinned");
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.ended && self.finished
    }

    // ── Teardown ────────────────────────────────────────────────────

    async fn fail(&mut self, error: BeamError) {
        tracing::warn!(role = %self.role, "pipe failed: {error}");
        let description = error.to_string();
        // The first waiting operation gets the cause; teardown resolves the rest.
        if let Some(reply) = self.pending_open.take() {
            let _ = reply.send(Err(error));
        } else if let Some(reply) = self.pending_read.take() {
            let _ = reply.send(Err(error));
        } else if let Some(op) = self.queued_output.take() {
            reject(op, error);
        }
        self.emit(PipeEvent::Error { description });
        self.teardown(PipeState::Destroyed).await;
    }

    /// Drop every transport, resolve what is pending, release the
    /// substrate, then emit `Close`.
    async fn teardown(&mut self, final_state: PipeState) {
        self.outgoing = None;
        self.candidates.clear();
        self.held = None;

        if let Some(reply) = self.pending_open.take() {
            let _ = reply.send(Err(BeamError::Destroyed));
        }
        if let Some(reply) = self.pending_read.take() {
            let _ = reply.send(Err(BeamError::Destroyed));
        }
        if let Some(op) = self.queued_output.take() {
            reject(op, BeamError::Destroyed);
        }

        if let Some(rendezvous) = self.rendezvous.take() {
            tracing::debug!(state = ?rendezvous.state(), "shutting down rendezvous");
            if let Err(e) = rendezvous.shutdown().await {
                tracing::warn!("rendezvous teardown failed: {e}");
            }
        }

        self.set_state(final_state);
        self.emit(PipeEvent::Close);
        tracing::debug!(role = %self.role, state = ?final_state, "pipe closed");
    }
}

fn reject(op: WriteOp, error: BeamError) {
    let reply = match op {
        WriteOp::Data { reply, .. } => reply,
        WriteOp::Finish { reply } => reply,
    };
    let _ = reply.send(Err(error));
}

async fn next_rendezvous(
    events: &mut Option<mpsc::Receiver<RendezvousEvent>>,
) -> Option<RendezvousEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Main event loop. Owns the tunnel until it is closed or destroyed.
pub(super) async fn tunnel_loop(
    mut tunnel: Tunnel,
    mut cmd_rx: mpsc::Receiver<TunnelCommand>,
    mut link_rx: mpsc::Receiver<LinkEvent>,
) {
    let mut rendezvous_events: Option<mpsc::Receiver<RendezvousEvent>> = None;

    loop {
        tokio::select! {
            // ── 1. Commands from the handles ────────────────
            cmd = cmd_rx.recv() => {
                let started = match cmd {
                    Some(TunnelCommand::Open { reply }) => tunnel.on_open(reply),
                    Some(TunnelCommand::Read { reply }) => tunnel.on_read(reply),
                    Some(TunnelCommand::Write { data, reply }) => {
                        tunnel.on_output(WriteOp::Data { data, reply })
                    }
                    Some(TunnelCommand::Finish { reply }) => tunnel.on_output(WriteOp::Finish { reply }),
                    Some(TunnelCommand::Destroy { reply }) => {
                        tunnel.teardown(PipeState::Destroyed).await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        // Every handle dropped.
                        tunnel.teardown(PipeState::Destroyed).await;
                        return;
                    }
                };
                if started.is_some() {
                    rendezvous_events = started;
                }
            }

            // ── 2. Rendezvous progress ──────────────────────
            event = next_rendezvous(&mut rendezvous_events) => match event {
                Some(event) => tunnel.on_rendezvous(event),
                None => rendezvous_events = None,
            },

            // ── 3. Transport reports ────────────────────────
            Some(event) = link_rx.recv() => tunnel.on_link(event),
        }

        if let Some(error) = tunnel.failure.take() {
            tunnel.fail(error).await;
            return;
        }
        if tunnel.is_closed() {
            tunnel.teardown(PipeState::Closed).await;
            return;
        }
    }
}

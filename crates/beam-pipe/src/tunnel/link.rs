//! Per-transport tasks.
//!
//! Each candidate's read half is driven by a credit pump that reads one
//! chunk per grant, so unread data stays parked in the transport. The
//! canonical outgoing write half is owned by a writer task.
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::BeamError;

/// Identifier of a candidate within one tunnel.
pub(super) type LinkId = u64;

/// Reports from link tasks to the tunnel loop.
#[derive(Debug)]
pub(super) enum LinkEvent {
    Data(LinkId, Bytes),
    End(LinkId),
    ReadFailed(LinkId, io::Error),
    WriteFailed(LinkId, io::Error),
    Finished(LinkId),
}

// ── Reader pump ─────────────────────────────────────────────────────

pub(super) struct ReaderPump {
    credit: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaderPump {
    pub(super) fn spawn(
        id: LinkId,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
        chunk_size: usize,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (credit, mut credits) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            while credits.recv().await.is_some() {
                let mut buf = BytesMut::zeroed(chunk_size);
                let event = match reader.read(&mut buf).await {
                    Ok(0) => LinkEvent::End(id),
                    Ok(n) => {
                        buf.truncate(n);
                        LinkEvent::Data(id, buf.freeze())
                    }
                    Err(e) => LinkEvent::ReadFailed(id, e),
                };
                let last = !matches!(event, LinkEvent::Data(..));
                if events.send(event).await.is_err() || last {
                    return;
                }
            }
        });
        Self { credit, task }
    }

    /// Allow one more chunk to be read. A grant already outstanding is kept.
    pub(super) fn grant(&self) {
        let _ = self.credit.try_send(());
    }
}

impl Drop for ReaderPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Writer ──────────────────────────────────────────────────────────

pub(super) enum WriteOp {
    Data {
        data: Bytes,
        reply: oneshot::Sender<Result<(), BeamError>>,
    },
    Finish {
        reply: oneshot::Sender<Result<(), BeamError>>,
    },
}

pub(super) struct Writer {
    ops: mpsc::Sender<WriteOp>,
    task: JoinHandle<()>,
}

impl Writer {
    pub(super) fn spawn(
        id: LinkId,
        mut writer: Pin<Box<dyn AsyncWrite + Send>>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (ops, mut rx) = mpsc::channel::<WriteOp>(1);
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Data { data, reply } => {
                        // Completion waits until the transport accepted and flushed the bytes.
                        let result = async {
                            writer.write_all(&data).await?;
                            writer.flush().await
                        }
                        .await;
                        if !report(id, result, reply, &events, false).await {
                            return;
                        }
                    }
                    WriteOp::Finish { reply } => {
                        let result = writer.shutdown().await;
                        if !report(id, result, reply, &events, true).await {
                            return;
                        }
                    }
                }
            }
        });
        Self { ops, task }
    }

    /// Queue an operation. Returns it back if the writer is gone.
    pub(super) fn submit(&self, op: WriteOp) -> Result<(), WriteOp> {
        self.ops.try_send(op).map_err(|e| e.into_inner())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolve the caller and tell the loop. Returns false once the link is dead.
async fn report(
    id: LinkId,
    result: io::Result<()>,
    reply: oneshot::Sender<Result<(), BeamError>>,
    events: &mpsc::Sender<LinkEvent>,
    finishing: bool,
) -> bool {
    match result {
        Ok(()) => {
            let _ = reply.send(Ok(()));
            if finishing {
                let _ = events.send(LinkEvent::Finished(id)).await;
            }
            true
        }
        Err(e) => {
            let kind = e.kind();
            let message = e.to_string();
            let _ = reply.send(Err(BeamError::Transport(e)));
            let _ = events
                .send(LinkEvent::WriteFailed(id, io::Error::new(kind, message)))
                .await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pump_reads_only_when_granted() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (reader, _writer) = tokio::io::split(near);
        let (tx, mut rx) = mpsc::channel(8);
        let pump = ReaderPump::spawn(1, Box::pin(reader), 16, tx);

        far.write_all(b"0123456789abcdefXYZ").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "no grant, no read"
        );

        pump.grant();
        match rx.recv().await {
            Some(LinkEvent::Data(1, chunk)) => assert!(!chunk.is_empty() && chunk.len() <= 16),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_pump_reports_end() {
        let (near, far) = tokio::io::duplex(64);
        let (reader, _writer) = tokio::io::split(near);
        drop(far);
        let (tx, mut rx) = mpsc::channel(8);
        let pump = ReaderPump::spawn(7, Box::pin(reader), 16, tx);

        pump.grant();
        assert!(matches!(rx.recv().await, Some(LinkEvent::End(7))));
    }

    #[tokio::test]
    async fn test_writer_flushes_then_finishes() {
        let (near, far) = tokio::io::duplex(64);
        let (_reader, writer) = tokio::io::split(near);
        let (mut far_reader, _far_writer) = tokio::io::split(far);
        let (tx, mut rx) = mpsc::channel(8);
        let link = Writer::spawn(3, Box::pin(writer), tx);

        let (reply, done) = oneshot::channel();
        assert!(link
            .submit(WriteOp::Data {
                data: Bytes::from_static(b"ping"),
                reply,
            })
            .is_ok());
        done.await.unwrap().unwrap();

        let (reply, done) = oneshot::channel();
        assert!(link.submit(WriteOp::Finish { reply }).is_ok());
        done.await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Finished(3))));

        let mut received = Vec::new();
        far_reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
    }

    #[tokio::test]
    async fn test_dropped_writer_resolves_pending_reply() {
        let (near, _far) = tokio::io::duplex(4);
        let (_reader, writer) = tokio::io::split(near);
        let (tx, _rx) = mpsc::channel(8);
        let link = Writer::spawn(1, Box::pin(writer), tx);

        // Larger than the duplex buffer: stays pending until the task dies.
        let (reply, done) = oneshot::channel();
        assert!(link
            .submit(WriteOp::Data {
                data: Bytes::from(vec![0u8; 64]),
                reply,
            })
            .is_ok());
        drop(link);
        assert!(done.await.is_err());
    }
}

//! Wire a pipe to stdin/stdout and drive it until it closes.
use std::sync::Arc;
use std::time::Duration;

use beam_pipe::{Beam, BeamHandle, BeamReader, BeamWriter, PipeEvent, PipeState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

/// How long a forced shutdown may take before we give up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const STDIN_CHUNK: usize = 64 * 1024;

/// Run the pipe to completion. Returns the process exit code.
pub async fn run(beam: Beam) -> anyhow::Result<i32> {
    let handle = beam.handle();
    let printer = spawn_event_printer(beam.events());

    let stop_input = Arc::new(Notify::new());
    let (reader, writer) = beam.into_split();
    let download = tokio::spawn(download(reader, stop_input.clone()));
    let upload = tokio::spawn(upload(writer, stop_input.clone()));

    let mut finishing = false;
    loop {
        tokio::select! {
            _ = handle.closed() => break,
            _ = tokio::signal::ctrl_c() => {
                if handle.is_connected() && !finishing {
                    eprintln!("\n[beam] Ctrl+C received, ending our side of the pipe...");
                    finishing = true;
                    stop_input.notify_one();
                } else {
                    upload.abort();
                    return Ok(shutdown(&handle).await);
                }
            }
        }
    }

    upload.abort();
    match download.await {
        Ok(Err(e)) => tracing::debug!("output stopped: {e}"),
        Err(e) => tracing::debug!("output task failed: {e}"),
        Ok(Ok(())) => {}
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    Ok(match handle.state() {
        PipeState::Closed => 0,
        _ => 1,
    })
}

/// Destroy the pipe, but never wait longer than the grace period.
async fn shutdown(handle: &BeamHandle) -> i32 {
    eprintln!("[beam] Shutting down beam...");
    if tokio::time::timeout(SHUTDOWN_GRACE, handle.destroy()).await.is_err() {
        eprintln!("[beam] Shutdown timed out");
    }
    1
}

/// Pipe output goes to stdout. Remote end-of-stream ends our input as well.
async fn download(mut reader: BeamReader, stop_input: Arc<Notify>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = reader.read().await? {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    stop_input.notify_one();
    Ok(())
}

/// stdin goes into the pipe until EOF or until told to stop, then half-closes.
async fn upload(mut writer: BeamWriter, stop_input: Arc<Notify>) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                writer.write(buf[..n].to_vec()).await?;
            }
            _ = stop_input.notified() => break,
        }
    }
    writer.finish().await?;
    Ok(())
}

fn spawn_event_printer(mut events: broadcast::Receiver<PipeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipeEvent::RemoteAddress(address)) => match address.host {
                    Some(_) => eprintln!("[beam] Joined the DHT, remote address is {address}"),
                    None => eprintln!("[beam] Could not detect remote address"),
                },
                Ok(PipeEvent::Connected) => {
                    eprintln!("[beam] Encrypted tunnel established to remote peer")
                }
                Ok(PipeEvent::End) => tracing::debug!("remote side finished writing"),
                Ok(PipeEvent::Error { description }) => eprintln!("[beam] Error: {description}"),
                Ok(PipeEvent::Close) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "event printer lagged")
                }
            }
        }
    })
}

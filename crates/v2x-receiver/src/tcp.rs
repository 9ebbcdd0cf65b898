use crate::framing::{read_frame, FrameRead};
use crate::ingest::Ingestor;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use v2x_core::Protocol;

/// Accepts connections and serves each on its own thread. The listener must
/// already be non-blocking so the loop can observe `stop`.
pub(crate) fn serve(
    listener: TcpListener,
    ingestor: Arc<Ingestor>,
    max_frame_bytes: u32,
    poll: Duration,
    stop: Arc<AtomicBool>,
) {
    info!(addr = ?listener.local_addr().ok(), "tcp listener started");
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let ingestor = ingestor.clone();
                let stop = stop.clone();
                let spawned = thread::Builder::new()
                    .name(format!("tcp-{}", peer))
                    .spawn(move || serve_connection(stream, peer, ingestor, max_frame_bytes, poll, stop));
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => warn!(peer = %peer, error = %err, "tcp: cannot spawn connection thread"),
                }
                connections.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll / 4),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                thread::sleep(poll);
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
    info!("tcp listener stopped");
}

fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ingestor: Arc<Ingestor>,
    max_frame_bytes: u32,
    poll: Duration,
    stop: Arc<AtomicBool>,
) {
    // Accepted sockets may inherit the listener's non-blocking flag.
    if let Err(err) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(poll)))
    {
        warn!(peer = %peer, error = %err, "tcp: cannot configure connection");
        return;
    }
    debug!(peer = %peer, "tcp connection opened");
    let mut frames = 0u64;
    loop {
        match read_frame(&mut stream, max_frame_bytes, &stop) {
            Ok(FrameRead::Frame(payload)) => {
                frames += 1;
                ingestor.ingest(&payload, Protocol::Tcp);
            }
            Ok(FrameRead::Closed) => break,
            Ok(FrameRead::Truncated { expected, received }) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!(peer = %peer, expected, received, "tcp: connection closed mid-frame");
                }
                break;
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "tcp: closing connection");
                break;
            }
        }
    }
    debug!(peer = %peer, frames, "tcp connection closed");
}

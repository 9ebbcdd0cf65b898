use crate::ingest::Ingestor;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use v2x_core::Protocol;

/// One datagram is one message. Datagrams longer than `max_datagram_bytes` are
/// truncated by the kernel and then fail to decode.
pub(crate) fn serve(
    socket: UdpSocket,
    ingestor: Arc<Ingestor>,
    max_datagram_bytes: usize,
    poll: Duration,
    stop: Arc<AtomicBool>,
) {
    if let Err(err) = socket.set_read_timeout(Some(poll)) {
        warn!(error = %err, "udp: cannot set read timeout");
    }
    let mut buf = vec![0u8; max_datagram_bytes];
    info!(addr = ?socket.local_addr().ok(), "udp listener started");
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => {
                ingestor.ingest(&buf[..n], Protocol::Udp);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                thread::sleep(poll);
            }
        }
    }
    info!("udp listener stopped");
}

//! Telemetry receiver: UDP datagrams, length-prefixed TCP streams and an MQTT
//! wildcard subscription, all feeding one [`Ingestor`].

pub mod framing;
pub mod ingest;
mod mqtt;
mod tcp;
pub mod tracker;
mod udp;
pub mod wire;

pub use ingest::{IngestSnapshot, Ingestor};

use anyhow::{Context, Result};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use v2x_core::config::ReceiverConfig;
use v2x_core::{Protocol, Store};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Raising the flag winds down every listener within one poll interval.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum Bound {
    Udp(UdpSocket),
    Tcp(TcpListener),
    Mqtt,
}

pub struct Receiver {
    config: ReceiverConfig,
    ingestor: Arc<Ingestor>,
    stop: StopHandle,
}

/// Listeners that are bound and serving. Dropping without [`join`](Self::join)
/// leaves the threads running until the stop flag is raised.
pub struct RunningReceiver {
    threads: Vec<(Protocol, JoinHandle<()>)>,
    udp_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    stop: StopHandle,
}

impl Receiver {
    pub fn new(store: Arc<Store>, config: ReceiverConfig) -> Self {
        Self {
            config,
            ingestor: Arc::new(Ingestor::new(store)),
            stop: StopHandle::default(),
        }
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Binds every requested socket on the calling thread before any serving
    /// thread starts, so a bind error leaves nothing running.
    pub fn start(&self, protocols: &[Protocol]) -> Result<RunningReceiver> {
        let mut protocols = protocols.to_vec();
        protocols.sort();
        protocols.dedup();

        let mut running = RunningReceiver {
            threads: Vec::new(),
            udp_addr: None,
            tcp_addr: None,
            stop: self.stop.clone(),
        };
        let mut bound = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            let socket = match protocol {
                Protocol::Udp => {
                    let addr = format!("{}:{}", self.config.bind_host, self.config.udp_port);
                    let socket = UdpSocket::bind(&addr)
                        .with_context(|| format!("bind_failed: udp {}", addr))?;
                    running.udp_addr = Some(socket.local_addr()?);
                    Bound::Udp(socket)
                }
                Protocol::Tcp => {
                    let addr = format!("{}:{}", self.config.bind_host, self.config.tcp_port);
                    let listener = TcpListener::bind(&addr)
                        .with_context(|| format!("bind_failed: tcp {}", addr))?;
                    listener.set_nonblocking(true)?;
                    running.tcp_addr = Some(listener.local_addr()?);
                    Bound::Tcp(listener)
                }
                Protocol::Mqtt => Bound::Mqtt,
            };
            bound.push(socket);
        }

        for socket in bound {
            let stop = self.stop.0.clone();
            let ingestor = self.ingestor.clone();
            let (protocol, spawned) = match socket {
                Bound::Udp(socket) => {
                    let max = self.config.max_datagram_bytes;
                    let spawned = thread::Builder::new()
                        .name("udp-listener".to_string())
                        .spawn(move || udp::serve(socket, ingestor, max, POLL_INTERVAL, stop));
                    (Protocol::Udp, spawned)
                }
                Bound::Tcp(listener) => {
                    let max = self.config.max_frame_bytes;
                    let spawned = thread::Builder::new()
                        .name("tcp-listener".to_string())
                        .spawn(move || tcp::serve(listener, ingestor, max, POLL_INTERVAL, stop));
                    (Protocol::Tcp, spawned)
                }
                Bound::Mqtt => {
                    let mqtt = self.config.mqtt.clone();
                    let spawned = thread::Builder::new()
                        .name("mqtt-subscriber".to_string())
                        .spawn(move || mqtt::serve(mqtt, ingestor, POLL_INTERVAL, stop));
                    (Protocol::Mqtt, spawned)
                }
            };
            match spawned {
                Ok(handle) => running.threads.push((protocol, handle)),
                Err(err) => {
                    running.stop_and_join();
                    // Leave the receiver startable again.
                    self.stop.0.store(false, Ordering::Relaxed);
                    return Err(err).context(format!("spawn_failed: {} listener", protocol));
                }
            }
        }
        Ok(running)
    }

    /// Serves until `duration` elapses (when given) or the stop handle fires,
    /// then returns the final ingest counters.
    pub fn run(&self, protocols: &[Protocol], duration: Option<Duration>) -> Result<IngestSnapshot> {
        let running = self.start(protocols)?;
        let started = Instant::now();
        info!(protocols = ?protocols, duration_secs = ?duration.map(|d| d.as_secs()), "receiver running");
        while !self.stop.is_stopped() {
            if duration.map_or(false, |d| started.elapsed() >= d) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        running.stop_and_join();
        let snapshot = self.ingestor.snapshot();
        info!(
            received = snapshot.received,
            stored = snapshot.stored,
            dropped = snapshot.dropped,
            negative_latency = snapshot.negative_latency,
            "receiver stopped"
        );
        Ok(snapshot)
    }
}

impl RunningReceiver {
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn stop_and_join(self) {
        self.stop.stop();
        for (protocol, handle) in self.threads {
            if handle.join().is_err() {
                warn!(protocol = %protocol, "listener thread panicked");
            }
        }
    }
}

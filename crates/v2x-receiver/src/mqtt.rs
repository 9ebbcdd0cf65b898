use crate::ingest::Ingestor;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use v2x_core::config::MqttConfig;
use v2x_core::Protocol;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Subscribes to `<namespace>/#` at QoS 1 and ingests every publish. The
/// subscription is renewed on each ConnAck, since a clean session drops it.
pub(crate) fn serve(config: MqttConfig, ingestor: Arc<Ingestor>, poll: Duration, stop: Arc<AtomicBool>) {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    let topic = config.wildcard_topic();

    let (client, mut connection) = Client::new(options, 64);
    info!(host = %config.host, port = config.port, topic = %topic, "mqtt subscriber started");
    while !stop.load(Ordering::Relaxed) {
        match connection.recv_timeout(poll) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                info!(topic = %topic, "mqtt connected; subscribing");
                if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce) {
                    warn!(error = %err, "mqtt subscribe request failed");
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "mqtt publish");
                ingestor.ingest(&publish.payload[..], Protocol::Mqtt);
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "mqtt connection error; retrying");
                thread::sleep(RECONNECT_BACKOFF);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("mqtt event loop ended");
                break;
            }
        }
    }
    let _ = client.disconnect();
    info!("mqtt subscriber stopped");
}

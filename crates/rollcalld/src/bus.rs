//! MQTT transport: feeds inbound publishes to the dispatcher and publishes
//! results back on `result/<group>`.

use crate::config::MqttConfig;
use crate::dispatcher::{result_topic, IngestDispatcher, SUBSCRIPTIONS};
use crate::pool::{RecognitionReply, ResultSink};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Largest single publish accepted from the broker. Fragments are sized by
/// senders to stay well under this.
const MAX_PACKET_BYTES: usize = 256 * 1024;
/// Outgoing requests buffered by the client before `try_publish` fails.
const REQUEST_CAPACITY: usize = 256;

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Publishes results without waiting on the network.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

impl ResultSink for MqttSink {
    fn publish(&self, group: &str, reply: &RecognitionReply) {
        let topic = result_topic(group);
        if let Err(e) = self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, reply.to_json())
        {
            tracing::warn!(topic = %topic, error = %e, "failed to publish result");
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Create the client. The connection is made lazily by `run`.
    pub fn new(cfg: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(user.as_str(), pass.as_str());
        }
        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        Self { client, eventloop }
    }

    pub fn sink(&self) -> MqttSink {
        MqttSink {
            client: self.client.clone(),
        }
    }

    /// Drive the connection until `shutdown` flips. Connection errors are
    /// retried with exponential backoff; subscriptions are renewed on every
    /// successful connect.
    pub async fn run(mut self, dispatcher: Arc<IngestDispatcher>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(code = ?ack.code, "connected to broker");
                    backoff = INITIAL_BACKOFF;
                    for filter in SUBSCRIPTIONS {
                        if let Err(e) = self.client.try_subscribe(filter, QoS::AtLeastOnce) {
                            tracing::error!(filter, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatcher.handle(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, retry_in = ?backoff, "broker connection lost");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "disconnect request not sent");
        }
        tracing::info!("mqtt transport stopped");
    }
}

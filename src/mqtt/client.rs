//! MQTT client wrapper for rumqttc
//!
//! Connects with an `offline` last-will on the availability topic so the
//! broker reports the bridge as unavailable when this process dies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use rumqttc::Outgoing;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::MqttError;

use super::tls;
use super::topics::{AVAILABILITY_TOPIC, PAYLOAD_OFFLINE, PAYLOAD_ONLINE, SUBSCRIPTIONS};

/// Message received from MQTT subscription
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
}

/// MQTT client wrapper
pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    /// Create a new MQTT client from configuration
    pub fn new(config: &MqttConfig, client_id: &str) -> Result<(Self, EventLoop), MqttError> {
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            AVAILABILITY_TOPIC,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));

        if let Some(user) = &config.user {
            options.set_credentials(user, config.password.as_deref().unwrap_or_default());
        }

        if let Some(tls_config) = &config.tls {
            options.set_transport(tls::build_transport(tls_config)?);
            info!("MQTT TLS enabled");
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        Ok((Self { client }, eventloop))
    }

    /// Publish a QoS 1 message
    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MqttError> {
        debug!("Publishing to {} (retain={}): {}", topic, retain, payload);
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| MqttError::PublishFailed(e.to_string()))
    }

    /// Queue a clean disconnect behind any pending publishes
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(e.to_string()))
    }

    /// Get a clone of the underlying client (for use in multiple tasks)
    pub fn clone_client(&self) -> AsyncClient {
        self.client.clone()
    }
}

/// Run the MQTT event loop and forward incoming messages
///
/// Re-subscribes to the command topics on every ConnAck, since rumqttc uses
/// `clean_start = true` and the broker drops subscriptions on reconnect.
/// The retained availability is re-asserted at the same time because the
/// broker may have fired the last-will while the connection was down.
/// Returns once a requested disconnect has been sent.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    bridge_online: Arc<AtomicBool>,
    message_tx: mpsc::Sender<IncomingMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(incoming)) => match incoming {
                Incoming::Publish(publish) => {
                    let topic = String::from_utf8_lossy(&publish.topic).to_string();
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    debug!("Received message on {}: {}", topic, payload);

                    if message_tx
                        .send(IncomingMessage { topic, payload })
                        .await
                        .is_err()
                    {
                        warn!("Failed to forward incoming message - receiver dropped");
                    }
                }
                Incoming::ConnAck(_) => {
                    info!("Connected to MQTT broker");

                    for topic in SUBSCRIPTIONS {
                        info!("Subscribing to {}", topic);
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {}: {}", topic, e);
                        }
                    }

                    let status = if bridge_online.load(Ordering::SeqCst) {
                        PAYLOAD_ONLINE
                    } else {
                        PAYLOAD_OFFLINE
                    };
                    // try_publish: this task is the one draining the request queue
                    if let Err(e) = client.try_publish(
                        AVAILABILITY_TOPIC,
                        QoS::AtLeastOnce,
                        true,
                        status.as_bytes().to_vec(),
                    ) {
                        error!("Failed to publish availability: {}", e);
                    }
                }
                Incoming::SubAck(_) => {
                    debug!("Subscription acknowledged");
                }
                Incoming::Disconnect(_) => {
                    warn!("Disconnected from MQTT broker");
                }
                _ => {}
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                return;
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

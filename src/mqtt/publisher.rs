//! MQTT publisher for device state and bridge availability

use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::MqttError;
use crate::state::{CoverMotion, StateUpdate};

use super::client::MqttClient;
use super::topics::{state_topic, AVAILABILITY_TOPIC, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

/// Upper bound on a single publish while the client's request queue is full
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON body of a state topic
#[derive(Debug, Serialize, PartialEq)]
struct StatePayload {
    state: &'static str,
    brightness: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    scene: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
}

impl From<&StateUpdate> for StatePayload {
    fn from(update: &StateUpdate) -> Self {
        let brightness = update.state.level.unwrap_or(0);
        Self {
            state: if brightness > 0 { "ON" } else { "OFF" },
            brightness,
            scene: update.state.scene,
            action: update.state.cover.map(|motion| match motion {
                CoverMotion::Opening => "opening",
                CoverMotion::Closing => "closing",
                CoverMotion::Stopped => "stopped",
            }),
            event: update.button_press.then_some("button_press"),
        }
    }
}

/// Level and scene state is retained; cover movements are momentary events
fn retained(update: &StateUpdate) -> bool {
    !update.is_transient()
}

/// Publisher for state changes and availability
pub struct Publisher<'a> {
    client: &'a MqttClient,
}

impl<'a> Publisher<'a> {
    /// Create a new publisher
    pub fn new(client: &'a MqttClient) -> Self {
        Self { client }
    }

    /// Publish a changed device state
    ///
    /// Topic: rako/room/{room}[/channel/{channel}]/state
    /// Retained: yes, except for cover movement events
    pub async fn publish_state(&self, update: &StateUpdate) -> Result<(), MqttError> {
        let topic = state_topic(update.room, update.channel);
        let payload = serde_json::to_string(&StatePayload::from(update))?;
        self.publish_bounded(&topic, &payload, retained(update)).await
    }

    /// Publish bridge availability (retained)
    pub async fn publish_availability(&self, online: bool) -> Result<(), MqttError> {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        debug!("Bridge availability: {}", payload);
        self.publish_bounded(AVAILABILITY_TOPIC, payload, true).await
    }

    /// Publish a retained discovery document
    pub async fn publish_config(&self, topic: &str, payload: &str) -> Result<(), MqttError> {
        self.publish_bounded(topic, payload, true).await
    }

    /// Publish a batch of discovery documents, logging failures
    pub async fn publish_configs(&self, configs: &[(String, String)]) {
        for (topic, payload) in configs {
            if let Err(e) = self.publish_config(topic, payload).await {
                error!("Failed to publish discovery config {}: {}", topic, e);
            }
        }
    }

    async fn publish_bounded(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), MqttError> {
        match timeout(PUBLISH_TIMEOUT, self.client.publish(topic, payload, retain)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Publish timeout for {} after {}s - MQTT client may be stalled",
                    topic,
                    PUBLISH_TIMEOUT.as_secs()
                );
                Err(MqttError::PublishTimeout(topic.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceState;
    use std::time::Instant;

    fn update(level: Option<u8>, scene: Option<u8>, cover: Option<CoverMotion>) -> StateUpdate {
        StateUpdate {
            room: 5,
            channel: 2,
            state: DeviceState {
                level,
                scene,
                cover,
                online: true,
                updated_at: Instant::now(),
            },
            button_press: false,
        }
    }

    fn json(update: &StateUpdate) -> String {
        serde_json::to_string(&StatePayload::from(update)).unwrap()
    }

    #[test]
    fn test_level_payload() {
        assert_eq!(
            json(&update(Some(128), None, None)),
            r#"{"state":"ON","brightness":128}"#
        );
        assert_eq!(json(&update(None, None, None)), r#"{"state":"OFF","brightness":0}"#);
    }

    #[test]
    fn test_scene_payload() {
        assert_eq!(
            json(&update(Some(0), Some(0), None)),
            r#"{"state":"OFF","brightness":0,"scene":0}"#
        );
        let mut pressed = update(Some(255), Some(1), None);
        pressed.button_press = true;
        assert_eq!(
            json(&pressed),
            r#"{"state":"ON","brightness":255,"scene":1,"event":"button_press"}"#
        );
    }

    #[test]
    fn test_cover_payload_is_transient() {
        let moving = update(Some(40), None, Some(CoverMotion::Closing));
        assert!(moving.is_transient());
        assert_eq!(
            json(&moving),
            r#"{"state":"ON","brightness":40,"action":"closing"}"#
        );
        assert!(!update(Some(40), None, None).is_transient());
    }

    #[test]
    fn test_retain_decision() {
        assert!(retained(&update(Some(128), None, None)));
        assert!(retained(&update(Some(0), Some(0), None)));

        let mut pressed = update(Some(255), Some(1), None);
        pressed.button_press = true;
        assert!(retained(&pressed));

        assert!(!retained(&update(Some(255), None, Some(CoverMotion::Opening))));
        assert!(!retained(&update(Some(40), None, Some(CoverMotion::Stopped))));
    }

    #[test]
    fn test_cover_status_reports_position() {
        use crate::model::CoverDirective;
        use crate::rako::{decode, status_frame};
        use crate::state::DeviceStateStore;
        use crate::topology::Topology;
        use std::sync::Arc;

        let topology = Topology::parse(
            r#"<rako><Room id="8"><Type>Blinds</Type><Channel id="1"/></Room></rako>"#,
        )
        .unwrap();
        let store = DeviceStateStore::new(Arc::new(topology));

        let open = decode(&status_frame(8, 1, 0x01, &[0])).unwrap();
        assert_eq!(open.value, crate::rako::FrameValue::Cover(CoverDirective::Open));
        store.apply(&open);
        let mut opened = update(None, None, None);
        opened.room = 8;
        opened.channel = 1;
        opened.state = store.get(8, 1).unwrap();
        assert_eq!(
            json(&opened),
            r#"{"state":"ON","brightness":255,"action":"opening"}"#
        );

        store.apply(&decode(&status_frame(8, 1, 0x02, &[0])).unwrap());
        opened.state = store.get(8, 1).unwrap();
        assert_eq!(
            json(&opened),
            r#"{"state":"OFF","brightness":0,"action":"closing"}"#
        );
    }
}

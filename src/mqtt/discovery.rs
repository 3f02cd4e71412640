//! Home Assistant MQTT discovery documents
//!
//! One retained config per room, channel and named scene. Every entity
//! hangs off a single device describing the bridge.

use std::net::IpAddr;

use serde::Serialize;

use crate::error::MqttError;
use crate::model::{DeviceType, Room, ALL_CHANNELS};
use crate::topology::Topology;

use super::topics::{state_topic, AVAILABILITY_TOPIC, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

const MANUFACTURER: &str = "Rako";

#[derive(Debug, Clone, Serialize)]
struct HaDevice {
    identifiers: Vec<String>,
    name: String,
    manufacturer: &'static str,
    model: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    sw_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    hw_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connections: Vec<[String; 2]>,
    configuration_url: String,
}

/// Fields shared by every entity
#[derive(Debug, Serialize)]
struct HaEntity<'a, C: Serialize> {
    name: String,
    unique_id: String,
    availability_topic: &'static str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    qos: u8,
    device: &'a HaDevice,
    #[serde(flatten)]
    capabilities: C,
}

#[derive(Debug, Serialize)]
struct LightCapabilities {
    schema: &'static str,
    state_topic: String,
    command_topic: String,
    brightness: bool,
    brightness_scale: u8,
}

#[derive(Debug, Serialize)]
struct SwitchCapabilities {
    state_topic: String,
    command_topic: String,
    value_template: &'static str,
    payload_on: &'static str,
    payload_off: &'static str,
    state_on: &'static str,
    state_off: &'static str,
}

#[derive(Debug, Serialize)]
struct CoverCapabilities {
    device_class: &'static str,
    command_topic: String,
    payload_open: &'static str,
    payload_close: &'static str,
    payload_stop: &'static str,
    position_topic: String,
    position_template: &'static str,
    set_position_topic: String,
    set_position_template: &'static str,
    position_open: u8,
    position_closed: u8,
}

#[derive(Debug, Serialize)]
struct SceneCapabilities {
    command_topic: String,
    payload_on: String,
}

/// Builds discovery configs for one bridge
pub struct DiscoveryBuilder<'a> {
    prefix: &'a str,
    device: HaDevice,
}

impl<'a> DiscoveryBuilder<'a> {
    pub fn new(prefix: &'a str, topology: &Topology, bridge: IpAddr) -> Self {
        let info = topology.info();
        let id = if info.host_mac.is_empty() {
            bridge.to_string()
        } else {
            info.host_mac.to_ascii_lowercase()
        };
        let device = HaDevice {
            identifiers: vec![format!("rako_bridge_{}", id)],
            name: if info.host_name.is_empty() {
                "Rako Bridge".to_string()
            } else {
                info.host_name.clone()
            },
            manufacturer: MANUFACTURER,
            model: "RA-BRIDGE",
            sw_version: info.version.clone(),
            hw_version: info.hw_status.clone(),
            connections: if info.host_mac.is_empty() {
                Vec::new()
            } else {
                vec![["mac".to_string(), info.host_mac.to_ascii_lowercase()]]
            },
            configuration_url: format!("http://{}", bridge),
        };
        Self { prefix, device }
    }

    /// Every (topic, payload) pair for the topology
    pub fn configs(&self, topology: &Topology) -> Result<Vec<(String, String)>, MqttError> {
        let mut configs = Vec::new();
        for room in topology.rooms() {
            self.room_configs(room, &mut configs)?;
        }
        Ok(configs)
    }

    fn room_configs(&self, room: &Room, out: &mut Vec<(String, String)>) -> Result<(), MqttError> {
        // The room set topic only takes scenes, so cover rooms are driven
        // through channel 0 instead
        if room.device_type.is_cover() {
            let name = format!("{} (All)", room.name);
            out.push(self.entity(room, ALL_CHANNELS, room.device_type, name)?);
        } else {
            let id = format!("rako_room_{}", room.id);
            let state_topic = state_topic(room.id, ALL_CHANNELS);
            let command_topic = format!("rako/room/{}/set", room.id);
            let doc = if room.device_type == DeviceType::Switch {
                self.document("switch", id, room.name.clone(), switch(state_topic, command_topic))
            } else {
                self.document("light", id, room.name.clone(), light(state_topic, command_topic))
            };
            out.push(doc?);
        }

        for channel in &room.channels {
            let name = if channel.name.is_empty() {
                format!("{} Channel {}", room.name, channel.id)
            } else {
                channel.name.clone()
            };
            out.push(self.entity(room, channel.id, channel.device_type, name)?);
        }

        if room.device_type.supports_scenes() {
            for scene in &room.scenes {
                let caps = SceneCapabilities {
                    command_topic: format!("rako/room/{}/set", room.id),
                    payload_on: format!(r#"{{"scene":{}}}"#, scene.id),
                };
                let id = format!("rako_room_{}_scene_{}", room.id, scene.id);
                let name = format!("{} {}", room.name, scene.name);
                out.push(self.document("scene", id, name, caps)?);
            }
        }
        Ok(())
    }

    /// Config for one channel (or the whole room on channel 0)
    fn entity(
        &self,
        room: &Room,
        channel: u8,
        device_type: DeviceType,
        name: String,
    ) -> Result<(String, String), MqttError> {
        let id = format!("rako_room_{}_channel_{}", room.id, channel);
        let base = format!("rako/room/{}/channel/{}", room.id, channel);
        let state = state_topic(room.id, channel);

        match device_type {
            DeviceType::Blinds | DeviceType::Curtains => {
                let caps = CoverCapabilities {
                    device_class: if device_type == DeviceType::Curtains {
                        "curtain"
                    } else {
                        "blind"
                    },
                    command_topic: format!("{}/command", base),
                    payload_open: "OPEN",
                    payload_close: "CLOSE",
                    payload_stop: "STOP",
                    position_topic: state,
                    position_template: "{{ value_json.brightness }}",
                    set_position_topic: format!("{}/set", base),
                    set_position_template: r#"{"brightness": {{ position }}}"#,
                    position_open: 255,
                    position_closed: 0,
                };
                self.document("cover", id, name, caps)
            }
            DeviceType::Switch => {
                self.document("switch", id, name, switch(state, format!("{}/set", base)))
            }
            _ => self.document("light", id, name, light(state, format!("{}/set", base))),
        }
    }

    fn document<C: Serialize>(
        &self,
        component: &str,
        unique_id: String,
        name: String,
        capabilities: C,
    ) -> Result<(String, String), MqttError> {
        let topic = format!("{}/{}/{}/config", self.prefix, component, unique_id);
        let entity = HaEntity {
            name,
            unique_id,
            availability_topic: AVAILABILITY_TOPIC,
            payload_available: PAYLOAD_ONLINE,
            payload_not_available: PAYLOAD_OFFLINE,
            qos: 1,
            device: &self.device,
            capabilities,
        };
        Ok((topic, serde_json::to_string(&entity)?))
    }
}

fn light(state_topic: String, command_topic: String) -> LightCapabilities {
    LightCapabilities {
        schema: "json",
        state_topic,
        command_topic,
        brightness: true,
        brightness_scale: 255,
    }
}

fn switch(state_topic: String, command_topic: String) -> SwitchCapabilities {
    SwitchCapabilities {
        state_topic,
        command_topic,
        value_template: "{{ value_json.state }}",
        payload_on: r#"{"state":"ON"}"#,
        payload_off: r#"{"state":"OFF"}"#,
        state_on: "ON",
        state_off: "OFF",
    }
}

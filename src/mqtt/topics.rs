//! MQTT topic layout
//!
//! Topic strings are a compatibility surface shared with existing
//! automations and must not change.

use crate::error::ValidationError;
use crate::model::{ALL_CHANNELS, MAX_ROOM_ID};

/// Bridge availability topic
pub const AVAILABILITY_TOPIC: &str = "rako/bridge/status";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Command subscriptions, re-issued on every connect
pub const SUBSCRIPTIONS: [&str; 3] = [
    "rako/room/+/set",
    "rako/room/+/channel/+/set",
    "rako/room/+/channel/+/command",
];

/// Base topic of a room or one of its channels
pub fn device_base(room: u16, channel: u8) -> String {
    if channel == ALL_CHANNELS {
        format!("rako/room/{}", room)
    } else {
        format!("rako/room/{}/channel/{}", room, channel)
    }
}

/// State topic; channel 0 reports on the room topic
pub fn state_topic(room: u16, channel: u8) -> String {
    format!("{}/state", device_base(room, channel))
}

/// Command topic kinds the gateway accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTopic {
    /// `rako/room/{room}/set`
    RoomSet { room: u16 },
    /// `rako/room/{room}/channel/{channel}/set`
    ChannelSet { room: u16, channel: u8 },
    /// `rako/room/{room}/channel/{channel}/command`
    ChannelCommand { room: u16, channel: u8 },
}

impl CommandTopic {
    pub fn parse(topic: &str) -> Result<Self, ValidationError> {
        let unknown = || ValidationError::UnknownTopic(topic.to_string());
        let parts: Vec<&str> = topic.split('/').collect();

        match parts.as_slice() {
            ["rako", "room", room, "set"] => Ok(Self::RoomSet {
                room: parse_room(room)?,
            }),
            ["rako", "room", room, "channel", channel, suffix] => {
                let room = parse_room(room)?;
                let channel = parse_channel(channel)?;
                match *suffix {
                    "set" => Ok(Self::ChannelSet { room, channel }),
                    "command" => Ok(Self::ChannelCommand { room, channel }),
                    _ => Err(unknown()),
                }
            }
            _ => Err(unknown()),
        }
    }
}

fn parse_room(segment: &str) -> Result<u16, ValidationError> {
    let out_of_range = || ValidationError::OutOfRange {
        field: "room",
        value: segment.to_string(),
    };
    let id: u32 = segment.parse().map_err(|_| out_of_range())?;
    if id > u32::from(MAX_ROOM_ID) {
        return Err(out_of_range());
    }
    Ok(id as u16)
}

fn parse_channel(segment: &str) -> Result<u8, ValidationError> {
    segment.parse().map_err(|_| ValidationError::OutOfRange {
        field: "channel",
        value: segment.to_string(),
    })
}

//! Lighting network model: rooms, channels, scenes and commands

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Channel id addressing every channel in a room
pub const ALL_CHANNELS: u8 = 0;

/// Highest room id that may be addressed (1020..=1023 are reserved)
pub const MAX_ROOM_ID: u16 = 1019;

/// Highest room id representable on the wire (10 bits)
pub const MAX_WIRE_ROOM_ID: u16 = 1023;

/// Highest standard scene id (17+ are reserved)
pub const MAX_SCENE_ID: u8 = 16;

/// Device type classification of a room or channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    Light,
    Slider,
    Switch,
    Blinds,
    LedStrip,
    Curtains,
    /// Unknown or unclassified; treated as a dimmable light
    #[default]
    Default,
}

impl DeviceType {
    /// Parse a type name from the topology document
    ///
    /// Returns `None` for names that don't map to a known type so callers
    /// can fall back to the room's classification.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "light" | "lights" | "lighting" | "dimmer" => Some(Self::Light),
            "slider" | "sliders" => Some(Self::Slider),
            "switch" | "switches" | "socket" | "sockets" => Some(Self::Switch),
            "blind" | "blinds" | "screen" | "screens" => Some(Self::Blinds),
            "ledstrip" | "ledstrips" | "led" => Some(Self::LedStrip),
            "curtain" | "curtains" => Some(Self::Curtains),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    /// Whether the device is driven with open/close/stop commands
    pub fn is_cover(self) -> bool {
        matches!(self, Self::Blinds | Self::Curtains)
    }

    /// Whether the device accepts brightness levels and scenes
    pub fn supports_scenes(self) -> bool {
        matches!(
            self,
            Self::Light | Self::Slider | Self::LedStrip | Self::Default
        )
    }
}

/// A named scene preset scoped to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scene {
    pub id: u8,
    pub name: String,
    /// Target level per channel id
    pub levels: BTreeMap<u8, u8>,
}

/// An addressable load within a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u8,
    pub name: String,
    pub device_type: DeviceType,
}

/// An addressable group of channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: u16,
    pub name: String,
    pub device_type: DeviceType,
    pub channels: Vec<Channel>,
    pub scenes: Vec<Scene>,
}

impl Room {
    pub fn channel(&self, id: u8) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn scene(&self, id: u8) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }
}

/// Transport mode currently used to reach the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Disconnected,
    Udp,
    Telnet,
    Failed,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Udp => "udp",
            Self::Telnet => "telnet",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the lighting bridge as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub host: IpAddr,
    pub mode: TransportMode,
    pub online: bool,
}

/// Cover movement directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoverDirective {
    Open,
    Close,
    Stop,
}

impl CoverDirective {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSE" => Some(Self::Close),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// What a command asks the bridge to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandKind {
    SetLevel(u8),
    SetScene(u8),
    Cover(CoverDirective),
}

/// A single outbound instruction for the bridge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub room: u16,
    /// Target channel, or [`ALL_CHANNELS`] for room-wide commands
    pub channel: u8,
    pub kind: CommandKind,
    /// Requested transition in seconds
    pub transition: Option<f64>,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room {} channel {}: ", self.room, self.channel)?;
        match self.kind {
            CommandKind::SetLevel(level) => write!(f, "level {}", level)?,
            CommandKind::SetScene(scene) => write!(f, "scene {}", scene)?,
            CommandKind::Cover(directive) => write!(f, "cover {:?}", directive)?,
        }
        if let Some(t) = self.transition {
            write!(f, " over {}s", t)?;
        }
        Ok(())
    }
}

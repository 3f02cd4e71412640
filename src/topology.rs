//! Topology loader for the bridge's exported `rako.xml`
//!
//! Parsed once at startup into rooms, channels and scenes. Lookups for
//! addresses missing from the document fall back to [`DeviceType::Default`]
//! so devices added after the export still work.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use roxmltree::{Document, Node};
use tracing::{debug, info, warn};

use crate::error::TopologyError;
use crate::model::{
    Channel, DeviceType, Room, Scene, MAX_ROOM_ID, MAX_SCENE_ID, MAX_WIRE_ROOM_ID,
};

/// Timeout for fetching the document from the bridge
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the topology document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologySource {
    /// A previously exported file
    File(PathBuf),
    /// Fetched over HTTP from the bridge
    Bridge(IpAddr),
}

/// Bridge identification from the `<info>` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeInfo {
    pub version: String,
    pub host_name: String,
    pub host_mac: String,
    pub hw_status: String,
}

/// Rooms, channels and scenes known to the bridge
#[derive(Debug, Clone, Default)]
pub struct Topology {
    info: BridgeInfo,
    rooms: Vec<Room>,
}

impl Topology {
    /// Load and parse the topology document
    pub async fn load(source: &TopologySource) -> Result<Self, TopologyError> {
        let xml = match source {
            TopologySource::File(path) => {
                info!("Loading topology from {}", path.display());
                tokio::fs::read_to_string(path).await?
            }
            TopologySource::Bridge(host) => {
                let url = format!("http://{}/rako.xml", host);
                info!("Fetching topology from {}", url);
                let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
                client
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?
            }
        };
        debug!("Topology document is {} bytes", xml.len());

        let topology = Self::parse(&xml)?;
        info!(
            "Topology has {} rooms and {} channels",
            topology.rooms.len(),
            topology.rooms.iter().map(|r| r.channels.len()).sum::<usize>()
        );
        Ok(topology)
    }

    /// Parse a topology document
    pub fn parse(xml: &str) -> Result<Self, TopologyError> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();

        let info = root
            .descendants()
            .find(|n| is_tag(n, "info"))
            .map(|node| BridgeInfo {
                version: child_text(&node, "version").unwrap_or_default(),
                host_name: child_text(&node, "hostName").unwrap_or_default(),
                host_mac: child_text(&node, "hostMAC").unwrap_or_default(),
                hw_status: child_text(&node, "hwStatus").unwrap_or_default(),
            })
            .unwrap_or_default();

        let mut rooms = Vec::new();
        for node in root.descendants().filter(|n| is_tag(n, "Room")) {
            if let Some(room) = parse_room(&node)? {
                rooms.push(room);
            }
        }
        rooms.sort_by_key(|r| r.id);

        if rooms.is_empty() {
            warn!("Topology document contains no rooms");
        }

        Ok(Self { info, rooms })
    }

    pub fn info(&self) -> &BridgeInfo {
        &self.info
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn room(&self, id: u16) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == id)
    }

    /// Device type of a channel, falling back to its room, then Default
    pub fn device_type(&self, room: u16, channel: u8) -> DeviceType {
        let Some(room) = self.room(room) else {
            return DeviceType::Default;
        };
        room.channel(channel)
            .map(|c| c.device_type)
            .unwrap_or(room.device_type)
    }

    /// Target level of a channel in a room scene, when the document has one
    pub fn scene_level(&self, room: u16, channel: u8, scene: u8) -> Option<u8> {
        self.room(room)?.scene(scene)?.levels.get(&channel).copied()
    }
}

fn is_tag(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(name)
}

/// Trimmed text of the first direct child with the given tag
fn child_text(node: &Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| is_tag(n, name))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_id<T: TryFrom<u32>>(node: &Node, element: &'static str, max: u32) -> Result<T, TopologyError> {
    let raw = node.attribute("id").unwrap_or_default();
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|id| *id <= max)
        .and_then(|id| T::try_from(id).ok())
        .ok_or_else(|| TopologyError::InvalidId {
            element,
            value: raw.to_string(),
        })
}

fn parse_room(node: &Node) -> Result<Option<Room>, TopologyError> {
    let id: u16 = parse_id(node, "Room", u32::from(MAX_WIRE_ROOM_ID))?;
    if id > MAX_ROOM_ID {
        warn!("Skipping reserved room id {}", id);
        return Ok(None);
    }

    let name = child_text(node, "Title").unwrap_or_else(|| format!("Room {}", id));
    let room_type = child_text(node, "Type").unwrap_or_default();
    let device_type = DeviceType::from_name(&room_type).unwrap_or_else(|| {
        if !room_type.is_empty() {
            debug!("Room {} has unknown type {:?}, using default", id, room_type);
        }
        DeviceType::Default
    });

    let mut channels: Vec<Channel> = Vec::new();
    let mut channel_levels: Vec<(u8, Vec<u8>)> = Vec::new();
    for channel_node in node.children().filter(|n| is_tag(n, "Channel")) {
        let channel_id: u8 = parse_id(&channel_node, "Channel", u32::from(u8::MAX))?;
        if channels.iter().any(|c| c.id == channel_id) {
            return Err(TopologyError::DuplicateChannel {
                room: id,
                channel: channel_id,
            });
        }

        let channel_type = child_text(&channel_node, "type")
            .and_then(|t| DeviceType::from_name(&t))
            .unwrap_or(device_type);
        channels.push(Channel {
            id: channel_id,
            name: child_text(&channel_node, "Name")
                .unwrap_or_else(|| format!("Channel {}", channel_id)),
            device_type: channel_type,
        });

        if let Some(levels) = child_text(&channel_node, "Levels") {
            match parse_levels(&levels) {
                Some(levels) => channel_levels.push((channel_id, levels)),
                None => warn!(
                    "Ignoring malformed scene levels for room {} channel {}",
                    id, channel_id
                ),
            }
        }
    }
    channels.sort_by_key(|c| c.id);

    let mut scenes = Vec::new();
    for scene_node in node.children().filter(|n| is_tag(n, "Scene")) {
        let scene_id: u8 = parse_id(&scene_node, "Scene", u32::from(u8::MAX))?;
        if scene_id > MAX_SCENE_ID {
            warn!("Skipping reserved scene {} in room {}", scene_id, id);
            continue;
        }
        let levels: BTreeMap<u8, u8> = if scene_id == 0 {
            channels.iter().map(|c| (c.id, 0)).collect()
        } else {
            channel_levels
                .iter()
                .filter_map(|(channel, levels)| {
                    levels
                        .get(usize::from(scene_id) - 1)
                        .map(|level| (*channel, *level))
                })
                .collect()
        };
        scenes.push(Scene {
            id: scene_id,
            name: child_text(&scene_node, "Name").unwrap_or_else(|| format!("Scene {}", scene_id)),
            levels,
        });
    }
    scenes.sort_by_key(|s| s.id);

    Ok(Some(Room {
        id,
        name,
        device_type,
        channels,
        scenes,
    }))
}

/// Decode a hex level string, one byte per scene starting at scene 1
fn parse_levels(hex: &str) -> Option<Vec<u8>> {
    let digits: String = hex
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

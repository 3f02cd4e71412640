//! Last-known device state cache
//!
//! A pure last-write-wins cache keyed by (room, channel). The bridge protocol
//! carries no sequence numbers, so a datagram delivered out of order can
//! briefly present an older value after a newer one. The store does not try
//! to reorder or reconcile such deliveries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::model::{Command, CoverDirective};
use crate::rako::{DecodedFrame, FrameValue};
use crate::topology::Topology;

/// Scene levels used when the topology has none for a channel
fn fallback_scene_level(scene: u8) -> Option<u8> {
    match scene {
        0 => Some(0),
        1 => Some(255),
        2 => Some(192),
        3 => Some(128),
        4 => Some(64),
        _ => None,
    }
}

/// Last observed movement of a cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverMotion {
    Opening,
    Closing,
    Stopped,
}

impl From<CoverDirective> for CoverMotion {
    fn from(directive: CoverDirective) -> Self {
        match directive {
            CoverDirective::Open => Self::Opening,
            CoverDirective::Close => Self::Closing,
            CoverDirective::Stop => Self::Stopped,
        }
    }
}

/// Last known state of one (room, channel)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Current level, unknown until a level or resolvable scene is seen
    pub level: Option<u8>,
    /// Scene id when the last update was scene based
    pub scene: Option<u8>,
    /// Last cover movement, for blinds and curtains
    pub cover: Option<CoverMotion>,
    /// Cleared when the bridge is considered offline
    pub online: bool,
    pub updated_at: Instant,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            level: None,
            scene: None,
            cover: None,
            online: true,
            updated_at: Instant::now(),
        }
    }

    /// Compare everything except the timestamp
    fn same_as(&self, other: &Self) -> bool {
        self.level == other.level
            && self.scene == other.scene
            && self.cover == other.cover
            && self.online == other.online
    }
}

/// A changed device state, ready to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub room: u16,
    pub channel: u8,
    pub state: DeviceState,
    /// Change was triggered by a keypad button
    pub button_press: bool,
}

impl StateUpdate {
    /// Cover movements are momentary events rather than state
    pub fn is_transient(&self) -> bool {
        self.state.cover.is_some()
    }
}

/// Concurrency-safe map of device states
pub struct DeviceStateStore {
    topology: Arc<Topology>,
    entries: Mutex<HashMap<(u16, u8), DeviceState>>,
}

impl DeviceStateStore {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(u16, u8), DeviceState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a decoded frame; returns whether the stored state changed
    pub fn apply(&self, frame: &DecodedFrame) -> bool {
        let mut entries = self.entries();
        let entry = entries
            .entry((frame.room, frame.channel))
            .or_insert_with(|| DeviceState {
                online: false,
                ..DeviceState::new()
            });
        let before = entry.clone();

        match frame.value {
            FrameValue::Level(level) => {
                entry.level = Some(level);
                entry.scene = None;
                entry.cover = None;
            }
            FrameValue::Scene(scene) => {
                let level = self
                    .topology
                    .scene_level(frame.room, frame.channel, scene)
                    .or_else(|| fallback_scene_level(scene));
                if level.is_some() {
                    entry.level = level;
                }
                entry.scene = Some(scene);
                entry.cover = None;
            }
            FrameValue::Cover(directive) => {
                // open and close run to the end stop; stop leaves the position
                match directive {
                    CoverDirective::Open => entry.level = Some(255),
                    CoverDirective::Close => entry.level = Some(0),
                    CoverDirective::Stop => {}
                }
                entry.cover = Some(directive.into());
            }
        }
        entry.online = true;
        entry.updated_at = Instant::now();

        !entry.same_as(&before)
    }

    /// Make sure an entry exists for the target of an issued command
    pub fn note_command(&self, command: &Command) {
        self.entries()
            .entry((command.room, command.channel))
            .or_insert_with(DeviceState::new);
    }

    pub fn get(&self, room: u16, channel: u8) -> Option<DeviceState> {
        self.entries().get(&(room, channel)).cloned()
    }

    /// Flag every entry as stale; values are kept as last known
    pub fn mark_stale(&self) -> usize {
        let mut entries = self.entries();
        let mut marked = 0;
        for state in entries.values_mut().filter(|s| s.online) {
            state.online = false;
            marked += 1;
        }
        marked
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandKind;
    use crate::rako::FrameFlags;

    const XML: &str = r#"<rako><Room id="5"><Type>Lights</Type>
        <Scene id="3"><Name>Evening</Name></Scene>
        <Channel id="2"><Levels>FFC05A40</Levels></Channel>
    </Room></rako>"#;

    fn store() -> DeviceStateStore {
        DeviceStateStore::new(Arc::new(Topology::parse(XML).unwrap()))
    }

    fn frame(room: u16, channel: u8, value: FrameValue) -> DecodedFrame {
        DecodedFrame {
            room,
            channel,
            value,
            flags: FrameFlags::default(),
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = store();
        let f = frame(5, 2, FrameValue::Level(128));
        assert!(store.apply(&f));
        assert!(!store.apply(&f));
        assert_eq!(store.get(5, 2).unwrap().level, Some(128));
    }

    #[test]
    fn test_last_write_wins() {
        let store = store();
        assert!(store.apply(&frame(1, 1, FrameValue::Level(200))));
        // an older datagram arriving late still overwrites
        assert!(store.apply(&frame(1, 1, FrameValue::Level(100))));
        assert_eq!(store.get(1, 1).unwrap().level, Some(100));
    }

    #[test]
    fn test_scene_level_from_topology() {
        let store = store();
        store.apply(&frame(5, 2, FrameValue::Scene(3)));
        let state = store.get(5, 2).unwrap();
        assert_eq!(state.level, Some(0x5A));
        assert_eq!(state.scene, Some(3));
    }

    #[test]
    fn test_scene_level_fallback() {
        let store = store();
        store.apply(&frame(9, 1, FrameValue::Scene(2)));
        assert_eq!(store.get(9, 1).unwrap().level, Some(192));

        // unresolvable scene keeps the previous level
        assert!(store.apply(&frame(9, 1, FrameValue::Scene(12))));
        let state = store.get(9, 1).unwrap();
        assert_eq!(state.level, Some(192));
        assert_eq!(state.scene, Some(12));
    }

    #[test]
    fn test_cover_motion_sets_position() {
        let store = store();
        assert!(store.apply(&frame(8, 1, FrameValue::Cover(CoverDirective::Open))));
        let state = store.get(8, 1).unwrap();
        assert_eq!(state.level, Some(255));
        assert_eq!(state.cover, Some(CoverMotion::Opening));
        assert!(!store.apply(&frame(8, 1, FrameValue::Cover(CoverDirective::Open))));

        assert!(store.apply(&frame(8, 1, FrameValue::Cover(CoverDirective::Close))));
        let state = store.get(8, 1).unwrap();
        assert_eq!(state.level, Some(0));
        assert_eq!(state.cover, Some(CoverMotion::Closing));
    }

    #[test]
    fn test_cover_stop_keeps_position() {
        let store = store();
        store.apply(&frame(8, 1, FrameValue::Level(40)));
        assert!(store.apply(&frame(8, 1, FrameValue::Cover(CoverDirective::Stop))));
        let state = store.get(8, 1).unwrap();
        assert_eq!(state.level, Some(40));
        assert_eq!(state.cover, Some(CoverMotion::Stopped));
    }

    #[test]
    fn test_stale_entries_report_change_on_refresh() {
        let store = store();
        let f = frame(3, 1, FrameValue::Level(10));
        store.apply(&f);
        assert_eq!(store.mark_stale(), 1);
        let state = store.get(3, 1).unwrap();
        assert!(!state.online);
        assert_eq!(state.level, Some(10));
        assert!(store.apply(&f));
        assert!(store.get(3, 1).unwrap().online);
    }

    #[test]
    fn test_note_command_creates_entry_once() {
        let store = store();
        let command = Command {
            room: 4,
            channel: 1,
            kind: CommandKind::SetLevel(50),
            transition: None,
        };
        assert!(store.get(4, 1).is_none());
        store.note_command(&command);
        store.note_command(&command);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(4, 1).unwrap().level, None);
        assert!(store.apply(&frame(4, 1, FrameValue::Level(50))));
    }

    #[test]
    fn test_unknown_entry() {
        assert!(store().get(1, 1).is_none());
    }
}

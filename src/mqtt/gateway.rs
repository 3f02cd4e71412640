//! MQTT command gateway
//!
//! Turns messages on the command topics into [`Command`]s for the
//! dispatcher. Anything malformed or out of range is rejected here and
//! never reaches the bridge.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{TransportError, ValidationError};
use crate::model::{Command, CommandKind, CoverDirective, ALL_CHANNELS, MAX_SCENE_ID};

use super::client::IncomingMessage;
use super::topics::CommandTopic;

/// JSON body accepted on the `set` and `command` topics
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandPayload {
    state: Option<String>,
    brightness: Option<f64>,
    percentage: Option<f64>,
    position: Option<f64>,
    scene: Option<f64>,
    transition: Option<f64>,
    command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Power {
    On,
    Off,
}

impl CommandPayload {
    fn power(&self) -> Result<Option<Power>, ValidationError> {
        match self.state.as_deref().map(|s| s.trim().to_ascii_uppercase()) {
            None => Ok(None),
            Some(s) if s == "ON" => Ok(Some(Power::On)),
            Some(s) if s == "OFF" => Ok(Some(Power::Off)),
            Some(s) => Err(ValidationError::Payload(format!(
                "state must be ON or OFF, got {:?}",
                s
            ))),
        }
    }

    /// Requested level from brightness, or percentage/position scaled to 0-255
    fn level(&self) -> Result<Option<u8>, ValidationError> {
        if let Some(brightness) = self.brightness {
            return in_range("brightness", brightness, 255.0).map(|v| Some(v as u8));
        }
        for (field, value) in [("percentage", self.percentage), ("position", self.position)] {
            if let Some(value) = value {
                let percent = in_range(field, value, 100.0)?;
                return Ok(Some((percent * 255.0 / 100.0).round() as u8));
            }
        }
        Ok(None)
    }

    fn scene(&self) -> Result<Option<u8>, ValidationError> {
        self.scene
            .map(|scene| in_range("scene", scene, f64::from(MAX_SCENE_ID)).map(|v| v as u8))
            .transpose()
    }

    fn transition(&self) -> Result<Option<f64>, ValidationError> {
        match self.transition {
            Some(t) if !t.is_finite() || t < 0.0 => Err(ValidationError::OutOfRange {
                field: "transition",
                value: t.to_string(),
            }),
            other => Ok(other),
        }
    }

    fn cover(&self) -> Result<Option<CoverDirective>, ValidationError> {
        self.command.as_deref().map(cover_directive).transpose()
    }
}

/// Accept whole numbers in `0..=max`
fn in_range(field: &'static str, value: f64, max: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value.fract() == 0.0 && (0.0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}

fn cover_directive(value: &str) -> Result<CoverDirective, ValidationError> {
    CoverDirective::parse(value).ok_or_else(|| ValidationError::UnknownCommand(value.to_string()))
}

/// Scene used for a room-wide brightness request
fn scene_for_level(level: u8) -> u8 {
    match level {
        255 => 1,
        192..=254 => 2,
        128..=191 => 3,
        64..=127 => 4,
        _ => 0,
    }
}

/// Parse one MQTT message into a command
pub fn parse_command(topic: &str, payload: &str) -> Result<Command, ValidationError> {
    let target = CommandTopic::parse(topic)?;
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ValidationError::Empty);
    }

    match target {
        CommandTopic::ChannelCommand { room, channel } => {
            // A bare OPEN or "OPEN" is accepted alongside the JSON form
            let directive = match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(serde_json::Value::String(s)) => cover_directive(&s)?,
                Ok(serde_json::Value::Object(_)) => parse_payload(payload)?
                    .cover()?
                    .ok_or_else(|| ValidationError::Payload("missing command".to_string()))?,
                Ok(other) => return Err(ValidationError::UnknownCommand(other.to_string())),
                Err(_) => cover_directive(payload)?,
            };
            Ok(Command {
                room,
                channel,
                kind: CommandKind::Cover(directive),
                transition: None,
            })
        }
        CommandTopic::ChannelSet { room, channel } => {
            let body = parse_payload(payload)?;
            Ok(Command {
                room,
                channel,
                transition: body.transition()?,
                kind: channel_kind(&body)?,
            })
        }
        CommandTopic::RoomSet { room } => {
            let body = parse_payload(payload)?;
            Ok(Command {
                room,
                channel: ALL_CHANNELS,
                transition: body.transition()?,
                kind: room_kind(&body)?,
            })
        }
    }
}

fn parse_payload(payload: &str) -> Result<CommandPayload, ValidationError> {
    serde_json::from_str(payload).map_err(|e| ValidationError::Payload(e.to_string()))
}

fn channel_kind(body: &CommandPayload) -> Result<CommandKind, ValidationError> {
    if let Some(directive) = body.cover()? {
        return Ok(CommandKind::Cover(directive));
    }
    if let Some(scene) = body.scene()? {
        return Ok(CommandKind::SetScene(scene));
    }
    let level = body.level()?;
    match (body.power()?, level) {
        (Some(Power::Off), _) => Ok(CommandKind::SetLevel(0)),
        (Some(Power::On), level) => Ok(CommandKind::SetLevel(level.unwrap_or(255))),
        (None, Some(level)) => Ok(CommandKind::SetLevel(level)),
        (None, None) => Err(ValidationError::Empty),
    }
}

fn room_kind(body: &CommandPayload) -> Result<CommandKind, ValidationError> {
    if let Some(directive) = body.cover()? {
        return Ok(CommandKind::Cover(directive));
    }
    if let Some(scene) = body.scene()? {
        return Ok(CommandKind::SetScene(scene));
    }
    let level = body.level()?;
    match (body.power()?, level) {
        (Some(Power::Off), _) => Ok(CommandKind::SetScene(0)),
        (Some(Power::On), None) => Ok(CommandKind::SetScene(1)),
        (_, Some(level)) => Ok(CommandKind::SetScene(scene_for_level(level))),
        (None, None) => Err(ValidationError::Empty),
    }
}

/// Consume command messages until the channel closes or the transport fails
pub async fn run_gateway(
    dispatcher: Arc<Dispatcher>,
    mut message_rx: mpsc::Receiver<IncomingMessage>,
) -> Result<(), TransportError> {
    info!("Command gateway ready");

    while let Some(msg) = message_rx.recv().await {
        let command = match parse_command(&msg.topic, &msg.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected command on {}: {}", msg.topic, e);
                continue;
            }
        };

        debug!("Dispatching {}", command);
        if let Err(e) = dispatcher.handle_command(&command).await {
            if e.is_terminal() {
                return Err(e);
            }
        }
    }

    warn!("Command channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(topic: &str, payload: &str) -> Result<Command, ValidationError> {
        parse_command(topic, payload)
    }

    #[test]
    fn test_channel_level_with_transition() {
        let command = parse(
            "rako/room/5/channel/2/set",
            r#"{"state":"ON","brightness":128,"transition":2}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            Command {
                room: 5,
                channel: 2,
                kind: CommandKind::SetLevel(128),
                transition: Some(2.0),
            }
        );
    }

    #[test]
    fn test_channel_state_only() {
        let on = parse("rako/room/5/channel/2/set", r#"{"state":"ON"}"#).unwrap();
        assert_eq!(on.kind, CommandKind::SetLevel(255));
        let off = parse("rako/room/5/channel/2/set", r#"{"state":"off","brightness":40}"#)
            .unwrap();
        assert_eq!(off.kind, CommandKind::SetLevel(0));
    }

    #[test]
    fn test_channel_percentage_and_position() {
        let pct = parse("rako/room/1/channel/1/set", r#"{"percentage":50}"#).unwrap();
        assert_eq!(pct.kind, CommandKind::SetLevel(128));
        let pos = parse("rako/room/8/channel/1/set", r#"{"position":100}"#).unwrap();
        assert_eq!(pos.kind, CommandKind::SetLevel(255));
    }

    #[test]
    fn test_channel_scene() {
        let command = parse("rako/room/5/channel/2/set", r#"{"scene":3,"transition":0}"#).unwrap();
        assert_eq!(command.kind, CommandKind::SetScene(3));
        assert_eq!(command.transition, Some(0.0));
    }

    #[test]
    fn test_room_scene() {
        let command = parse("rako/room/5/set", r#"{"scene":3}"#).unwrap();
        assert_eq!(
            command,
            Command {
                room: 5,
                channel: ALL_CHANNELS,
                kind: CommandKind::SetScene(3),
                transition: None,
            }
        );
    }

    #[test]
    fn test_room_state_and_brightness() {
        let on = parse("rako/room/5/set", r#"{"state":"ON"}"#).unwrap();
        assert_eq!(on.kind, CommandKind::SetScene(1));
        let off = parse("rako/room/5/set", r#"{"state":"OFF"}"#).unwrap();
        assert_eq!(off.kind, CommandKind::SetScene(0));
        let dim = parse("rako/room/5/set", r#"{"state":"ON","brightness":130}"#).unwrap();
        assert_eq!(dim.kind, CommandKind::SetScene(3));
        let low = parse("rako/room/5/set", r#"{"brightness":10}"#).unwrap();
        assert_eq!(low.kind, CommandKind::SetScene(0));
    }

    #[test]
    fn test_scene_buckets() {
        assert_eq!(scene_for_level(255), 1);
        assert_eq!(scene_for_level(200), 2);
        assert_eq!(scene_for_level(128), 3);
        assert_eq!(scene_for_level(64), 4);
        assert_eq!(scene_for_level(63), 0);
    }

    #[test]
    fn test_cover_commands() {
        let open = parse("rako/room/8/channel/1/command", r#"{"command":"OPEN"}"#).unwrap();
        assert_eq!(open.kind, CommandKind::Cover(CoverDirective::Open));
        let bare = parse("rako/room/8/channel/1/command", "STOP").unwrap();
        assert_eq!(bare.kind, CommandKind::Cover(CoverDirective::Stop));
        let quoted = parse("rako/room/8/channel/1/command", "\"close\"").unwrap();
        assert_eq!(quoted.kind, CommandKind::Cover(CoverDirective::Close));
    }

    #[test]
    fn test_unknown_cover_command_rejected() {
        assert_eq!(
            parse("rako/room/8/channel/1/command", r#"{"command":"FOO"}"#),
            Err(ValidationError::UnknownCommand("FOO".to_string()))
        );
        assert!(matches!(
            parse("rako/room/8/channel/1/command", "42"),
            Err(ValidationError::UnknownCommand(_))
        ));
        assert!(matches!(
            parse("rako/room/8/channel/1/set", r#"{"command":"FOO","brightness":10}"#),
            Err(ValidationError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for payload in [
            r#"{"brightness":256}"#,
            r#"{"brightness":-1}"#,
            r#"{"brightness":12.5}"#,
            r#"{"scene":17}"#,
            r#"{"percentage":101}"#,
            r#"{"state":"ON","transition":-1}"#,
        ] {
            assert!(
                matches!(
                    parse("rako/room/5/channel/2/set", payload),
                    Err(ValidationError::OutOfRange { .. })
                ),
                "{} should be rejected",
                payload
            );
        }
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            parse("rako/room/5/channel/2/set", "not json"),
            Err(ValidationError::Payload(_))
        ));
        assert!(matches!(
            parse("rako/room/5/channel/2/set", r#"{"state":"DIM"}"#),
            Err(ValidationError::Payload(_))
        ));
        assert_eq!(
            parse("rako/room/5/channel/2/set", "{}"),
            Err(ValidationError::Empty)
        );
        assert_eq!(parse("rako/room/5/channel/2/set", "  "), Err(ValidationError::Empty));
    }

    #[test]
    fn test_topic_rejections() {
        assert!(matches!(
            parse("rako/room/1020/set", r#"{"scene":1}"#),
            Err(ValidationError::OutOfRange { field: "room", .. })
        ));
        assert!(matches!(
            parse("rako/room/5/state", r#"{"scene":1}"#),
            Err(ValidationError::UnknownTopic(_))
        ));
    }
}

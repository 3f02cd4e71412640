//! Rako bridge wire protocol
//!
//! Binary UDP frames, the ASCII Telnet fallback and fade-rate handling.
//!
//! Frame layout (requests start with `R`, status broadcasts with `S`):
//!
//! ```text
//! [header, count, room_hi, room_lo, channel, command, data..., checksum]
//! ```
//!
//! `count` is the number of bytes following it and the checksum makes the
//! sum of everything after the header zero modulo 256.

use crate::error::DecodeError;
use crate::model::{Command, CommandKind, CoverDirective};

/// UDP and Telnet port of the bridge
pub const BRIDGE_PORT: u16 = 9761;

/// Header byte of a request frame
pub const REQUEST_HEADER: u8 = b'R';

/// Header byte of a status frame
pub const STATUS_HEADER: u8 = b'S';

/// Acknowledgement sent by the bridge for a UDP request
pub const UDP_ACK: &[u8] = b"AOK\r\n";

/// Marker contained in a Telnet acknowledgement
pub const TELNET_ACK: &str = "OK";

/// Broadcast probe payload used for bridge discovery
pub const DISCOVERY_PROBE: &[u8] = b"D";

/// Command opcodes from the RS232/UDP command summary
mod opcode {
    pub const OFF: u8 = 0x00;
    pub const FADE_UP: u8 = 0x01;
    pub const FADE_DOWN: u8 = 0x02;
    pub const SCENE1_LEGACY: u8 = 0x03;
    pub const SCENE4_LEGACY: u8 = 0x06;
    pub const LEVEL_LEGACY: u8 = 0x0C;
    pub const STOP: u8 = 0x0F;
    pub const SET_SCENE: u8 = 0x31;
    pub const BUTTON_PRESS: u8 = 0x33;
    pub const SET_LEVEL: u8 = 0x34;
}

/// Discrete fade rates accepted by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FadeRate {
    Instant = 0,
    Fast = 1,
    Medium = 2,
    Slow = 3,
    VerySlow = 4,
    ExtraSlow = 5,
}

impl FadeRate {
    pub const ALL: [FadeRate; 6] = [
        Self::Instant,
        Self::Fast,
        Self::Medium,
        Self::Slow,
        Self::VerySlow,
        Self::ExtraSlow,
    ];

    /// Parse a configuration name such as `very_slow`
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|rate| rate.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::VerySlow => "very_slow",
            Self::ExtraSlow => "extra_slow",
        }
    }

    /// Approximate fade duration of the bucket
    pub fn nominal_secs(self) -> u8 {
        match self {
            Self::Instant => 0,
            Self::Fast => 2,
            Self::Medium => 4,
            Self::Slow => 8,
            Self::VerySlow => 16,
            Self::ExtraSlow => 32,
        }
    }

    /// Quantize a transition duration to the bucket that covers it
    pub fn from_transition(secs: f64) -> Self {
        if secs <= 0.0 {
            Self::Instant
        } else if secs <= 2.0 {
            Self::Fast
        } else if secs <= 4.0 {
            Self::Medium
        } else if secs <= 8.0 {
            Self::Slow
        } else if secs <= 16.0 {
            Self::VerySlow
        } else {
            Self::ExtraSlow
        }
    }
}

/// How transitions are expressed in the fade byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeEncoding {
    /// Bucket index; the bridge only accepts discrete rates
    Buckets,
    /// Whole seconds, for bridges accepting continuous transitions
    Seconds,
}

/// An encoded command, rendered for both transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Binary UDP datagram
    pub datagram: Vec<u8>,
    /// Telnet command line, without the line terminator
    pub line: String,
}

/// Value carried by a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameValue {
    Level(u8),
    Scene(u8),
    Cover(CoverDirective),
}

/// Auxiliary bits of a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Raw fade byte, zero when the command carries none
    pub fade: u8,
    /// Frame originated from a keypad button press
    pub button_press: bool,
}

/// A parsed inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub room: u16,
    pub channel: u8,
    pub value: FrameValue,
    pub flags: FrameFlags,
}

/// Encoder for outbound commands
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    default_fade: FadeRate,
    encoding: FadeEncoding,
}

impl Codec {
    pub fn new(default_fade: FadeRate, encoding: FadeEncoding) -> Self {
        Self {
            default_fade,
            encoding,
        }
    }

    /// Fade byte for an optional transition in seconds
    pub fn fade_byte(&self, transition: Option<f64>) -> u8 {
        match (self.encoding, transition) {
            (FadeEncoding::Buckets, Some(secs)) => FadeRate::from_transition(secs) as u8,
            (FadeEncoding::Buckets, None) => self.default_fade as u8,
            (FadeEncoding::Seconds, Some(secs)) => secs.round().clamp(0.0, 255.0) as u8,
            (FadeEncoding::Seconds, None) => self.default_fade.nominal_secs(),
        }
    }

    /// Encode a command into its UDP datagram and Telnet line
    pub fn encode(&self, command: &Command) -> Frame {
        let fade = self.fade_byte(command.transition);
        let (opcode, data, action) = match command.kind {
            CommandKind::SetLevel(level) => {
                (opcode::SET_LEVEL, vec![fade, level], format!("LEVEL{:03}", level))
            }
            CommandKind::SetScene(scene) => {
                (opcode::SET_SCENE, vec![fade, scene], format!("SCENE{:02}", scene))
            }
            CommandKind::Cover(directive) => {
                let (opcode, action) = match directive {
                    CoverDirective::Open => (opcode::FADE_UP, "FADEUP"),
                    CoverDirective::Close => (opcode::FADE_DOWN, "FADEDOWN"),
                    CoverDirective::Stop => (opcode::STOP, "STOP"),
                };
                (opcode, vec![0x00], action.to_string())
            }
        };

        Frame {
            datagram: build_datagram(REQUEST_HEADER, command.room, command.channel, opcode, &data),
            line: format!(
                "ROOM{:02},CHANNEL{:02},{}",
                command.room, command.channel, action
            ),
        }
    }
}

/// Assemble a frame with count byte and checksum
fn build_datagram(header: u8, room: u16, channel: u8, opcode: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + data.len());
    frame.push(header);
    frame.push((5 + data.len()) as u8);
    frame.push((room >> 8) as u8);
    frame.push((room & 0xFF) as u8);
    frame.push(channel);
    frame.push(opcode);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame[1..]));
    frame
}

/// Checksum byte over everything after the header
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Decode a status frame broadcast by the bridge
///
/// Request frames from other controllers on the network are rejected; only
/// the bridge's own status reports change device state.
pub fn decode(bytes: &[u8]) -> Result<DecodedFrame, DecodeError> {
    parse_frame(bytes, STATUS_HEADER)
}

/// Decode one of our own request frames
#[cfg(test)]
pub fn decode_request(bytes: &[u8]) -> Result<DecodedFrame, DecodeError> {
    parse_frame(bytes, REQUEST_HEADER)
}

fn parse_frame(bytes: &[u8], accepted: u8) -> Result<DecodedFrame, DecodeError> {
    let header = *bytes.first().ok_or(DecodeError::Empty)?;
    if header != accepted {
        return Err(DecodeError::UnsupportedType(header));
    }

    let count = *bytes.get(1).ok_or(DecodeError::Truncated {
        expected: 7,
        actual: bytes.len(),
    })? as usize;
    // room_hi, room_lo, channel, command and checksum at minimum
    let expected = 2 + count.max(5);
    if bytes.len() < expected || count < 5 {
        return Err(DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    let frame = &bytes[..expected];
    let actual = frame[expected - 1];
    let computed = checksum(&frame[1..expected - 1]);
    if computed != actual {
        return Err(DecodeError::Checksum {
            expected: computed,
            actual,
        });
    }

    let room = (u16::from(frame[2] & 0x03) << 8) | u16::from(frame[3]);
    let channel = frame[4];
    let command = frame[5];
    let data = &frame[6..expected - 1];
    let mut flags = FrameFlags::default();
    if matches!(
        command,
        opcode::SET_LEVEL | opcode::LEVEL_LEGACY | opcode::SET_SCENE
    ) {
        flags.fade = data.first().copied().unwrap_or(0);
    }

    let value = match command {
        opcode::SET_LEVEL | opcode::LEVEL_LEGACY => {
            FrameValue::Level(*data.get(1).ok_or(DecodeError::MissingData(command))?)
        }
        opcode::SET_SCENE => {
            FrameValue::Scene(*data.get(1).ok_or(DecodeError::MissingData(command))?)
        }
        opcode::BUTTON_PRESS => {
            flags.button_press = true;
            FrameValue::Scene(data.last().copied().unwrap_or(0))
        }
        opcode::OFF => FrameValue::Scene(0),
        opcode::SCENE1_LEGACY..=opcode::SCENE4_LEGACY => {
            FrameValue::Scene(command - opcode::SCENE1_LEGACY + 1)
        }
        opcode::FADE_UP => FrameValue::Cover(CoverDirective::Open),
        opcode::FADE_DOWN => FrameValue::Cover(CoverDirective::Close),
        opcode::STOP => FrameValue::Cover(CoverDirective::Stop),
        other => return Err(DecodeError::UnknownCommand(other)),
    };

    Ok(DecodedFrame {
        room,
        channel,
        value,
        flags,
    })
}

/// Build a status frame as the bridge would broadcast it
#[cfg(test)]
pub fn status_frame(room: u16, channel: u8, opcode: u8, data: &[u8]) -> Vec<u8> {
    build_datagram(STATUS_HEADER, room, channel, opcode, data)
}

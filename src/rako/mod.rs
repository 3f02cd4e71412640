//! Rako bridge module - wire codec, transport, discovery and scene cache

mod discovery;
mod protocol;
mod scenes;
mod transport;

pub use discovery::discover;
pub use protocol::{
    decode, Codec, DecodedFrame, FadeEncoding, FadeRate, FrameFlags, FrameValue, BRIDGE_PORT,
};
pub use scenes::{SceneCache, SceneCacheEntry};
pub use transport::{FrameReceiver, Transport, TransportConfig};

#[cfg(test)]
pub use discovery::discover_at;
#[cfg(test)]
pub use protocol::status_frame;

//! Scene cache served by the bridge at `/scenes.htm`
//!
//! The page is a run of 4-hex-digit records, optionally `0x` prefixed. Each
//! record holds the active scene in bits 12-15 and the room in bits 0-9.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::MAX_ROOM_ID;

/// Timeout for one scene cache request
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Active scene of one room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneCacheEntry {
    pub room: u16,
    pub scene: u8,
}

/// HTTP reader for the bridge's scene cache
#[derive(Debug, Clone)]
pub struct SceneCache {
    client: reqwest::Client,
    url: String,
}

impl SceneCache {
    pub fn new(bridge: IpAddr) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("http://{}/scenes.htm", bridge),
        })
    }

    /// Fetch and parse the current scene cache
    pub async fn fetch(&self) -> Result<Vec<SceneCacheEntry>, TransportError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        debug!("Scene cache is {} bytes", body.len());
        Ok(parse_scene_cache(&body))
    }
}

/// Parse the scene cache page
///
/// Room 0 and reserved rooms are skipped, as are records that are not hex.
pub fn parse_scene_cache(content: &str) -> Vec<SceneCacheEntry> {
    let digits: Vec<char> = content
        .replace("0x", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    digits
        .chunks_exact(4)
        .filter_map(|chunk| {
            let record: String = chunk.iter().collect();
            match u16::from_str_radix(&record, 16) {
                Ok(value) => Some(SceneCacheEntry {
                    room: value & 0x03FF,
                    scene: (value >> 12) as u8,
                }),
                Err(_) => {
                    warn!("Invalid scene cache record {:?}", record);
                    None
                }
            }
        })
        .filter(|entry| entry.room != 0 && entry.room <= MAX_ROOM_ID)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records() {
        assert_eq!(
            parse_scene_cache("0x10063004"),
            vec![
                SceneCacheEntry { room: 6, scene: 1 },
                SceneCacheEntry { room: 4, scene: 3 },
            ]
        );
    }

    #[test]
    fn test_parse_extended_rooms_and_high_scenes() {
        // room bits 0-9, bits 10-11 unused
        assert_eq!(
            parse_scene_cache("F3FB0C01"),
            vec![
                SceneCacheEntry { room: 1019, scene: 15 },
                SceneCacheEntry { room: 1, scene: 0 },
            ]
        );
    }

    #[test]
    fn test_parse_skips_padding_reserved_and_garbage() {
        assert_eq!(
            parse_scene_cache("0x0000 23FC zz12 2005\n10"),
            vec![SceneCacheEntry { room: 5, scene: 2 }]
        );
        assert!(parse_scene_cache("").is_empty());
    }

    #[test]
    fn test_url() {
        let cache = SceneCache::new(IpAddr::from([192, 168, 1, 40])).unwrap();
        assert_eq!(cache.url, "http://192.168.1.40/scenes.htm");
    }
}

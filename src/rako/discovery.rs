//! Broadcast discovery of the bridge on the local network

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::{BRIDGE_PORT, DISCOVERY_PROBE};

/// Probes sent before giving up
const DISCOVERY_ATTEMPTS: u32 = 3;

/// Broadcast a probe on the control port and adopt the first responder
///
/// Returns `None` when nothing answers within `wait`.
pub async fn discover(wait: Duration) -> Option<IpAddr> {
    discover_at(SocketAddr::from((Ipv4Addr::BROADCAST, BRIDGE_PORT)), wait).await
}

/// Probe a specific address; used by [`discover`] with the broadcast address
pub async fn discover_at(target: SocketAddr, wait: Duration) -> Option<IpAddr> {
    match probe(target, wait).await {
        Ok(found) => found,
        Err(e) => {
            warn!("Bridge discovery failed: {}", e);
            None
        }
    }
}

async fn probe(target: SocketAddr, wait: Duration) -> io::Result<Option<IpAddr>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let per_attempt = wait / DISCOVERY_ATTEMPTS;
    let mut buf = [0u8; 256];
    for attempt in 1..=DISCOVERY_ATTEMPTS {
        debug!("Broadcasting discovery probe #{} to {}", attempt, target);
        socket.send_to(DISCOVERY_PROBE, target).await?;

        match timeout(per_attempt, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                info!("Found Rako bridge at {}", from.ip());
                debug!("Discovery reply: {:?}", String::from_utf8_lossy(&buf[..len]));
                return Ok(Some(from.ip()));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => debug!("No bridge answered probe #{}", attempt),
        }
    }
    Ok(None)
}

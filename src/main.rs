//! rako-mqttd - MQTT bridge for Rako lighting bridges
//!
//! - Finds the bridge by UDP broadcast when no address is configured
//! - Loads the room/channel/scene topology from the bridge's `rako.xml`
//! - Sends MQTT commands to the bridge over UDP, falling back to Telnet
//! - Publishes status broadcasts as retained JSON state
//! - Polls the bridge's scene cache so room scenes are known after a restart
//! - Publishes Home Assistant discovery and bridge availability

mod config;
mod dispatcher;
mod error;
mod model;
mod mqtt;
mod rako;
mod state;
mod topology;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RakoConfig};
use crate::dispatcher::{
    run_frame_loop, run_liveness_monitor, run_scene_cache_monitor, Dispatcher,
};
use crate::error::{DiscoveryError, Error, Result, TransportError};
use crate::mqtt::{run_event_loop, run_gateway, DiscoveryBuilder, MqttClient, Publisher};
use crate::rako::{discover, Codec, SceneCache, Transport, TransportConfig};
use crate::topology::{Topology, TopologySource};

/// How long the MQTT client gets to flush the final publishes
const MQTT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var("DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
        {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    if config.debug {
        info!("Debug mode enabled");
    }

    let bridge = resolve_bridge(&config.rako, discover).await?;
    info!("Using Rako bridge at {}", bridge);

    let source = match &config.rako.topology_file {
        Some(path) => TopologySource::File(path.clone()),
        None => TopologySource::Bridge(bridge),
    };
    let topology = Arc::new(Topology::load(&source).await?);

    let mut transport = Transport::new(TransportConfig::new(bridge, config.rako.port));
    transport.open().await?;

    let dispatcher = Arc::new(Dispatcher::new(
        Codec::new(config.rako.default_fade, config.rako.fade_encoding),
        transport,
        Arc::clone(&topology),
        config.rako.liveness_window,
        config.rako.shutdown_grace,
    ));
    let snapshot = dispatcher.bridge().await;
    info!(
        "Bridge {} reachable over {} (online: {})",
        snapshot.host, snapshot.mode, snapshot.online
    );
    let receiver = dispatcher
        .receiver()
        .await
        .ok_or(TransportError::NotConnected)?;

    // Create MQTT client
    let (mqtt_client, eventloop) = MqttClient::new(&config.mqtt, &config.client_id())?;
    let mqtt_client = Arc::new(mqtt_client);
    let (message_tx, message_rx) = mpsc::channel(100);

    let mut eventloop_handle = tokio::spawn(run_event_loop(
        eventloop,
        mqtt_client.clone_client(),
        dispatcher.online_flag(),
        message_tx,
    ));

    let discovery = DiscoveryBuilder::new(&config.mqtt.discovery_prefix, &topology, bridge)
        .configs(&topology)?;
    Publisher::new(&mqtt_client).publish_configs(&discovery).await;
    info!("Published {} discovery configs", discovery.len());

    let mut gateway_handle = tokio::spawn(run_gateway(Arc::clone(&dispatcher), message_rx));
    let mut frame_handle = tokio::spawn(run_frame_loop(
        Arc::clone(&dispatcher),
        receiver,
        Arc::clone(&mqtt_client),
    ));

    let mut liveness_handle: Option<JoinHandle<()>> = if config.rako.liveness_window.is_zero() {
        info!("Liveness check disabled");
        None
    } else {
        Some(tokio::spawn(run_liveness_monitor(
            Arc::clone(&dispatcher),
            config.rako.liveness_window,
            Arc::clone(&mqtt_client),
        )))
    };

    let mut scene_cache_handle: Option<JoinHandle<()>> =
        if config.rako.scene_cache_interval.is_zero() {
            info!("Scene cache polling disabled");
            None
        } else {
            Some(tokio::spawn(run_scene_cache_monitor(
                Arc::clone(&dispatcher),
                SceneCache::new(bridge)?,
                config.rako.scene_cache_interval,
                Arc::clone(&mqtt_client),
            )))
        };

    info!("rako-mqttd started");

    // Wait for a shutdown signal or for any task to end (which means something went wrong)
    let outcome = tokio::select! {
        result = &mut gateway_handle => match result {
            Ok(Ok(())) => Err(Error::TaskExited("command gateway")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => {
                error!("Command gateway task failed: {}", e);
                Err(Error::TaskExited("command gateway"))
            }
        },
        _ = &mut eventloop_handle => Err(Error::TaskExited("MQTT event loop")),
        _ = &mut frame_handle => Err(Error::TaskExited("status frame loop")),
        _ = join_optional(&mut liveness_handle) => Err(Error::TaskExited("liveness monitor")),
        _ = join_optional(&mut scene_cache_handle) => Err(Error::TaskExited("scene cache monitor")),
        result = shutdown_signal() => match result {
            Ok(()) => {
                info!("Received shutdown signal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    };

    // Cleanup: in-flight sends get the grace period before the transport closes
    dispatcher.shutdown().await;
    gateway_handle.abort();
    frame_handle.abort();
    for handle in [liveness_handle, scene_cache_handle].into_iter().flatten() {
        handle.abort();
    }

    let publisher = Publisher::new(&mqtt_client);
    if let Err(e) = publisher.publish_availability(false).await {
        warn!("Failed to publish offline status: {}", e);
    }
    if let Err(e) = mqtt_client.disconnect().await {
        warn!("Failed to disconnect from MQTT broker: {}", e);
    }
    if !eventloop_handle.is_finished()
        && timeout(MQTT_FLUSH_TIMEOUT, &mut eventloop_handle).await.is_err()
    {
        warn!("MQTT client did not flush before shutdown");
        eventloop_handle.abort();
    }

    outcome
}

/// Wait on an optional background task; never resolves when it is absent
async fn join_optional(handle: &mut Option<JoinHandle<()>>) {
    match handle {
        Some(handle) => {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
        None => std::future::pending().await,
    }
}

/// Use the configured bridge address, or discover one on the network
async fn resolve_bridge<F, Fut>(rako: &RakoConfig, discover: F) -> Result<IpAddr>
where
    F: FnOnce(Duration) -> Fut,
    Fut: Future<Output = Option<IpAddr>>,
{
    if let Some(host) = rako.host {
        return Ok(host);
    }
    info!("No bridge address configured, broadcasting for one");
    discover(rako.discovery_timeout)
        .await
        .ok_or_else(|| DiscoveryError::NotFound(rako.discovery_timeout.as_secs()).into())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    use tokio::net::UdpSocket;

    use crate::rako::{discover_at, FadeEncoding, FadeRate, BRIDGE_PORT};

    fn rako_config(host: Option<IpAddr>) -> RakoConfig {
        RakoConfig {
            host,
            port: BRIDGE_PORT,
            topology_file: None,
            default_fade: FadeRate::Medium,
            fade_encoding: FadeEncoding::Buckets,
            discovery_timeout: Duration::from_millis(300),
            liveness_window: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(3),
            scene_cache_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_no_bridge_found_is_fatal() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let started = Instant::now();
        let result = resolve_bridge(&rako_config(None), |wait| discover_at(target, wait)).await;
        assert!(matches!(
            result,
            Err(Error::Discovery(DiscoveryError::NotFound(_)))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_configured_bridge_skips_discovery() {
        let host = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40));
        // discovery finding nothing would be an error
        let result =
            resolve_bridge(&rako_config(Some(host)), |_| std::future::ready(None)).await;
        assert_eq!(result.unwrap(), host);
    }

    #[tokio::test]
    async fn test_discovered_bridge_is_used() {
        let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = bridge.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            if let Ok((_, from)) = bridge.recv_from(&mut buf).await {
                let _ = bridge.send_to(b"RAKOBRIDGE", from).await;
            }
        });

        let result = resolve_bridge(&rako_config(None), |wait| discover_at(target, wait)).await;
        assert_eq!(result.unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}

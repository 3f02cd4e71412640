//! Dispatcher between MQTT and the Rako bridge
//!
//! Commands are encoded and sent under a single transport lock, so frames
//! never interleave on the wire and at most one send per target is in
//! flight. Status frames are decoded and applied to the state store in
//! receive order. A liveness tracker reports the bridge offline after a
//! window without any valid frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, TransportError};
use crate::model::{Bridge, Command, ALL_CHANNELS};
use crate::mqtt::{MqttClient, Publisher};
use crate::rako::{
    decode, Codec, DecodedFrame, FrameFlags, FrameReceiver, FrameValue, SceneCache,
    SceneCacheEntry, Transport,
};
use crate::state::{DeviceStateStore, StateUpdate};
use crate::topology::Topology;

/// How long one receive call waits before looping
const RECEIVE_WAIT: Duration = Duration::from_secs(5);

/// Pause after a receive error before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the liveness check period
const MAX_LIVENESS_PERIOD: Duration = Duration::from_secs(30);

/// Result of handling one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The bridge had been marked offline and this frame revived it
    pub came_online: bool,
    /// State to publish, when anything changed
    pub update: Option<StateUpdate>,
}

/// Tracks when the bridge was last heard from
struct Liveness {
    window: Duration,
    last_frame: Mutex<Instant>,
    online: Arc<AtomicBool>,
}

impl Liveness {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_frame: Mutex::new(Instant::now()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Record a valid frame; returns whether the bridge was offline
    fn heard(&self) -> bool {
        let mut last_frame = self.last_frame.lock().unwrap_or_else(PoisonError::into_inner);
        *last_frame = Instant::now();
        !self.online.swap(true, Ordering::SeqCst)
    }

    /// Go offline if the window has passed, running `on_expire` on the transition
    ///
    /// The frame timestamp stays locked until the flag and `on_expire` are
    /// done, so a concurrent `heard` always lands after and wins.
    fn expire<F: FnOnce() -> usize>(&self, on_expire: F) -> Option<usize> {
        let last_frame = self.last_frame.lock().unwrap_or_else(PoisonError::into_inner);
        if self.window.is_zero() || last_frame.elapsed() < self.window {
            return None;
        }
        if !self.online.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(on_expire())
    }
}

/// Single coordination point between MQTT and the bridge
pub struct Dispatcher {
    codec: Codec,
    topology: Arc<Topology>,
    link: AsyncMutex<Transport>,
    store: DeviceStateStore,
    liveness: Liveness,
    grace: Duration,
}

impl Dispatcher {
    pub fn new(
        codec: Codec,
        transport: Transport,
        topology: Arc<Topology>,
        liveness_window: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            codec,
            link: AsyncMutex::new(transport),
            store: DeviceStateStore::new(Arc::clone(&topology)),
            topology,
            liveness: Liveness::new(liveness_window),
            grace,
        }
    }

    /// Shared flag read by the MQTT event loop on reconnect
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.liveness.online)
    }

    pub fn is_online(&self) -> bool {
        self.liveness.online.load(Ordering::SeqCst)
    }

    /// Snapshot of the bridge
    pub async fn bridge(&self) -> Bridge {
        let link = self.link.lock().await;
        Bridge {
            host: link.bridge(),
            mode: link.mode(),
            online: self.is_online(),
        }
    }

    /// Status frame reader of the underlying transport
    pub async fn receiver(&self) -> Option<FrameReceiver> {
        self.link.lock().await.receiver()
    }

    /// Encode and send one command
    ///
    /// Sends are serialized through the transport lock. Failures are logged
    /// here; only a terminal error should stop the caller.
    pub async fn handle_command(&self, command: &Command) -> Result<(), TransportError> {
        let frame = self.codec.encode(command);
        let mut link = self.link.lock().await;
        self.store.note_command(command);

        match link.send(&frame).await {
            Ok(()) => {
                info!("Sent {} via {}", command, link.mode());
                Ok(())
            }
            Err(e) => {
                if e.is_terminal() {
                    error!("Bridge transport failed sending {}: {}", command, e);
                } else {
                    warn!("Failed to send {}: {}", command, e);
                }
                Err(e)
            }
        }
    }

    /// Decode one inbound frame and apply it to the state store
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<Inbound, DecodeError> {
        let frame = decode(bytes)?;
        debug!(
            "Status for room {} channel {} ({:?}): {:?}",
            frame.room,
            frame.channel,
            self.topology.device_type(frame.room, frame.channel),
            frame.value
        );
        let came_online = self.liveness.heard();
        if came_online {
            info!("Bridge is back online");
        }

        let changed = self.store.apply(&frame);
        // button presses are events, published even when state is unchanged
        let update = if changed || frame.flags.button_press {
            self.store
                .get(frame.room, frame.channel)
                .map(|state| StateUpdate {
                    room: frame.room,
                    channel: frame.channel,
                    state,
                    button_press: frame.flags.button_press,
                })
        } else {
            None
        };

        Ok(Inbound {
            came_online,
            update,
        })
    }

    /// Mark the bridge offline once the liveness window has passed
    ///
    /// Returns true only on the transition to offline.
    pub fn check_liveness(&self) -> bool {
        match self.liveness.expire(|| self.store.mark_stale()) {
            Some(stale) => {
                warn!(
                    "No frames from the bridge for {}s, marking offline ({} devices stale)",
                    self.liveness.window.as_secs(),
                    stale
                );
                true
            }
            None => false,
        }
    }

    /// Apply the bridge's scene cache as room-wide scene reports
    ///
    /// Returns the rooms whose state changed.
    pub fn apply_scene_cache(&self, entries: &[SceneCacheEntry]) -> Vec<StateUpdate> {
        entries
            .iter()
            .filter_map(|entry| {
                let frame = DecodedFrame {
                    room: entry.room,
                    channel: ALL_CHANNELS,
                    value: FrameValue::Scene(entry.scene),
                    flags: FrameFlags::default(),
                };
                if !self.store.apply(&frame) {
                    return None;
                }
                self.store.get(entry.room, ALL_CHANNELS).map(|state| StateUpdate {
                    room: entry.room,
                    channel: ALL_CHANNELS,
                    state,
                    button_press: false,
                })
            })
            .collect()
    }

    /// Let an in-flight send finish within the grace period, then close
    pub async fn shutdown(&self) {
        match timeout(self.grace, self.link.lock()).await {
            Ok(mut link) => link.close().await,
            Err(_) => warn!(
                "In-flight send still running after {}s, abandoning it",
                self.grace.as_secs()
            ),
        }
    }
}

/// Receive status frames and publish the resulting state changes
pub async fn run_frame_loop(
    dispatcher: Arc<Dispatcher>,
    receiver: FrameReceiver,
    mqtt_client: Arc<MqttClient>,
) {
    let publisher = Publisher::new(&mqtt_client);
    match receiver.local_addr() {
        Ok(addr) => info!("Listening for bridge status frames on {}", addr),
        Err(e) => warn!("Status listener address unavailable: {}", e),
    }

    loop {
        let bytes = match receiver.receive(RECEIVE_WAIT).await {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                warn!("Failed to receive status frame: {}", e);
                sleep(RECEIVE_BACKOFF).await;
                continue;
            }
        };

        let inbound = match dispatcher.handle_frame(&bytes) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("Discarding frame {:02x?}: {}", bytes, e);
                continue;
            }
        };

        if inbound.came_online {
            if let Err(e) = publisher.publish_availability(true).await {
                error!("Failed to publish availability: {}", e);
            }
        }
        if let Some(update) = inbound.update {
            if let Err(e) = publisher.publish_state(&update).await {
                error!(
                    "Failed to publish state for room {} channel {}: {}",
                    update.room, update.channel, e
                );
            }
        }
    }
}

/// Periodically check liveness and publish `offline` when the bridge goes quiet
pub async fn run_liveness_monitor(
    dispatcher: Arc<Dispatcher>,
    window: Duration,
    mqtt_client: Arc<MqttClient>,
) {
    let period = (window / 4).clamp(Duration::from_secs(1), MAX_LIVENESS_PERIOD);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let publisher = Publisher::new(&mqtt_client);

    loop {
        ticker.tick().await;
        if dispatcher.check_liveness() {
            if let Err(e) = publisher.publish_availability(false).await {
                error!("Failed to publish availability: {}", e);
            }
        }
    }
}

/// Poll the bridge's scene cache and publish rooms whose scene changed
///
/// The first poll runs immediately so room state is known after a restart.
pub async fn run_scene_cache_monitor(
    dispatcher: Arc<Dispatcher>,
    cache: SceneCache,
    period: Duration,
    mqtt_client: Arc<MqttClient>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let publisher = Publisher::new(&mqtt_client);

    loop {
        ticker.tick().await;
        let entries = match cache.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read scene cache: {}", e);
                continue;
            }
        };

        for update in dispatcher.apply_scene_cache(&entries) {
            debug!(
                "Scene cache: room {} is on scene {:?}",
                update.room, update.state.scene
            );
            if let Err(e) = publisher.publish_state(&update).await {
                error!("Failed to publish state for room {}: {}", update.room, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::mpsc;

    use crate::model::TransportMode;
    use crate::mqtt::{parse_command, run_gateway, IncomingMessage};
    use crate::rako::{status_frame, FadeEncoding, FadeRate, TransportConfig};

    const XML: &str = r#"<rako><Room id="5"><Title>Kitchen</Title><Type>Lights</Type>
        <Scene id="3"><Name>Evening</Name></Scene>
        <Channel id="1"><Levels>FF00A000</Levels></Channel>
        <Channel id="2"><Levels>FFC08040</Levels></Channel>
    </Room></rako>"#;

    const SET_LEVEL: u8 = 0x34;
    const SET_SCENE: u8 = 0x31;
    const BUTTON_PRESS: u8 = 0x33;

    fn transport_config(udp_port: u16, telnet_port: u16) -> TransportConfig {
        TransportConfig {
            bridge: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port,
            telnet_port,
            listen_port: 0,
            ack_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(5),
            udp_failure_threshold: 3,
            telnet_connect_attempts: 3,
            retry_budget: 8,
        }
    }

    fn dispatcher(transport: Transport, window: Duration) -> Dispatcher {
        Dispatcher::new(
            Codec::new(FadeRate::Medium, FadeEncoding::Buckets),
            transport,
            Arc::new(Topology::parse(XML).unwrap()),
            window,
            Duration::from_millis(100),
        )
    }

    /// Fake bridge acking every datagram and reporting what it received
    async fn acking_bridge() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let _ = tx.send(buf[..len].to_vec());
                let _ = socket.send_to(b"AOK\r\n", from).await;
            }
        });
        (port, rx)
    }

    async fn open_dispatcher(port: u16) -> Dispatcher {
        let mut transport = Transport::new(transport_config(port, port));
        transport.open().await.unwrap();
        dispatcher(transport, Duration::from_secs(900))
    }

    fn idle_dispatcher(window: Duration) -> Dispatcher {
        dispatcher(Transport::new(transport_config(1, 1)), window)
    }

    #[tokio::test]
    async fn test_level_command_and_status_round_trip() {
        let (port, mut sent) = acking_bridge().await;
        let dispatcher = open_dispatcher(port).await;

        let command = parse_command(
            "rako/room/5/channel/2/set",
            r#"{"state":"ON","brightness":128,"transition":2}"#,
        )
        .unwrap();
        dispatcher.handle_command(&command).await.unwrap();

        let datagram = sent.recv().await.unwrap();
        assert_eq!(&datagram[2..8], &[0x00, 0x05, 0x02, SET_LEVEL, FadeRate::Fast as u8, 128]);
        assert!(sent.try_recv().is_err(), "exactly one frame expected");

        let inbound = dispatcher
            .handle_frame(&status_frame(5, 2, SET_LEVEL, &[FadeRate::Fast as u8, 128]))
            .unwrap();
        assert!(!inbound.came_online);
        let update = inbound.update.unwrap();
        assert_eq!((update.room, update.channel), (5, 2));
        assert_eq!(update.state.level, Some(128));
    }

    #[tokio::test]
    async fn test_room_scene_updates_each_channel() {
        let (port, mut sent) = acking_bridge().await;
        let dispatcher = open_dispatcher(port).await;

        let command = parse_command("rako/room/5/set", r#"{"scene":3}"#).unwrap();
        assert_eq!(command.channel, ALL_CHANNELS);
        dispatcher.handle_command(&command).await.unwrap();

        let datagram = sent.recv().await.unwrap();
        assert_eq!(datagram[4], ALL_CHANNELS);
        assert_eq!(datagram[5], SET_SCENE);
        assert_eq!(datagram[7], 3);
        assert!(sent.try_recv().is_err());

        for (channel, level) in [(1, 0xA0), (2, 0x80)] {
            let update = dispatcher
                .handle_frame(&status_frame(5, channel, SET_SCENE, &[0, 3]))
                .unwrap()
                .update
                .unwrap();
            assert_eq!(update.channel, channel);
            assert_eq!(update.state.scene, Some(3));
            assert_eq!(update.state.level, Some(level));
        }
    }

    #[tokio::test]
    async fn test_cover_command_frame() {
        let (port, mut sent) = acking_bridge().await;
        let dispatcher = open_dispatcher(port).await;

        let command = parse_command("rako/room/8/channel/1/command", r#"{"command":"OPEN"}"#)
            .unwrap();
        dispatcher.handle_command(&command).await.unwrap();
        let datagram = sent.recv().await.unwrap();
        assert_eq!(&datagram[2..6], &[0x00, 0x08, 0x01, 0x01]);
    }

    #[test]
    fn test_duplicate_frame_is_not_republished() {
        let dispatcher = idle_dispatcher(Duration::from_secs(900));
        let frame = status_frame(5, 2, SET_LEVEL, &[0, 40]);
        assert!(dispatcher.handle_frame(&frame).unwrap().update.is_some());
        assert!(dispatcher.handle_frame(&frame).unwrap().update.is_none());
    }

    #[test]
    fn test_button_press_always_published() {
        let dispatcher = idle_dispatcher(Duration::from_secs(900));
        let frame = status_frame(5, 0, BUTTON_PRESS, &[0, 1]);
        for _ in 0..2 {
            let update = dispatcher.handle_frame(&frame).unwrap().update.unwrap();
            assert!(update.button_press);
            assert_eq!(update.state.scene, Some(1));
        }
    }

    #[test]
    fn test_malformed_frame_leaves_state_alone() {
        let dispatcher = idle_dispatcher(Duration::from_secs(900));
        let mut frame = status_frame(5, 2, SET_LEVEL, &[0, 40]);
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            dispatcher.handle_frame(&frame),
            Err(DecodeError::Checksum { .. })
        ));
        assert!(dispatcher.handle_frame(&[]).is_err());
        assert_eq!(dispatcher.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_window() {
        let dispatcher = idle_dispatcher(Duration::from_secs(60));
        dispatcher
            .handle_frame(&status_frame(5, 2, SET_LEVEL, &[0, 40]))
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!dispatcher.check_liveness());
        assert!(dispatcher.is_online());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(dispatcher.check_liveness());
        assert!(!dispatcher.check_liveness(), "offline is reported once");
        assert!(!dispatcher.is_online());
        assert!(!dispatcher.store.get(5, 2).unwrap().online);

        // the next valid frame restores online status
        let inbound = dispatcher
            .handle_frame(&status_frame(5, 2, SET_LEVEL, &[0, 40]))
            .unwrap();
        assert!(inbound.came_online);
        assert!(inbound.update.is_some());
        assert!(dispatcher.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_after_window_keeps_bridge_online() {
        let dispatcher = idle_dispatcher(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;

        // a frame lands before the monitor gets to run
        let inbound = dispatcher
            .handle_frame(&status_frame(5, 2, SET_LEVEL, &[0, 40]))
            .unwrap();
        assert!(!inbound.came_online);
        assert!(!dispatcher.check_liveness());
        assert!(dispatcher.is_online());
        assert!(dispatcher.store.get(5, 2).unwrap().online);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(dispatcher.check_liveness());
        let inbound = dispatcher
            .handle_frame(&status_frame(5, 2, SET_LEVEL, &[0, 40]))
            .unwrap();
        assert!(inbound.came_online);
        assert!(dispatcher.store.get(5, 2).unwrap().online);
        assert!(!dispatcher.check_liveness());
    }

    #[test]
    fn test_scene_cache_updates_rooms() {
        let dispatcher = idle_dispatcher(Duration::from_secs(900));
        let entries = [
            SceneCacheEntry { room: 5, scene: 3 },
            SceneCacheEntry { room: 9, scene: 0 },
        ];

        let updates = dispatcher.apply_scene_cache(&entries);
        assert_eq!(updates.len(), 2);
        assert_eq!((updates[0].room, updates[0].channel), (5, ALL_CHANNELS));
        assert_eq!(updates[0].state.scene, Some(3));
        assert!(!updates[0].is_transient());
        assert_eq!(updates[1].state.level, Some(0));

        // unchanged rooms are not republished
        assert!(dispatcher.apply_scene_cache(&entries).is_empty());

        let updates = dispatcher.apply_scene_cache(&[SceneCacheEntry { room: 5, scene: 1 }]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state.scene, Some(1));
        assert_eq!(updates[0].state.level, Some(255));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_disabled() {
        let dispatcher = idle_dispatcher(Duration::ZERO);
        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert!(!dispatcher.check_liveness());
        assert!(dispatcher.is_online());
    }

    #[tokio::test]
    async fn test_failed_transport_stops_gateway() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = silent.local_addr().unwrap().port();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut transport = Transport::new(transport_config(udp_port, tcp_port));
        transport.open().await.unwrap();
        let dispatcher = Arc::new(dispatcher(transport, Duration::from_secs(900)));

        let (tx, rx) = mpsc::channel(4);
        tx.send(IncomingMessage {
            topic: "rako/room/5/channel/2/set".to_string(),
            payload: r#"{"brightness":10}"#.to_string(),
        })
        .await
        .unwrap();

        let result = run_gateway(Arc::clone(&dispatcher), rx).await;
        assert!(matches!(result, Err(e) if e.is_terminal()));
        assert_eq!(dispatcher.bridge().await.mode, TransportMode::Failed);
    }

    #[tokio::test]
    async fn test_invalid_command_sends_nothing() {
        let (port, mut sent) = acking_bridge().await;
        let dispatcher = Arc::new(open_dispatcher(port).await);

        let (tx, rx) = mpsc::channel(4);
        tx.send(IncomingMessage {
            topic: "rako/room/8/channel/1/command".to_string(),
            payload: r#"{"command":"FOO"}"#.to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        run_gateway(Arc::clone(&dispatcher), rx).await.unwrap();
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let (port, _sent) = acking_bridge().await;
        let dispatcher = open_dispatcher(port).await;
        assert!(dispatcher.receiver().await.is_some());

        dispatcher.shutdown().await;
        let bridge = dispatcher.bridge().await;
        assert_eq!(bridge.mode, TransportMode::Disconnected);
        assert_eq!(bridge.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(dispatcher.receiver().await.is_none());
    }
}

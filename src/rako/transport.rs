//! Connection to the Rako bridge
//!
//! Commands go out as UDP datagrams acknowledged with `AOK`. After a run of
//! unacknowledged sends the transport falls back to the Telnet interface on
//! the same bridge and stays there. Status broadcasts are always read from
//! the UDP listener.
//!
//! ```text
//! Disconnected --open--> Udp --N failures--> Telnet --close--> Disconnected
//!                         |                    |
//!                         +---- budget spent --+--> Failed (terminal)
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::model::TransportMode;

use super::protocol::{Frame, TELNET_ACK, UDP_ACK};

/// Largest datagram the bridge sends
const MAX_DATAGRAM: usize = 256;

/// Connection and retry settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bridge: IpAddr,
    /// UDP command port of the bridge
    pub udp_port: u16,
    /// TCP port of the Telnet interface
    pub telnet_port: u16,
    /// Local port receiving status broadcasts
    pub listen_port: u16,
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
    /// Fixed pause between attempts
    pub retry_backoff: Duration,
    /// Consecutive UDP failures before switching to Telnet
    pub udp_failure_threshold: u32,
    /// Consecutive Telnet connect failures before giving up
    pub telnet_connect_attempts: u32,
    /// Consecutive failures across both modes before giving up
    pub retry_budget: u32,
}

impl TransportConfig {
    pub fn new(bridge: IpAddr, port: u16) -> Self {
        Self {
            bridge,
            udp_port: port,
            telnet_port: port,
            listen_port: port,
            ack_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            udp_failure_threshold: 3,
            telnet_connect_attempts: 3,
            retry_budget: 8,
        }
    }
}

/// Reader half for inbound status frames
#[derive(Clone)]
pub struct FrameReceiver {
    socket: Arc<UdpSocket>,
}

impl FrameReceiver {
    /// Wait for the next datagram, up to `wait`
    pub async fn receive(&self, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                debug!("Received {} bytes from {}: {:02x?}", len, from, &buf[..len]);
                Ok(buf[..len].to_vec())
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

/// The single logical connection to the bridge
pub struct Transport {
    config: TransportConfig,
    mode: TransportMode,
    socket: Option<UdpSocket>,
    listener: Option<Arc<UdpSocket>>,
    telnet: Option<TcpStream>,
    udp_failures: u32,
    connect_failures: u32,
    consecutive_failures: u32,
}

impl Transport {
    /// Create a transport (does not bind immediately)
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            mode: TransportMode::Disconnected,
            socket: None,
            listener: None,
            telnet: None,
            udp_failures: 0,
            connect_failures: 0,
            consecutive_failures: 0,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn bridge(&self) -> IpAddr {
        self.config.bridge
    }

    /// Bind the command socket and the status listener
    pub async fn open(&mut self) -> Result<(), TransportError> {
        match self.mode {
            TransportMode::Failed => return Err(TransportError::Failed),
            TransportMode::Udp | TransportMode::Telnet => return Ok(()),
            TransportMode::Disconnected => {}
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port)).await?;
        listener.set_broadcast(true)?;
        info!(
            "Bridge transport open: commands to {}:{}, status on {}",
            self.config.bridge,
            self.config.udp_port,
            listener.local_addr()?
        );

        self.socket = Some(socket);
        self.listener = Some(Arc::new(listener));
        self.mode = TransportMode::Udp;
        self.reset_failures();
        Ok(())
    }

    /// Status frame reader; `None` until the transport is open
    pub fn receiver(&self) -> Option<FrameReceiver> {
        self.listener.as_ref().map(|socket| FrameReceiver {
            socket: Arc::clone(socket),
        })
    }

    /// Deliver a frame, retrying and falling back as needed
    ///
    /// The frame carries both renderings, so a switch to Telnet mid-send
    /// delivers the same command without involving the caller.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        loop {
            let attempt = match self.mode {
                TransportMode::Failed => return Err(TransportError::Failed),
                TransportMode::Disconnected => return Err(TransportError::NotConnected),
                TransportMode::Udp => self.send_udp(frame).await,
                TransportMode::Telnet => self.send_telnet(frame).await,
            };

            match attempt {
                Ok(()) => {
                    self.reset_failures();
                    return Ok(());
                }
                Err(e) => self.record_failure(&e)?,
            }

            sleep(self.config.retry_backoff).await;
        }
    }

    async fn send_udp(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let target = SocketAddr::new(self.config.bridge, self.config.udp_port);

        debug!("Sending UDP frame to {}: {:02x?}", target, frame.datagram);
        socket.send_to(&frame.datagram, target).await?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let reply = timeout(self.config.ack_timeout, async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from.ip() == self.config.bridge {
                    return Ok::<_, std::io::Error>(len);
                }
                debug!("Ignoring datagram from {}", from);
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        if &buf[..reply] == UDP_ACK {
            debug!("Command acknowledged");
        } else {
            warn!(
                "Unexpected reply to {:02x?}: {:?}",
                frame.datagram,
                String::from_utf8_lossy(&buf[..reply])
            );
        }
        Ok(())
    }

    async fn send_telnet(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.telnet.is_none() {
            let stream = self.connect_telnet().await?;
            self.connect_failures = 0;
            self.telnet = Some(stream);
        }
        let stream = self.telnet.as_mut().ok_or(TransportError::NotConnected)?;

        let result = exchange_line(stream, &frame.line, self.config.ack_timeout).await;
        if result.is_err() {
            // partial replies may be left in the stream
            self.telnet = None;
        }
        result
    }

    async fn connect_telnet(&self) -> Result<TcpStream, TransportError> {
        let addr = SocketAddr::new(self.config.bridge, self.config.telnet_port);
        info!("Connecting to bridge Telnet interface at {}", addr);
        timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionFailed("connection timeout".to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    fn reset_failures(&mut self) {
        self.udp_failures = 0;
        self.connect_failures = 0;
        self.consecutive_failures = 0;
    }

    /// Count a failed attempt and escalate the state machine
    fn record_failure(&mut self, error: &TransportError) -> Result<(), TransportError> {
        self.consecutive_failures += 1;
        warn!(
            "{} send attempt failed ({} consecutive): {}",
            self.mode, self.consecutive_failures, error
        );

        match self.mode {
            TransportMode::Udp => {
                self.udp_failures += 1;
                if self.udp_failures >= self.config.udp_failure_threshold {
                    warn!(
                        "{} consecutive UDP failures, falling back to Telnet",
                        self.udp_failures
                    );
                    self.mode = TransportMode::Telnet;
                }
            }
            TransportMode::Telnet => {
                if matches!(error, TransportError::ConnectionFailed(_)) {
                    self.connect_failures += 1;
                    if self.connect_failures >= self.config.telnet_connect_attempts {
                        error!(
                            "Telnet connection could not be established after {} attempts",
                            self.connect_failures
                        );
                        return Err(self.fail());
                    }
                }
            }
            TransportMode::Disconnected | TransportMode::Failed => {}
        }

        if self.consecutive_failures >= self.config.retry_budget {
            error!("Transport retry budget exhausted");
            return Err(self.fail());
        }
        Ok(())
    }

    fn fail(&mut self) -> TransportError {
        self.mode = TransportMode::Failed;
        self.telnet = None;
        TransportError::Exhausted(self.consecutive_failures)
    }

    /// Release sockets and close the Telnet stream
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.telnet.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Telnet shutdown failed: {}", e);
            }
        }
        self.socket = None;
        self.listener = None;
        if self.mode != TransportMode::Failed {
            self.mode = TransportMode::Disconnected;
        }
        info!("Bridge transport closed");
    }
}

/// Write one Telnet command line and wait for the reply
async fn exchange_line(
    stream: &mut TcpStream,
    line: &str,
    wait: Duration,
) -> Result<(), TransportError> {
    debug!("Sending Telnet command: {}", line);
    stream.write_all(format!("{}\r\n", line).as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let len = timeout(wait, stream.read(&mut buf))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if len == 0 {
        return Err(TransportError::ConnectionLost);
    }

    let reply = String::from_utf8_lossy(&buf[..len]);
    if reply.contains(TELNET_ACK) {
        debug!("Telnet command acknowledged");
    } else {
        warn!("Unexpected Telnet reply to {}: {:?}", line, reply.trim());
    }
    Ok(())
}

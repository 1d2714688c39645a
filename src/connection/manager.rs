//! Connection manager with persistent channel and automatic reconnection

use anyhow::{anyhow, bail, Result};
use fleetsync_shared::{
    codec::{self, FrameDecoder},
    envelope::Payload,
    limits, Envelope, Hello, HelloAck, Join, Ping,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

pub const ENV_SERVER: &str = "FLEETSYNC_SERVER";
pub const ENV_DEVICE_ID: &str = "FLEETSYNC_DEVICE_ID";
pub const ENV_TOKEN: &str = "FLEETSYNC_TOKEN";
pub const ENV_REPORT_INTERVAL_MS: &str = "FLEETSYNC_REPORT_INTERVAL_MS";

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake accepted and joined
    Connected { connection_id: u64, principal_id: String },
    /// Channel lost after it was established
    Disconnected { reason: String },
    /// Received an envelope from server
    Received(Envelope),
    /// Could not establish the channel on this attempt
    ConnectionFailed { reason: String },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device ID reported in location updates
    pub device_id: String,
    /// Channel server address
    pub server_addr: String,
    /// Signed bearer token presented in the handshake
    pub token: String,
    /// Interval between location reports
    pub report_interval: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Time to wait for the server's HelloAck
    pub handshake_timeout: Duration,
    /// Keepalive ping interval
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "drone-001".into(),
            server_addr: "127.0.0.1:8080".into(),
            token: String::new(),
            report_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_millis(limits::HANDSHAKE_TIMEOUT_MS),
            ping_interval: Duration::from_millis(limits::PING_INTERVAL_MS),
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `FLEETSYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(addr) = get(ENV_SERVER) {
            config.server_addr = addr;
        }
        if let Some(id) = get(ENV_DEVICE_ID) {
            config.device_id = id;
        }
        config.token = get(ENV_TOKEN)
            .ok_or_else(|| anyhow!("{ENV_TOKEN} is not set"))?
            .trim()
            .to_string();
        if let Some(raw) = get(ENV_REPORT_INTERVAL_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("{ENV_REPORT_INTERVAL_MS}={raw:?}: {e}"))?;
            if ms == 0 {
                bail!("{ENV_REPORT_INTERVAL_MS} must be positive");
            }
            config.report_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

/// Manages persistent connection to the channel server
pub struct ConnectionManager {
    config: ConnectionConfig,
    sequence_id: Arc<AtomicU64>,
    /// Channel to send envelopes to the server
    outbound_tx: mpsc::Sender<Envelope>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let sequence_id = Arc::new(AtomicU64::new(0));

        let config_clone = config.clone();
        let seq_clone = sequence_id.clone();
        tokio::spawn(async move {
            connection_loop(config_clone, seq_clone, outbound_rx, event_tx).await;
        });

        Self {
            config,
            sequence_id,
            outbound_tx,
            event_rx,
        }
    }

    /// Shared sequence counter for tasks stamping their own envelopes
    pub fn sequence(&self) -> Arc<AtomicU64> {
        self.sequence_id.clone()
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Get the device ID
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Get a clone of the sender for outbound messages
    pub fn get_sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound_tx.clone()
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    sequence_id: Arc<AtomicU64>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let next_seq = || sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.server_addr)).await {
            Ok(Ok(stream)) => {
                let (mut reader, mut writer) = stream.into_split();
                let mut decoder = FrameDecoder::new();

                match handshake(&mut reader, &mut writer, &mut decoder, &config, &next_seq).await {
                    Ok(ack) => {
                        // Connected successfully
                        reconnect_delay = config.reconnect_delay;

                        let _ = event_tx
                            .send(ConnectionEvent::Connected {
                                connection_id: ack.connection_id,
                                principal_id: ack.principal_id,
                            })
                            .await;

                        if let Err(reason) = handle_connection(
                            &mut reader,
                            &mut writer,
                            &mut decoder,
                            &config,
                            &next_seq,
                            &mut outbound_rx,
                            &event_tx,
                        )
                        .await
                        {
                            let _ = event_tx
                                .send(ConnectionEvent::Disconnected {
                                    reason: reason.to_string(),
                                })
                                .await;
                        }
                    }
                    Err(reason) => {
                        let _ = event_tx
                            .send(ConnectionEvent::ConnectionFailed {
                                reason: format!("Handshake failed: {}", reason),
                            })
                            .await;
                    }
                }
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("Connect to {} failed: {}", config.server_addr, e),
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("Connect to {} timed out", config.server_addr),
                    })
                    .await;
            }
        }

        if event_tx.is_closed() {
            debug!("Event receiver dropped, stopping connection loop");
            return;
        }

        // Wait before reconnecting
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = next_backoff(reconnect_delay, config.max_reconnect_delay);
    }
}

/// Exponential backoff capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Send Hello, wait for HelloAck, then join under the acknowledged principal
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    decoder: &mut FrameDecoder,
    config: &ConnectionConfig,
    next_seq: &impl Fn() -> u64,
) -> Result<HelloAck> {
    let hello = Envelope::new(
        &config.device_id,
        next_seq(),
        Payload::Hello(Hello {
            credential: config.token.clone(),
        }),
    );
    write_envelope(writer, &hello).await?;

    let ack = timeout(config.handshake_timeout, read_hello_ack(reader, decoder))
        .await
        .map_err(|_| anyhow!("no HelloAck within {:?}", config.handshake_timeout))??;

    let join = Envelope::new(
        &config.device_id,
        next_seq(),
        Payload::Join(Join {
            principal_id: ack.principal_id.clone(),
        }),
    );
    write_envelope(writer, &join).await?;

    Ok(ack)
}

/// Handle an established channel until it fails
async fn handle_connection(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    decoder: &mut FrameDecoder,
    config: &ConnectionConfig,
    next_seq: &impl Fn() -> u64,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let mut read_buf = vec![0u8; 4096];

    // Frames that arrived together with the HelloAck
    while let Some(envelope) = decoder.decode_next()? {
        let _ = event_tx.send(ConnectionEvent::Received(envelope)).await;
    }

    let mut ping_interval = interval(config.ping_interval);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            // Keepalive
            _ = ping_interval.tick() => {
                nonce += 1;
                let ping = Envelope::new(&config.device_id, next_seq(), Payload::Ping(Ping { nonce }));
                write_envelope(writer, &ping).await?;
            }

            // Send outbound messages
            Some(envelope) = outbound_rx.recv() => {
                write_envelope(writer, &envelope).await?;
            }

            // Read incoming messages
            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        return Err(anyhow!("Server closed connection"));
                    }
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);
                        while let Some(envelope) = decoder.decode_next()? {
                            let _ = event_tx.send(ConnectionEvent::Received(envelope)).await;
                        }
                    }
                    Err(e) => {
                        return Err(anyhow!("Read error: {}", e));
                    }
                }
            }
        }
    }
}

async fn write_envelope(writer: &mut (impl AsyncWriteExt + Unpin), envelope: &Envelope) -> Result<()> {
    let encoded = codec::encode(envelope)?;
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read until the first frame, which must be HelloAck
///
/// The server answers a rejected credential by closing the socket, so EOF
/// here means the token was refused.
async fn read_hello_ack(reader: &mut OwnedReadHalf, decoder: &mut FrameDecoder) -> Result<HelloAck> {
    let mut read_buf = [0u8; 1024];
    loop {
        if let Some(envelope) = decoder.decode_next()? {
            return match envelope.payload {
                Some(Payload::HelloAck(ack)) => Ok(ack),
                other => Err(anyhow!("expected HelloAck, got {:?}", other)),
            };
        }

        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            bail!("server closed the connection (credential rejected?)");
        }
        decoder.extend(&read_buf[..n]);
    }
}

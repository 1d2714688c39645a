//! Channel server: accept loop, handshake and per-connection message loop
//!
//! Connection lifecycle:
//! 1. The first frame must be `Hello` and arrive within the handshake timeout.
//!    A missing, late or rejected credential closes the socket without a reply.
//! 2. On success the server queues `HelloAck` and the client may `Join` under
//!    its own principal, stream `UpdateLocation` reports and `Ping`.
//! 3. When the socket closes the handle leaves the registry immediately.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use fleetsync_shared::{envelope::Payload, Envelope, HelloAck, Pong};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::{CredentialValidator, Principal};
use crate::config::ServerConfig;
use crate::fanout::SERVER_SENDER;
use crate::session::{spawn_writer, ChannelHandle, ChannelReader};
use crate::FleetServices;

/// Everything a connection task needs
pub struct ServerContext {
    pub services: FleetServices,
    pub validator: Arc<dyn CredentialValidator>,
    pub handshake_timeout: Duration,
    pub outbound_queue: usize,
}

impl ServerContext {
    pub fn new(
        services: FleetServices,
        validator: Arc<dyn CredentialValidator>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            services,
            validator,
            handshake_timeout: config.handshake_timeout,
            outbound_queue: config.outbound_queue,
        }
    }
}

/// Accept channel connections until the listener fails
pub async fn run(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    info!("Channel server listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("Connection from {}", addr);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, addr, ctx).await {
                warn!("Connection {} ended with error: {}", addr, e);
            }
        });
    }
}

/// Drive one channel from handshake to close
pub async fn serve_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = ChannelReader::new(read_half, addr);

    let principal = match timeout(
        ctx.handshake_timeout,
        handshake(&mut reader, ctx.validator.as_ref()),
    )
    .await
    {
        Ok(Ok(principal)) => principal,
        Ok(Err(e)) => {
            warn!("Handshake from {} rejected: {}", addr, e);
            return Ok(());
        }
        Err(_) => {
            warn!("Handshake from {} timed out", addr);
            return Ok(());
        }
    };

    let (handle, rx) = ChannelHandle::new(addr, principal.clone(), ctx.outbound_queue);
    let writer = spawn_writer(write_half, rx, handle.id());
    info!(
        "{} authenticated {} as {} ({})",
        handle.id(),
        addr,
        principal.id,
        principal.role.name()
    );

    let ack = Envelope::new(
        SERVER_SENDER,
        ctx.services.fanout.next_sequence_id(),
        Payload::HelloAck(HelloAck {
            connection_id: handle.id().0,
            principal_id: principal.id.clone(),
            role: principal.role.into(),
        }),
    );

    let result = match handle.send(&ack) {
        Ok(()) => message_loop(&mut reader, &handle, &ctx).await,
        Err(e) => Err(e),
    };

    if let Some(principal_id) = ctx.services.registry.leave(&handle).await {
        info!("{} left ({})", principal_id, handle.id());
    }
    writer.abort();
    result
}

/// Wait for `Hello` and validate its credential
async fn handshake<R>(reader: &mut ChannelReader<R>, validator: &dyn CredentialValidator) -> Result<Principal>
where
    R: AsyncRead + Unpin,
{
    let envelope = reader
        .recv()
        .await?
        .ok_or_else(|| anyhow!("closed before hello"))?;

    match envelope.payload {
        Some(Payload::Hello(hello)) => Ok(validator.validate(&hello.credential)?),
        other => bail!("expected hello, got {}", payload_name(other.as_ref())),
    }
}

async fn message_loop<R>(
    reader: &mut ChannelReader<R>,
    handle: &ChannelHandle,
    ctx: &ServerContext,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let services = &ctx.services;

    while let Some(envelope) = reader.recv().await? {
        match envelope.payload {
            Some(Payload::Join(join)) => {
                let principal = handle.principal();
                if join.principal_id != principal.id {
                    // A rejected join ends the channel; nothing more is delivered
                    warn!(
                        "{} ({}) tried to join as {}, closing",
                        handle.id(),
                        principal.id,
                        join.principal_id
                    );
                    return Ok(());
                }
                if let Some(previous) = services.registry.join(principal.id.clone(), handle.clone()).await {
                    info!("{} replaced {} for {}", handle.id(), previous.id(), principal.id);
                } else {
                    info!("{} joined ({})", principal.id, handle.id());
                }
            }
            Some(Payload::UpdateLocation(report)) => {
                // Fire-and-forget: failures are reported by the ingestor, never to the sender
                let _ = services.ingestor.ingest(report).await;
            }
            Some(Payload::Ping(ping)) => {
                let pong = Envelope::new(
                    SERVER_SENDER,
                    services.fanout.next_sequence_id(),
                    Payload::Pong(Pong { nonce: ping.nonce }),
                );
                if let Err(e) = handle.send(&pong) {
                    debug!("Pong to {} dropped: {}", handle.id(), e);
                }
            }
            other => {
                debug!("{} sent unexpected {}", handle.id(), payload_name(other.as_ref()));
            }
        }
    }

    Ok(())
}

fn payload_name(payload: Option<&Payload>) -> &'static str {
    match payload {
        None => "empty frame",
        Some(Payload::Hello(_)) => "hello",
        Some(Payload::HelloAck(_)) => "hello ack",
        Some(Payload::Join(_)) => "join",
        Some(Payload::UpdateLocation(_)) => "location report",
        Some(Payload::LocationUpdate(_)) => "location update",
        Some(Payload::Ping(_)) => "ping",
        Some(Payload::Pong(_)) => "pong",
    }
}

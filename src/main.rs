mod connection;
mod position;

use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use fleetsync_shared::{envelope, Envelope};
use position::{PatrolConfig, PatrolSource};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc::error::TrySendError;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ConnectionConfig::from_env()?;

    info!("Reporter starting: {}", config.device_id);
    info!("  Server: {}", config.server_addr);
    info!("  Report interval: {:?}", config.report_interval);

    let mut conn = ConnectionManager::new(config.clone());

    // Location streaming task. Reports are dropped rather than queued while
    // the channel is down; a stale fix is worth nothing.
    let sender = conn.get_sender();
    let sequence = conn.sequence();
    let device_id = conn.device_id().to_string();
    let report_interval = config.report_interval;
    tokio::spawn(async move {
        let mut source = PatrolSource::new(PatrolConfig::default());
        let mut ticker = tokio::time::interval(report_interval);
        loop {
            ticker.tick().await;
            let report = source.next_report(&device_id);
            let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let envelope = Envelope::new(
                &device_id,
                seq,
                envelope::Payload::UpdateLocation(report),
            );

            match sender.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Outbound queue full, skipping report {}", seq),
                Err(TrySendError::Closed(_)) => {
                    error!("Connection manager gone, stopping reports");
                    break;
                }
            }
        }
    });

    // Main event loop
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected {
                connection_id,
                principal_id,
            }) => {
                info!("Connected as {} (connection {})", principal_id, connection_id);
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                error!("Connection failed: {}", reason);
            }
            Some(ConnectionEvent::Received(envelope)) => {
                handle_server_message(&envelope);
            }
            None => {
                error!("Connection manager closed");
                break;
            }
        }
    }

    Ok(())
}

fn handle_server_message(envelope: &Envelope) {
    let seq = envelope.header.as_ref().map(|h| h.sequence_id).unwrap_or_default();

    match &envelope.payload {
        Some(envelope::Payload::LocationUpdate(update)) => {
            let (lat, lon) = update
                .location
                .map(|p| (p.latitude, p.longitude))
                .unwrap_or_default();
            info!(
                "[{}] {} at ({:.6}, {:.6}) battery {:.1}%",
                update.device_id, update.display_name, lat, lon, update.battery_level
            );
        }
        Some(envelope::Payload::Pong(pong)) => {
            debug!("Pong {} (seq={})", pong.nonce, seq);
        }
        _ => {
            debug!("Unhandled payload (seq={})", seq);
        }
    }
}

//! Broadcast fanout to every registered channel
//!
//! Delivery is best-effort and at most once per handle. The event is encoded
//! once and queued on each handle without waiting; a full or closed queue
//! drops the event for that handle only. Per-handle queues are FIFO, so events
//! published in order reach each live handle in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleetsync_shared::{codec, envelope::Payload, Envelope, LocationUpdate};
use tracing::{debug, error};

use crate::session::{ConnectionRegistry, DeliveryError};

/// Sender name stamped on server-originated frames
pub const SERVER_SENDER: &str = "server";

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
    sequence_id: AtomicU64,
}

impl Fanout {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            sequence_id: AtomicU64::new(0),
        }
    }

    /// Next server frame sequence id
    pub fn next_sequence_id(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Broadcast a device location change
    pub async fn publish(&self, update: LocationUpdate) -> FanoutReport {
        self.broadcast(Payload::LocationUpdate(update)).await
    }

    /// Deliver `payload` to every handle registered at call time
    pub async fn broadcast(&self, payload: Payload) -> FanoutReport {
        let envelope = Envelope::new(SERVER_SENDER, self.next_sequence_id(), payload);
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Dropping broadcast, encode failed: {}", e);
                return FanoutReport::default();
            }
        };

        // Snapshot first; the registry lock is not held while queueing
        let handles = self.registry.all_handles().await;

        let mut report = FanoutReport::default();
        for handle in handles {
            match handle.try_deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    report.dropped += 1;
                    match reason {
                        DeliveryError::QueueFull => debug!(
                            "{} ({}) queue full, dropping broadcast",
                            handle.id(),
                            handle.addr()
                        ),
                        DeliveryError::Closed => debug!(
                            "{} ({}) already closed, dropping broadcast",
                            handle.id(),
                            handle.addr()
                        ),
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::session::ChannelHandle;
    use bytes::BytesMut;
    use fleetsync_shared::{GeoPoint, Role};
    use std::net::SocketAddr;

    fn update(device_id: &str, battery: f64) -> LocationUpdate {
        LocationUpdate {
            device_id: device_id.into(),
            location: Some(GeoPoint::new(1.0, 2.0)),
            battery_level: battery,
            display_name: format!("Drone {device_id}"),
        }
    }

    fn decode_update(frame: &[u8]) -> LocationUpdate {
        let mut buf = BytesMut::from(frame);
        match codec::decode(&mut buf).expect("decode").expect("frame").payload {
            Some(Payload::LocationUpdate(update)) => update,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().expect("addr")
    }

    #[tokio::test]
    async fn test_publish_reaches_every_registered_handle() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(registry.clone());

        let (a, mut rx_a) = ChannelHandle::new(addr(), Principal::new("a", Role::Viewer), 4);
        let (b, mut rx_b) = ChannelHandle::new(addr(), Principal::new("b", Role::Viewer), 4);
        registry.join("a", a).await;
        registry.join("b", b).await;

        let report = fanout.publish(update("D1", 50.0)).await;
        assert_eq!(report, FanoutReport { delivered: 2, dropped: 0 });

        assert_eq!(decode_update(&rx_a.recv().await.expect("a frame")).device_id, "D1");
        assert_eq!(decode_update(&rx_b.recv().await.expect("b frame")).device_id, "D1");
    }

    #[tokio::test]
    async fn test_failed_handle_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(registry.clone());

        let (closed, rx_closed) = ChannelHandle::new(addr(), Principal::new("gone", Role::Viewer), 4);
        let (slow, _rx_slow) = ChannelHandle::new(addr(), Principal::new("slow", Role::Viewer), 1);
        let (live, mut rx_live) = ChannelHandle::new(addr(), Principal::new("live", Role::Viewer), 4);
        drop(rx_closed);
        registry.join("gone", closed).await;
        registry.join("slow", slow).await;
        registry.join("live", live).await;

        let first = fanout.publish(update("D1", 10.0)).await;
        assert_eq!(first, FanoutReport { delivered: 2, dropped: 1 });

        // "slow" still holds the first frame, so the second is dropped for it
        let second = fanout.publish(update("D1", 9.0)).await;
        assert_eq!(second, FanoutReport { delivered: 1, dropped: 2 });

        assert_eq!(decode_update(&rx_live.recv().await.expect("frame")).battery_level, 10.0);
        assert_eq!(decode_update(&rx_live.recv().await.expect("frame")).battery_level, 9.0);
    }

    #[tokio::test]
    async fn test_publish_order_preserved_per_handle() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(registry.clone());
        let (h, mut rx) = ChannelHandle::new(addr(), Principal::new("v", Role::Viewer), 16);
        registry.join("v", h).await;

        for battery in [90.0, 80.0, 70.0] {
            fanout.publish(update("D1", battery)).await;
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(decode_update(&rx.recv().await.expect("frame")).battery_level);
        }
        assert_eq!(seen, vec![90.0, 80.0, 70.0]);
    }

    #[tokio::test]
    async fn test_publish_with_nobody_online() {
        let fanout = Fanout::new(Arc::new(ConnectionRegistry::new()));
        assert_eq!(fanout.publish(update("D1", 1.0)).await, FanoutReport::default());
    }
}

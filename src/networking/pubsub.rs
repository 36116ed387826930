// Best-effort broadcast fabric.
//
// The control plane publishes onto an in-process bus; IPC connections that
// sent a Subscribe request get events pushed over their frame stream.
// Delivery is best-effort by design: subscribers re-fetch authoritative
// state after any observed broadcast.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::common::tasks::Shutdown;
use crate::error::{PlatformError, Result};
use crate::networking::codec;
use crate::networking::protocol::{
    BroadcastEvent, EventEnvelope, ReplyEnvelope, RequestEnvelope, RequestPayload,
};

const BUS_CAPACITY: usize = 256;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// In-process fan-out shared by the IPC server and local subscribers.
pub struct BroadcastBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BroadcastEvent) {
        let envelope = EventEnvelope::new(event);
        // No receivers is fine; broadcasts are advisory.
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote subscription: connects to a control-plane address, upgrades the
/// connection with a Subscribe request, and invokes the callback per event.
/// Reconnects with backoff until shutdown.
pub async fn subscribe_events<F>(
    addrs: Vec<String>,
    topics: Vec<String>,
    mut on_event: F,
    mut shutdown: Shutdown,
) where
    F: FnMut(BroadcastEvent) + Send,
{
    if addrs.is_empty() {
        warn!("no control-plane addresses to subscribe to");
        return;
    }
    let mut index = 0usize;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let addr = addrs[index % addrs.len()].clone();
        index += 1;

        match subscription_stream(&addr, &topics, &mut on_event, &mut shutdown).await {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                debug!(addr = %addr, error = %e, "broadcast subscription dropped");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

async fn subscription_stream<F>(
    addr: &str,
    topics: &[String],
    on_event: &mut F,
    shutdown: &mut Shutdown,
) -> Result<()>
where
    F: FnMut(BroadcastEvent) + Send,
{
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .map_err(|e| PlatformError::Network(format!("connect {}: {}", addr, e)))?;

    let request = RequestEnvelope::new(RequestPayload::Subscribe {
        topics: topics.to_vec(),
    });
    codec::write_frame(&mut stream, &request.encode()?).await?;

    let ack = codec::read_frame(&mut stream)
        .await?
        .ok_or_else(|| PlatformError::Network("subscription refused".into()))?;
    ReplyEnvelope::decode(&ack)?.into_result()?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = codec::read_frame(&mut stream) => {
                let Some(bytes) = frame? else {
                    return Err(PlatformError::Network("broadcast stream closed".into()));
                };
                match EventEnvelope::decode(&bytes) {
                    Ok(envelope) => on_event(envelope.event),
                    Err(e) => warn!(error = %e, "undecodable broadcast"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = BroadcastBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(BroadcastEvent::NodeDown {
            node_id: "n_b".to_string(),
        });
        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.event, eb.event);
        assert_eq!(ea.event.topic(), "node.down");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = BroadcastBus::new();
        bus.publish(BroadcastEvent::RoutingInvalidate { tenant_id: None });
    }
}

// IPC listener for the control plane.
//
// Each connection carries framed JSON request envelopes. A Subscribe
// request upgrades the connection into a one-way broadcast stream filtered
// by the requested topics; everything else is dispatched to the installed
// handler and answered with a reply envelope.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::common::tasks::Shutdown;
use crate::error::Result;
use crate::networking::codec;
use crate::networking::protocol::{ReplyEnvelope, RequestEnvelope, RequestPayload};
use crate::networking::pubsub::BroadcastBus;

/// Dispatches one decoded request to domain logic.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: RequestPayload) -> Result<Option<Value>>;
}

pub async fn serve_ipc(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    bus: Arc<BroadcastBus>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "ipc accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                let bus = bus.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler, bus, shutdown).await {
                        debug!(%peer, error = %e, "ipc connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    bus: Arc<BroadcastBus>,
    mut shutdown: Shutdown,
) -> Result<()> {
    while let Some(bytes) = codec::read_frame(&mut stream).await? {
        let envelope = match RequestEnvelope::decode(&bytes) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "undecodable ipc request");
                let reply = ReplyEnvelope::err("", &e);
                codec::write_frame(&mut stream, &reply.encode()?).await?;
                continue;
            }
        };

        if let RequestPayload::Subscribe { topics } = &envelope.request {
            let topics = topics.clone();
            let ack = ReplyEnvelope::ok(&envelope.request_id, None);
            codec::write_frame(&mut stream, &ack.encode()?).await?;
            return stream_events(stream, bus, topics, &mut shutdown).await;
        }

        let reply = match handler.handle(envelope.request).await {
            Ok(data) => ReplyEnvelope::ok(&envelope.request_id, data),
            Err(e) => ReplyEnvelope::err(&envelope.request_id, &e),
        };
        codec::write_frame(&mut stream, &reply.encode()?).await?;
    }
    Ok(())
}

async fn stream_events(
    mut stream: TcpStream,
    bus: Arc<BroadcastBus>,
    topics: Vec<String>,
    shutdown: &mut Shutdown,
) -> Result<()> {
    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = rx.recv() => {
                match received {
                    Ok(envelope) => {
                        if !topics.is_empty() && !topics.iter().any(|t| t == envelope.event.topic()) {
                            continue;
                        }
                        codec::write_frame(&mut stream, &envelope.encode()?).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Best-effort bus: a slow subscriber just misses
                        // events and reconciles by re-reading state.
                        debug!(missed, "broadcast subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::protocol::BroadcastEvent;
    use crate::networking::rpc::ControlPlaneClient;
    use crate::networking::pubsub::subscribe_events;
    use tokio::sync::watch;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: RequestPayload) -> Result<Option<Value>> {
            match request {
                RequestPayload::GetTenantByDomain { domain } => {
                    Ok(Some(serde_json::json!({ "echo": domain })))
                }
                _ => Ok(None),
            }
        }
    }

    async fn start_server() -> (String, Arc<BroadcastBus>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let bus = Arc::new(BroadcastBus::new());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_ipc(
            listener,
            Arc::new(Echo),
            bus.clone(),
            Shutdown::from_receiver(rx),
        ));
        (addr, bus, tx)
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let (addr, _bus, _tx) = start_server().await;
        let client = ControlPlaneClient::new(vec![addr]);
        let data = client
            .request(RequestPayload::GetTenantByDomain {
                domain: "t1.example.com".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(data.unwrap()["echo"], "t1.example.com");
    }

    #[tokio::test]
    async fn test_subscription_receives_topic_filtered_events() {
        let (addr, bus, _tx) = start_server().await;
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(subscribe_events(
            vec![addr],
            vec!["node.down".to_string()],
            move |event| {
                let _ = events_tx.send(event);
            },
            Shutdown::from_receiver(stop_rx),
        ));

        // Give the subscriber time to attach before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        bus.publish(BroadcastEvent::RoutingInvalidate { tenant_id: None });
        bus.publish(BroadcastEvent::NodeDown {
            node_id: "n_b".to_string(),
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic(), "node.down");
        let _ = stop_tx.send(true);
    }
}

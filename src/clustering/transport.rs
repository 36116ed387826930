// Replication transport between control-plane peers.
//
// RPCs are bincode structs inside the standard CRC32 frame. The transport
// is a trait so the log engine can be exercised with an in-process loopback
// in tests while production peers talk TCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::clustering::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::common::tasks::Shutdown;
use crate::error::{PlatformError, Result};
use crate::networking::codec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpc {
    Vote(VoteRequest),
    Append(AppendRequest),
    Snapshot(InstallSnapshotRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpcReply {
    Vote(VoteResponse),
    Append(AppendResponse),
    Snapshot(InstallSnapshotResponse),
}

fn encode_rpc<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| PlatformError::Serialization(e.to_string()))
}

fn decode_rpc<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PlatformError::Serialization(e.to_string()))?;
    Ok(value)
}

/// Handles one inbound replication RPC.
pub trait RaftRpcHandler: Send + Sync {
    fn handle(&self, rpc: RaftRpc) -> RaftRpcReply;
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send(&self, addr: &str, rpc: RaftRpc) -> Result<RaftRpcReply>;
}

/// One-shot TCP connections; replication traffic is small and infrequent
/// enough that connection reuse is not worth the bookkeeping.
pub struct TcpRaftTransport {
    timeout: Duration,
}

impl TcpRaftTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpRaftTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl RaftTransport for TcpRaftTransport {
    async fn send(&self, addr: &str, rpc: RaftRpc) -> Result<RaftRpcReply> {
        let io = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| PlatformError::Network(format!("connect {}: {}", addr, e)))?;
            codec::write_frame(&mut stream, &encode_rpc(&rpc)?).await?;
            let payload = codec::read_frame(&mut stream)
                .await?
                .ok_or_else(|| PlatformError::Network(format!("{} closed connection", addr)))?;
            decode_rpc::<RaftRpcReply>(&payload)
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| PlatformError::Timeout(format!("raft rpc to {}", addr)))?
    }
}

/// Accept loop for the local replication listener.
pub async fn serve_replication(
    listener: TcpListener,
    handler: Arc<dyn RaftRpcHandler>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "replication accept failed");
                        continue;
                    }
                };
                debug!(%peer, "replication connection");
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        debug!(%peer, error = %e, "replication connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn RaftRpcHandler>) -> Result<()> {
    while let Some(payload) = codec::read_frame(&mut stream).await? {
        let rpc: RaftRpc = decode_rpc(&payload)?;
        let reply = handler.handle(rpc);
        codec::write_frame(&mut stream, &encode_rpc(&reply)?).await?;
    }
    Ok(())
}

/// In-process transport wiring peers directly to each other's handlers.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: RwLock<HashMap<String, Arc<dyn RaftRpcHandler>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn RaftRpcHandler>) {
        self.handlers.write().insert(addr.into(), handler);
    }

    /// Simulate a partition by removing the peer's handler.
    pub fn disconnect(&self, addr: &str) {
        self.handlers.write().remove(addr);
    }
}

#[async_trait]
impl RaftTransport for LoopbackTransport {
    async fn send(&self, addr: &str, rpc: RaftRpc) -> Result<RaftRpcReply> {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(addr).cloned()
        };
        match handler {
            Some(handler) => Ok(handler.handle(rpc)),
            None => Err(PlatformError::Network(format!("{} unreachable", addr))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoVote;

    impl RaftRpcHandler for EchoVote {
        fn handle(&self, rpc: RaftRpc) -> RaftRpcReply {
            match rpc {
                RaftRpc::Vote(req) => RaftRpcReply::Vote(VoteResponse {
                    term: req.term,
                    granted: true,
                }),
                RaftRpc::Append(req) => RaftRpcReply::Append(AppendResponse {
                    term: req.term,
                    success: true,
                    match_index: Some(req.prev_log_index),
                    conflict_index: None,
                }),
                RaftRpc::Snapshot(req) => {
                    RaftRpcReply::Snapshot(InstallSnapshotResponse { term: req.term })
                }
            }
        }
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let shutdown = Shutdown::from_receiver(rx);
        tokio::spawn(serve_replication(listener, Arc::new(EchoVote), shutdown));

        let transport = TcpRaftTransport::default();
        let reply = transport
            .send(
                &addr,
                RaftRpc::Vote(VoteRequest {
                    term: 7,
                    candidate: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await
            .unwrap();
        match reply {
            RaftRpcReply::Vote(v) => {
                assert_eq!(v.term, 7);
                assert!(v.granted);
            }
            _ => panic!("wrong reply kind"),
        }
        let _ = tx.send(true);
    }

    #[tokio::test]
    async fn test_loopback_unreachable_peer() {
        let transport = LoopbackTransport::new();
        let err = transport
            .send(
                "10.0.0.9:7000",
                RaftRpc::Vote(VoteRequest {
                    term: 1,
                    candidate: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Network(_)));
    }
}

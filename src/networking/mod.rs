// IPC fabric: CRC32-framed wire codec, typed JSON envelopes, the
// request/reply client and server, and best-effort broadcasts.

pub mod codec;
pub mod protocol;
pub mod pubsub;
pub mod rpc;
pub mod server;

pub use protocol::{BroadcastEvent, EventEnvelope, ReplyEnvelope, RequestEnvelope, RequestPayload};
pub use pubsub::BroadcastBus;
pub use rpc::ControlPlaneClient;
pub use server::{serve_ipc, RequestHandler};

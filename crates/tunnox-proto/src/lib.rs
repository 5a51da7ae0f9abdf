//! Wire types for the tunnox session and tunnel core
//!
//! Three wire surfaces live here:
//! - `packet`: application packets multiplexed over a client's control
//!   connection (`TransferPacket` and its typed JSON bodies)
//! - `frame`: the fixed-layout inter-node frames exchanged between
//!   cluster nodes over dedicated TCP connections
//! - `cluster`: broker broadcast payloads, cross-node RPC envelopes and
//!   the shared KV key layout

pub mod cluster;
pub mod frame;
pub mod mapping;
pub mod packet;

pub use cluster::{
    client_node_key, cross_server_conn_key, tunnel_waiting_key, CommandEnvelope,
    CommandResponseEnvelope, ConfigPushBroadcast, DnsQueryEnvelope, DnsResponseEnvelope,
    HttpProxyEnvelope, HttpResponseEnvelope, TunnelOpenBroadcast, TunnelReadyBroadcast,
    TunnelWaitingState, CMD_CONFIG_SET, CMD_TUNNEL_OPEN, TOPIC_CONFIG_PUSH, TOPIC_TUNNEL_OPEN,
    TOPIC_TUNNEL_READY,
};
pub use frame::{
    decode_target_ready, encode_target_ready, tunnel_id_from_bytes, tunnel_id_to_bytes,
    FrameError, FrameType, TunnelFrame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD, TUNNEL_ID_LEN,
};
pub use mapping::{PortMapping, TrafficDelta, TrafficStats};
pub use packet::{
    CommandRequestBody, CommandResponseBody, ConnectionType, HandshakeAck, HandshakeRequest,
    PacketError, PacketFlags, PacketKind, TransferPacket, TunnelOpenAck, TunnelOpenRequest,
};

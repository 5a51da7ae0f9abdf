//! Application packet types multiplexed over control connections
//!
//! A `TransferPacket` is one framed unit on a client connection. The
//! type byte carries the packet kind in its low six bits; the top two
//! bits flag end-to-end compression and encryption. Servers route on
//! the kind bits only and never interpret the transform flags.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Packet errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Malformed packet body: {0}")]
    MalformedBody(#[from] serde_json::Error),
}

/// Packet kind, encoded in the low six bits of the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    TunnelOpen = 0x03,
    TunnelOpenAck = 0x04,
    JsonCommand = 0x05,
    CommandResp = 0x06,
    Heartbeat = 0x07,
    HeartbeatAck = 0x08,
}

impl PacketKind {
    /// Mask selecting the kind bits of a type byte
    pub const KIND_MASK: u8 = 0b0011_1111;

    pub fn from_type_byte(byte: u8) -> Result<Self, PacketError> {
        match byte & Self::KIND_MASK {
            0x01 => Ok(PacketKind::Handshake),
            0x02 => Ok(PacketKind::HandshakeAck),
            0x03 => Ok(PacketKind::TunnelOpen),
            0x04 => Ok(PacketKind::TunnelOpenAck),
            0x05 => Ok(PacketKind::JsonCommand),
            0x06 => Ok(PacketKind::CommandResp),
            0x07 => Ok(PacketKind::Heartbeat),
            0x08 => Ok(PacketKind::HeartbeatAck),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

/// Transform flags carried in the top two bits of the type byte
///
/// The transforms themselves are end-to-end between clients; nodes
/// forward flagged payloads verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const COMPRESSED: u8 = 0b0100_0000;
    pub const ENCRYPTED: u8 = 0b1000_0000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }

    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::ENCRYPTED;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_type_byte(byte: u8) -> Self {
        Self(byte & !PacketKind::KIND_MASK)
    }
}

/// One framed unit on a client connection
#[derive(Debug, Clone)]
pub struct TransferPacket {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

impl TransferPacket {
    pub fn new(kind: PacketKind, payload: Bytes) -> Self {
        Self {
            kind,
            flags: PacketFlags::new(),
            payload,
        }
    }

    /// Build a packet with a JSON-encoded body
    pub fn json<T: Serialize>(kind: PacketKind, body: &T) -> Result<Self, PacketError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(kind, Bytes::from(payload)))
    }

    /// Build an empty-bodied packet (heartbeats and their acks)
    pub fn empty(kind: PacketKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The full type byte: kind bits plus transform flags
    pub fn type_byte(&self) -> u8 {
        self.kind as u8 | self.flags.as_u8()
    }

    pub fn from_type_byte(byte: u8, payload: Bytes) -> Result<Self, PacketError> {
        Ok(Self {
            kind: PacketKind::from_type_byte(byte)?,
            flags: PacketFlags::from_type_byte(byte),
            payload,
        })
    }

    /// Decode the JSON body into a typed struct
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Whether an authenticated connection is a control or tunnel channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Control,
    Tunnel,
}

/// Handshake request, the first packet on every new connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    pub auth_token: String,
    /// Client id the caller believes it holds; authoritative assignment
    /// comes back in the ack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    /// Present when the connection is a tunnel channel for a mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_id: Option<String>,
}

/// Handshake acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
}

impl HandshakeAck {
    pub fn ok(client_id: i64, connection_type: ConnectionType) -> Self {
        Self {
            success: true,
            error: None,
            client_id: Some(client_id),
            connection_type: Some(connection_type),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            client_id: None,
            connection_type: None,
        }
    }
}

/// Tunnel open request, sent by both the listen and target endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpenRequest {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

/// Tunnel open acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpenAck {
    pub success: bool,
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelOpenAck {
    pub fn ok(tunnel_id: impl Into<String>) -> Self {
        Self {
            success: true,
            tunnel_id: tunnel_id.into(),
            error: None,
        }
    }

    pub fn failed(tunnel_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            tunnel_id: tunnel_id.into(),
            error: Some(reason.into()),
        }
    }
}

/// JSON command carried in a `JsonCommand` packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequestBody {
    pub command_id: String,
    pub command_type: String,
    /// Client the command is addressed to; absent means the node itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Response carried in a `CommandResp` packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponseBody {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            PacketKind::Handshake,
            PacketKind::HandshakeAck,
            PacketKind::TunnelOpen,
            PacketKind::TunnelOpenAck,
            PacketKind::JsonCommand,
            PacketKind::CommandResp,
            PacketKind::Heartbeat,
            PacketKind::HeartbeatAck,
        ] {
            assert_eq!(PacketKind::from_type_byte(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let result = PacketKind::from_type_byte(0x3f);
        assert!(matches!(result, Err(PacketError::UnknownKind(0x3f))));
    }

    #[test]
    fn test_flags_do_not_disturb_kind() {
        let packet = TransferPacket::empty(PacketKind::TunnelOpen)
            .with_flags(PacketFlags::new().with_compressed().with_encrypted());

        let byte = packet.type_byte();
        assert_eq!(PacketKind::from_type_byte(byte).unwrap(), PacketKind::TunnelOpen);

        let flags = PacketFlags::from_type_byte(byte);
        assert!(flags.is_compressed());
        assert!(flags.is_encrypted());
    }

    #[test]
    fn test_json_body_round_trip() {
        let req = TunnelOpenRequest {
            tunnel_id: "t1".to_string(),
            mapping_id: "m1".to_string(),
            secret_key: "s3cret".to_string(),
            target_host: Some("127.0.0.1".to_string()),
            target_port: Some(5432),
        };

        let packet = TransferPacket::json(PacketKind::TunnelOpen, &req).unwrap();
        let decoded: TunnelOpenRequest = packet.decode_body().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_malformed_body() {
        let packet = TransferPacket::new(
            PacketKind::TunnelOpen,
            Bytes::from_static(b"not json at all"),
        );
        let result: Result<TunnelOpenRequest, _> = packet.decode_body();
        assert!(matches!(result, Err(PacketError::MalformedBody(_))));
    }

    #[test]
    fn test_handshake_ack_constructors() {
        let ok = HandshakeAck::ok(42, ConnectionType::Control);
        assert!(ok.success);
        assert_eq!(ok.client_id, Some(42));

        let failed = HandshakeAck::failed("bad token");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("bad token"));
    }
}

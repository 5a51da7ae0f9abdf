//! Inter-node frame codec
//!
//! Frames exchanged between cluster nodes over dedicated TCP
//! connections. Fixed 21-byte header followed by the payload:
//!
//! ```text
//! offset  size  field
//! 0       16    tunnel id (zero-padded ASCII, terminated at first zero)
//! 16      1     frame type
//! 17      4     payload length (big-endian)
//! 21      N     payload
//! ```
//!
//! Tunnel ids longer than 16 bytes are truncated in the header; the
//! `TargetReady` payload carries the full id so the receiver can
//! disambiguate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of the tunnel id field in the header
pub const TUNNEL_ID_LEN: usize = 16;

/// Total header length
pub const FRAME_HEADER_LEN: usize = 21;

/// Maximum payload bytes per frame
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    #[error("Frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Tunnel id is not ASCII")]
    NonAsciiTunnelId,

    #[error("Malformed frame payload")]
    MalformedPayload,
}

/// Inter-node frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    TargetReady = 0x02,
    Close = 0x03,
    Ack = 0x04,
    HttpProxy = 0x05,
    HttpResponse = 0x06,
    DnsQuery = 0x07,
    DnsResponse = 0x08,
    Command = 0x09,
    CommandResponse = 0x0a,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::TargetReady),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::HttpProxy),
            0x06 => Ok(FrameType::HttpResponse),
            0x07 => Ok(FrameType::DnsQuery),
            0x08 => Ok(FrameType::DnsResponse),
            0x09 => Ok(FrameType::Command),
            0x0a => Ok(FrameType::CommandResponse),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }
}

/// One inter-node frame
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelFrame {
    pub tunnel_id: String,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl TunnelFrame {
    pub fn new(tunnel_id: impl Into<String>, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            frame_type,
            payload,
        }
    }

    /// Encode to the wire layout
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        if !self.tunnel_id.is_ascii() {
            return Err(FrameError::NonAsciiTunnelId);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_slice(&tunnel_id_to_bytes(&self.tunnel_id));
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        Ok(buf.freeze())
    }

    /// Decode one frame from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared length
    /// above [`MAX_FRAME_PAYLOAD`] is an error, not a wait.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut id_bytes = [0u8; TUNNEL_ID_LEN];
        id_bytes.copy_from_slice(&buf[..TUNNEL_ID_LEN]);
        let frame_type = FrameType::try_from(buf[TUNNEL_ID_LEN])?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[TUNNEL_ID_LEN + 1..FRAME_HEADER_LEN]);
        let length = u32::from_be_bytes(len_bytes) as usize;

        if length > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(length));
        }
        if buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }

        let tunnel_id = tunnel_id_from_bytes(&id_bytes)?;
        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            tunnel_id,
            frame_type,
            payload,
        }))
    }
}

/// Pack a tunnel id into the fixed header field
///
/// Zero-padded; ids longer than 16 bytes keep only their prefix.
pub fn tunnel_id_to_bytes(tunnel_id: &str) -> [u8; TUNNEL_ID_LEN] {
    let mut out = [0u8; TUNNEL_ID_LEN];
    let bytes = tunnel_id.as_bytes();
    let n = bytes.len().min(TUNNEL_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Unpack a tunnel id from the fixed header field
///
/// The first zero byte terminates the id.
pub fn tunnel_id_from_bytes(bytes: &[u8; TUNNEL_ID_LEN]) -> Result<String, FrameError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(TUNNEL_ID_LEN);
    let slice = &bytes[..end];
    if !slice.is_ascii() {
        return Err(FrameError::NonAsciiTunnelId);
    }
    Ok(String::from_utf8_lossy(slice).into_owned())
}

/// Encode a `TargetReady` payload: `"<tunnelID>|<nodeID>"`
///
/// The payload carries the full tunnel id, even when the header field
/// had to truncate it.
pub fn encode_target_ready(tunnel_id: &str, node_id: &str) -> Bytes {
    Bytes::from(format!("{}|{}", tunnel_id, node_id))
}

/// Decode a `TargetReady` payload into `(tunnel_id, node_id)`
pub fn decode_target_ready(payload: &[u8]) -> Result<(String, String), FrameError> {
    let text = std::str::from_utf8(payload).map_err(|_| FrameError::MalformedPayload)?;
    let (tunnel_id, node_id) = text.split_once('|').ok_or(FrameError::MalformedPayload)?;
    if tunnel_id.is_empty() {
        return Err(FrameError::MalformedPayload);
    }
    Ok((tunnel_id.to_string(), node_id.to_string()))
}

//! Packet codec for client connections
//!
//! Format: `[type: u8][length: u32 BE][payload]`. The type byte carries
//! the packet kind and transform flags; the payload is opaque here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tunnox_proto::TransferPacket;

use crate::stream::TransportError;

/// Maximum payload size for one packet (1 MiB)
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Transfer packet codec
pub struct PacketCodec;

impl PacketCodec {
    /// Header size: type (1) + length (4)
    pub const HEADER_SIZE: usize = 5;

    /// Encode a packet to bytes
    pub fn encode(packet: &TransferPacket) -> Result<Bytes, TransportError> {
        if packet.payload.len() > MAX_PACKET_SIZE {
            return Err(TransportError::PacketTooLarge(packet.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + packet.payload.len());
        buf.put_u8(packet.type_byte());
        buf.put_u32(packet.payload.len() as u32);
        buf.put(packet.payload.clone());
        Ok(buf.freeze())
    }

    /// Decode one packet from the buffer
    ///
    /// Returns `Ok(Some(packet))` if a complete packet was decoded,
    /// `Ok(None)` if more data is needed, `Err` on error.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TransferPacket>, TransportError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = buf[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[1..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(len_bytes) as usize;

        if length > MAX_PACKET_SIZE {
            return Err(TransportError::PacketTooLarge(length));
        }
        if buf.len() < Self::HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length).freeze();
        let packet = TransferPacket::from_type_byte(type_byte, payload)?;
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnox_proto::{PacketFlags, PacketKind};

    #[test]
    fn test_encode_decode() {
        let packet = TransferPacket::new(
            PacketKind::Heartbeat,
            Bytes::from_static(b"{\"ts\":1}"),
        );

        let encoded = PacketCodec::encode(&packet).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = PacketCodec::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.kind, PacketKind::Heartbeat);
        assert_eq!(decoded.payload, packet.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let packet = TransferPacket::empty(PacketKind::Handshake);
        let encoded = PacketCodec::encode(&packet).unwrap();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(PacketCodec::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..]);
        assert!(PacketCodec::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_flags_survive_round_trip() {
        let packet = TransferPacket::new(PacketKind::JsonCommand, Bytes::from_static(b"{}"))
            .with_flags(PacketFlags::new().with_encrypted());

        let encoded = PacketCodec::encode(&packet).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = PacketCodec::decode(&mut buf).unwrap().unwrap();

        assert!(decoded.flags.is_encrypted());
        assert!(!decoded.flags.is_compressed());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketKind::JsonCommand as u8);
        buf.put_u32((MAX_PACKET_SIZE + 1) as u32);

        assert!(matches!(
            PacketCodec::decode(&mut buf),
            Err(TransportError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_multiple() {
        let p1 = TransferPacket::empty(PacketKind::Heartbeat);
        let p2 = TransferPacket::empty(PacketKind::HeartbeatAck);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&PacketCodec::encode(&p1).unwrap());
        buf.extend_from_slice(&PacketCodec::encode(&p2).unwrap());

        assert_eq!(
            PacketCodec::decode(&mut buf).unwrap().unwrap().kind,
            PacketKind::Heartbeat
        );
        assert_eq!(
            PacketCodec::decode(&mut buf).unwrap().unwrap().kind,
            PacketKind::HeartbeatAck
        );
        assert!(PacketCodec::decode(&mut buf).unwrap().is_none());
    }
}

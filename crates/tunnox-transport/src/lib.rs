//! Transport seams for the session core
//!
//! The core never opens sockets of its own; physical transports hand it
//! a reader/writer pair and a [`StreamFactory`] turns that pair into a
//! [`PacketStream`]. Every stream also exposes raw byte I/O so a bridge
//! can take over the connection after the framed phase ends.

pub mod codec;
pub mod framed;
pub mod stream;

pub use codec::{PacketCodec, MAX_PACKET_SIZE};
pub use framed::{DuplexByteStream, FramedPacketStream, FramedStreamFactory};
pub use stream::{
    BoxedReader, BoxedWriter, ByteStream, ConnectionCapabilities, PacketStream, StreamFactory,
    TransportError, TransportProtocol,
};

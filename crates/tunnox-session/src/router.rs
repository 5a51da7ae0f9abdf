//! Packet router: classify and dispatch framed packets
//!
//! Stateless dispatch on the kind bits of the type byte. Handlers run
//! synchronously on the read-loop task; they may spawn work but must
//! not block unboundedly. Unknown kinds go to the default handler when
//! one is registered, else fail `Unsupported`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::trace;
use tunnox_proto::{PacketKind, TransferPacket};

use crate::connection::Connection;
use crate::error::{Disposition, SessionError};

/// Handler for one packet kind
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError>;
}

/// Kind-keyed dispatch table
#[derive(Default)]
pub struct PacketRouter {
    handlers: RwLock<HashMap<u8, Arc<dyn PacketHandler>>>,
    default_handler: RwLock<Option<Arc<dyn PacketHandler>>>,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: PacketKind, handler: Arc<dyn PacketHandler>) {
        self.handlers.write().unwrap().insert(kind as u8, handler);
    }

    pub fn set_default(&self, handler: Arc<dyn PacketHandler>) {
        *self.default_handler.write().unwrap() = Some(handler);
    }

    /// Dispatch one packet to its handler
    pub async fn route(
        &self,
        conn: &Arc<Connection>,
        packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        let kind_byte = packet.kind as u8;
        trace!(
            conn_id = conn.id(),
            kind = ?packet.kind,
            payload_len = packet.payload.len(),
            "Routing packet"
        );

        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&kind_byte).cloned()
        };
        if let Some(handler) = handler {
            return handler.handle(conn, packet).await;
        }

        let fallback = self.default_handler.read().unwrap().clone();
        match fallback {
            Some(handler) => handler.handle(conn, packet).await,
            None => Err(SessionError::Unsupported(kind_byte)),
        }
    }
}

/// Heartbeat handler: refresh the activity stamp and echo an ack
pub struct HeartbeatHandler;

#[async_trait]
impl PacketHandler for HeartbeatHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        _packet: TransferPacket,
    ) -> Result<Disposition, SessionError> {
        conn.touch();
        conn.stream()
            .send_packet(&TransferPacket::empty(PacketKind::HeartbeatAck))
            .await?;
        Ok(Disposition::Continue)
    }
}

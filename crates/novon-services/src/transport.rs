//! Overlay transport contract.
//!
//! The broadcaster never touches sockets. It talks to a pool of overlay
//! client identities that share one account, and receives viewer traffic
//! from a single inbound channel. The daemon supplies the implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use novon_core::overlay::{MessageId, Payload, SendConfig};

/// One identity in the send pool.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    /// True once the identity has lost its overlay connection.
    fn is_closed(&self) -> bool;

    /// Resolves once the identity is connected and can send. Returns false
    /// when it closed before ever connecting.
    async fn ready(&self) -> bool;

    /// Deliver `payload` to every destination. Returns once handed to the
    /// overlay, not once delivered.
    async fn send(
        &self,
        destinations: &[String],
        payload: Payload,
        config: SendConfig,
    ) -> Result<(), TransportError>;
}

/// The overlay account as a whole.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Address viewers send control messages to.
    fn address(&self) -> String;

    /// Ledger address donations must be paid to.
    fn wallet_address(&self) -> String;

    /// The identity pool, in a stable order.
    fn clients(&self) -> Vec<Arc<dyn OverlayClient>>;

    /// Announce the stream on a discovery topic for `duration_blocks`.
    async fn subscribe(
        &self,
        topic: &str,
        duration_blocks: u32,
        meta: &str,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Address conversions owned by the overlay SDK.
pub trait WalletCodec: Send + Sync {
    /// Ledger address of the account behind an overlay client address.
    fn client_to_wallet(&self, client_address: &str) -> Option<String>;

    /// Ledger address of a transfer's program hash.
    fn program_hash_to_wallet(&self, program_hash: &[u8]) -> Option<String>;
}

/// A message from a viewer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sender address with any virtual prefix already removed.
    pub src: String,
    pub message_id: MessageId,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("client is closed")]
    Closed,
    #[error("unresolvable destination {0}")]
    Unresolvable(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] novon_core::wire::WireError),
}

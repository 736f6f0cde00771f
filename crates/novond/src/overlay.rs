//! UDP rendition of the overlay.
//!
//! Each pool identity is one UDP socket. Identity 0 binds the configured
//! listen address and is the address viewers talk to; the rest bind
//! ephemeral ports on the same interface. Addresses are `host:port`
//! strings, optionally carrying a `__k__.` virtual-route prefix.
//!
//! The broadcaster's wallet comes from its identity seed; viewers on the
//! local overlay have no wallet of their own, so their address stands in.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use novon_core::overlay::{
    decode_datagram, encode_datagram, strip_sub_address, Payload, SendConfig, DATAGRAM_HEADER_LEN,
    MAX_DATAGRAM_PAYLOAD,
};
use novon_services::{InboundMessage, Overlay, OverlayClient, TransportError, WalletCodec};

// ── Client ────────────────────────────────────────────────────────────────────

pub struct UdpClient {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
}

impl UdpClient {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Resolve an overlay address to a socket address.
async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    let plain = strip_sub_address(address);
    if let Ok(addr) = plain.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(plain)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TransportError::Unresolvable(address.to_string()))
}

#[async_trait]
impl OverlayClient for UdpClient {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Sockets are bound before the client exists.
    async fn ready(&self) -> bool {
        !self.is_closed()
    }

    async fn send(
        &self,
        destinations: &[String],
        payload: Payload,
        _config: SendConfig,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let datagram = encode_datagram(&payload)?;

        let sends = destinations.iter().map(|dest| {
            let datagram = &datagram;
            async move {
                let addr = resolve(dest).await?;
                self.socket.send_to(datagram, addr).await?;
                Ok::<(), TransportError>(())
            }
        });
        let mut first_err = None;
        for (dest, result) in destinations.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                tracing::trace!(dest = %dest, error = %e, "datagram not sent");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Overlay ───────────────────────────────────────────────────────────────────

pub struct UdpOverlay {
    clients: Vec<Arc<UdpClient>>,
    address: String,
    wallet: String,
}

impl UdpOverlay {
    /// Bind `pool_size` identities. Identity 0 binds `listen_addr`.
    /// `wallet` is the address derived from the identity seed.
    pub async fn bind(listen_addr: &str, pool_size: usize, wallet: String) -> std::io::Result<Self> {
        let primary = UdpSocket::bind(listen_addr).await?;
        let local = primary.local_addr()?;
        let mut clients = vec![Arc::new(UdpClient::new(primary))];

        let ephemeral = SocketAddr::new(local.ip(), 0);
        for _ in 1..pool_size.max(1) {
            clients.push(Arc::new(UdpClient::new(UdpSocket::bind(ephemeral).await?)));
        }

        Ok(Self {
            clients,
            address: local.to_string(),
            wallet,
        })
    }

    /// Wallet mapping for this overlay: our own address maps to the seed
    /// wallet, every other address is its own wallet.
    pub fn wallet_codec(&self) -> AddressWallet {
        AddressWallet {
            own_address: self.address.clone(),
            own_wallet: self.wallet.clone(),
        }
    }

    /// Socket viewers send to.
    pub fn primary_socket(&self) -> Arc<UdpSocket> {
        self.clients[0].socket.clone()
    }
}

#[async_trait]
impl Overlay for UdpOverlay {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn wallet_address(&self) -> String {
        self.wallet.clone()
    }

    fn clients(&self) -> Vec<Arc<dyn OverlayClient>> {
        self.clients
            .iter()
            .map(|c| c.clone() as Arc<dyn OverlayClient>)
            .collect()
    }

    async fn subscribe(&self, topic: &str, duration_blocks: u32, meta: &str) -> Result<(), TransportError> {
        tracing::info!(topic, duration_blocks, meta, "announcing stream (local overlay, no discovery)");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        tracing::info!(topic, "withdrawing stream announcement");
        Ok(())
    }
}

/// Address-as-wallet mapping used on the local overlay.
pub struct AddressWallet {
    own_address: String,
    own_wallet: String,
}

impl WalletCodec for AddressWallet {
    fn client_to_wallet(&self, client_address: &str) -> Option<String> {
        let plain = strip_sub_address(client_address);
        if plain == self.own_address {
            return Some(self.own_wallet.clone());
        }
        (!plain.is_empty()).then(|| plain.to_string())
    }

    fn program_hash_to_wallet(&self, program_hash: &[u8]) -> Option<String> {
        std::str::from_utf8(program_hash).ok().map(str::to_string)
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// Decode datagrams arriving on `socket` into `InboundMessage`s.
pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::Sender<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; DATAGRAM_HEADER_LEN + MAX_DATAGRAM_PAYLOAD];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("overlay receiver shutting down");
                return;
            }
            r = socket.recv_from(&mut buf) => {
                let (len, peer) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "overlay recv failed");
                        continue;
                    }
                };
                let payload = match decode_datagram(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "dropping malformed datagram");
                        continue;
                    }
                };
                let msg = InboundMessage {
                    src: peer.to_string(),
                    message_id: payload.message_id,
                    data: payload.data,
                };
                if inbound.send(msg).await.is_err() {
                    tracing::info!("inbound channel closed, overlay receiver exiting");
                    return;
                }
            }
        }
    }
}

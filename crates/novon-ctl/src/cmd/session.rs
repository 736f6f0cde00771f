//! UDP session with a novond broadcaster.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;

use novon_core::overlay::{decode_datagram, encode_datagram, Payload, DATAGRAM_HEADER_LEN, MAX_DATAGRAM_PAYLOAD};

pub struct Session {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
}

impl Session {
    pub async fn connect(server: &str, timeout: Duration) -> Result<Self> {
        let server: SocketAddr = tokio::net::lookup_host(server)
            .await
            .with_context(|| format!("cannot resolve {server}"))?
            .next()
            .with_context(|| format!("no address for {server}"))?;
        let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await.context("failed to bind local socket")?;
        Ok(Self {
            socket,
            server,
            timeout,
        })
    }

    pub async fn send(&self, payload: &Payload) -> Result<()> {
        let datagram = encode_datagram(payload)?;
        self.socket
            .send_to(&datagram, self.server)
            .await
            .with_context(|| format!("failed to send to {}", self.server))?;
        Ok(())
    }

    /// Next datagram from the broadcaster. Datagrams from other senders are
    /// skipped.
    pub async fn recv(&self) -> Result<Payload> {
        let mut buf = vec![0u8; DATAGRAM_HEADER_LEN + MAX_DATAGRAM_PAYLOAD];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if peer.ip() != self.server.ip() {
                continue;
            }
            match decode_datagram(Bytes::copy_from_slice(&buf[..len])) {
                Ok(p) => return Ok(p),
                Err(_) => continue,
            }
        }
    }

    /// Send `payload` and wait for the first reply to it. Replies arrive
    /// once per virtual route; the duplicates are left unread.
    pub async fn request(&self, payload: Payload) -> Result<Payload> {
        let id = payload.message_id;
        self.send(&payload).await?;
        let wait = async {
            loop {
                let p = self.recv().await?;
                if p.reply_to == Some(id) {
                    return Ok::<_, anyhow::Error>(p);
                }
            }
        };
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(r) => r,
            Err(_) => bail!(
                "no reply from {} within {}s — is the stream live?",
                self.server,
                self.timeout.as_secs()
            ),
        }
    }

    pub async fn request_text(&self, payload: Payload) -> Result<String> {
        let reply = self.request(payload).await?;
        reply
            .as_text()
            .map(str::to_string)
            .context("reply is not text")
    }
}

//! novon integration test harness.
//!
//! Scenarios drive a full `Streamer` (real balancer, fan-out, registry,
//! chat and donation validation) over an in-memory overlay, a scripted
//! ledger node and a fake transcoder. Nothing touches the network or
//! external tools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use serde_json::{json, Value};

use novon_core::config::TranscodeProfile;
use novon_core::ledger::{Transaction, TransferAsset, ASSET_UNIT_SCALE, TRANSFER_ASSET_TYPE};
use novon_core::overlay::{random_message_id, strip_sub_address, Payload, PayloadKind, SendConfig};
use novon_core::wire::{Chunk, SegmentAssembler};
use novon_services::{
    ClientBalancer, DonationLedger, DonationValidator, InboundMessage, LedgerRpc, Overlay,
    OverlayClient, RetryPolicy, RpcError, SourceInfo, StreamSettings, Streamer, TranscodeError,
    Transcoder, TransportError, WalletCodec,
};

mod control;
mod donations;
mod streaming;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const OWNER: &str = "owner.addr";
pub const HOST_WALLET: &str = "host-wallet";
pub const SUB_CLIENTS: usize = 3;
pub const CHUNK_SIZE: usize = 1_000;
pub const POOL: usize = 4;

/// One pool identity; records every send.
#[derive(Default)]
pub struct MemClient {
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<(Vec<String>, Payload)>>,
}

#[async_trait]
impl OverlayClient for MemClient {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

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
        self.sent.lock().push((destinations.to_vec(), payload));
        Ok(())
    }
}

pub struct MemOverlay {
    pub clients: Vec<Arc<MemClient>>,
    pub topics: Mutex<Vec<String>>,
}

impl MemOverlay {
    fn new(pool: usize) -> Self {
        Self {
            clients: (0..pool).map(|_| Arc::new(MemClient::default())).collect(),
            topics: Mutex::new(Vec::new()),
        }
    }

    /// Every send that reached `address` on any route, with the route used.
    pub fn received_by(&self, address: &str) -> Vec<(String, Payload)> {
        let mut out = Vec::new();
        for client in &self.clients {
            for (dests, payload) in client.sent.lock().iter() {
                for d in dests {
                    if strip_sub_address(d) == address {
                        out.push((d.clone(), payload.clone()));
                    }
                }
            }
        }
        out
    }

    /// Sends addressed to more than one destination at once.
    pub fn group_sends(&self) -> Vec<(Vec<String>, Payload)> {
        self.clients
            .iter()
            .flat_map(|c| c.sent.lock().clone())
            .filter(|(dests, _)| dests.len() > 1)
            .collect()
    }

    pub fn clear(&self) {
        for c in &self.clients {
            c.sent.lock().clear();
        }
    }
}

#[async_trait]
impl Overlay for MemOverlay {
    fn address(&self) -> String {
        "host.addr".into()
    }

    fn wallet_address(&self) -> String {
        HOST_WALLET.into()
    }

    fn clients(&self) -> Vec<Arc<dyn OverlayClient>> {
        self.clients
            .iter()
            .map(|c| c.clone() as Arc<dyn OverlayClient>)
            .collect()
    }

    async fn subscribe(&self, topic: &str, _blocks: u32, _meta: &str) -> Result<(), TransportError> {
        self.topics.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().retain(|t| t != topic);
        Ok(())
    }
}

/// Client address doubles as wallet; program hashes are UTF-8 wallets.
pub struct PlainWallet;

impl WalletCodec for PlainWallet {
    fn client_to_wallet(&self, client_address: &str) -> Option<String> {
        Some(strip_sub_address(client_address).to_string())
    }

    fn program_hash_to_wallet(&self, program_hash: &[u8]) -> Option<String> {
        String::from_utf8(program_hash.to_vec()).ok()
    }
}

/// Ledger node answering from in-memory transaction lists.
#[derive(Default)]
pub struct MemLedger {
    pub mempool: Mutex<Vec<Transaction>>,
    pub confirmed: Mutex<Vec<Transaction>>,
}

#[async_trait]
impl LedgerRpc for MemLedger {
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "getrawmempool" => Ok(serde_json::to_value(self.mempool.lock().clone()).unwrap_or(json!([]))),
            "gettransaction" => {
                let hash = params["hash"].as_str().unwrap_or_default();
                let found = self.confirmed.lock().iter().find(|tx| tx.hash == hash).cloned();
                match found {
                    Some(tx) => serde_json::to_value(tx).map_err(|_| RpcError::MissingResult),
                    None => Err(RpcError::Remote {
                        code: -45022,
                        message: "unknown transaction".into(),
                    }),
                }
            }
            _ => Err(RpcError::MissingResult),
        }
    }
}

pub fn transfer_tx(donation_id: &str, hash: &str, from: &str, to: &str, units: i64) -> Transaction {
    let asset = TransferAsset {
        sender: from.as_bytes().to_vec(),
        recipient: to.as_bytes().to_vec(),
        amount: units * ASSET_UNIT_SCALE,
    };
    Transaction {
        attributes: donation_id.to_string(),
        hash: hash.to_string(),
        payload_data: hex::encode(asset.encode_to_vec()),
        tx_type: TRANSFER_ASSET_TYPE.to_string(),
        ..Transaction::default()
    }
}

pub fn tx_hash(n: u8) -> String {
    hex::encode([n; 32])
}

/// 1080p30 source; each transcode keeps the first half of its input.
pub struct HalvingTranscoder;

#[async_trait]
impl Transcoder for HalvingTranscoder {
    async fn probe(&self, _segment: Bytes) -> Result<SourceInfo, TranscodeError> {
        Ok(SourceInfo {
            codec: "h264".into(),
            width: 1920,
            resolution: 1080,
            framerate: 30,
        })
    }

    async fn transcode(&self, _profile: TranscodeProfile, segment: Bytes) -> Result<Bytes, TranscodeError> {
        Ok(segment.slice(..segment.len() / 2))
    }

    async fn thumbnail(&self, _segment: Bytes) -> Result<Bytes, TranscodeError> {
        Ok(Bytes::from_static(b"\xff\xd8thumb"))
    }
}

pub struct Node {
    pub streamer: Arc<Streamer>,
    pub overlay: Arc<MemOverlay>,
    pub ledger: Arc<MemLedger>,
}

pub fn node(transcode: Vec<TranscodeProfile>) -> Node {
    let overlay = Arc::new(MemOverlay::new(POOL));
    let ledger = Arc::new(MemLedger::default());
    let balancer = Arc::new(ClientBalancer::new(overlay.clients(), SUB_CLIENTS));
    let fast = RetryPolicy {
        attempts: 2,
        spacing: Duration::from_millis(5),
        timeout: Duration::from_millis(200),
    };
    let validator = DonationValidator::new(
        Arc::new(DonationLedger::new()),
        ledger.clone(),
        Arc::new(PlainWallet),
        overlay.wallet_address(),
    )
    .with_policies(true, fast, fast);

    let settings = StreamSettings {
        owner: OWNER.to_string(),
        panels: "Welcome to the stream".to_string(),
        chunk_size: CHUNK_SIZE,
        transcode,
        ..StreamSettings::default()
    };
    let streamer = Streamer::new(
        settings,
        overlay.clone(),
        balancer,
        Arc::new(validator),
        Arc::new(HalvingTranscoder),
    );
    Node {
        streamer,
        overlay,
        ledger,
    }
}

pub fn p720() -> TranscodeProfile {
    TranscodeProfile {
        resolution: 720,
        framerate: 30,
    }
}

pub fn segment(len: usize, seed: u8) -> Bytes {
    Bytes::from((0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<u8>>())
}

impl Node {
    /// Deliver a message from `src` and wait for any chat task it started.
    pub async fn send(&self, src: &str, data: &[u8]) -> [u8; 8] {
        let message_id = random_message_id();
        let msg = InboundMessage {
            src: src.to_string(),
            message_id,
            data: Bytes::copy_from_slice(data),
        };
        if let Some(task) = self.streamer.handle_message(msg) {
            task.await.expect("chat task panicked");
        }
        settle().await;
        message_id
    }

    pub async fn publish(&self, data: Bytes) {
        self.streamer
            .on_segment(data)
            .await
            .expect("segment task panicked");
        settle().await;
    }

    /// Text replies to `message_id` seen by `address`, one per route.
    pub fn replies(&self, address: &str, message_id: [u8; 8]) -> Vec<String> {
        self.overlay
            .received_by(address)
            .into_iter()
            .filter(|(_, p)| p.reply_to == Some(message_id))
            .filter_map(|(_, p)| p.as_text().map(str::to_string))
            .collect()
    }

    /// Reassemble every complete segment `address` received.
    pub fn segments_of(&self, address: &str) -> Vec<(u32, Bytes)> {
        let mut asm = SegmentAssembler::new();
        let mut out = Vec::new();
        for (_, payload) in self.overlay.received_by(address) {
            if payload.reply_to.is_some() || payload.kind != PayloadKind::Binary {
                continue;
            }
            let Ok(chunk) = Chunk::decode(payload.data) else {
                continue;
            };
            // Redundant routes can complete a segment more than once.
            if let Ok(Some(done)) = asm.push(chunk) {
                if !out.iter().any(|(id, _)| *id == done.0) {
                    out.push(done);
                }
            }
        }
        out
    }
}

/// Let spawned sends land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

//! Stream service. Ties ingest, fan-out, viewers and chat together.
//!
//! `Streamer` owns the per-stream state (segment counter, source info,
//! thumbnail) and answers viewer control messages. Long-running work is
//! split into loops that each stop on the shared shutdown signal:
//! - `run_receiver`: inbound viewer messages
//! - `run_sweeper`: viewer TTL expiry
//! - `maintain_subscription`: discovery topic while live
//! - `report_clients`: overlay pool health
//! - `prune_donation_ids`: unpaid donation id expiry
//! - `run_ingest_events`: ingest lifecycle

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use novon_core::config::{NovonConfig, TranscodeProfile};
use novon_core::control::ControlMessage;
use novon_core::message::{ChannelInfo, OWNER_ROLE};
use novon_core::overlay::{MessageId, Payload};
use novon_core::wire;

use crate::balancer::Broadcaster;
use crate::chat::{ChatOutcome, ChatService};
use crate::donation::{DonationLedger, DonationValidator};
use crate::fanout::{PublishReport, QualityFanout, TranscodeBudget};
use crate::log_watcher::{IngestEvent, IngestEventSource};
use crate::transcode::{select_profiles, SourceInfo, Transcoder};
use crate::transport::{InboundMessage, Overlay};
use crate::viewers::{self, ViewerRegistry};

/// A thumbnail is captured on every Nth segment.
pub const THUMBNAIL_EVERY: u32 = 10;

/// How often unpaid donation ids are checked for expiry.
pub const DONATION_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on one overlay subscribe or unsubscribe call.
pub const SUBSCRIPTION_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub title: String,
    pub owner: String,
    pub panels: String,
    pub chunk_size: usize,
    pub segment_duration: Duration,
    pub transcode: Vec<TranscodeProfile>,
    /// Stream counts as live this long after the last segment.
    pub live_window: Duration,
    pub topic: String,
    pub subscribe_duration_blocks: u32,
    pub resubscribe_after: Duration,
    pub viewer_ttl: Duration,
    pub sweep_interval: Duration,
    pub default_quality: u32,
    /// Unpaid donation ids older than this are forgotten.
    pub donation_id_ttl: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &NovonConfig) -> Self {
        let blocks = config.network.subscribe_duration_blocks;
        Self {
            title: config.stream.title.clone(),
            owner: config.stream.owner.clone(),
            panels: config.stream.panels.clone(),
            chunk_size: config.stream.chunk_size,
            segment_duration: Duration::from_millis(config.stream.segment_duration_ms),
            transcode: config.stream.transcode.clone(),
            live_window: Duration::from_secs(5),
            topic: config.network.topic.clone(),
            subscribe_duration_blocks: blocks,
            // ~20 s per block
            resubscribe_after: Duration::from_secs(u64::from(blocks) * 20),
            viewer_ttl: Duration::from_secs(config.viewers.ttl_secs),
            sweep_interval: Duration::from_millis(config.viewers.sweep_interval_ms),
            default_quality: config.viewers.default_quality,
            donation_id_ttl: Duration::from_secs(config.donation.id_ttl_secs),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&NovonConfig::default())
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Publish {
        segment_id: u32,
        viewers: usize,
        segment_bytes: usize,
        chunks: usize,
    },
    Clients {
        connected: usize,
        pool: usize,
    },
    Ingest(IngestEvent),
}

// ── Subscription ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Decides when the discovery subscription is placed, renewed or dropped.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    last_subscribe: Option<Instant>,
}

impl SubscriptionState {
    pub fn step(&mut self, now: Instant, live: bool, renew_after: Duration) -> Option<SubscriptionAction> {
        match (live, self.last_subscribe) {
            (true, None) => {
                self.last_subscribe = Some(now);
                Some(SubscriptionAction::Subscribe)
            }
            (true, Some(at)) if now.saturating_duration_since(at) > renew_after => {
                self.last_subscribe = Some(now);
                Some(SubscriptionAction::Subscribe)
            }
            (false, Some(_)) => {
                self.last_subscribe = None;
                Some(SubscriptionAction::Unsubscribe)
            }
            _ => None,
        }
    }
}

// ── Streamer ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MediaState {
    last_segment_at: Option<Instant>,
    source: Option<SourceInfo>,
    profiles: Vec<TranscodeProfile>,
    thumbnail: Bytes,
}

pub struct Streamer {
    settings: StreamSettings,
    overlay: Arc<dyn Overlay>,
    broadcaster: Arc<dyn Broadcaster>,
    transcoder: Arc<dyn Transcoder>,
    viewers: Arc<ViewerRegistry>,
    fanout: QualityFanout,
    chat: Arc<ChatService>,
    ledger: Arc<DonationLedger>,
    budget: TranscodeBudget,
    segment_id: AtomicU32,
    media: Mutex<MediaState>,
    /// Serializes segment processing.
    pipeline: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StreamEvent>,
}

impl Streamer {
    pub fn new(
        settings: StreamSettings,
        overlay: Arc<dyn Overlay>,
        broadcaster: Arc<dyn Broadcaster>,
        validator: Arc<DonationValidator>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Arc<Self> {
        let viewers = Arc::new(ViewerRegistry::new(settings.default_quality));
        let fanout = QualityFanout::new(viewers.clone(), broadcaster.clone());
        let ledger = validator.ledger().clone();
        let chat = Arc::new(ChatService::new(
            validator,
            broadcaster.clone(),
            viewers.clone(),
            settings.owner.clone(),
        ));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            budget: TranscodeBudget::new(settings.segment_duration),
            settings,
            overlay,
            broadcaster,
            transcoder,
            viewers,
            fanout,
            chat,
            ledger,
            segment_id: AtomicU32::new(0),
            media: Mutex::new(MediaState::default()),
            pipeline: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn viewers(&self) -> &Arc<ViewerRegistry> {
        &self.viewers
    }

    pub fn ledger(&self) -> &Arc<DonationLedger> {
        &self.ledger
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Id the next segment will carry.
    pub fn segment_id(&self) -> u32 {
        self.segment_id.load(Ordering::Relaxed)
    }

    pub fn is_broadcasting(&self) -> bool {
        self.media
            .lock()
            .last_segment_at
            .is_some_and(|at| at.elapsed() < self.settings.live_window)
    }

    pub fn thumbnail(&self) -> Bytes {
        self.media.lock().thumbnail.clone()
    }

    /// Source quality followed by every active transcode profile.
    pub fn quality_levels(&self) -> Vec<TranscodeProfile> {
        let media = self.media.lock();
        let source = media.source.as_ref().map(SourceInfo::as_profile).unwrap_or(TranscodeProfile {
            resolution: 0,
            framerate: 0,
        });
        std::iter::once(source).chain(media.profiles.iter().copied()).collect()
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Control ───────────────────────────────────────────────────────────────

    fn reply_text(&self, src: &str, message_id: MessageId, text: impl Into<String>) {
        self.broadcaster
            .unicast(src, Payload::text(text).in_reply_to(message_id));
    }

    /// Handle one inbound viewer message. Returns the spawned chat task for
    /// envelopes.
    pub fn handle_message(self: &Arc<Self>, msg: InboundMessage) -> Option<JoinHandle<ChatOutcome>> {
        let control = ControlMessage::parse(&msg.data);
        let src = msg.src.as_str();

        if !control.always_answered() && !self.is_broadcasting() {
            tracing::trace!(src, "not live, message ignored");
            return None;
        }

        match control {
            ControlMessage::GetPanels => {
                self.reply_text(src, msg.message_id, self.settings.panels.clone());
            }
            ControlMessage::ChannelInfo => {
                let info = ChannelInfo {
                    panels: self.settings.panels.clone(),
                    viewers: self.viewers.len(),
                    role: if src == self.settings.owner {
                        OWNER_ROLE.to_string()
                    } else {
                        String::new()
                    },
                    quality_levels: self.quality_levels(),
                };
                match serde_json::to_string(&info) {
                    Ok(json) => self.reply_text(src, msg.message_id, json),
                    Err(e) => tracing::warn!(error = %e, "channel info serialization failed"),
                }
            }
            ControlMessage::Ping => {
                if self.viewers.add_or_touch(src) {
                    let chunks = self.fanout.catch_up(src);
                    tracing::info!(viewer = src, catch_up_chunks = chunks, "viewer joined");
                }
            }
            ControlMessage::Thumbnail => {
                self.broadcaster
                    .unicast(src, Payload::binary(self.thumbnail()).in_reply_to(msg.message_id));
            }
            ControlMessage::Disconnect => {
                if self.viewers.remove(src) {
                    tracing::info!(viewer = src, "viewer left - disconnected");
                }
            }
            ControlMessage::ViewCount => {
                self.reply_text(src, msg.message_id, self.viewers.len().to_string());
            }
            ControlMessage::DonationId => {
                self.reply_text(src, msg.message_id, self.ledger.issue());
            }
            ControlMessage::Quality(tier) => {
                self.viewers.set_quality(src, tier);
                self.reply_text(src, msg.message_id, self.segment_id().to_string());
            }
            ControlMessage::Envelope(raw) => {
                let chat = self.chat.clone();
                let src = msg.src.clone();
                let message_id = msg.message_id;
                return Some(tokio::spawn(async move {
                    chat.process(&src, message_id, &raw).await
                }));
            }
        }
        None
    }

    // ── Segments ──────────────────────────────────────────────────────────────

    /// Accept one finished segment from ingest. Work happens in the
    /// returned task.
    pub fn on_segment(self: &Arc<Self>, segment: Bytes) -> JoinHandle<Option<PublishReport>> {
        let reprobe = {
            let mut media = self.media.lock();
            let was_live = media
                .last_segment_at
                .is_some_and(|at| at.elapsed() < self.settings.live_window);
            media.last_segment_at = Some(Instant::now());
            !was_live
        };
        let this = self.clone();
        tokio::spawn(async move { this.process_segment(segment, reprobe).await })
    }

    async fn process_segment(self: Arc<Self>, segment: Bytes, reprobe: bool) -> Option<PublishReport> {
        let _guard = self.pipeline.lock().await;

        if reprobe {
            self.probe_source(segment.clone()).await;
        }
        let profiles = self.media.lock().profiles.clone();

        let segment_id = self.segment_id();
        let source_chunks = match wire::split_framed(&segment, self.settings.chunk_size, segment_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "segment could not be chunked");
                return None;
            }
        };
        let source_chunk_count = source_chunks.len();
        let mut variants = vec![source_chunks];

        let started = Instant::now();
        let mut current = segment.clone();
        for profile in &profiles {
            let begin = Instant::now();
            let out = match self.transcoder.transcode(*profile, current.clone()).await {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!(
                        resolution = profile.resolution,
                        framerate = profile.framerate,
                        error = %e,
                        "transcode failed, lower variants skipped"
                    );
                    break;
                }
            };
            match wire::split_framed(&out, self.settings.chunk_size, segment_id) {
                Ok(chunks) => {
                    tracing::debug!(
                        resolution = profile.resolution,
                        framerate = profile.framerate,
                        bytes = out.len(),
                        chunks = chunks.len(),
                        elapsed_ms = begin.elapsed().as_millis() as u64,
                        "transcoded"
                    );
                    variants.push(chunks);
                    current = out;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transcoded segment could not be chunked");
                    break;
                }
            }
        }
        self.segment_id.fetch_add(1, Ordering::Relaxed);

        let report = self.fanout.publish_segment(variants);
        self.emit(StreamEvent::Publish {
            segment_id,
            viewers: report.viewers(),
            segment_bytes: segment.len(),
            chunks: source_chunk_count,
        });

        if !profiles.is_empty() {
            self.budget.assess(started.elapsed());
        }

        if segment_id % THUMBNAIL_EVERY == 0 {
            let this = self.clone();
            tokio::spawn(async move { this.capture_thumbnail(current).await });
        }

        Some(report)
    }

    async fn probe_source(&self, segment: Bytes) {
        match self.transcoder.probe(segment).await {
            Ok(info) => {
                let profiles = select_profiles(&self.settings.transcode, &info);
                tracing::info!(
                    codec = %info.codec,
                    resolution = info.resolution,
                    framerate = info.framerate,
                    variants = profiles.len(),
                    "receiving stream"
                );
                for p in &profiles {
                    tracing::info!(resolution = p.resolution, framerate = p.framerate, "transcoding to");
                }
                let mut media = self.media.lock();
                media.source = Some(info);
                media.profiles = profiles;
            }
            Err(e) => {
                tracing::warn!(error = %e, "source probe failed, sending source quality only");
                let mut media = self.media.lock();
                media.source = None;
                media.profiles.clear();
            }
        }
    }

    async fn capture_thumbnail(&self, segment: Bytes) {
        match self.transcoder.thumbnail(segment).await {
            Ok(image) => {
                tracing::debug!(bytes = image.len(), "thumbnail captured");
                self.media.lock().thumbnail = image;
            }
            Err(e) => tracing::warn!(error = %e, "thumbnail capture failed"),
        }
    }

    // ── Loops ─────────────────────────────────────────────────────────────────

    pub async fn run_receiver(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receiver shutting down");
                    return;
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("inbound channel closed, receiver exiting");
                        return;
                    };
                    self.handle_message(msg);
                }
            }
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, shutdown: broadcast::Receiver<()>) {
        viewers::sweeper_loop(
            self.viewers.clone(),
            self.settings.viewer_ttl,
            self.settings.sweep_interval,
            shutdown,
        )
        .await
    }

    pub async fn maintain_subscription(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut state = SubscriptionState::default();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("subscription maintenance shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let live = self.is_broadcasting();
                    if let Some(action) = state.step(Instant::now(), live, self.settings.resubscribe_after) {
                        tokio::spawn(self.clone().apply_subscription(action));
                    }
                }
            }
        }
    }

    /// One overlay subscription call, bounded by `SUBSCRIPTION_CALL_TIMEOUT`.
    async fn apply_subscription(self: Arc<Self>, action: SubscriptionAction) {
        let topic = &self.settings.topic;
        let call = async {
            match action {
                SubscriptionAction::Subscribe => {
                    self.overlay
                        .subscribe(topic, self.settings.subscribe_duration_blocks, &self.settings.title)
                        .await
                }
                SubscriptionAction::Unsubscribe => self.overlay.unsubscribe(topic).await,
            }
        };
        match tokio::time::timeout(SUBSCRIPTION_CALL_TIMEOUT, call).await {
            Ok(Ok(())) => tracing::info!(%topic, ?action, "subscription updated"),
            Ok(Err(e)) => tracing::warn!(%topic, ?action, error = %e, "subscription call failed"),
            Err(_) => tracing::warn!(%topic, ?action, "subscription call timed out"),
        }
    }

    pub async fn report_clients(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("client reporter shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let clients = self.overlay.clients();
                    let connected = clients.iter().filter(|c| !c.is_closed()).count();
                    tracing::debug!(connected, pool = clients.len(), "overlay clients");
                    self.emit(StreamEvent::Clients { connected, pool: clients.len() });
                }
            }
        }
    }

    pub async fn prune_donation_ids(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(DONATION_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("donation id pruner shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let dropped = self.ledger.prune_unconsumed(self.settings.donation_id_ttl);
                    if dropped > 0 {
                        tracing::info!(dropped, remaining = self.ledger.len(), "expired unpaid donation ids");
                    }
                }
            }
        }
    }

    pub async fn run_ingest_events<S>(self: Arc<Self>, mut source: S, mut shutdown: broadcast::Receiver<()>)
    where
        S: IngestEventSource,
    {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = source.next_event() => {
                    let Some(event) = event else {
                        tracing::info!("ingest event source closed");
                        return;
                    };
                    match &event {
                        IngestEvent::PortBound(port) => tracing::info!(%port, "ingest listening"),
                        IngestEvent::PublishStarted => tracing::info!("ingest publishing started"),
                        IngestEvent::Terminated => tracing::info!("ingest session terminated"),
                    }
                    self.emit(StreamEvent::Ingest(event));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::tests::RecordingClient;
    use crate::donation::tests::{IdentityWallet, ScriptedRpc};
    use crate::fanout::tests::RecordingBroadcaster;
    use crate::log_watcher::ChannelEventSource;
    use crate::transcode::TranscodeError;
    use crate::transport::{OverlayClient, TransportError};
    use async_trait::async_trait;

    struct FakeOverlay {
        clients: Vec<Arc<RecordingClient>>,
        subs: Mutex<Vec<String>>,
        /// Subscription calls never return.
        hang: bool,
    }

    #[async_trait]
    impl Overlay for FakeOverlay {
        fn address(&self) -> String {
            "host".into()
        }

        fn wallet_address(&self) -> String {
            "host-wallet".into()
        }

        fn clients(&self) -> Vec<Arc<dyn OverlayClient>> {
            self.clients
                .iter()
                .map(|c| c.clone() as Arc<dyn OverlayClient>)
                .collect()
        }

        async fn subscribe(&self, topic: &str, blocks: u32, meta: &str) -> Result<(), TransportError> {
            self.subs.lock().push(format!("+{topic}/{blocks}/{meta}"));
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.subs.lock().push(format!("-{topic}"));
            Ok(())
        }
    }

    /// 1080p30 source; each transcode prefixes the profile height.
    struct FakeTranscoder;

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn probe(&self, _segment: Bytes) -> Result<SourceInfo, TranscodeError> {
            Ok(SourceInfo {
                codec: "h264".into(),
                width: 1920,
                resolution: 1080,
                framerate: 30,
            })
        }

        async fn transcode(&self, profile: TranscodeProfile, segment: Bytes) -> Result<Bytes, TranscodeError> {
            let mut out = format!("{}:", profile.resolution).into_bytes();
            out.extend_from_slice(&segment[..segment.len() / 2]);
            Ok(Bytes::from(out))
        }

        async fn thumbnail(&self, _segment: Bytes) -> Result<Bytes, TranscodeError> {
            Ok(Bytes::from_static(b"JPEG"))
        }
    }

    struct Harness {
        streamer: Arc<Streamer>,
        rec: Arc<RecordingBroadcaster>,
        overlay: Arc<FakeOverlay>,
    }

    fn harness(transcode: Vec<TranscodeProfile>) -> Harness {
        harness_with(transcode, false)
    }

    fn harness_with(transcode: Vec<TranscodeProfile>, hang: bool) -> Harness {
        let settings = StreamSettings {
            owner: "owner".into(),
            panels: "panel text".into(),
            chunk_size: 100,
            transcode,
            ..StreamSettings::default()
        };
        let overlay = Arc::new(FakeOverlay {
            clients: (0..4).map(|_| Arc::new(RecordingClient::default())).collect(),
            subs: Mutex::new(Vec::new()),
            hang,
        });
        let rec = Arc::new(RecordingBroadcaster::default());
        let validator = Arc::new(DonationValidator::new(
            Arc::new(DonationLedger::new()),
            Arc::new(ScriptedRpc::default()),
            Arc::new(IdentityWallet),
            "host-wallet".into(),
        ));
        let streamer = Streamer::new(settings, overlay.clone(), rec.clone(), validator, Arc::new(FakeTranscoder));
        Harness {
            streamer,
            rec,
            overlay,
        }
    }

    fn inbound(src: &str, data: &[u8]) -> InboundMessage {
        InboundMessage {
            src: src.into(),
            message_id: [9; 8],
            data: Bytes::copy_from_slice(data),
        }
    }

    fn replies_to(rec: &RecordingBroadcaster, addr: &str) -> Vec<String> {
        rec.unicasts
            .lock()
            .iter()
            .filter(|(a, p)| a == addr && p.reply_to.is_some())
            .filter_map(|(_, p)| p.as_text().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn offline_stream_answers_only_panels_and_info() {
        let h = harness(Vec::new());
        assert!(!h.streamer.is_broadcasting());

        h.streamer.handle_message(inbound("v", b"getpanels"));
        h.streamer.handle_message(inbound("owner", b"channelinfo"));
        h.streamer.handle_message(inbound("v", b"ping"));
        h.streamer.handle_message(inbound("v", b"viewcount"));

        assert_eq!(replies_to(&h.rec, "v"), vec!["panel text".to_string()]);
        let info: serde_json::Value =
            serde_json::from_str(&replies_to(&h.rec, "owner")[0]).unwrap();
        assert_eq!(info["role"], "owner");
        assert_eq!(info["viewers"], 0);
        assert!(h.streamer.viewers().is_empty());
    }

    #[tokio::test]
    async fn live_stream_control_flow() {
        let h = harness(Vec::new());
        h.streamer.on_segment(Bytes::from(vec![7u8; 250])).await.unwrap();
        assert!(h.streamer.is_broadcasting());

        h.streamer.handle_message(inbound("v", b"ping"));
        assert!(h.streamer.viewers().contains("v"));
        // Joined after the first segment: catch-up of all three source chunks.
        assert_eq!(
            h.rec.unicasts.lock().iter().filter(|(a, _)| a == "v").count(),
            3
        );

        h.streamer.handle_message(inbound("v", b"viewcount"));
        h.streamer.handle_message(inbound("v", b"quality0"));
        h.streamer.handle_message(inbound("v", b"donationid"));
        let replies = replies_to(&h.rec, "v");
        assert_eq!(replies[0], "1");
        assert_eq!(replies[1], "1");
        assert_eq!(replies[2].len(), 64);
        assert_eq!(h.streamer.viewers().quality_of("v"), Some(0));
        assert_eq!(
            h.streamer.ledger().state(&replies[2]),
            crate::donation::DonationState::Unconsumed
        );

        h.streamer.handle_message(inbound("v", b"disconnect"));
        assert!(!h.streamer.viewers().contains("v"));
    }

    #[tokio::test]
    async fn chat_envelope_is_spawned() {
        let h = harness(Vec::new());
        h.streamer.on_segment(Bytes::from_static(b"seg")).await.unwrap();
        h.streamer.handle_message(inbound("v", b"ping"));

        let task = h
            .streamer
            .handle_message(inbound("v", br#"{"type":"chat-message","content":{"text":"hey"}}"#))
            .expect("chat task");
        assert!(matches!(task.await.unwrap(), ChatOutcome::Posted(_)));
    }

    #[tokio::test]
    async fn segments_are_transcoded_in_a_chain() {
        let h = harness(vec![
            TranscodeProfile { resolution: 480, framerate: 30 },
            TranscodeProfile { resolution: 720, framerate: 30 },
            TranscodeProfile { resolution: 1440, framerate: 60 },
        ]);
        let mut events = h.streamer.subscribe_events();

        h.streamer.on_segment(Bytes::from(vec![1u8; 400])).await.unwrap();
        h.streamer.handle_message(inbound("src", b"ping"));
        h.streamer.handle_message(inbound("low", b"ping"));
        h.streamer.handle_message(inbound("src", b"quality0"));
        h.streamer.handle_message(inbound("low", b"quality9"));

        let report = h.streamer.on_segment(Bytes::from(vec![2u8; 400])).await.unwrap().unwrap();
        assert_eq!(report.deliveries.len(), 2);
        assert_eq!(report.deliveries[0].variant, 0);
        assert_eq!(report.deliveries[0].chunks, 4);
        // 480p is transcoded from the 720p output, so it is the smallest.
        assert_eq!(report.deliveries[1].variant, 2);
        assert_eq!(report.deliveries[1].chunks, 2);

        let levels: Vec<u32> = h.streamer.quality_levels().iter().map(|p| p.resolution).collect();
        assert_eq!(levels, vec![1080, 720, 480]);
        assert_eq!(h.streamer.segment_id(), 2);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Publish { segment_id: 0, .. }));
    }

    #[tokio::test]
    async fn first_segment_captures_thumbnail() {
        let h = harness(Vec::new());
        h.streamer.on_segment(Bytes::from_static(b"seg")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(&h.streamer.thumbnail()[..], b"JPEG");

        h.streamer.handle_message(inbound("v", b"thumbnail"));
        let uni = h.rec.unicasts.lock();
        let (_, p) = uni.iter().find(|(a, _)| a == "v").unwrap();
        assert_eq!(&p.data[..], b"JPEG");
    }

    #[test]
    fn subscription_state_machine() {
        let renew = Duration::from_secs(2000);
        let t0 = Instant::now();
        let mut s = SubscriptionState::default();

        assert_eq!(s.step(t0, false, renew), None);
        assert_eq!(s.step(t0, true, renew), Some(SubscriptionAction::Subscribe));
        assert_eq!(s.step(t0 + Duration::from_secs(1), true, renew), None);
        assert_eq!(
            s.step(t0 + Duration::from_secs(2001), true, renew),
            Some(SubscriptionAction::Subscribe)
        );
        assert_eq!(
            s.step(t0 + Duration::from_secs(2002), false, renew),
            Some(SubscriptionAction::Unsubscribe)
        );
        assert_eq!(s.step(t0 + Duration::from_secs(2003), false, renew), None);
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let h = harness(Vec::new());
        h.streamer.on_segment(Bytes::from_static(b"seg")).await.unwrap();
        let mut events = h.streamer.subscribe_events();

        let (shutdown, _) = broadcast::channel(1);
        let (ingest_tx, ingest_rx) = mpsc::channel(4);
        let tasks = vec![
            tokio::spawn(h.streamer.clone().maintain_subscription(shutdown.subscribe())),
            tokio::spawn(h.streamer.clone().report_clients(shutdown.subscribe())),
            tokio::spawn(h.streamer.clone().run_sweeper(shutdown.subscribe())),
            tokio::spawn(h.streamer.clone().prune_donation_ids(shutdown.subscribe())),
            tokio::spawn(
                h.streamer
                    .clone()
                    .run_ingest_events(ChannelEventSource::new(ingest_rx), shutdown.subscribe()),
            ),
        ];

        ingest_tx.send(IngestEvent::PublishStarted).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert!(seen.contains(&StreamEvent::Clients { connected: 4, pool: 4 }));
        assert!(seen.contains(&StreamEvent::Ingest(IngestEvent::PublishStarted)));
        assert_eq!(*h.overlay.subs.lock(), vec!["+novon/100/Unnamed Stream".to_string()]);

        shutdown.send(()).unwrap();
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test]
    async fn stuck_subscribe_does_not_block_shutdown() {
        let h = harness_with(Vec::new(), true);
        h.streamer.on_segment(Bytes::from_static(b"seg")).await.unwrap();

        let (shutdown, _) = broadcast::channel(1);
        let task = tokio::spawn(h.streamer.clone().maintain_subscription(shutdown.subscribe()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.overlay.subs.lock().len(), 1);

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("maintenance loop ignored shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn offline_gate_uses_always_answered_words() {
        let h = harness(Vec::new());
        for word in [&b"getpanels"[..], b"channelinfo", b"ping", b"thumbnail", b"quality0"] {
            let answered = ControlMessage::parse(word).always_answered();
            let before = h.rec.unicasts.lock().len();
            h.streamer.handle_message(inbound("v", word));
            let replied = h.rec.unicasts.lock().len() > before;
            assert_eq!(replied, answered, "{}", String::from_utf8_lossy(word));
        }
    }
}

//! Quality-aware segment fan-out.
//!
//! Each segment arrives as one chunk list per quality variant, index 0 being
//! the source. Every tier in the viewer cache receives the variant matching
//! its tier, or the highest variant available when the tier is above what
//! was produced. The source variant is kept so that late joiners can start
//! playing before the next segment lands.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use novon_core::overlay::Payload;
use parking_lot::RwLock;

use crate::balancer::Broadcaster;
use crate::viewers::ViewerRegistry;

/// What one `publish_segment` call sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub deliveries: Vec<TierDelivery>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDelivery {
    pub tier: u32,
    /// Variant actually sent to this tier.
    pub variant: usize,
    pub addresses: usize,
    pub chunks: usize,
}

impl PublishReport {
    pub fn viewers(&self) -> usize {
        self.deliveries.iter().map(|d| d.addresses).sum()
    }

    pub fn messages(&self) -> usize {
        self.deliveries.iter().map(|d| d.chunks).sum()
    }
}

pub struct QualityFanout {
    viewers: Arc<ViewerRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    last_segment: RwLock<Arc<[Bytes]>>,
}

impl QualityFanout {
    pub fn new(viewers: Arc<ViewerRegistry>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            viewers,
            broadcaster,
            last_segment: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Send every variant to its tier and retain the source variant.
    pub fn publish_segment(&self, variants: Vec<Vec<Bytes>>) -> PublishReport {
        let Some(source) = variants.first() else {
            return PublishReport::default();
        };
        *self.last_segment.write() = Arc::from(source.clone());

        let highest = variants.len() - 1;
        let cache = self.viewers.tier_cache();
        let mut report = PublishReport::default();

        for (tier, addresses) in cache.tiers() {
            let variant = (tier as usize).min(highest);
            let chunks = &variants[variant];
            for chunk in chunks {
                self.broadcaster
                    .multicast(addresses.clone(), Payload::binary(chunk.clone()));
            }
            report.deliveries.push(TierDelivery {
                tier,
                variant,
                addresses: addresses.len(),
                chunks: chunks.len(),
            });
        }

        report
    }

    /// Send the retained segment to one viewer. Returns the chunk count.
    pub fn catch_up(&self, address: &str) -> usize {
        let last = self.last_segment.read().clone();
        for chunk in last.iter() {
            self.broadcaster
                .unicast(address, Payload::binary(chunk.clone()));
        }
        last.len()
    }

    pub fn last_segment(&self) -> Arc<[Bytes]> {
        self.last_segment.read().clone()
    }
}

// ── Transcode budget ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Within,
    /// Past half a segment. Viewers are fine, headroom is thin.
    Approaching,
    /// Transcoding takes longer than real time. Playback will stall.
    Exceeded,
}

/// Compares per-segment transcode time against the segment duration.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeBudget {
    segment_duration: Duration,
}

impl TranscodeBudget {
    pub fn new(segment_duration: Duration) -> Self {
        Self { segment_duration }
    }

    pub fn assess(&self, elapsed: Duration) -> BudgetStatus {
        let ms = elapsed.as_millis() as u64;
        if elapsed >= self.segment_duration {
            tracing::error!(
                elapsed_ms = ms,
                segment_ms = self.segment_duration.as_millis() as u64,
                "transcoding exceeds segment duration, stream will stall; reduce transcode profiles"
            );
            BudgetStatus::Exceeded
        } else if elapsed >= self.segment_duration / 2 {
            tracing::warn!(
                elapsed_ms = ms,
                segment_ms = self.segment_duration.as_millis() as u64,
                "transcoding time approaching segment duration"
            );
            BudgetStatus::Approaching
        } else {
            BudgetStatus::Within
        }
    }
}

impl Default for TranscodeBudget {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

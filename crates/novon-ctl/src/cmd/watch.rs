//! `watch`: join the stream and write reassembled segments to a file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use novon_core::control::ControlMessage;
use novon_core::overlay::PayloadKind;
use novon_core::wire::{Chunk, SegmentAssembler};

use super::chat::format_chat;
use super::control::control;
use super::session::Session;

/// Heartbeat period; well inside the broadcaster's viewer TTL.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Incomplete segments further back than this are abandoned.
const REORDER_WINDOW: u32 = 3;

pub async fn cmd_watch(
    session: &Session,
    out: &Path,
    quality: Option<u32>,
    max_segments: Option<usize>,
) -> Result<()> {
    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;

    session.send(&control(&ControlMessage::Ping)).await?;
    if let Some(tier) = quality {
        session.send(&control(&ControlMessage::Quality(tier))).await?;
    }
    println!("Watching, writing to {} (Ctrl-C to stop)", out.display());

    let mut assembler = SegmentAssembler::new();
    let mut newest: Option<u32> = None;
    let mut written = 0usize;
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ping.tick() => {
                session.send(&control(&ControlMessage::Ping)).await?;
            }
            payload = session.recv() => {
                let payload = payload?;
                if payload.reply_to.is_some() {
                    continue;
                }
                if payload.kind == PayloadKind::Text {
                    if let Some(line) = format_chat(&payload.data) {
                        println!("{line}");
                    }
                    continue;
                }
                let Ok(chunk) = Chunk::decode(payload.data) else {
                    continue;
                };
                let Ok(Some((segment_id, segment))) = assembler.push(chunk) else {
                    continue;
                };
                // Segments already written are duplicates from catch-up.
                if newest.is_some_and(|n| segment_id <= n) {
                    continue;
                }
                newest = Some(segment_id);
                assembler.discard_before(segment_id.saturating_sub(REORDER_WINDOW));

                file.write_all(&segment).await?;
                written += 1;
                println!("  segment {segment_id}: {} bytes", segment.len());
                if max_segments.is_some_and(|max| written >= max) {
                    break;
                }
            }
        }
    }

    file.flush().await?;
    session.send(&control(&ControlMessage::Disconnect)).await?;
    println!("Wrote {written} segments to {}", out.display());
    Ok(())
}

//! One-shot control commands.

use std::path::Path;

use anyhow::{Context, Result};

use novon_core::control::ControlMessage;
use novon_core::message::ChannelInfo;
use novon_core::overlay::Payload;

use super::session::Session;

/// Payload carrying a control word.
pub fn control(msg: &ControlMessage) -> Payload {
    Payload::text(String::from_utf8_lossy(&msg.to_bytes()).into_owned())
}

pub async fn cmd_ping(session: &Session) -> Result<()> {
    session.send(&control(&ControlMessage::Ping)).await?;
    println!("ping sent");
    Ok(())
}

pub async fn cmd_disconnect(session: &Session) -> Result<()> {
    session.send(&control(&ControlMessage::Disconnect)).await?;
    println!("disconnect sent");
    Ok(())
}

pub async fn cmd_viewcount(session: &Session) -> Result<()> {
    let count = session.request_text(control(&ControlMessage::ViewCount)).await?;
    println!("Viewers: {count}");
    Ok(())
}

pub async fn cmd_donation_id(session: &Session) -> Result<()> {
    let id = session.request_text(control(&ControlMessage::DonationId)).await?;
    println!("{id}");
    Ok(())
}

pub async fn cmd_panels(session: &Session) -> Result<()> {
    let panels = session.request_text(control(&ControlMessage::GetPanels)).await?;
    if panels.is_empty() {
        println!("No panels.");
    } else {
        println!("{panels}");
    }
    Ok(())
}

pub async fn cmd_quality(session: &Session, tier: u32) -> Result<()> {
    let segment = session
        .request_text(control(&ControlMessage::Quality(tier)))
        .await?;
    println!("Quality tier {tier} from segment {segment}");
    Ok(())
}

pub async fn cmd_channel_info(session: &Session) -> Result<()> {
    let json = session.request_text(control(&ControlMessage::ChannelInfo)).await?;
    let info: ChannelInfo = serde_json::from_str(&json).context("failed to parse channel info")?;

    println!("═══════════════════════════════════════");
    println!("  Channel");
    println!("═══════════════════════════════════════");
    println!("  Viewers : {}", info.viewers);
    if !info.role.is_empty() {
        println!("  Role    : {}", info.role);
    }
    if !info.panels.is_empty() {
        println!("  Panels  : {}", info.panels);
    }
    println!("\n  Quality levels:");
    for (tier, level) in info.quality_levels.iter().enumerate() {
        if level.resolution == 0 {
            println!("  ├─ {tier}: source (not probed)");
        } else {
            println!("  ├─ {tier}: {}p{}", level.resolution, level.framerate);
        }
    }
    Ok(())
}

pub async fn cmd_thumbnail(session: &Session, out: &Path) -> Result<()> {
    let reply = session.request(control(&ControlMessage::Thumbnail)).await?;
    if reply.data.is_empty() {
        println!("No thumbnail captured yet.");
        return Ok(());
    }
    tokio::fs::write(out, &reply.data)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("Thumbnail saved to {} ({} bytes)", out.display(), reply.data.len());
    Ok(())
}

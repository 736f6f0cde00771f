//! Chat commands.

use anyhow::{bail, Result};

use novon_core::message::{ChatMessage, Envelope};
use novon_core::overlay::Payload;

use super::session::Session;

pub async fn cmd_chat(session: &Session, text: &str, hash: &str) -> Result<()> {
    let envelope = Envelope::chat(text, hash)?;
    let reply = session.request_text(Payload::text(String::from_utf8(envelope.to_bytes()?)?)).await?;
    if reply != "success" {
        bail!("chat rejected: {reply}");
    }
    println!("Message posted.");
    Ok(())
}

/// One line for a chat broadcast, or `None` if `raw` is not a chat message.
/// Broadcasts are bare chat objects; envelopes (deletes) carry a `type`.
pub fn format_chat(raw: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
    if value.get("type").is_some() {
        return None;
    }
    let chat = ChatMessage::from_content(&value).ok()?;
    let who = if chat.role.is_empty() {
        short(&chat.src)
    } else {
        format!("{} ({})", short(&chat.src), chat.role)
    };
    Some(format!("[{}] {who}: {}", chat.id, chat.text))
}

fn short(addr: &str) -> String {
    addr.chars().take(16).collect()
}

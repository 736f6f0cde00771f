//! Overlay message model shared by the broadcaster, the dev transport and
//! the viewer CLI.
//!
//! The production overlay hands us opaque payloads tagged with an 8-byte
//! message id. Replies reference the id they answer. Virtual sub-addresses
//! (`__k__.addr`) let one recipient be reached through K independent routes.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::WireError;

pub type MessageId = [u8; 8];

/// Largest payload the dev transport carries in one datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Binary = 0,
    Text = 1,
}

impl PayloadKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Binary),
            1 => Some(Self::Text),
            _ => None,
        }
    }
}

/// One overlay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub message_id: MessageId,
    /// Id of the message this one answers.
    pub reply_to: Option<MessageId>,
    /// Receiver should not send an acknowledgement.
    pub no_reply: bool,
    pub data: Bytes,
}

impl Payload {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            message_id: random_message_id(),
            reply_to: None,
            no_reply: true,
            data: data.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            message_id: random_message_id(),
            reply_to: None,
            no_reply: true,
            data: Bytes::from(text.into()),
        }
    }

    /// Mark as a reply to `message_id`.
    pub fn in_reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

pub fn random_message_id() -> MessageId {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Per-send options passed through to the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendConfig {
    pub unencrypted: bool,
    pub no_reply: bool,
    /// Seconds the overlay may hold an undeliverable message. 0 = drop.
    pub max_holding_secs: u32,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            unencrypted: true,
            no_reply: true,
            max_holding_secs: 0,
        }
    }
}

// ── Sub-addresses ─────────────────────────────────────────────────────────────

/// `__k__.addr`: the k-th virtual route to `addr`.
pub fn sub_address(k: usize, address: &str) -> String {
    format!("__{k}__.{address}")
}

/// Strip a `__k__.` prefix if present.
pub fn strip_sub_address(address: &str) -> &str {
    let Some(rest) = address.strip_prefix("__") else {
        return address;
    };
    match rest.find("__.") {
        Some(end) if end > 0 && rest[..end].bytes().all(|b| b.is_ascii_digit()) => {
            &rest[end + 3..]
        }
        _ => address,
    }
}

// ── Datagram framing ──────────────────────────────────────────────────────────

const FLAG_HAS_REPLY_TO: u8 = 0x01;
const FLAG_NO_REPLY: u8 = 0x02;

/// Header the dev transport puts in front of every datagram.
///
/// Wire size: 18 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DatagramHeader {
    pub message_id: [u8; 8],
    /// Zero unless `FLAG_HAS_REPLY_TO` is set.
    pub reply_to: [u8; 8],
    pub kind: u8,
    pub flags: u8,
}

assert_eq_size!(DatagramHeader, [u8; 18]);

pub const DATAGRAM_HEADER_LEN: usize = 18;

pub fn encode_datagram(payload: &Payload) -> Result<Bytes, WireError> {
    if payload.data.len() > MAX_DATAGRAM_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.data.len()));
    }
    let mut flags = 0u8;
    if payload.reply_to.is_some() {
        flags |= FLAG_HAS_REPLY_TO;
    }
    if payload.no_reply {
        flags |= FLAG_NO_REPLY;
    }
    let header = DatagramHeader {
        message_id: payload.message_id,
        reply_to: payload.reply_to.unwrap_or([0u8; 8]),
        kind: payload.kind as u8,
        flags,
    };
    let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_LEN + payload.data.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(&payload.data);
    Ok(buf.freeze())
}

pub fn decode_datagram(datagram: Bytes) -> Result<Payload, WireError> {
    let header = DatagramHeader::read_from_prefix(&datagram[..])
        .ok_or(WireError::TooShort(datagram.len()))?;
    let kind = PayloadKind::from_u8(header.kind).ok_or(WireError::UnknownPayloadKind(header.kind))?;
    Ok(Payload {
        kind,
        message_id: header.message_id,
        reply_to: (header.flags & FLAG_HAS_REPLY_TO != 0).then_some(header.reply_to),
        no_reply: header.flags & FLAG_NO_REPLY != 0,
        data: datagram.slice(DATAGRAM_HEADER_LEN..),
    })
}

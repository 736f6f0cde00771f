//! Viewer → broadcaster control protocol.
//!
//! Control words are matched on exact length and content. Anything that is
//! not a control word is treated as a JSON envelope (see `message`).

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Heartbeat. The first ping registers the viewer.
    Ping,
    Thumbnail,
    Disconnect,
    ViewCount,
    DonationId,
    /// `quality<N>` with a single decimal digit.
    Quality(u32),
    GetPanels,
    ChannelInfo,
    /// Not a control word; bytes are handed to the envelope parser.
    Envelope(Bytes),
}

impl ControlMessage {
    pub fn parse(data: &[u8]) -> Self {
        match (data.len(), data) {
            (4, b"ping") => Self::Ping,
            (9, b"thumbnail") => Self::Thumbnail,
            (10, b"disconnect") => Self::Disconnect,
            (9, b"viewcount") => Self::ViewCount,
            (10, b"donationid") => Self::DonationId,
            (9, b"getpanels") => Self::GetPanels,
            (11, b"channelinfo") => Self::ChannelInfo,
            (8, [b'q', b'u', b'a', b'l', b'i', b't', b'y', digit]) if digit.is_ascii_digit() => {
                Self::Quality(u32::from(digit - b'0'))
            }
            _ => Self::Envelope(Bytes::copy_from_slice(data)),
        }
    }

    /// Bytes a viewer sends for this message.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Ping => Bytes::from_static(b"ping"),
            Self::Thumbnail => Bytes::from_static(b"thumbnail"),
            Self::Disconnect => Bytes::from_static(b"disconnect"),
            Self::ViewCount => Bytes::from_static(b"viewcount"),
            Self::DonationId => Bytes::from_static(b"donationid"),
            Self::Quality(n) => Bytes::from(format!("quality{n}")),
            Self::GetPanels => Bytes::from_static(b"getpanels"),
            Self::ChannelInfo => Bytes::from_static(b"channelinfo"),
            Self::Envelope(raw) => raw.clone(),
        }
    }

    /// Answered even while no stream is live.
    pub fn always_answered(&self) -> bool {
        matches!(self, Self::GetPanels | Self::ChannelInfo)
    }
}

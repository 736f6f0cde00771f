//! novon-core — shared types, wire format, and configuration.
//! All other novon crates depend on this one.

pub mod config;
pub mod control;
pub mod ledger;
pub mod message;
pub mod overlay;
pub mod wire;

pub use config::NovonConfig;
pub use control::ControlMessage;
pub use message::{ChannelInfo, ChatMessage, Envelope};
pub use overlay::{Payload, PayloadKind, SendConfig};
pub use wire::{Chunk, SegmentAssembler, WireError};

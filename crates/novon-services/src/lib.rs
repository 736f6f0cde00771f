//! novon-services — the broadcaster's moving parts.
//!
//! Everything here is transport-agnostic: the overlay, the ledger node and
//! the media tools sit behind traits so the daemon can wire real ones and
//! tests can wire fakes.

pub mod balancer;
pub mod chat;
pub mod donation;
pub mod fanout;
pub mod ledger_rpc;
pub mod log_watcher;
pub mod stream;
pub mod transcode;
pub mod transport;
pub mod viewers;

pub use balancer::{Broadcaster, ClientBalancer};
pub use chat::{ChatOutcome, ChatService};
pub use donation::{
    DonationLedger, DonationState, DonationValidator, LedgerRpc, RetryPolicy, RpcError, Validated,
    ValidationFailure,
};
pub use fanout::{BudgetStatus, PublishReport, QualityFanout, TranscodeBudget};
pub use ledger_rpc::JsonRpcLedger;
pub use log_watcher::{
    ChannelEventSource, Disposition, IngestEvent, IngestEventSource, LogEventWatcher, LogScanSource,
};
pub use stream::{StreamEvent, StreamSettings, Streamer};
pub use transcode::{FfmpegTranscoder, SourceInfo, TranscodeError, Transcoder};
pub use transport::{InboundMessage, Overlay, OverlayClient, TransportError, WalletCodec};
pub use viewers::ViewerRegistry;

//! Donation gating for the chat channel.
//!
//! A chat line may carry `donate<N>` tokens. When the tokens add up to more
//! than zero the line is only accepted if it names a ledger transaction that:
//! - carries a donation id this broadcaster issued and has not seen paid
//! - is a plain asset transfer of exactly N whole units
//! - was sent by the chat sender's wallet to this broadcaster's wallet
//!
//! The transaction is first looked for in the sender's mempool, then as a
//! confirmed transaction, each with a bounded retry.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use novon_core::ledger::{Transaction, ASSET_UNIT_SCALE, TRANSFER_ASSET_TYPE};
use novon_core::message::ChatMessage;
use rand::RngCore;
use regex::Regex;
use serde_json::{json, Value};

use crate::transport::WalletCodec;

static DONATION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"donate[0-9]+").expect("donation pattern is valid"));

/// Length of a hex transaction hash.
pub const TX_HASH_LEN: usize = 64;

// ── Ledger ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonationState {
    /// Never issued by this broadcaster.
    Unknown,
    Unconsumed,
    /// Paid by the named transaction.
    Consumed(String),
}

struct LedgerEntry {
    issued_at: Instant,
    consumed_by: Option<String>,
}

/// Issued donation ids and the transaction that consumed each one.
///
/// Unconsumed ids can be pruned once they are older than the configured
/// age; consumed ids are kept so replays keep failing.
#[derive(Default)]
pub struct DonationLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl DonationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh id: 32 random bytes, hex encoded.
    pub fn issue(&self) -> String {
        self.issue_at(Instant::now())
    }

    pub fn issue_at(&self, now: Instant) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let id = hex::encode(raw);
        self.entries.insert(
            id.clone(),
            LedgerEntry {
                issued_at: now,
                consumed_by: None,
            },
        );
        id
    }

    pub fn state(&self, id: &str) -> DonationState {
        match self.entries.get(id) {
            None => DonationState::Unknown,
            Some(entry) => match &entry.consumed_by {
                None => DonationState::Unconsumed,
                Some(tx) => DonationState::Consumed(tx.clone()),
            },
        }
    }

    /// Mark `id` paid by `tx_hash`. Only the first caller succeeds.
    pub fn consume(&self, id: &str, tx_hash: &str) -> Result<(), ValidationFailure> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or(ValidationFailure::UnknownDonationId)?;
        if entry.consumed_by.is_some() {
            return Err(ValidationFailure::AlreadyConsumed);
        }
        entry.consumed_by = Some(tx_hash.to_string());
        Ok(())
    }

    /// Forget unconsumed ids issued more than `max_age` ago. Returns how
    /// many were dropped.
    pub fn prune_unconsumed(&self, max_age: Duration) -> usize {
        self.prune_unconsumed_at(Instant::now(), max_age)
    }

    pub fn prune_unconsumed_at(&self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            e.consumed_by.is_some() || now.saturating_duration_since(e.issued_at) <= max_age
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a donation was rejected. Display strings are sent to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("no tx hash")]
    MissingTxHash,
    #[error("transaction not found in time")]
    TransactionNotFound,
    #[error("this donation id does not exist")]
    UnknownDonationId,
    #[error("this donation was already received")]
    AlreadyConsumed,
    #[error("incorrect txtype")]
    WrongTxType,
    /// The transfer payload is not a decodable `TransferAsset`. Answered
    /// to the viewer like every other failure rather than dropped, so the
    /// sender learns the donation was not accepted.
    #[error("transfer payload could not be decoded")]
    MalformedTransfer,
    #[error("transfer amount mismatch")]
    AmountMismatch,
    #[error("transfer sender is not message src")]
    SenderMismatch,
    #[error("transfer recipient is not host address")]
    RecipientMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("response has no result")]
    MissingResult,
    #[error("timed out")]
    Timeout,
}

// ── Collaborators ─────────────────────────────────────────────────────────────

/// JSON-RPC access to a ledger node.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Attempts, spacing between attempts, and per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub spacing: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn mempool() -> Self {
        Self {
            attempts: 5,
            spacing: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn confirmed() -> Self {
        Self {
            attempts: 10,
            spacing: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated {
    /// No positive donation in the text.
    NoDonation,
    Donation {
        donation_id: String,
        units: u64,
        tx_hash: String,
    },
}

/// Sum of every `donate<N>` token. Tokens that overflow are skipped.
pub fn donation_sum(text: &str) -> u64 {
    DONATION_TOKEN
        .find_iter(text)
        .filter_map(|m| m.as_str()["donate".len()..].parse::<u64>().ok())
        .fold(0u64, |acc, n| acc.saturating_add(n))
}

pub struct DonationValidator {
    ledger: Arc<DonationLedger>,
    rpc: Arc<dyn LedgerRpc>,
    wallet: Arc<dyn WalletCodec>,
    /// Wallet donations must be paid to.
    own_wallet: String,
    allow_mempool: bool,
    mempool: RetryPolicy,
    confirmed: RetryPolicy,
}

impl DonationValidator {
    pub fn new(
        ledger: Arc<DonationLedger>,
        rpc: Arc<dyn LedgerRpc>,
        wallet: Arc<dyn WalletCodec>,
        own_wallet: String,
    ) -> Self {
        Self {
            ledger,
            rpc,
            wallet,
            own_wallet,
            allow_mempool: true,
            mempool: RetryPolicy::mempool(),
            confirmed: RetryPolicy::confirmed(),
        }
    }

    pub fn with_policies(mut self, allow_mempool: bool, mempool: RetryPolicy, confirmed: RetryPolicy) -> Self {
        self.allow_mempool = allow_mempool;
        self.mempool = mempool;
        self.confirmed = confirmed;
        self
    }

    pub fn ledger(&self) -> &Arc<DonationLedger> {
        &self.ledger
    }

    /// Check a chat message. `msg.src` must already be the authenticated
    /// overlay sender.
    pub async fn validate(&self, msg: &ChatMessage) -> Result<Validated, ValidationFailure> {
        let units = donation_sum(&msg.text);
        if units == 0 {
            return Ok(Validated::NoDonation);
        }
        if msg.hash.len() != TX_HASH_LEN {
            return Err(ValidationFailure::MissingTxHash);
        }

        let sender_wallet = self.wallet.client_to_wallet(&msg.src);

        let mut found = None;
        if self.allow_mempool {
            if let Some(wallet) = sender_wallet.as_deref() {
                found = self.find_in_mempool(&msg.hash, wallet).await;
            }
        }
        let tx = match found {
            Some(tx) => tx,
            None => self
                .find_confirmed(&msg.hash)
                .await
                .ok_or(ValidationFailure::TransactionNotFound)?,
        };

        match self.ledger.state(&tx.attributes) {
            DonationState::Unknown => return Err(ValidationFailure::UnknownDonationId),
            DonationState::Consumed(_) => return Err(ValidationFailure::AlreadyConsumed),
            DonationState::Unconsumed => {}
        }

        if tx.tx_type != TRANSFER_ASSET_TYPE {
            return Err(ValidationFailure::WrongTxType);
        }

        let transfer = tx.transfer().map_err(|e| {
            tracing::warn!(tx = %tx.hash, error = %e, "undecodable transfer payload");
            ValidationFailure::MalformedTransfer
        })?;

        let expected = i64::try_from(units)
            .ok()
            .and_then(|u| u.checked_mul(ASSET_UNIT_SCALE));
        if expected != Some(transfer.amount) {
            return Err(ValidationFailure::AmountMismatch);
        }

        let transfer_sender = self.wallet.program_hash_to_wallet(&transfer.sender);
        if sender_wallet.is_none() || transfer_sender != sender_wallet {
            return Err(ValidationFailure::SenderMismatch);
        }

        let transfer_recipient = self.wallet.program_hash_to_wallet(&transfer.recipient);
        if transfer_recipient.as_deref() != Some(self.own_wallet.as_str()) {
            return Err(ValidationFailure::RecipientMismatch);
        }

        self.ledger.consume(&tx.attributes, &tx.hash)?;
        tracing::info!(
            donation = %tx.attributes,
            tx = %tx.hash,
            units,
            src = %msg.src,
            "donation received"
        );

        Ok(Validated::Donation {
            donation_id: tx.attributes,
            units,
            tx_hash: tx.hash,
        })
    }

    async fn call(&self, policy: &RetryPolicy, method: &str, params: Value) -> Result<Value, RpcError> {
        match tokio::time::timeout(policy.timeout, self.rpc.rpc(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    async fn find_in_mempool(&self, hash: &str, sender_wallet: &str) -> Option<Transaction> {
        let params = json!({ "action": "txnlist", "address": sender_wallet });
        for attempt in 0..self.mempool.attempts {
            let listed = match self.call(&self.mempool, "getrawmempool", params.clone()).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "mempool lookup failed, falling back to confirmed lookup");
                    return None;
                }
            };
            let txs: Vec<Transaction> = serde_json::from_value(listed).unwrap_or_default();
            if let Some(tx) = txs.into_iter().find(|tx| tx.hash == hash) {
                return Some(tx);
            }
            if attempt + 1 < self.mempool.attempts {
                tracing::debug!(attempt, "transaction not in mempool yet");
                tokio::time::sleep(self.mempool.spacing).await;
            }
        }
        None
    }

    async fn find_confirmed(&self, hash: &str) -> Option<Transaction> {
        let params = json!({ "hash": hash });
        for attempt in 0..self.confirmed.attempts {
            match self.call(&self.confirmed, "gettransaction", params.clone()).await {
                Ok(v) => match serde_json::from_value::<Transaction>(v) {
                    Ok(tx) if !tx.hash.is_empty() => return Some(tx),
                    Ok(_) => tracing::debug!(attempt, "empty transaction record"),
                    Err(e) => tracing::warn!(error = %e, "unparsable transaction record"),
                },
                Err(e) => tracing::debug!(attempt, error = %e, "transaction not confirmed yet"),
            }
            if attempt + 1 < self.confirmed.attempts {
                tokio::time::sleep(self.confirmed.spacing).await;
            }
        }
        None
    }
}

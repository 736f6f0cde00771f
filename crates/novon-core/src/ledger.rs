//! Ledger records as returned by the chain's JSON-RPC interface.

use serde::{Deserialize, Serialize};

/// `txType` of a plain value transfer.
pub const TRANSFER_ASSET_TYPE: &str = "TRANSFER_ASSET_TYPE";

/// Smallest ledger units per whole asset unit.
pub const ASSET_UNIT_SCALE: i64 = 100_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transaction {
    /// Free-form attribute field. Donations carry the donation id here.
    pub attributes: String,
    pub fee: i64,
    pub hash: String,
    pub nonce: u64,
    /// Hex-encoded protobuf payload, `TransferAsset` for transfers.
    pub payload_data: String,
    pub programs: Vec<Program>,
    pub size: u64,
    pub tx_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Program {
    pub code: String,
    pub parameter: String,
}

impl Transaction {
    /// Decode `payload_data` as a transfer.
    pub fn transfer(&self) -> Result<TransferAsset, PayloadError> {
        let raw = hex::decode(&self.payload_data)?;
        Ok(<TransferAsset as prost::Message>::decode(raw.as_slice())?)
    }
}

/// Transfer payload. Sender and recipient are 20-byte program hashes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TransferAsset {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub amount: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("payload is not a transfer: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

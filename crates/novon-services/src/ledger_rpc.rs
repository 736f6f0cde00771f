//! JSON-RPC 2.0 client for a ledger node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::donation::{LedgerRpc, RpcError};

pub struct JsonRpcLedger {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LedgerRpc for JsonRpcLedger {
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::trace!(method, id, "ledger rpc");
        let response: Value = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        unpack_response(response)
    }
}

/// Pull `result` out of a JSON-RPC response, or turn `error` into `RpcError`.
fn unpack_response(mut response: Value) -> Result<Value, RpcError> {
    if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Remote {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::MissingResult),
    }
}

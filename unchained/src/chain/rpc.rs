//! JSON-RPC backed [`ChainClient`].

use super::{Appearance, ChainClient, TransactionRef};
use crate::error::{IndexError, Result};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
}

pub struct RpcChainClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| IndexError::InvariantViolation(format!("http client: {err}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let failed = |reason: String| IndexError::DownloadFailed {
            hash: method.to_string(),
            reason,
        };
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?
            .json()
            .await
            .map_err(|err| failed(err.to_string()))?;
        if let Some(error) = response.error {
            return Err(failed(error.to_string()));
        }
        Ok(response.result.filter(|value| !value.is_null()))
    }
}

fn quantity(block_number: u64) -> String {
    format!("{block_number:#x}")
}

fn parse_u64(value: &Value) -> Result<u64> {
    let text = value.as_str().ok_or_else(|| {
        IndexError::InvariantViolation(format!("expected hex quantity, got {value}"))
    })?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|err| IndexError::InvariantViolation(format!("bad quantity {text}: {err}")))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_block_number(&self) -> Result<u64> {
        let value = self
            .call("eth_blockNumber", json!([]))
            .await?
            .ok_or_else(|| {
                IndexError::InvariantViolation("eth_blockNumber returned null".to_string())
            })?;
        parse_u64(&value)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
        let Some(block) = self
            .call("eth_getBlockByNumber", json!([quantity(block_number), false]))
            .await?
        else {
            return Ok(None);
        };
        block.get("timestamp").map(parse_u64).transpose()
    }

    async fn balance_at(&self, address: Address, block_number: u64) -> Result<U256> {
        let value = self
            .call("eth_getBalance", json!([address, quantity(block_number)]))
            .await?
            .ok_or_else(|| {
                IndexError::InvariantViolation("eth_getBalance returned null".to_string())
            })?;
        serde_json::from_value(value)
            .map_err(|err| IndexError::InvariantViolation(format!("bad balance: {err}")))
    }

    async fn transaction_by_appearance(
        &self,
        appearance: &Appearance,
    ) -> Result<Option<TransactionRef>> {
        let params = json!([
            quantity(u64::from(appearance.block_number)),
            quantity(u64::from(appearance.transaction_index)),
        ]);
        let Some(value) = self
            .call("eth_getTransactionByBlockNumberAndIndex", params)
            .await?
        else {
            return Ok(None);
        };
        let tx: RpcTransaction = serde_json::from_value(value)
            .map_err(|err| IndexError::InvariantViolation(format!("bad transaction: {err}")))?;
        Ok(Some(TransactionRef {
            hash: tx.hash,
            block_number: u64::from(appearance.block_number),
            transaction_index: u64::from(appearance.transaction_index),
            from: tx.from,
            to: tx.to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_are_hex() {
        assert_eq!(quantity(1500), "0x5dc");
        assert_eq!(parse_u64(&json!("0x5dc")).expect("parse"), 1500);
        assert!(parse_u64(&json!(12)).is_err());
    }
}

//! Chain data needed around the index: heads, timestamps, balances and the
//! transactions an appearance points at.

use crate::chunk::AppearanceRecord;
use crate::error::Result;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;

mod rpc;

pub use rpc::RpcChainClient;

/// Location of an appearance, used to look up its transaction.
pub type Appearance = AppearanceRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRef {
    pub hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
}

/// Read access to a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64>;

    /// `None` when the node does not know the block.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>>;

    async fn balance_at(&self, address: Address, block_number: u64) -> Result<U256>;

    async fn transaction_by_appearance(
        &self,
        appearance: &Appearance,
    ) -> Result<Option<TransactionRef>>;
}

/// In-memory chain, for tests and offline tools.
#[derive(Debug, Default, Clone)]
pub struct MemoryChainClient {
    timestamps: HashMap<u64, u64>,
    balances: HashMap<(Address, u64), U256>,
    transactions: HashMap<(u64, u64), TransactionRef>,
}

impl MemoryChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(mut self, block_number: u64, timestamp: u64) -> Self {
        self.timestamps.insert(block_number, timestamp);
        self
    }

    pub fn with_balance(mut self, address: Address, block_number: u64, balance: U256) -> Self {
        self.balances.insert((address, block_number), balance);
        self
    }

    pub fn with_transaction(mut self, tx: TransactionRef) -> Self {
        self.transactions
            .insert((tx.block_number, tx.transaction_index), tx);
        self
    }
}

#[async_trait]
impl ChainClient for MemoryChainClient {
    async fn latest_block_number(&self) -> Result<u64> {
        Ok(self.timestamps.keys().copied().max().unwrap_or(0))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
        Ok(self.timestamps.get(&block_number).copied())
    }

    async fn balance_at(&self, address: Address, block_number: u64) -> Result<U256> {
        // latest known balance at or before the block
        let balance = self
            .balances
            .iter()
            .filter(|((owner, at), _)| *owner == address && *at <= block_number)
            .max_by_key(|((_, at), _)| *at)
            .map(|(_, balance)| *balance)
            .unwrap_or(U256::ZERO);
        Ok(balance)
    }

    async fn transaction_by_appearance(
        &self,
        appearance: &Appearance,
    ) -> Result<Option<TransactionRef>> {
        let key = (
            u64::from(appearance.block_number),
            u64::from(appearance.transaction_index),
        );
        Ok(self.transactions.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_client_answers_lookups() {
        let alice = Address::repeat_byte(0xa1);
        let tx = TransactionRef {
            hash: B256::repeat_byte(7),
            block_number: 1500,
            transaction_index: 2,
            from: alice,
            to: None,
        };
        let client = MemoryChainClient::new()
            .with_timestamp(1499, 1_600_000_000)
            .with_timestamp(1500, 1_600_000_013)
            .with_balance(alice, 1000, U256::from(5u64))
            .with_balance(alice, 1400, U256::from(9u64))
            .with_transaction(tx.clone());

        assert_eq!(client.latest_block_number().await.expect("head"), 1500);
        assert_eq!(client.block_timestamp(1500).await.expect("ts"), Some(1_600_000_013));
        assert_eq!(client.block_timestamp(7).await.expect("ts"), None);
        assert_eq!(client.balance_at(alice, 1450).await.expect("balance"), U256::from(9u64));
        assert_eq!(client.balance_at(alice, 10).await.expect("balance"), U256::ZERO);
        let found = client
            .transaction_by_appearance(&Appearance::new(1500, 2))
            .await
            .expect("tx");
        assert_eq!(found, Some(tx));
    }
}

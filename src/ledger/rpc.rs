//! [`LedgerClient`] over an alloy HTTP provider.
//!
//! Payouts are signed in-process with the oracle key. Nonce, gas price and gas
//! limit are set explicitly on every request; the provider's fillers only add
//! the chain id.

use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::ledger::{Address, Bytes, LedgerClient, LogEntry, TxHash, TxReceipt, TxRequest};

pub struct RpcLedger {
    provider: DynProvider,
    signer: Address,
}

impl RpcLedger {
    /// No network traffic happens here; an unreachable node surfaces on the
    /// first call instead.
    pub fn connect(rpc_url: &str, signer: PrivateKeySigner) -> Result<Self> {
        let url: reqwest::Url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("RPC_URL {rpc_url}: {e}")))?;
        let address = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self {
            provider,
            signer: address,
        })
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, height: u64) -> Result<u64> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(height))
            .await?
            .ok_or_else(|| AppError::Rpc(format!("block {height} not found")))?;
        Ok(block.header.timestamp)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let req = TransactionRequest::default().with_to(to).with_input(data);
        Ok(self.provider.call(req).await?)
    }

    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        let filter = Filter::new().address(address).from_block(from).to_block(to);
        // Raw values so one bad entry does not fail the whole range.
        let raw: Vec<Value> = self
            .provider
            .raw_request("eth_getLogs".into(), (filter,))
            .await?;
        debug!(%address, from, to, count = raw.len(), "eth_getLogs");
        Ok(parse_logs(raw))
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64> {
        Ok(self.provider.get_transaction_count(account).pending().await?)
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash> {
        if tx.from != self.signer {
            return Err(AppError::Config(format!(
                "no key for {}, this client signs as {}",
                tx.from, self.signer
            )));
        }
        let req = TransactionRequest::default()
            .with_from(tx.from)
            .with_to(tx.to)
            .with_input(tx.data)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas)
            .with_gas_price(tx.gas_price);
        let pending = self.provider.send_transaction(req).await?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash, timeout: Duration) -> Result<TxReceipt> {
        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash)
            .with_timeout(Some(timeout))
            .get_receipt()
            .await
            .map_err(|e| AppError::Confirmation(format!("transaction {tx_hash}: {e}")))?;
        Ok(TxReceipt {
            tx_hash,
            block_number: receipt.block_number().unwrap_or_default(),
            success: receipt.status(),
            gas_used: receipt.gas_used(),
        })
    }
}

/// Keeps every log that parses and carries a chain position. Removed
/// (reorged) and malformed entries are logged and dropped.
pub fn parse_logs(raw: Vec<Value>) -> Vec<LogEntry> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<Log>(value) {
            Ok(log) => to_entry(log),
            Err(e) => {
                warn!("skipping malformed log: {e}");
                None
            }
        })
        .collect()
}

fn to_entry(log: Log) -> Option<LogEntry> {
    if log.removed {
        warn!(tx_hash = ?log.transaction_hash, "skipping removed log");
        return None;
    }
    match (log.block_number, log.log_index, log.transaction_hash) {
        (Some(block_number), Some(log_index), Some(tx_hash)) => Some(LogEntry {
            inner: log.inner,
            block_number,
            log_index,
            tx_hash,
        }),
        _ => {
            warn!(address = %log.inner.address, "skipping log without chain position");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;
    use serde_json::json;

    use crate::ledger::bindings::IERC20;

    fn transfer_log(block: &str) -> Value {
        json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [
                IERC20::Transfer::SIGNATURE_HASH,
                "0x0000000000000000000000002222222222222222222222222222222222222222",
                "0x0000000000000000000000003333333333333333333333333333333333333333",
            ],
            "data": "0x00000000000000000000000000000000000000000000000000000000000000ff",
            "blockNumber": block,
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000ab",
            "transactionIndex": "0x0",
            "blockHash": "0x00000000000000000000000000000000000000000000000000000000000000cd",
            "logIndex": "0x2",
            "removed": false,
        })
    }

    #[test]
    fn parses_rpc_log() {
        let logs = parse_logs(vec![transfer_log("0x10")]);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 16);
        assert_eq!(logs[0].log_index, 2);
        assert_eq!(logs[0].address(), Address::repeat_byte(0x11));
        assert_eq!(logs[0].inner.data.data.len(), 32);
    }

    #[test]
    fn one_malformed_log_does_not_hide_the_rest() {
        let mut bad_data = transfer_log("0x11");
        bad_data["data"] = json!("0xzz");
        let mut pending = transfer_log("0x12");
        pending["blockNumber"] = Value::Null;
        let mut removed = transfer_log("0x13");
        removed["removed"] = json!(true);

        let logs = parse_logs(vec![bad_data, transfer_log("0x10"), pending, removed]);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 16);
    }

    #[tokio::test]
    async fn refuses_to_sign_for_another_address() {
        let signer = PrivateKeySigner::random();
        let own = signer.address();
        // Nothing listens here; the check must fire before any request.
        let ledger = RpcLedger::connect("http://127.0.0.1:1", signer).unwrap();
        assert_eq!(ledger.signer(), own);

        let tx = TxRequest {
            from: Address::repeat_byte(0x33),
            to: Address::repeat_byte(0x11),
            data: Bytes::new(),
            gas: 300_000,
            gas_price: 1,
            nonce: 0,
        };
        assert!(matches!(ledger.send_transaction(tx).await, Err(AppError::Config(_))));
    }

    #[test]
    fn bad_rpc_url_is_a_config_error() {
        let err = RpcLedger::connect("not a url", PrivateKeySigner::random()).err();
        assert!(matches!(err, Some(AppError::Config(_))));
    }
}

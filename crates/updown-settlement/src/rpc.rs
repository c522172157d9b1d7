//! JSON-RPC chain client.
//!
//! Plain `reqwest` against an Ethereum JSON-RPC endpoint. Transactions are
//! EIP-1559, signed locally with the configured key, and followed until a
//! receipt appears or the receipt timeout passes.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::Signer as AlloySigner;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use updown_telemetry::Metrics;

use crate::chain::{BoxFuture, ChainClient, TxReceipt, TxRequest};
use crate::error::ChainError;
use crate::key::KeyManager;

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Priority fee used when the node does not answer `eth_maxPriorityFeePerGas`.
const FALLBACK_PRIORITY_FEE_WEI: u128 = 30_000_000_000;

#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub url: String,
    pub chain_id: u64,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RawReceipt {
    #[serde(default)]
    status: Option<String>,
}

fn hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

fn parse_bytes(value: &Value) -> Result<Bytes, ChainError> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex string, got {value}")))?;
    Bytes::from_str(s).map_err(|e| ChainError::Decode(format!("bytes '{s}': {e}")))
}

fn parse_quantity(value: &Value) -> Result<u128, ChainError> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected quantity, got {value}")))?;
    u128::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("quantity '{s}': {e}")))
}

pub struct RpcChainClient {
    client: Client,
    settings: RpcSettings,
    keys: Arc<KeyManager>,
    next_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(settings: RpcSettings, keys: Arc<KeyManager>) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            keys,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&self.settings.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(DEFAULT_TIMEOUT.as_millis() as u64)
                } else {
                    ChainError::Transport(format!("HTTP request failed: {e}"))
                }
            })?;
        Metrics::remote_call(method, started.elapsed().as_secs_f64() * 1000.0);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Decode(format!("Failed to parse RPC response: {e}")))?;
        if let Some(err) = parsed.error {
            trace!(method, code = err.code, message = %err.message, "RPC error");
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn priority_fee(&self) -> Result<u128, ChainError> {
        match self.request("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(v) => parse_quantity(&v),
            Err(e) if !e.is_transient() => {
                debug!(error = %e, "Priority fee unavailable, using fallback");
                Ok(FALLBACK_PRIORITY_FEE_WEI)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let value = self
            .request("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let receipt: RawReceipt = serde_json::from_value(value)
            .map_err(|e| ChainError::Decode(format!("receipt: {e}")))?;
        let success = receipt.status.as_deref() == Some("0x1");
        Ok(Some(TxReceipt { tx_hash, success }))
    }

    /// Poll until mined. Every failure past this point keeps the hash so
    /// the caller can look the transaction up later instead of resending.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, ChainError> {
        let deadline = Instant::now() + self.settings.receipt_timeout;
        loop {
            match self.fetch_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => debug!(%tx_hash, error = %e, "Receipt poll failed"),
            }
            if Instant::now() >= deadline {
                warn!(%tx_hash, "No receipt before timeout");
                return Err(ChainError::Unconfirmed { tx_hash });
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    async fn sign_and_send(&self, request: TxRequest) -> Result<TxReceipt, ChainError> {
        let signer = self.keys.signer().ok_or(ChainError::NoSigner)?;
        let from = signer.address();

        let nonce = parse_quantity(
            &self
                .request("eth_getTransactionCount", json!([from.to_string(), "pending"]))
                .await?,
        )?;
        let base_price = parse_quantity(&self.request("eth_gasPrice", json!([])).await?)?;
        let priority = self.priority_fee().await?;

        let tx = TxEip1559 {
            chain_id: self.settings.chain_id,
            nonce: u64::try_from(nonce)
                .map_err(|_| ChainError::Decode(format!("nonce {nonce} out of range")))?,
            gas_limit: request.gas_limit,
            max_fee_per_gas: base_price.saturating_mul(2).max(priority),
            max_priority_fee_per_gas: priority,
            to: TxKind::Call(request.to),
            value: U256::ZERO,
            access_list: Default::default(),
            input: request.data,
        };

        let signature = signer
            .sign_hash(&tx.signature_hash())
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let envelope = TxEnvelope::from(tx.into_signed(signature));
        let tx_hash = *envelope.tx_hash();

        match self
            .request(
                "eth_sendRawTransaction",
                json!([hex_data(&envelope.encoded_2718())]),
            )
            .await
        {
            Ok(_) => {}
            // The node may have taken it before the connection dropped
            Err(e) if e.is_transient() => {
                warn!(%tx_hash, error = %e, "Broadcast outcome unknown");
                return Err(ChainError::Unconfirmed { tx_hash });
            }
            Err(e) => return Err(e),
        }
        info!(%tx_hash, to = %request.to, nonce, "Transaction broadcast");

        self.wait_for_receipt(tx_hash).await
    }
}

impl ChainClient for RpcChainClient {
    fn call(&self, to: Address, data: Bytes) -> BoxFuture<'_, Result<Bytes, ChainError>> {
        Box::pin(async move {
            let params = json!([{ "to": to.to_string(), "data": hex_data(&data) }, "latest"]);
            parse_bytes(&self.request("eth_call", params).await?)
        })
    }

    fn code_at(&self, address: Address) -> BoxFuture<'_, Result<Bytes, ChainError>> {
        Box::pin(async move {
            let params = json!([address.to_string(), "latest"]);
            parse_bytes(&self.request("eth_getCode", params).await?)
        })
    }

    fn send_transaction(&self, tx: TxRequest) -> BoxFuture<'_, Result<TxReceipt, ChainError>> {
        Box::pin(async move { self.sign_and_send(tx).await })
    }

    fn receipt(&self, tx_hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>, ChainError>> {
        Box::pin(async move { self.fetch_receipt(tx_hash).await })
    }
}

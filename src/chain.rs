//! Blockchain reader for payment verification
//!
//! Thin JSON-RPC client over an EVM node. Only two reads are needed:
//! `eth_getTransactionByHash` and `eth_getTransactionReceipt`.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Errors from talking to the chain node. Any of these means the chain could
/// not be read, as opposed to a transaction that failed verification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("chain RPC transport error: {0}")]
    Transport(String),
    #[error("chain RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed chain RPC response: {0}")]
    Malformed(String),
    /// The node accepted the connection but did not answer in time
    #[error("chain RPC timed out: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout(e.to_string())
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

/// JSON-RPC request structure
#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    params: Vec<Value>,
}

/// JSON-RPC response structure
#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC transport, swappable for a mock in tests
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Returns the `result` member, which may be JSON `null`.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError>;
}

/// Default HTTP-based RPC client using reqwest
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ChainError::Transport(format!(
                "node returned HTTP {}",
                resp.status().as_u16()
            )));
        }

        let body = resp.text().await?;
        let rpc_resp: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| ChainError::Malformed(e.to_string()))?;

        if let Some(error) = rpc_resp.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(rpc_resp.result.unwrap_or(Value::Null))
    }
}

/// The fields of an on-chain transaction that payment verification needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub value: U256,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Read access to chain state, by transaction hash
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_transaction(&self, hash: &B256) -> Result<Option<ChainTransaction>, ChainError>;

    async fn get_transaction_receipt(
        &self,
        hash: &B256,
    ) -> Result<Option<TransactionReceipt>, ChainError>;
}

/// [`ChainReader`] backed by standard `eth_*` JSON-RPC methods
pub struct JsonRpcChainReader {
    rpc: Box<dyn RpcClient>,
}

impl JsonRpcChainReader {
    pub fn new(rpc: Box<dyn RpcClient>) -> Self {
        Self { rpc }
    }

    /// Reader talking to `url` over HTTP
    pub fn http(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        Ok(Self::new(Box::new(HttpRpcClient::new(url, timeout)?)))
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn get_transaction(&self, hash: &B256) -> Result<Option<ChainTransaction>, ChainError> {
        let raw = self
            .rpc
            .call("eth_getTransactionByHash", vec![hash_param(hash)])
            .await?;

        if raw.is_null() {
            debug!(tx_hash = %hash, "transaction not found");
            return Ok(None);
        }
        parse_transaction(&raw).map(Some)
    }

    async fn get_transaction_receipt(
        &self,
        hash: &B256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        let raw = self
            .rpc
            .call("eth_getTransactionReceipt", vec![hash_param(hash)])
            .await?;

        if raw.is_null() {
            debug!(tx_hash = %hash, "receipt not available");
            return Ok(None);
        }
        parse_receipt(&raw).map(Some)
    }
}

fn hash_param(hash: &B256) -> Value {
    Value::String(format!("0x{}", hex::encode(hash.as_slice())))
}

fn field<'a>(raw: &'a Value, name: &str) -> Result<&'a str, ChainError> {
    raw.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::Malformed(format!("missing '{}' field", name)))
}

fn parse_quantity(s: &str) -> Result<U256, ChainError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Malformed(format!("bad quantity '{}': {}", s, e)))
}

fn parse_u64_quantity(s: &str) -> Result<u64, ChainError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Malformed(format!("bad quantity '{}': {}", s, e)))
}

fn parse_address(s: &str) -> Result<Address, ChainError> {
    Address::from_str(s).map_err(|e| ChainError::Malformed(format!("bad address '{}': {}", s, e)))
}

fn parse_transaction(raw: &Value) -> Result<ChainTransaction, ChainError> {
    let hash = B256::from_str(field(raw, "hash")?)
        .map_err(|e| ChainError::Malformed(format!("bad hash: {}", e)))?;
    let from = parse_address(field(raw, "from")?)?;
    let to = match raw.get("to").and_then(|v| v.as_str()) {
        Some(to) => Some(parse_address(to)?),
        None => None,
    };
    let value = parse_quantity(field(raw, "value")?)?;
    let chain_id = match raw.get("chainId").and_then(|v| v.as_str()) {
        Some(id) => Some(parse_u64_quantity(id)?),
        None => None,
    };

    Ok(ChainTransaction {
        hash,
        from,
        to,
        value,
        chain_id,
    })
}

fn parse_receipt(raw: &Value) -> Result<TransactionReceipt, ChainError> {
    let success = match raw.get("status").and_then(|v| v.as_str()) {
        Some(status) => parse_u64_quantity(status)? == 1,
        None => return Err(ChainError::Malformed("missing 'status' field".to_string())),
    };
    let block_number = match raw.get("blockNumber").and_then(|v| v.as_str()) {
        Some(n) => Some(parse_u64_quantity(n)?),
        None => None,
    };
    Ok(TransactionReceipt {
        success,
        block_number,
    })
}

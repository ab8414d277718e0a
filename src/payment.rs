//! x402 payment proofs and on-chain verification
//!
//! Nothing here is stored between requests. Each submitted proof is checked
//! from scratch against the chain and against the terms for that call.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::utils::parse_ether;
use alloy_primitives::{Address, B256, U256};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chain::{ChainError, ChainReader, ChainTransaction, TransactionReceipt};
use crate::config::PaymentConfig;

/// Request header carrying the payment proof
pub const PAYMENT_HEADER: &str = "x-payment";

/// Response header naming the verified transaction
pub const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

pub const PROTOCOL: &str = "x402";

/// Tolerance may absorb at most 1/10 of the price
const MAX_TOLERANCE_DIVISOR: u64 = 10;

/// Why a proof was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    WrongRecipient,
    InsufficientAmount,
    TxNotFound,
    TxFailedOnchain,
    WrongNetwork,
    MalformedProof,
}

impl DenialReason {
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::WrongRecipient => "wrong-recipient",
            DenialReason::InsufficientAmount => "insufficient-amount",
            DenialReason::TxNotFound => "tx-not-found",
            DenialReason::TxFailedOnchain => "tx-failed-onchain",
            DenialReason::WrongNetwork => "wrong-network",
            DenialReason::MalformedProof => "malformed-proof",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PaymentError {
    #[error("no payment proof supplied")]
    NoProofSupplied,
    #[error("payment proof rejected ({reason}): {detail}")]
    ProofInvalid { reason: DenialReason, detail: String },
    #[error("payment verification unavailable: {0}")]
    VerificationInfrastructure(String),
}

impl PaymentError {
    fn denied(reason: DenialReason, detail: impl Into<String>) -> Self {
        PaymentError::ProofInvalid {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentConfigError {
    #[error("invalid payment amount '{value}': {message}")]
    Amount { value: String, message: String },
    #[error("invalid payee address '{0}'")]
    PayTo(String),
}

/// What a paid call costs and who must be paid
#[derive(Debug, Clone)]
pub struct PaymentTerms {
    /// Price as configured, for display in challenges
    pub price_display: String,
    /// Price in the smallest unit (wei)
    pub price: U256,
    pub tolerance: U256,
    pub pay_to: Address,
    pub network: String,
    pub chain_id: u64,
}

impl PaymentTerms {
    pub fn from_config(config: &PaymentConfig) -> Result<Self, PaymentConfigError> {
        let price = parse_amount(&config.price)?;
        let tolerance = parse_amount(&config.tolerance)?;
        if tolerance.saturating_mul(U256::from(MAX_TOLERANCE_DIVISOR)) > price {
            return Err(PaymentConfigError::Amount {
                value: config.tolerance.clone(),
                message: format!(
                    "tolerance must not exceed 1/{} of the price ({})",
                    MAX_TOLERANCE_DIVISOR,
                    config.price.trim()
                ),
            });
        }
        let pay_to = Address::from_str(config.pay_to.trim())
            .map_err(|_| PaymentConfigError::PayTo(config.pay_to.clone()))?;

        Ok(Self {
            price_display: config.price.trim().to_string(),
            price,
            tolerance,
            pay_to,
            network: config.network.clone(),
            chain_id: config.chain_id,
        })
    }

    /// Lowest accepted on-chain value
    pub fn minimum_accepted(&self) -> U256 {
        self.price.saturating_sub(self.tolerance)
    }

    /// Challenge describing these terms for `resource`
    pub fn challenge(&self, resource: &str) -> PaymentChallenge {
        PaymentChallenge {
            price: self.price_display.clone(),
            pay_to: self.pay_to.to_checksum(None),
            network: self.network.clone(),
            protocol: PROTOCOL.to_string(),
            resource: resource.to_string(),
            chain_id: self.chain_id,
            max_amount_required: self.price.to_string(),
        }
    }
}

fn parse_amount(value: &str) -> Result<U256, PaymentConfigError> {
    parse_ether(value.trim()).map_err(|e| PaymentConfigError::Amount {
        value: value.to_string(),
        message: e.to_string(),
    })
}

/// The `payment_details` body of a 402 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    pub price: String,
    pub pay_to: String,
    pub network: String,
    pub protocol: String,
    pub resource: String,
    pub chain_id: u64,
    /// `price` in wei, decimal
    pub max_amount_required: String,
}

/// Caller-supplied evidence of payment. The claimed fields are informational;
/// verification always reads the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
    pub transaction_hash: B256,
    pub claimed_from: Option<Address>,
    pub claimed_to: Option<Address>,
    pub claimed_value: Option<U256>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofDocument {
    #[serde(alias = "txHash", alias = "hash", alias = "transaction_hash")]
    transaction_hash: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, alias = "chain_id")]
    chain_id: Option<Value>,
}

impl PaymentProof {
    pub fn from_hash(hash: B256) -> Self {
        Self {
            transaction_hash: hash,
            claimed_from: None,
            claimed_to: None,
            claimed_value: None,
            chain_id: None,
        }
    }

    /// Parse a header value: a bare transaction hash, a JSON proof object, or
    /// that JSON object base64-encoded.
    pub fn parse(raw: &str) -> Result<Self, PaymentError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PaymentError::NoProofSupplied);
        }

        if raw.starts_with("0x") || raw.starts_with("0X") {
            return parse_hash(raw).map(Self::from_hash);
        }

        if raw.starts_with('{') {
            let value: Value = serde_json::from_str(raw).map_err(|e| {
                PaymentError::denied(DenialReason::MalformedProof, format!("invalid JSON: {}", e))
            })?;
            return Self::from_value(&value);
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|_| {
                PaymentError::denied(
                    DenialReason::MalformedProof,
                    "expected a transaction hash, JSON object or base64 JSON",
                )
            })?;
        let value: Value = serde_json::from_slice(&decoded).map_err(|e| {
            PaymentError::denied(
                DenialReason::MalformedProof,
                format!("invalid base64 JSON: {}", e),
            )
        })?;
        Self::from_value(&value)
    }

    /// Parse a proof given as a JSON value (string hash or proof object)
    pub fn from_value(value: &Value) -> Result<Self, PaymentError> {
        match value {
            Value::Null => Err(PaymentError::NoProofSupplied),
            Value::String(s) => Self::parse(s),
            Value::Object(_) => {
                let doc: ProofDocument = serde_json::from_value(value.clone()).map_err(|e| {
                    PaymentError::denied(DenialReason::MalformedProof, e.to_string())
                })?;
                Ok(Self {
                    transaction_hash: parse_hash(&doc.transaction_hash)?,
                    claimed_from: doc.from.as_deref().and_then(|s| Address::from_str(s).ok()),
                    claimed_to: doc.to.as_deref().and_then(|s| Address::from_str(s).ok()),
                    claimed_value: doc.value.as_ref().and_then(json_to_u256),
                    chain_id: match doc.chain_id.as_ref() {
                        Some(v) => Some(json_to_u64(v).ok_or_else(|| {
                            PaymentError::denied(
                                DenialReason::MalformedProof,
                                format!("invalid chainId {}", v),
                            )
                        })?),
                        None => None,
                    },
                })
            }
            other => Err(PaymentError::denied(
                DenialReason::MalformedProof,
                format!("unsupported proof type: {}", other),
            )),
        }
    }
}

fn parse_hash(raw: &str) -> Result<B256, PaymentError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.len() != 64 {
        return Err(PaymentError::denied(
            DenialReason::MalformedProof,
            format!("transaction hash must be 32 bytes, got '{}'", raw),
        ));
    }
    B256::from_str(digits).map_err(|e| {
        PaymentError::denied(
            DenialReason::MalformedProof,
            format!("invalid transaction hash: {}", e),
        )
    })
}

fn json_to_u256(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_str_radix(s, 10).ok(),
        },
        _ => None,
    }
}

fn json_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// A payment the chain confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    pub transaction_hash: B256,
    pub from: Address,
    pub value: U256,
    pub block_number: Option<u64>,
}

/// Checks proofs against chain state
pub struct PaymentVerifier {
    reader: Arc<dyn ChainReader>,
    timeout: Duration,
}

impl PaymentVerifier {
    pub fn new(reader: Arc<dyn ChainReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    /// Verify `proof` against `terms`. Grants only when the transaction exists,
    /// succeeded, paid the configured payee, and moved at least the price minus
    /// the rounding tolerance.
    pub async fn verify(
        &self,
        proof: &PaymentProof,
        terms: &PaymentTerms,
    ) -> Result<VerifiedPayment, PaymentError> {
        let hash = proof.transaction_hash;

        if let Some(claimed) = proof.chain_id {
            if claimed != terms.chain_id {
                return Err(PaymentError::denied(
                    DenialReason::WrongNetwork,
                    format!("proof is for chain {}, expected {}", claimed, terms.chain_id),
                ));
            }
        }

        let read = match tokio::time::timeout(self.timeout, self.read_chain(&hash)).await {
            Ok(read) => read,
            Err(_) => Err(ChainError::Timeout(format!("no answer within {:?}", self.timeout))),
        };

        let (tx, receipt) = match read {
            Ok(read) => read,
            // Either our deadline or the transport's own fired first; same outcome
            Err(ChainError::Timeout(detail)) => {
                warn!(tx_hash = %hash, timeout = ?self.timeout, detail = %detail, "chain read timed out");
                return Err(PaymentError::denied(
                    DenialReason::TxNotFound,
                    format!("transaction lookup timed out after {:?}", self.timeout),
                ));
            }
            Err(e) => {
                warn!(tx_hash = %hash, error = %e, "chain read failed during verification");
                return Err(PaymentError::VerificationInfrastructure(e.to_string()));
            }
        };

        let Some(tx) = tx else {
            return Err(PaymentError::denied(
                DenialReason::TxNotFound,
                format!("transaction {} not found", hash),
            ));
        };
        let Some(receipt) = receipt else {
            return Err(PaymentError::denied(
                DenialReason::TxNotFound,
                format!("transaction {} is not confirmed yet", hash),
            ));
        };

        if !receipt.success {
            return Err(PaymentError::denied(
                DenialReason::TxFailedOnchain,
                format!("transaction {} reverted", hash),
            ));
        }

        if let Some(chain_id) = tx.chain_id {
            if chain_id != terms.chain_id {
                return Err(PaymentError::denied(
                    DenialReason::WrongNetwork,
                    format!("transaction is on chain {}, expected {}", chain_id, terms.chain_id),
                ));
            }
        }

        // Address equality is byte equality, so checksum casing never matters
        if tx.to != Some(terms.pay_to) {
            return Err(PaymentError::denied(
                DenialReason::WrongRecipient,
                format!(
                    "transaction paid {}, expected {}",
                    tx.to
                        .map(|a| a.to_checksum(None))
                        .unwrap_or_else(|| "a contract creation".to_string()),
                    terms.pay_to.to_checksum(None)
                ),
            ));
        }

        let minimum = terms.minimum_accepted();
        if tx.value < minimum {
            return Err(PaymentError::denied(
                DenialReason::InsufficientAmount,
                format!("transaction value {} wei is below the required {} wei", tx.value, minimum),
            ));
        }

        log_claim_mismatches(proof, &tx);
        info!(tx_hash = %hash, from = %tx.from, value = %tx.value, "payment verified");

        Ok(VerifiedPayment {
            transaction_hash: hash,
            from: tx.from,
            value: tx.value,
            block_number: receipt.block_number,
        })
    }

    async fn read_chain(
        &self,
        hash: &B256,
    ) -> Result<(Option<ChainTransaction>, Option<TransactionReceipt>), ChainError> {
        let tx = self.reader.get_transaction(hash).await?;
        if tx.is_none() {
            return Ok((None, None));
        }
        let receipt = self.reader.get_transaction_receipt(hash).await?;
        Ok((tx, receipt))
    }
}

fn log_claim_mismatches(proof: &PaymentProof, tx: &ChainTransaction) {
    if proof.claimed_from.is_some_and(|from| from != tx.from) {
        debug!(tx_hash = %tx.hash, "claimed sender differs from chain");
    }
    if proof.claimed_to.is_some() && proof.claimed_to != tx.to {
        debug!(tx_hash = %tx.hash, "claimed recipient differs from chain");
    }
    if proof.claimed_value.is_some_and(|value| value != tx.value) {
        debug!(tx_hash = %tx.hash, "claimed value differs from chain");
    }
}

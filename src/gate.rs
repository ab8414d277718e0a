//! x402 payment gate
//!
//! A request without a proof is challenged. A request with a proof is
//! verified against the chain, and only a granted request runs the protected
//! operation. No challenge state is kept between the two requests.
//!
//! `x-payment-response` means the payment was accepted, not that the operation
//! succeeded; it is attached to whatever response a granted operation returns.

use std::future::Future;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::payment::{
    DenialReason, PaymentChallenge, PaymentError, PaymentProof, PaymentTerms, PaymentVerifier,
    VerifiedPayment, PAYMENT_RESPONSE_HEADER,
};

/// Proof as it arrived on the request, before parsing
#[derive(Debug, Clone)]
pub enum RawProof {
    Header(String),
    Body(Value),
}

impl RawProof {
    fn parse(&self) -> Result<PaymentProof, PaymentError> {
        match self {
            RawProof::Header(raw) => PaymentProof::parse(raw),
            RawProof::Body(value) => PaymentProof::from_value(value),
        }
    }
}

/// Terminal state of one pass through the gate
#[derive(Debug)]
pub enum GateOutcome<T> {
    /// No proof; the operation was not run
    Challenge(PaymentChallenge),
    /// Proof rejected; the operation was not run
    Denied {
        reason: DenialReason,
        detail: String,
        challenge: PaymentChallenge,
    },
    /// The chain could not be asked; the operation was not run
    Unavailable(String),
    Granted {
        output: T,
        payment: Option<VerifiedPayment>,
    },
}

enum GateMode {
    Disabled,
    Enforcing {
        terms: PaymentTerms,
        verifier: PaymentVerifier,
    },
}

pub struct PaymentGate {
    mode: GateMode,
}

impl PaymentGate {
    pub fn new(terms: PaymentTerms, verifier: PaymentVerifier) -> Self {
        info!(
            price = %terms.price_display,
            pay_to = %terms.pay_to,
            network = %terms.network,
            "payment gate enforcing"
        );
        Self {
            mode: GateMode::Enforcing { terms, verifier },
        }
    }

    /// Gate that grants every request without a proof
    pub fn disabled() -> Self {
        warn!("payment gate disabled, paid endpoints are free");
        Self {
            mode: GateMode::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, GateMode::Enforcing { .. })
    }

    pub fn terms(&self) -> Option<&PaymentTerms> {
        match &self.mode {
            GateMode::Enforcing { terms, .. } => Some(terms),
            GateMode::Disabled => None,
        }
    }

    /// Run `op` only if `proof` pays for `resource`.
    pub async fn protect<T, F, Fut>(
        &self,
        proof: Option<RawProof>,
        resource: &str,
        op: F,
    ) -> GateOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (terms, verifier) = match &self.mode {
            GateMode::Disabled => {
                return GateOutcome::Granted {
                    output: op().await,
                    payment: None,
                }
            }
            GateMode::Enforcing { terms, verifier } => (terms, verifier),
        };

        let parsed = match proof {
            Some(raw) => raw.parse(),
            None => Err(PaymentError::NoProofSupplied),
        };

        let verified = match parsed {
            Ok(proof) => verifier.verify(&proof, terms).await,
            Err(e) => Err(e),
        };

        match verified {
            Ok(payment) => GateOutcome::Granted {
                output: op().await,
                payment: Some(payment),
            },
            Err(PaymentError::NoProofSupplied) => {
                info!(resource, price = %terms.price_display, "payment required, issuing challenge");
                GateOutcome::Challenge(terms.challenge(resource))
            }
            Err(PaymentError::ProofInvalid { reason, detail }) => {
                warn!(resource, reason = %reason, detail = %detail, "payment denied");
                GateOutcome::Denied {
                    reason,
                    detail,
                    challenge: terms.challenge(resource),
                }
            }
            Err(PaymentError::VerificationInfrastructure(message)) => {
                GateOutcome::Unavailable(message)
            }
        }
    }
}

impl<T: IntoResponse> IntoResponse for GateOutcome<T> {
    fn into_response(self) -> Response {
        match self {
            GateOutcome::Challenge(challenge) => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": "payment required",
                    "payment_details": challenge,
                })),
            )
                .into_response(),
            GateOutcome::Denied {
                reason,
                detail,
                challenge,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": "payment verification failed",
                    "reason": reason,
                    "details": detail,
                    "payment_details": challenge,
                })),
            )
                .into_response(),
            GateOutcome::Unavailable(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "payment verification unavailable",
                    "details": message,
                })),
            )
                .into_response(),
            GateOutcome::Granted { output, payment } => {
                let mut response = output.into_response();
                if let Some(payment) = payment {
                    let hash = format!("0x{}", hex::encode(payment.transaction_hash.as_slice()));
                    if let Ok(value) = HeaderValue::from_str(&hash) {
                        response
                            .headers_mut()
                            .insert(PAYMENT_RESPONSE_HEADER, value);
                    }
                }
                response
            }
        }
    }
}

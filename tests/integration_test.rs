use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use toolpay_agent::chain::{
    ChainError, ChainReader, ChainTransaction, JsonRpcChainReader, TransactionReceipt,
};
use toolpay_agent::config::{Config, PaymentConfig};
use toolpay_agent::gate::PaymentGate;
use toolpay_agent::payment::{PaymentTerms, PaymentVerifier, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER};
use toolpay_agent::plan::ToolRef;
use toolpay_agent::planner::{Planner, PlannerError};
use toolpay_agent::server::{build_router, AppState};
use toolpay_agent::tools::local::{LocalTools, ToolHandler};
use toolpay_agent::tools::registry::ToolRegistry;
use toolpay_agent::tools::FallbackInvoker;

const PAYEE: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
const STRANGER: &str = "0x1111111111111111111111111111111111111111";
const TX_HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

/// Chain with a single confirmed transfer
struct FakeChain {
    to: Address,
    value: U256,
    reachable: bool,
    reads: Arc<AtomicU32>,
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn get_transaction(&self, hash: &B256) -> Result<Option<ChainTransaction>, ChainError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(ChainError::Transport("connection refused".to_string()));
        }
        if *hash != B256::from_str(TX_HASH).unwrap() {
            return Ok(None);
        }
        Ok(Some(ChainTransaction {
            hash: *hash,
            from: Address::from_str(STRANGER).unwrap(),
            to: Some(self.to),
            value: self.value,
            chain_id: Some(8453),
        }))
    }

    async fn get_transaction_receipt(
        &self,
        _hash: &B256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(Some(TransactionReceipt {
            success: true,
            block_number: Some(12_345_678),
        }))
    }
}

/// Tool handler returning a canned result and recording its params
struct RecordingTool {
    response: Result<Value, String>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl RecordingTool {
    fn new(
        response: Result<Value, String>,
        delay: Option<Duration>,
    ) -> (Arc<Self>, Arc<Mutex<Vec<Value>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let tool = Arc::new(Self {
            response,
            delay,
            calls: Arc::clone(&calls),
        });
        (tool, calls)
    }
}

#[async_trait]
impl ToolHandler for RecordingTool {
    async fn call(&self, params: &Value) -> Result<Value, String> {
        self.calls.lock().unwrap().push(params.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}

struct CannedPlanner {
    plan: Value,
    delay: Option<Duration>,
}

#[async_trait]
impl Planner for CannedPlanner {
    async fn plan(&self, _query: &str) -> Result<Value, PlannerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.plan.clone())
    }
}

struct Harness {
    router: Router,
    chain_reads: Arc<AtomicU32>,
    wallet_calls: Arc<Mutex<Vec<Value>>>,
    portfolio_calls: Arc<Mutex<Vec<Value>>>,
}

struct HarnessOptions {
    paid_to: &'static str,
    paid_value: U256,
    chain_reachable: bool,
    portfolio: Result<Value, String>,
    planner: Option<Value>,
    planner_delay: Option<Duration>,
    tool_delay: Option<Duration>,
    /// Replaces the fake chain when set
    chain: Option<Arc<dyn ChainReader>>,
    verify_timeout: Duration,
    request_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            paid_to: PAYEE,
            paid_value: U256::from(1_000_000_000_000_000u64),
            chain_reachable: true,
            portfolio: Ok(json!({"totalValueUsd": 1234.5})),
            planner: None,
            planner_delay: None,
            tool_delay: None,
            chain: None,
            verify_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let registry = Arc::new(ToolRegistry::with_defaults());

    let (wallet, wallet_calls) = RecordingTool::new(
        Ok(json!({
            "wallet": {"address": "0xabc0000000000000000000000000000000000001", "chain": "base"},
            "balanceEth": "1.5"
        })),
        options.tool_delay,
    );
    let (portfolio, portfolio_calls) = RecordingTool::new(options.portfolio, options.tool_delay);

    let mut local = LocalTools::new();
    local.register(ToolRef::new("wallet", "get_wallet_info"), wallet);
    local.register(ToolRef::new("wallet", "analyze_portfolio"), portfolio);

    let reads = Arc::new(AtomicU32::new(0));
    let chain: Arc<dyn ChainReader> = match options.chain {
        Some(chain) => chain,
        None => Arc::new(FakeChain {
            to: Address::from_str(options.paid_to).unwrap(),
            value: options.paid_value,
            reachable: options.chain_reachable,
            reads: Arc::clone(&reads),
        }),
    };
    let terms = PaymentTerms::from_config(&PaymentConfig {
        pay_to: PAYEE.to_string(),
        ..PaymentConfig::default()
    })
    .unwrap();
    let gate = PaymentGate::new(
        terms,
        PaymentVerifier::new(chain, options.verify_timeout),
    );

    let mut state = AppState::new(registry, Arc::new(FallbackInvoker::new(local)), gate);
    if let Some(plan) = options.planner {
        state = state.with_planner(Arc::new(CannedPlanner {
            plan,
            delay: options.planner_delay,
        }));
    }

    Harness {
        router: build_router(state, options.request_timeout),
        chain_reads: reads,
        wallet_calls,
        portfolio_calls,
    }
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    proof: Option<&str>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(proof) = proof {
        request = request.header(PAYMENT_HEADER, proof);
    }
    let body = match body {
        Some(json_body) => Body::from(serde_json::to_vec(&json_body).unwrap()),
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, headers, json)
}

fn wallet_plan() -> Value {
    json!({
        "intent": "analyze my wallet",
        "steps": [
            {
                "toolNamespace": "wallet",
                "toolName": "get_wallet_info",
                "params": {"address": "0xabc0000000000000000000000000000000000001"},
                "reason": "fetch the wallet",
                "dependsOn": []
            },
            {
                "toolNamespace": "wallet",
                "toolName": "analyze_portfolio",
                "params": {},
                "reason": "summarize holdings",
                "dependsOn": [0]
            }
        ],
        "totalCost": 999.0,
        "reasoning": "wallet first, then analysis",
        "expectedOutcome": "portfolio summary"
    })
}

#[tokio::test]
async fn test_health_and_tools() {
    let h = harness(HarnessOptions::default());

    let (status, _, body) = send(&h.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let (status, _, body) = send(&h.router, "GET", "/tools", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let tools = body["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 7);
    assert!(tools
        .iter()
        .any(|t| t["name"] == "get_token_price" && t["price"] == 0.005));
}

#[tokio::test]
async fn test_execute_without_proof_is_challenged() {
    let h = harness(HarnessOptions::default());

    let (status, headers, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(headers.get(PAYMENT_RESPONSE_HEADER).is_none());
    assert_eq!(body["error"], "payment required");
    assert_eq!(body["payment_details"]["price"], "0.001");
    assert_eq!(body["payment_details"]["payTo"], PAYEE);
    assert_eq!(body["payment_details"]["network"], "base");
    assert_eq!(body["payment_details"]["protocol"], "x402");

    assert!(h.wallet_calls.lock().unwrap().is_empty());
    assert_eq!(h.chain_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_paid_execution_runs_plan_in_order() {
    let h = harness(HarnessOptions::default());

    let (status, headers, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(PAYMENT_RESPONSE_HEADER).unwrap(), TX_HASH);
    assert_eq!(body["success"], true);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    assert!(body.get("errors").is_none());
    // registry prices, not the planner's totalCost
    assert!((body["totalCost"].as_f64().unwrap() - 0.06).abs() < 1e-9);

    let portfolio_calls = h.portfolio_calls.lock().unwrap();
    assert_eq!(portfolio_calls.len(), 1);
    let params = &portfolio_calls[0];
    assert_eq!(params["address"], "0xabc0000000000000000000000000000000000001");
    assert_eq!(params["chain"], "base");
    assert_eq!(params["_previousResults"][0]["index"], 0);
    assert_eq!(params["_previousResults"][0]["result"]["balanceEth"], "1.5");
}

#[tokio::test]
async fn test_proof_in_body_is_accepted() {
    let h = harness(HarnessOptions::default());

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({
            "plan": wallet_plan(),
            "payment": {"transactionHash": TX_HASH, "chainId": 8453}
        })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_wrong_recipient_is_denied_with_402() {
    let h = harness(HarnessOptions {
        paid_to: STRANGER,
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "wrong-recipient");
    assert_eq!(body["payment_details"]["price"], "0.001");
    assert!(h.wallet_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_underpayment_is_denied() {
    let h = harness(HarnessOptions {
        paid_value: U256::from(500_000_000_000_000u64),
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "insufficient-amount");
}

#[tokio::test]
async fn test_unknown_transaction_is_denied() {
    let h = harness(HarnessOptions::default());
    let other_hash = format!("0x{}", "ab".repeat(32));

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(&other_hash),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "tx-not-found");
}

#[tokio::test]
async fn test_unreachable_chain_is_500() {
    let h = harness(HarnessOptions {
        chain_reachable: false,
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "payment verification unavailable");
    assert!(h.wallet_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_plan_rejected_before_payment() {
    let h = harness(HarnessOptions::default());
    let plan = json!({
        "steps": [
            {
                "toolNamespace": "wallet",
                "toolName": "get_wallet_info",
                "params": {},
                "reason": "fetch",
                "dependsOn": [1]
            },
            {
                "toolNamespace": "nft",
                "toolName": "mint",
                "params": {},
                "reason": "mint"
            }
        ]
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": plan})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid plan");
    let details = body["details"].as_array().unwrap();
    assert_eq!(details.len(), 3);
    assert_eq!(h.chain_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_step_returns_200_with_errors() {
    let h = harness(HarnessOptions {
        portfolio: Err("portfolio service returned 503: upstream unavailable".to_string()),
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1]["error"], "portfolio service returned 503: upstream unavailable");
    assert_eq!(
        body["errors"][0],
        "Step 1 (wallet.analyze_portfolio) failed: portfolio service returned 503: upstream unavailable"
    );
    assert!((body["totalCost"].as_f64().unwrap() - 0.01).abs() < 1e-9);
}

#[tokio::test]
async fn test_empty_plan_succeeds_at_zero_cost() {
    let h = harness(HarnessOptions::default());

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": {"intent": "nothing", "steps": []}})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["totalCost"], 0.0);
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_non_json_body_gets_json_error() {
    let h = harness(HarnessOptions::default());
    let request = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("bad request"));
}

#[tokio::test]
async fn test_plan_endpoint_estimates_from_registry() {
    let h = harness(HarnessOptions {
        planner: Some(wallet_plan()),
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/plan",
        Some(json!({"query": "analyze my wallet"})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"]["steps"].as_array().unwrap().len(), 2);
    assert!((body["estimatedCost"].as_f64().unwrap() - 0.06).abs() < 1e-9);
    // two dependency levels
    assert_eq!(body["estimatedTime"], 6);
}

#[tokio::test]
async fn test_plan_endpoint_rejects_invalid_planner_output() {
    let h = harness(HarnessOptions {
        planner: Some(json!({"intent": "x", "steps": [{"toolNamespace": "nft"}]})),
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/plan",
        Some(json!({"query": "mint something"})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body["details"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_plan_endpoint_without_planner() {
    let h = harness(HarnessOptions::default());

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/plan",
        Some(json!({"query": "anything"})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "planner is not configured");
}

#[tokio::test]
async fn test_disabled_payment_grants_from_config() {
    let config = tokio_test::assert_ok!(Config::from_toml(
        r#"
[payment]
enabled = false
"#
    ));
    let state = AppState::from_config(&config, LocalTools::new()).unwrap();
    let router = build_router(state, Duration::from_secs(30));

    let (status, headers, body) = send(
        &router,
        "POST",
        "/execute",
        Some(json!({"plan": {"intent": "nothing", "steps": []}})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(PAYMENT_RESPONSE_HEADER).is_none());
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_slow_paid_run_is_not_cut_off() {
    let h = harness(HarnessOptions {
        tool_delay: Some(Duration::from_millis(300)),
        request_timeout: Duration::from_millis(500),
        ..HarnessOptions::default()
    });

    let (status, headers, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(PAYMENT_RESPONSE_HEADER).unwrap(), TX_HASH);
    assert_eq!(body["success"], true);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    assert_eq!(h.portfolio_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_slow_planner_is_json_504() {
    let h = harness(HarnessOptions {
        planner: Some(wallet_plan()),
        planner_delay: Some(Duration::from_secs(5)),
        request_timeout: Duration::from_millis(200),
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/plan",
        Some(json!({"query": "analyze my wallet"})),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].as_str().unwrap().starts_with("timed out"));
}

#[tokio::test]
async fn test_slow_rpc_node_denies_without_running_plan() {
    let node = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&node)
        .await;

    let timeout = Duration::from_millis(300);
    let reader = JsonRpcChainReader::http(&node.uri(), timeout).unwrap();
    let h = harness(HarnessOptions {
        chain: Some(Arc::new(reader)),
        verify_timeout: timeout,
        ..HarnessOptions::default()
    });

    let (status, _, body) = send(
        &h.router,
        "POST",
        "/execute",
        Some(json!({"plan": wallet_plan()})),
        Some(TX_HASH),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["reason"], "tx-not-found");
    assert!(h.wallet_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tolerance_above_price_fails_startup() {
    let config = tokio_test::assert_ok!(Config::from_toml(&format!(
        r#"
[payment]
pay_to = "{}"
price = "0.001"
tolerance = "0.01"
"#,
        PAYEE
    )));
    assert!(AppState::from_config(&config, LocalTools::new()).is_err());
}

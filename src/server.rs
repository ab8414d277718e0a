//! HTTP surface
//!
//! `POST /execute` runs validator, payment gate and executor in that order.
//! A plan that fails validation is rejected before any payment is asked for.
//! There is no request-level deadline on `/execute`: chain reads carry their
//! own timeout, and a paid run always finishes and returns its result.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::chain::JsonRpcChainReader;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::executor::{estimate_cost, estimate_time, PlanExecutor};
use crate::gate::{PaymentGate, RawProof};
use crate::llm::LlmClient;
use crate::payment::{PaymentTerms, PaymentVerifier, PAYMENT_HEADER};
use crate::plan::Plan;
use crate::planner::{LlmPlanner, Planner, PlannerError};
use crate::tools::http::HttpToolInvoker;
use crate::tools::local::LocalTools;
use crate::tools::registry::ToolRegistry;
use crate::tools::{FallbackInvoker, ToolInvoker};
use crate::validator::PlanValidator;

/// Path of the paid endpoint; also the `resource` named in challenges
pub const EXECUTE_PATH: &str = "/execute";

const DEFAULT_PLANNER_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared, read-only handler state. Nothing in here changes per request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ToolRegistry>,
    pub validator: Arc<PlanValidator>,
    pub executor: Arc<PlanExecutor>,
    pub gate: Arc<PaymentGate>,
    pub planner: Option<Arc<dyn Planner>>,
    /// Upper bound on one planner call
    pub planner_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<ToolRegistry>,
        invoker: Arc<dyn ToolInvoker>,
        gate: PaymentGate,
    ) -> Self {
        Self {
            validator: Arc::new(PlanValidator::new(Arc::clone(&registry))),
            executor: Arc::new(PlanExecutor::new(invoker, Arc::clone(&registry))),
            gate: Arc::new(gate),
            planner: None,
            planner_timeout: DEFAULT_PLANNER_TIMEOUT,
            registry,
        }
    }

    /// Set the planner (for dependency injection / testing)
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Wire the production collaborators described by `config`
    pub fn from_config(
        config: &Config,
        local: LocalTools,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Arc::new(ToolRegistry::from_config(&config.tools.registry));

        let mut invoker = FallbackInvoker::new(local);
        if let Some(url) = &config.tools.service_url {
            let remote =
                HttpToolInvoker::new(url, Duration::from_secs(config.tools.timeout_secs))?;
            invoker = invoker.with_remote(Arc::new(remote));
        }

        let gate = if config.payment.enabled {
            let terms = PaymentTerms::from_config(&config.payment)?;
            let timeout = Duration::from_secs(config.payment.verify_timeout_secs);
            let reader = JsonRpcChainReader::http(&config.payment.rpc_url, timeout)?;
            PaymentGate::new(terms, PaymentVerifier::new(Arc::new(reader), timeout))
        } else {
            PaymentGate::disabled()
        };

        let mut state = Self::new(registry, Arc::new(invoker), gate);

        if let Some(planner_config) = &config.planner {
            match LlmClient::from_config(planner_config) {
                Ok(client) => {
                    let planner = LlmPlanner::new(
                        client,
                        Arc::clone(&state.registry),
                        planner_config.max_tokens,
                    );
                    state = state.with_planner(Arc::new(planner));
                }
                Err(e) => warn!(error = %e, "planner unavailable, /plan will return 503"),
            }
        }

        Ok(state)
    }
}

/// `request_timeout` bounds planner calls only; paid executions are never cut off.
pub fn build_router(mut state: AppState, request_timeout: Duration) -> Router {
    state.planner_timeout = request_timeout;
    Router::new()
        .route("/health", get(handle_health))
        .route("/tools", get(handle_tools))
        .route("/plan", post(handle_plan))
        .route(EXECUTE_PATH, post(handle_execute))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process is stopped
pub async fn serve(config: Config, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = build_router(
        state,
        Duration::from_secs(config.server.request_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, payment_enabled = config.payment.enabled, "toolpay agent listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.registry.list() }))
}

#[derive(Debug, Deserialize)]
struct PlanRequest {
    query: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    plan: Plan,
    /// USD, from the registry
    estimated_cost: f64,
    /// Seconds
    estimated_time: u64,
}

async fn handle_plan(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<PlanResponse>> {
    let request: PlanRequest = parse_body(&body)?;
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }

    let planner = state.planner.as_ref().ok_or(PlannerError::NotConfigured)?;
    let raw = tokio::time::timeout(state.planner_timeout, planner.plan(&request.query))
        .await
        .map_err(|_| {
            ApiError::Timeout(format!(
                "planner did not answer within {:?}",
                state.planner_timeout
            ))
        })??;
    let plan = state
        .validator
        .parse(&raw)
        .map_err(ApiError::PlannerOutputInvalid)?;

    Ok(Json(PlanResponse {
        estimated_cost: estimate_cost(&plan, &state.registry).as_usd(),
        estimated_time: estimate_time(&plan).as_secs(),
        plan,
    }))
}

async fn handle_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let body: Value = parse_body(&body)?;
    let raw_plan = body.get("plan").unwrap_or(&Value::Null);
    let plan = state.validator.parse(raw_plan).map_err(ApiError::InvalidPlan)?;

    let proof = payment_proof(&headers, &body);
    let executor = Arc::clone(&state.executor);
    let outcome = state
        .gate
        .protect(proof, EXECUTE_PATH, || async move {
            executor
                .execute(&plan)
                .await
                .map(Json)
                .map_err(ApiError::from)
        })
        .await;

    Ok(outcome.into_response())
}

/// Header wins over the body field when both are present
fn payment_proof(headers: &HeaderMap, body: &Value) -> Option<RawProof> {
    if let Some(value) = headers.get(PAYMENT_HEADER) {
        return Some(RawProof::Header(
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }
    match body.get("payment") {
        None | Some(Value::Null) => None,
        Some(value) => Some(RawProof::Body(value.clone())),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

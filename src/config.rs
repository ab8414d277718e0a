use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Payment gate configuration
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Tool transport and registry configuration
    #[serde(default)]
    pub tools: ToolsConfig,

    /// LLM planner configuration (optional; `/plan` is disabled without it)
    #[serde(default)]
    pub planner: Option<PlannerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline for planner calls; paid executions are not cut off
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Price per execution in the chain's native token, as a decimal string
    #[serde(default = "default_price")]
    pub price: String,
    /// Accepted shortfall for rounding, same unit as `price`
    #[serde(default = "default_tolerance")]
    pub tolerance: String,
    #[serde(default)]
    pub pay_to: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Base URL of the HTTP tool service used when no local handler exists
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Extra registry entries; these override built-in prices
    #[serde(default)]
    pub registry: Vec<ToolEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntryConfig {
    pub namespace: String,
    pub name: String,
    pub price_usd: f64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8402
}

fn default_request_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_price() -> String {
    "0.001".to_string()
}

fn default_tolerance() -> String {
    "0.00001".to_string()
}

fn default_network() -> String {
    "base".to_string()
}

fn default_chain_id() -> u64 {
    8453
}

fn default_rpc_url() -> String {
    "https://mainnet.base.org".to_string()
}

fn default_verify_timeout() -> u64 {
    10
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            price: default_price(),
            tolerance: default_tolerance(),
            pay_to: String::new(),
            network: default_network(),
            chain_id: default_chain_id(),
            rpc_url: default_rpc_url(),
            verify_timeout_secs: default_verify_timeout(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            timeout_secs: default_tool_timeout(),
            registry: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            port = config.server.port,
            payment_enabled = config.payment.enabled,
            network = %config.payment.network,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

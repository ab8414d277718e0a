use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::config::ToolEntryConfig;
use crate::plan::ToolRef;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Tool price in integer micro-USD so that totals are exact sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(u64);

impl Price {
    pub const ZERO: Price = Price(0);

    pub const fn from_micros(micros: u64) -> Self {
        Price(micros)
    }

    /// Convert a USD amount, rounding to the nearest micro-dollar.
    /// Negative or non-finite inputs become zero.
    pub fn from_usd(usd: f64) -> Self {
        if !usd.is_finite() || usd <= 0.0 {
            return Price::ZERO;
        }
        Price((usd * MICROS_PER_USD).round() as u64)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn as_usd(self) -> f64 {
        self.0 as f64 / MICROS_PER_USD
    }

    pub fn saturating_add(self, other: Price) -> Price {
        Price(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.as_usd())
    }
}

impl Serialize for Price {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_usd())
    }
}

/// Registry entry for a single tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub namespace: String,
    pub name: String,
    pub price: Price,
    pub description: String,
}

#[derive(Debug, Clone)]
struct DefaultEntry {
    namespace: &'static str,
    name: &'static str,
    micros: u64,
    description: &'static str,
}

const DEFAULT_TOOLS: &[DefaultEntry] = &[
    DefaultEntry {
        namespace: "wallet",
        name: "get_wallet_info",
        micros: 10_000,
        description: "Resolve a wallet address and report its chain, native balance and activity",
    },
    DefaultEntry {
        namespace: "wallet",
        name: "get_token_balances",
        micros: 20_000,
        description: "List ERC-20 token balances held by an address",
    },
    DefaultEntry {
        namespace: "wallet",
        name: "analyze_portfolio",
        micros: 50_000,
        description: "Summarize holdings, allocation and risk for a wallet",
    },
    DefaultEntry {
        namespace: "wallet",
        name: "get_transaction_history",
        micros: 20_000,
        description: "Fetch recent transactions for an address",
    },
    DefaultEntry {
        namespace: "market",
        name: "get_token_price",
        micros: 5_000,
        description: "Current USD price for a token symbol or contract address",
    },
    DefaultEntry {
        namespace: "market",
        name: "get_market_overview",
        micros: 10_000,
        description: "Top movers, volume and sentiment across major markets",
    },
    DefaultEntry {
        namespace: "storage",
        name: "upload_to_ipfs",
        micros: 30_000,
        description: "Pin a JSON document or text report to IPFS and return its CID",
    },
];

/// Static table of known tools and what each one costs.
///
/// Shared read-only by the validator and the executor; built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolRef, ToolSpec>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the built-in tool table
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for entry in DEFAULT_TOOLS {
            registry.register(
                entry.namespace,
                entry.name,
                Price::from_micros(entry.micros),
                entry.description,
            );
        }
        registry
    }

    /// Built-in table plus config entries; config entries override defaults.
    pub fn from_config(entries: &[ToolEntryConfig]) -> Self {
        let mut registry = Self::with_defaults();
        for entry in entries {
            registry.register(
                &entry.namespace,
                &entry.name,
                Price::from_usd(entry.price_usd),
                entry.description.clone().unwrap_or_default(),
            );
        }
        info!(tools = registry.len(), "tool registry loaded");
        registry
    }

    /// Register (or replace) a tool
    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        price: Price,
        description: impl Into<String>,
    ) {
        let tool = ToolRef::new(namespace, name);
        let spec = ToolSpec {
            namespace: tool.namespace.clone(),
            name: tool.name.clone(),
            price,
            description: description.into(),
        };
        self.tools.insert(tool, spec);
    }

    pub fn get(&self, tool: &ToolRef) -> Option<&ToolSpec> {
        self.tools.get(tool)
    }

    pub fn contains(&self, tool: &ToolRef) -> bool {
        self.tools.contains_key(tool)
    }

    pub fn price_of(&self, tool: &ToolRef) -> Option<Price> {
        self.tools.get(tool).map(|spec| spec.price)
    }

    /// All tools, ordered by namespace then name
    pub fn list(&self) -> Vec<&ToolSpec> {
        self.tools.values().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

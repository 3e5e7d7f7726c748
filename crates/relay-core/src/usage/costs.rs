use std::collections::HashMap;

/// Cost charged for methods the table does not know about.
pub const DEFAULT_METHOD_COST: u64 = 26;

/// Built-in per-method prices in compute units, modelled on common provider price sheets.
const BUILTIN_COSTS: &[(&str, u64)] = &[
    ("eth_chainId", 0),
    ("net_version", 0),
    ("web3_clientVersion", 0),
    ("eth_syncing", 0),
    ("eth_blockNumber", 10),
    ("eth_gasPrice", 19),
    ("eth_maxPriorityFeePerGas", 10),
    ("eth_feeHistory", 10),
    ("eth_getBalance", 19),
    ("eth_getCode", 19),
    ("eth_getStorageAt", 17),
    ("eth_getTransactionCount", 26),
    ("eth_call", 26),
    ("eth_estimateGas", 87),
    ("eth_getBlockByNumber", 16),
    ("eth_getBlockByHash", 21),
    ("eth_getTransactionByHash", 17),
    ("eth_getTransactionReceipt", 15),
    ("eth_getBlockReceipts", 500),
    ("eth_getLogs", 75),
    ("eth_newFilter", 20),
    ("eth_getFilterChanges", 20),
    ("eth_subscribe", 10),
    ("eth_unsubscribe", 10),
    ("eth_sendRawTransaction", 250),
    ("debug_traceTransaction", 309),
    ("trace_block", 500),
];

/// Method → compute-unit price table with an explicit fallback price.
#[derive(Debug, Clone)]
pub struct CostTable {
    costs: HashMap<String, u64>,
    default_cost: u64,
}

impl CostTable {
    /// Table with no per-method entries; every method costs `default_cost`.
    #[must_use]
    pub fn empty(default_cost: u64) -> Self {
        Self { costs: HashMap::new(), default_cost }
    }

    #[must_use]
    pub fn with_cost(mut self, method: impl Into<String>, cu: u64) -> Self {
        self.costs.insert(method.into(), cu);
        self
    }

    #[must_use]
    pub fn with_default(mut self, cu: u64) -> Self {
        self.default_cost = cu;
        self
    }

    #[must_use]
    pub fn cost_of(&self, method: &str) -> u64 {
        self.costs.get(method).copied().unwrap_or(self.default_cost)
    }

    #[must_use]
    pub fn default_cost(&self) -> u64 {
        self.default_cost
    }
}

impl Default for CostTable {
    fn default() -> Self {
        let costs = BUILTIN_COSTS.iter().map(|(method, cu)| ((*method).to_string(), *cu)).collect();
        Self { costs, default_cost: DEFAULT_METHOD_COST }
    }
}

/// Converts a caller-supplied cost override into whole compute units.
///
/// Negative and NaN overrides count as zero; fractions are floored.
#[must_use]
pub fn normalize_cost(raw: f64) -> u64 {
    if raw.is_nan() || raw <= 0.0 {
        0
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cu = raw.floor() as u64;
        cu
    }
}

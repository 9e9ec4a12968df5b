use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// When false the recorder is not attached and `trace.*` methods report unavailable.
    pub enabled: bool,
    /// Quiet period after the last event of a burst before summaries are persisted.
    pub flush_debounce_ms: u64,
    /// Upper bound on how long a continuous burst can hold back a flush.
    pub flush_max_delay_ms: u64,
    pub list_default_limit: u32,
    pub list_max_limit: u32,
    pub events_default_limit: u32,
    pub events_max_limit: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_debounce_ms: 250,
            flush_max_delay_ms: 2_000,
            list_default_limit: 50,
            list_max_limit: 500,
            events_default_limit: 500,
            events_max_limit: 5_000,
        }
    }
}

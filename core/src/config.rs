//! Bridge configuration.
//!
//! Every field has a default, so an empty JSON object (or no configuration at
//! all) yields a working bridge. `from_env` layers `REQUESTS_*` variables on
//! top of whatever was loaded.

use std::path::PathBuf;

use serde::Deserialize;

/// Callback invoked in place of the requested one when a request fails.
pub const DEFAULT_FAILURE_CALLBACK: &str = "OnRequestFailure";

#[cfg(not(windows))]
const DEFAULT_CA_BUNDLE: Option<&str> = Some("/etc/ssl/certs/ca-certificates.crt");
#[cfg(windows)]
const DEFAULT_CA_BUNDLE: Option<&str> = None;

/// Order in which drained responses are handed to the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOrder {
    /// Most recently completed first.
    #[default]
    Lifo,
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub failure_callback: String,
    /// PEM bundle trusted by `https` clients. `None` uses the transport's
    /// built-in roots.
    pub ca_bundle: Option<PathBuf>,
    /// Overall per-request timeout in milliseconds; 0 disables it.
    pub timeout_ms: u64,
    /// Upper bound on concurrently executing requests.
    pub max_workers: usize,
    pub delivery_order: DeliveryOrder,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            failure_callback: DEFAULT_FAILURE_CALLBACK.to_string(),
            ca_bundle: DEFAULT_CA_BUNDLE.map(PathBuf::from),
            timeout_ms: 30_000,
            max_workers: 32,
            delivery_order: DeliveryOrder::Lifo,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON configuration document. Blank input yields the defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text)
    }

    /// Apply `REQUESTS_*` environment overrides. Unparseable values are
    /// logged and ignored.
    pub fn from_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = var("REQUESTS_FAILURE_CALLBACK") {
            self.failure_callback = name;
        }
        if let Some(path) = var("REQUESTS_CA_BUNDLE") {
            self.ca_bundle = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Some(raw) = var("REQUESTS_TIMEOUT_MS") {
            match raw.parse() {
                Ok(ms) => self.timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid REQUESTS_TIMEOUT_MS"),
            }
        }
        if let Some(raw) = var("REQUESTS_MAX_WORKERS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.max_workers = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid REQUESTS_MAX_WORKERS"),
            }
        }
        if let Some(raw) = var("REQUESTS_DELIVERY_ORDER") {
            match raw.to_ascii_lowercase().as_str() {
                "lifo" => self.delivery_order = DeliveryOrder::Lifo,
                "fifo" => self.delivery_order = DeliveryOrder::Fifo,
                _ => tracing::warn!(value = %raw, "ignoring invalid REQUESTS_DELIVERY_ORDER"),
            }
        }
        self
    }
}

use std::env;
use std::time::Duration;

use ledger_store::RetryPolicy;

/// Every tunable named in the external interface: heal cadence and caps,
/// idempotency retention, fast-transfer retry policy, and the currencies
/// this deployment accepts. Each has a typed default so a bare `cargo run`
/// works out of the box.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub bind_addr: String,
    pub heal_rate_seconds: u64,
    pub heal_max_abs_minor: i64,
    pub heal_suspense_account: String,
    pub heal_reserve_account: String,
    pub heal_tenant_id: String,
    pub heal_region_a: String,
    pub heal_region_b: String,
    pub heal_global_watermark_stale_ms: u64,
    pub idempotency_retention_days: u32,
    pub fast_transfer_max_retries: u32,
    pub fast_transfer_retry_base_ms: u64,
    pub supported_currencies: Vec<String>,
    pub device_hmac_key: Vec<u8>,
    pub origin_region: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            bind_addr: env_string_or("LEDGER_BIND_ADDR", "0.0.0.0:8080"),
            heal_rate_seconds: env_or("HEAL_RATE_SECONDS", 10),
            heal_max_abs_minor: env_or("HEAL_MAX_ABS_MINOR", 200_000),
            heal_suspense_account: env_string_or("HEAL_SUSPENSE_ACCOUNT", "suspense"),
            heal_reserve_account: env_string_or("HEAL_RESERVE_ACCOUNT", "reserve"),
            heal_tenant_id: env_string_or("HEAL_TENANT_ID", "tnt_test1"),
            heal_region_a: env_string_or("HEAL_REGION_A", "region-a"),
            heal_region_b: env_string_or("HEAL_REGION_B", "region-b"),
            heal_global_watermark_stale_ms: env_or("HEAL_GLOBAL_WATERMARK_STALE_MS", 5_000),
            idempotency_retention_days: env_or("IDEMPOTENCY_RETENTION_DAYS", 30),
            fast_transfer_max_retries: env_or("FAST_TRANSFER_MAX_RETRIES", 3),
            fast_transfer_retry_base_ms: env_or("FAST_TRANSFER_RETRY_BASE_MS", 100),
            supported_currencies: env::var("SUPPORTED_CURRENCIES")
                .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).collect())
                .unwrap_or_else(|_| vec!["NGN".into(), "USD".into(), "EUR".into(), "GBP".into()]),
            device_hmac_key: env::var("DEVICE_HMAC_KEY")
                .map(String::into_bytes)
                .unwrap_or_else(|_| b"dev-only-insecure-default-key".to_vec()),
            origin_region: env_string_or("LEDGER_REGION", "local"),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn fast_transfer_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.fast_transfer_max_retries,
            base_backoff: Duration::from_millis(self.fast_transfer_retry_base_ms),
        }
    }

    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.idempotency_retention_days) * 24 * 3600)
    }

    pub fn heal_config(&self) -> ledger_heal::HealConfig {
        ledger_heal::HealConfig {
            max_abs_minor: self.heal_max_abs_minor,
            watermark_stale_after: Duration::from_millis(self.heal_global_watermark_stale_ms),
        }
    }
}

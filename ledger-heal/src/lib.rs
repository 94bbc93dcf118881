#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Cross-region drift auto-healing: each region reports the net imbalance
//! it has observed for one tenant's account, in one currency, against the
//! ledger of record, as a signed delta. Deltas accumulate per `(tenant,
//! account, currency)` key with a separate sub-counter per region. Gated on
//! a fresh global watermark, the healer compares exactly two named regions
//! for a key and, if they diverge by no more than its configured cap,
//! issues a single compensating transfer between the drifting account and
//! a tenant-scoped suspense account to bring the two regions back into
//! agreement. A divergence past the cap is never partially corrected: the
//! run is skipped and the caller is expected to alert on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use ledger_core::Account;
use ledger_core::AccountId;
use ledger_core::Currency;
use ledger_core::EntryOrigin;
use ledger_core::EntryStatus;
use ledger_core::JournalEntry;
use ledger_core::Posting;
use ledger_core::PostingSide;
use ledger_core::TenantId;
use ledger_store::LedgerStore;
use ledger_store::RetryPolicy;
use ledger_store::StoreError;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub type HealResult<T> = Result<T, HealError>;

#[derive(Debug, Error)]
pub enum HealError {
    #[error("global watermark for tenant {0} is stale")]
    StaleWatermark(TenantId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The unit of drift tracking: one tenant's one account in one currency.
pub type DriftKey = (TenantId, AccountId, String);

/// Accumulation of one region's observed delta for a [`DriftKey`], in minor
/// units. `pos_minor` is the sum of deltas where the region observed more
/// funds than the ledger of record; `neg_minor`, the sum where it observed
/// less.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegionTally {
    pub pos_minor: i64,
    pub neg_minor: i64,
}

impl RegionTally {
    fn net(&self) -> i64 {
        self.pos_minor - self.neg_minor
    }

    fn record(&mut self, delta_minor: i64) {
        if delta_minor >= 0 {
            self.pos_minor += delta_minor;
        } else {
            self.neg_minor += -delta_minor;
        }
    }
}

/// Per-region tallies for a single [`DriftKey`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftCounter {
    regions: HashMap<String, RegionTally>,
}

impl DriftCounter {
    fn net(&self, region: &str) -> i64 {
        self.regions.get(region).map(RegionTally::net).unwrap_or(0)
    }

    fn record(&mut self, region: &str, delta_minor: i64) {
        self.regions.entry(region.to_string()).or_default().record(delta_minor);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalWatermark {
    pub observed_at: DateTime<Utc>,
}

/// Outcome of one `heal` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    NothingToHeal,
    Compensated { entry_id: String, amount_minor: i64 },
    /// The two regions disagree by more than `max_abs_minor`. No transfer
    /// is posted; the caller should alert rather than retry blindly.
    ExceedsCap { diff_minor: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct HealConfig {
    pub max_abs_minor: i64,
    pub watermark_stale_after: Duration,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_abs_minor: 200_000,
            watermark_stale_after: Duration::from_millis(5_000),
        }
    }
}

pub struct DriftHealer {
    store: Arc<dyn LedgerStore>,
    config: HealConfig,
    counters: RwLock<HashMap<DriftKey, DriftCounter>>,
    watermarks: RwLock<HashMap<TenantId, GlobalWatermark>>,
}

impl DriftHealer {
    pub fn new(store: Arc<dyn LedgerStore>, config: HealConfig) -> Self {
        Self {
            store,
            config,
            counters: RwLock::new(HashMap::new()),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    /// Records an observed delta from `region` for one tenant's account in
    /// one currency. Called by the cross-region reconciliation feed, not by
    /// ledger postings themselves.
    pub async fn record_region_delta(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        currency_code: &str,
        region: &str,
        delta_minor: i64,
    ) {
        let key = (tenant_id.clone(), account_id.clone(), currency_code.to_string());
        self.counters.write().await.entry(key).or_default().record(region, delta_minor);
    }

    pub async fn update_watermark(&self, tenant_id: &TenantId, observed_at: DateTime<Utc>) {
        self.watermarks
            .write()
            .await
            .insert(tenant_id.clone(), GlobalWatermark { observed_at });
    }

    async fn diff(&self, key: &DriftKey, region_a: &str, region_b: &str) -> i64 {
        let counters = self.counters.read().await;
        let Some(counter) = counters.get(key) else {
            return 0;
        };
        counter.net(region_a) - counter.net(region_b)
    }

    /// Raises `fix_region`'s net by `amount_minor`, bringing it level with
    /// the other region for this key. This is what makes a retry within the
    /// same watermark window resolve to `NothingToHeal` without relying
    /// solely on idempotency-key replay.
    async fn apply_correction(&self, key: &DriftKey, fix_region: &str, amount_minor: i64) {
        self.counters
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .record(fix_region, amount_minor);
    }

    fn tenant_suspense_account(suspense_account: &str, tenant_id: &TenantId) -> AccountId {
        format!("{suspense_account}::{tenant_id}")
    }

    /// An account referenced for the first time is created on the spot,
    /// mirroring the fast-transfer path's first-reference upsert.
    async fn get_or_create_suspense(
        &self,
        suspense_id: &AccountId,
        tenant_id: &TenantId,
        currency: &Currency,
    ) -> HealResult<Account> {
        match self.store.get_account(suspense_id).await {
            Ok(account) => Ok(account),
            Err(StoreError::Ledger(ledger_core::LedgerError::NotFound(_))) => {
                let mut fresh = Account::new(suspense_id.clone(), tenant_id.clone(), currency.clone())
                    .map_err(|err| HealError::Validation(err.to_string()))?;
                fresh.is_suspense = true;
                match self.store.create_account(fresh).await {
                    Ok(account) => Ok(account),
                    Err(StoreError::AccountExists(_)) => Ok(self.store.get_account(suspense_id).await?),
                    Err(other) => Err(HealError::Store(other)),
                }
            }
            Err(other) => Err(HealError::Store(other)),
        }
    }

    /// Checks the watermark, compares `region_a` and `region_b` for one
    /// `(tenant, account, currency)` key, and, if they diverge within
    /// `HealConfig::max_abs_minor`, posts a single compensating entry
    /// between `account_id` and a tenant-scoped suspense account sized to
    /// close the gap exactly. A divergence past the cap is reported, not
    /// partially corrected.
    pub async fn heal(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        currency: &Currency,
        region_a: &str,
        region_b: &str,
        suspense_account: &str,
    ) -> HealResult<HealOutcome> {
        let watermark = self
            .watermarks
            .read()
            .await
            .get(tenant_id)
            .copied()
            .ok_or_else(|| HealError::StaleWatermark(tenant_id.clone()))?;

        let age = Utc::now().signed_duration_since(watermark.observed_at);
        if age.to_std().unwrap_or(Duration::MAX) > self.config.watermark_stale_after {
            return Err(HealError::StaleWatermark(tenant_id.clone()));
        }

        let key: DriftKey = (tenant_id.clone(), account_id.clone(), currency.code.clone());
        let diff = self.diff(&key, region_a, region_b).await;
        if diff == 0 {
            return Ok(HealOutcome::NothingToHeal);
        }

        if diff.abs() > self.config.max_abs_minor {
            warn!(
                tenant_id = %tenant_id,
                account_id = %account_id,
                currency = %currency.code,
                diff_minor = diff,
                max_abs_minor = self.config.max_abs_minor,
                "drift exceeds cap, skipping heal"
            );
            return Ok(HealOutcome::ExceedsCap { diff_minor: diff });
        }

        let fix_region = if diff > 0 { region_b } else { region_a };
        let amount_minor = diff.abs();

        let suspense_id = Self::tenant_suspense_account(suspense_account, tenant_id);
        let suspense = self.get_or_create_suspense(&suspense_id, tenant_id, currency).await?;

        // A positive diff means region_a observed more than region_b: the
        // account is short relative to region_a's view, so credit the
        // account from suspense. A negative diff reverses the two legs.
        let (debit_account, credit_account) = if diff > 0 {
            (suspense.id.clone(), account_id.clone())
        } else {
            (account_id.clone(), suspense.id.clone())
        };

        let idempotency_key = format!(
            "heal::{fix_region}::{tenant_id}::{account_id}::{currency}::{watermark}",
            currency = currency.code,
            watermark = watermark.observed_at.to_rfc3339(),
        );

        let entry = JournalEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            postings: vec![
                Posting::new(debit_account, PostingSide::Debit, amount_minor, currency.clone()),
                Posting::new(credit_account, PostingSide::Credit, amount_minor, currency.clone()),
            ],
            origin: EntryOrigin::DriftCompensation,
            status: EntryStatus::Posted,
            memo: Some(format!("drift compensation for {tenant_id}/{account_id}/{}", currency.code)),
            idempotency_key: Some(idempotency_key),
            created_at: Utc::now(),
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        };

        let committed = self.store.commit_entry(entry, RetryPolicy::default(), None).await?;

        self.apply_correction(&key, fix_region, amount_minor).await;

        info!(
            tenant_id = %tenant_id,
            account_id = %account_id,
            amount_minor,
            entry_id = %committed.id,
            "drift compensation posted"
        );

        Ok(HealOutcome::Compensated {
            entry_id: committed.id,
            amount_minor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_store::InMemoryLedgerStore;
    use pretty_assertions::assert_eq;

    fn usd() -> Currency {
        Currency::new("USD", 2).expect("valid currency")
    }

    async fn store_with_account() -> Arc<InMemoryLedgerStore> {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .create_account(Account::new("acct-1", "tnt_test1", usd()).expect("valid account"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn stale_watermark_blocks_healing() {
        let store = store_with_account().await;
        let healer = DriftHealer::new(store, HealConfig::default());
        let tenant = "tnt_test1".to_string();
        healer.record_region_delta(&tenant, &"acct-1".to_string(), "USD", "region-a", 500).await;

        let err = healer
            .heal(&tenant, &"acct-1".to_string(), &usd(), "region-a", "region-b", "suspense")
            .await
            .expect_err("no watermark recorded yet");
        assert!(matches!(err, HealError::StaleWatermark(_)));
    }

    #[tokio::test]
    async fn equal_regions_are_a_no_op() {
        let store = store_with_account().await;
        let healer = DriftHealer::new(store, HealConfig::default());
        let tenant = "tnt_test1".to_string();
        let account = "acct-1".to_string();
        healer.record_region_delta(&tenant, &account, "USD", "region-a", 500).await;
        healer.record_region_delta(&tenant, &account, "USD", "region-b", 500).await;
        healer.update_watermark(&tenant, Utc::now()).await;

        let outcome = healer
            .heal(&tenant, &account, &usd(), "region-a", "region-b", "suspense")
            .await
            .expect("heal");
        assert_eq!(outcome, HealOutcome::NothingToHeal);
    }

    #[tokio::test]
    async fn diverging_regions_post_a_compensating_transfer() {
        let store = store_with_account().await;
        let healer = DriftHealer::new(store.clone(), HealConfig::default());
        let tenant = "tnt_test1".to_string();
        let account = "acct-1".to_string();
        healer.record_region_delta(&tenant, &account, "USD", "region-a", 1_200).await;
        healer.update_watermark(&tenant, Utc::now()).await;

        let outcome = healer
            .heal(&tenant, &account, &usd(), "region-a", "region-b", "suspense")
            .await
            .expect("heal");
        match outcome {
            HealOutcome::Compensated { amount_minor, .. } => assert_eq!(amount_minor, 1_200),
            other => panic!("expected compensation, got {other:?}"),
        }
        assert_eq!(store.get_account(&account).await.unwrap().balance_minor, 1_200);
        let suspense_id = DriftHealer::tenant_suspense_account("suspense", &tenant);
        assert_eq!(store.get_account(&suspense_id).await.unwrap().balance_minor, -1_200);
    }

    #[tokio::test]
    async fn retry_in_the_same_watermark_window_is_a_no_op() {
        let store = store_with_account().await;
        let healer = DriftHealer::new(store.clone(), HealConfig::default());
        let tenant = "tnt_test1".to_string();
        let account = "acct-1".to_string();
        healer.record_region_delta(&tenant, &account, "USD", "region-a", 1_200).await;
        healer.update_watermark(&tenant, Utc::now()).await;

        healer
            .heal(&tenant, &account, &usd(), "region-a", "region-b", "suspense")
            .await
            .expect("first heal compensates");
        let second = healer
            .heal(&tenant, &account, &usd(), "region-a", "region-b", "suspense")
            .await
            .expect("second heal in same window");
        assert_eq!(second, HealOutcome::NothingToHeal);
    }

    #[tokio::test]
    async fn divergence_past_the_cap_is_skipped_not_partially_healed() {
        let store = store_with_account().await;
        let config = HealConfig {
            max_abs_minor: 500,
            ..HealConfig::default()
        };
        let healer = DriftHealer::new(store.clone(), config);
        let tenant = "tnt_test1".to_string();
        let account = "acct-1".to_string();
        healer.record_region_delta(&tenant, &account, "USD", "region-a", 10_000).await;
        healer.update_watermark(&tenant, Utc::now()).await;

        let outcome = healer
            .heal(&tenant, &account, &usd(), "region-a", "region-b", "suspense")
            .await
            .expect("heal");
        assert_eq!(outcome, HealOutcome::ExceedsCap { diff_minor: 10_000 });
        assert_eq!(store.get_account(&account).await.unwrap().balance_minor, 0);
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The storage engine: a `LedgerStore` trait abstracting account/journal
//! persistence, with an in-memory implementation that provides
//! serializable-isolation commits through ordered per-account advisory
//! locking and bounded retry with exponential backoff, the same shape a
//! `SELECT ... FOR UPDATE ORDER BY account_id` + retry-on-conflict loop
//! gives you against a real relational store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use ledger_core::Account;
use ledger_core::AccountId;
use ledger_core::Currency;
use ledger_core::EntryStatus;
use ledger_core::JournalEntry;
use ledger_core::JournalEntryId;
use ledger_core::LedgerError;
use ledger_core::PostingEngine;
use ledger_core::TenantId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::warn;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("account {0} already exists")]
    AccountExists(AccountId),
    #[error("could not acquire ordered account locks after {0} attempts")]
    Conflict(u32),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Retry policy for the ordered-lock commit loop. Mirrors
/// `FAST_TRANSFER_MAX_RETRIES` / `FAST_TRANSFER_RETRY_BASE_MS`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    entry_id: JournalEntryId,
    recorded_at: DateTime<Utc>,
}

/// One committed mutation, recorded for tenant operators to inspect after
/// the fact. Appended inside `commit_entry` itself so an audit event exists
/// for every posting whether it arrived through the fast-path transfer,
/// offline sync, or drift compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub tenant_id: TenantId,
    pub entity_id: JournalEntryId,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditTrailFilter {
    pub tenant_id: TenantId,
    pub entity_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// Invoked synchronously from inside `commit_entry`, after an entry's
/// postings are applied but before its account locks are released, so a
/// caller never observes a committed entry whose outbox message (or other
/// side effect) was not also recorded. This is how the outbox (C5) gets
/// "written in the same transaction" as the posting without this crate
/// depending on the outbox crate.
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// `touched_accounts` holds the post-apply state of every account the
    /// entry's postings named, keyed by account id.
    async fn on_commit(&self, entry: &JournalEntry, touched_accounts: &HashMap<AccountId, Account>);
}

/// Persistence surface for accounts and journal entries. The in-memory
/// implementation below is the default; a `postgres-store` feature stub is
/// provided for the real backing store, not yet implemented.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_account(&self, account: Account) -> StoreResult<Account>;
    async fn get_account(&self, account_id: &AccountId) -> StoreResult<Account>;
    async fn list_accounts(&self, tenant_id: &TenantId) -> StoreResult<Vec<Account>>;

    /// Commits `entry` under serializable isolation: validates against the
    /// current balances of every account it touches, applies it, and
    /// records its idempotency key in the same logical transaction. Returns
    /// the previously committed entry verbatim if `entry.idempotency_key`
    /// was already recorded, per the idempotent-replay contract.
    async fn commit_entry(
        &self,
        entry: JournalEntry,
        policy: RetryPolicy,
        hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry>;

    async fn get_entry(&self, entry_id: &JournalEntryId) -> StoreResult<JournalEntry>;

    /// Builds and commits the reversing entry for `entry_id` through the
    /// same ordered-locking commit path as any other entry, then marks the
    /// original entry `Reversed` and links the two.
    async fn reverse_entry(
        &self,
        entry_id: &JournalEntryId,
        new_entry_id: JournalEntryId,
        policy: RetryPolicy,
        hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry>;

    /// Audit events for a tenant, oldest first, optionally narrowed to one
    /// entity and paged by cursor (an event id) and limit.
    async fn list_audit_trail(&self, filter: AuditTrailFilter) -> StoreResult<Vec<AuditEvent>>;
}

struct AccountSlot {
    account: Account,
}

const DEFAULT_IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountSlot>>>>,
    entries: RwLock<HashMap<JournalEntryId, JournalEntry>>,
    idempotency_keys: RwLock<HashMap<String, IdempotencyRecord>>,
    idempotency_retention: Duration,
    audit_events: RwLock<Vec<AuditEvent>>,
    audit_seq: RwLock<u64>,
    posting_engine: PostingEngine,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            idempotency_keys: RwLock::new(HashMap::new()),
            idempotency_retention: DEFAULT_IDEMPOTENCY_RETENTION,
            audit_events: RwLock::new(Vec::new()),
            audit_seq: RwLock::new(0),
            posting_engine: PostingEngine::default(),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A key older than `retention` stops replaying its stored result and
    /// becomes eligible to be re-run, per the configured idempotency
    /// retention window.
    pub fn with_idempotency_retention(retention: Duration) -> Self {
        Self {
            idempotency_retention: retention,
            ..Self::default()
        }
    }

    async fn account_lock(&self, account_id: &AccountId) -> Option<Arc<Mutex<AccountSlot>>> {
        self.accounts.read().await.get(account_id).cloned()
    }

    /// Acquires every account touched by `entry`, in ascending account-id
    /// order, using non-blocking `try_lock`. If any lock is currently held
    /// this releases everything it already grabbed and reports contention
    /// so the caller can back off and retry. This is what prevents
    /// deadlock across concurrently-committing entries that touch
    /// overlapping accounts in different orders.
    async fn try_acquire_ordered<'a>(
        &self,
        account_ids: &'a [AccountId],
    ) -> Result<Vec<tokio::sync::OwnedMutexGuard<AccountSlot>>, ()> {
        let mut guards = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            let Some(lock) = self.account_lock(account_id).await else {
                return Err(());
            };
            match lock.try_lock_owned() {
                Ok(guard) => guards.push(guard),
                Err(_) => return Err(()),
            }
        }
        Ok(guards)
    }

    async fn record_audit_event(&self, tenant_id: TenantId, entity_id: JournalEntryId, description: String) {
        let mut seq = self.audit_seq.write().await;
        *seq += 1;
        let event = AuditEvent {
            id: format!("audit-{seq}"),
            tenant_id,
            entity_id,
            actor: "system".to_string(),
            occurred_at: Utc::now(),
            description,
        };
        self.audit_events.write().await.push(event);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self, account: Account) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.id) {
            return Err(StoreError::AccountExists(account.id));
        }
        let id = account.id.clone();
        accounts.insert(
            id,
            Arc::new(Mutex::new(AccountSlot {
                account: account.clone(),
            })),
        );
        Ok(account)
    }

    async fn get_account(&self, account_id: &AccountId) -> StoreResult<Account> {
        let slot = self
            .account_lock(account_id)
            .await
            .ok_or_else(|| StoreError::Ledger(LedgerError::NotFound(format!("account {account_id}"))))?;
        Ok(slot.lock().await.account.clone())
    }

    async fn list_accounts(&self, tenant_id: &TenantId) -> StoreResult<Vec<Account>> {
        let accounts = self.accounts.read().await;
        let mut out = Vec::new();
        for slot in accounts.values() {
            let guard = slot.lock().await;
            if &guard.account.tenant_id == tenant_id {
                out.push(guard.account.clone());
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn commit_entry(
        &self,
        entry: JournalEntry,
        policy: RetryPolicy,
        hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry> {
        if let Some(key) = &entry.idempotency_key {
            let keys = self.idempotency_keys.read().await;
            if let Some(record) = keys.get(key) {
                let age = Utc::now().signed_duration_since(record.recorded_at);
                let expired = age.to_std().map(|age| age > self.idempotency_retention).unwrap_or(false);
                if !expired {
                    let entry_id = record.entry_id.clone();
                    drop(keys);
                    return self.get_entry(&entry_id).await;
                }
            }
        }

        let mut account_ids: Vec<AccountId> =
            entry.postings.iter().map(|p| p.account_id.clone()).collect();
        account_ids.sort();
        account_ids.dedup();

        let mut attempt = 0u32;
        loop {
            match self.try_acquire_ordered(&account_ids).await {
                Ok(mut guards) => {
                    let mut snapshot: HashMap<AccountId, Account> = HashMap::new();
                    for guard in &guards {
                        snapshot.insert(guard.account.id.clone(), guard.account.clone());
                    }
                    self.posting_engine
                        .validate_against_accounts(&entry, &snapshot)?;
                    self.posting_engine.apply(&entry, &mut snapshot);
                    for guard in guards.iter_mut() {
                        if let Some(updated) = snapshot.get(&guard.account.id) {
                            guard.account = updated.clone();
                        }
                    }
                    self.entries
                        .write()
                        .await
                        .insert(entry.id.clone(), entry.clone());
                    if let Some(key) = &entry.idempotency_key {
                        self.idempotency_keys.write().await.insert(
                            key.clone(),
                            IdempotencyRecord {
                                entry_id: entry.id.clone(),
                                recorded_at: Utc::now(),
                            },
                        );
                    }
                    if let Some(hook) = hook {
                        hook.on_commit(&entry, &snapshot).await;
                    }
                    drop(guards);
                    self.record_audit_event(
                        entry.tenant_id.clone(),
                        entry.id.clone(),
                        format!("entry {} posted ({:?}, {} postings)", entry.id, entry.origin, entry.postings.len()),
                    )
                    .await;
                    return Ok(entry);
                }
                Err(()) => {
                    if attempt >= policy.max_retries {
                        warn!(entry_id = %entry.id, attempts = attempt, "ordered lock acquisition exhausted retries");
                        return Err(StoreError::Conflict(attempt));
                    }
                    let backoff = policy.base_backoff * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn get_entry(&self, entry_id: &JournalEntryId) -> StoreResult<JournalEntry> {
        self.entries
            .read()
            .await
            .get(entry_id)
            .cloned()
            .ok_or_else(|| StoreError::Ledger(LedgerError::NotFound(format!("entry {entry_id}"))))
    }

    async fn reverse_entry(
        &self,
        entry_id: &JournalEntryId,
        new_entry_id: JournalEntryId,
        policy: RetryPolicy,
        hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry> {
        let original = self.get_entry(entry_id).await?;
        let reversal = original.build_reversal(new_entry_id)?;
        let committed = self.commit_entry(reversal, policy, hook).await?;

        let mut entries = self.entries.write().await;
        if let Some(stored) = entries.get_mut(entry_id) {
            stored.status = EntryStatus::Reversed;
            stored.reversed_by_entry_id = Some(committed.id.clone());
        }
        Ok(committed)
    }

    async fn list_audit_trail(&self, filter: AuditTrailFilter) -> StoreResult<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self
            .audit_events
            .read()
            .await
            .iter()
            .filter(|event| event.tenant_id == filter.tenant_id)
            .cloned()
            .collect();

        if let Some(entity) = &filter.entity_id {
            events.retain(|event| &event.entity_id == entity);
        }
        if let Some(cursor) = &filter.cursor
            && let Some(pos) = events.iter().position(|event| &event.id == cursor)
        {
            events.drain(0..=pos);
        }
        if let Some(limit) = filter.limit
            && events.len() > limit
        {
            events.truncate(limit);
        }
        Ok(events)
    }
}

#[cfg(feature = "postgres-store")]
pub struct PostgresLedgerStore;

#[cfg(feature = "postgres-store")]
#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_account(&self, _account: Account) -> StoreResult<Account> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn get_account(&self, _account_id: &AccountId) -> StoreResult<Account> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn list_accounts(&self, _tenant_id: &TenantId) -> StoreResult<Vec<Account>> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn commit_entry(
        &self,
        _entry: JournalEntry,
        _policy: RetryPolicy,
        _hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn get_entry(&self, _entry_id: &JournalEntryId) -> StoreResult<JournalEntry> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn reverse_entry(
        &self,
        _entry_id: &JournalEntryId,
        _new_entry_id: JournalEntryId,
        _policy: RetryPolicy,
        _hook: Option<&(dyn CommitHook)>,
    ) -> StoreResult<JournalEntry> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }

    async fn list_audit_trail(&self, _filter: AuditTrailFilter) -> StoreResult<Vec<AuditEvent>> {
        Err(StoreError::Internal("postgres-store not yet implemented".into()))
    }
}

/// Convenience constructor used by wiring code, independent of currency
/// table lookups; callers decide the account's currency.
pub fn new_account(
    id: impl Into<AccountId>,
    tenant_id: impl Into<TenantId>,
    currency: Currency,
) -> ledger_core::LedgerResult<Account> {
    Account::new(id, tenant_id, currency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::EntryOrigin;
    use ledger_core::EntryStatus;
    use ledger_core::Posting;
    use ledger_core::PostingSide;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn usd() -> Currency {
        Currency::new("USD", 2).expect("valid currency")
    }

    fn transfer_entry(tenant: &str, from: &str, to: &str, amount: i64, idem: Option<&str>) -> JournalEntry {
        JournalEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.into(),
            postings: vec![
                Posting::new(from, PostingSide::Debit, amount, usd()),
                Posting::new(to, PostingSide::Credit, amount, usd()),
            ],
            origin: EntryOrigin::FastTransfer,
            status: EntryStatus::Posted,
            memo: None,
            idempotency_key: idem.map(|s| s.to_string()),
            created_at: Utc::now(),
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        }
    }

    async fn seeded_store() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        let mut a = Account::new("a", "tnt_test1", usd()).expect("valid account");
        a.balance_minor = 10_000;
        store.create_account(a).await.expect("create a");
        store
            .create_account(Account::new("b", "tnt_test1", usd()).expect("valid account"))
            .await
            .expect("create b");
        store
    }

    #[tokio::test]
    async fn commits_a_balanced_transfer() {
        let store = seeded_store().await;
        let entry = transfer_entry("tnt_test1", "a", "b", 2_500, None);
        store
            .commit_entry(entry, RetryPolicy::default(), None)
            .await
            .expect("commit");

        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 7_500);
        assert_eq!(store.get_account(&"b".to_string()).await.unwrap().balance_minor, 2_500);
    }

    #[tokio::test]
    async fn idempotency_key_replays_same_result_without_reapplying() {
        let store = seeded_store().await;
        let entry = transfer_entry("tnt_test1", "a", "b", 1_000, Some("idem-1"));

        let first = store
            .commit_entry(entry.clone(), RetryPolicy::default(), None)
            .await
            .expect("first commit");
        let second = store
            .commit_entry(entry, RetryPolicy::default(), None)
            .await
            .expect("replayed commit");

        assert_eq!(first.id, second.id);
        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 9_000);
    }

    #[tokio::test]
    async fn concurrent_transfers_on_disjoint_accounts_both_commit() {
        let store = Arc::new(seeded_store().await);
        store
            .create_account(Account::new("c", "tnt_test1", usd()).expect("valid account"))
            .await
            .expect("create c");
        store
            .create_account(Account::new("d", "tnt_test1", usd()).expect("valid account"))
            .await
            .expect("create d");
        store
            .commit_entry(transfer_entry("tnt_test1", "a", "c", 5_000, None), RetryPolicy::default(), None)
            .await
            .expect("seed c");

        let store_a = store.clone();
        let t1 = tokio::spawn(async move {
            store_a
                .commit_entry(transfer_entry("tnt_test1", "a", "b", 1_000, None), RetryPolicy::default(), None)
                .await
        });
        let store_b = store.clone();
        let t2 = tokio::spawn(async move {
            store_b
                .commit_entry(transfer_entry("tnt_test1", "c", "d", 500, None), RetryPolicy::default(), None)
                .await
        });

        let (r1, r2) = tokio::join!(t1, t2);
        r1.unwrap().expect("transfer a->b commits");
        r2.unwrap().expect("transfer c->d commits");
    }

    #[tokio::test]
    async fn commit_appends_an_audit_event_for_the_entry() {
        let store = seeded_store().await;
        let entry = transfer_entry("tnt_test1", "a", "b", 1_000, None);
        let entry_id = entry.id.clone();
        store.commit_entry(entry, RetryPolicy::default(), None).await.expect("commit");

        let events = store
            .list_audit_trail(AuditTrailFilter {
                tenant_id: "tnt_test1".into(),
                ..Default::default()
            })
            .await
            .expect("list audit trail");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, entry_id);
        assert_eq!(events[0].tenant_id, "tnt_test1");
    }

    #[tokio::test]
    async fn audit_trail_cursor_skips_events_up_to_and_including_it() {
        let store = seeded_store().await;
        store
            .commit_entry(transfer_entry("tnt_test1", "a", "b", 100, None), RetryPolicy::default(), None)
            .await
            .expect("first commit");
        store
            .commit_entry(transfer_entry("tnt_test1", "a", "b", 200, None), RetryPolicy::default(), None)
            .await
            .expect("second commit");

        let all = store
            .list_audit_trail(AuditTrailFilter {
                tenant_id: "tnt_test1".into(),
                ..Default::default()
            })
            .await
            .expect("list all");
        assert_eq!(all.len(), 2);

        let paged = store
            .list_audit_trail(AuditTrailFilter {
                tenant_id: "tnt_test1".into(),
                cursor: Some(all[0].id.clone()),
                ..Default::default()
            })
            .await
            .expect("list after cursor");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, all[1].id);
    }

    #[tokio::test]
    async fn expired_idempotency_key_is_eligible_to_run_again() {
        let store = InMemoryLedgerStore::with_idempotency_retention(Duration::from_millis(0));
        let mut a = Account::new("a", "tnt_test1", usd()).expect("valid account");
        a.balance_minor = 10_000;
        store.create_account(a).await.expect("create a");
        store.create_account(Account::new("b", "tnt_test1", usd()).expect("valid account")).await.expect("create b");

        let first = transfer_entry("tnt_test1", "a", "b", 1_000, Some("idem-expiring"));
        let committed_first = store
            .commit_entry(first, RetryPolicy::default(), None)
            .await
            .expect("first commit");

        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = transfer_entry("tnt_test1", "a", "b", 1_000, Some("idem-expiring"));
        let committed_second = store
            .commit_entry(second, RetryPolicy::default(), None)
            .await
            .expect("second commit after expiry");

        assert_ne!(committed_first.id, committed_second.id);
        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 8_000);
    }

    #[tokio::test]
    async fn reverse_entry_flips_postings_and_marks_original_reversed() {
        let store = seeded_store().await;
        let entry = transfer_entry("tnt_test1", "a", "b", 2_500, None);
        let committed = store
            .commit_entry(entry, RetryPolicy::default(), None)
            .await
            .expect("commit");

        let reversal = store
            .reverse_entry(&committed.id, "rev-1".to_string(), RetryPolicy::default(), None)
            .await
            .expect("reverse");

        assert_eq!(reversal.reverses_entry_id.as_deref(), Some(committed.id.as_str()));
        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 10_000);
        assert_eq!(store.get_account(&"b".to_string()).await.unwrap().balance_minor, 0);

        let original = store.get_entry(&committed.id).await.expect("fetch original");
        assert_eq!(original.status, EntryStatus::Reversed);
        assert_eq!(original.reversed_by_entry_id.as_deref(), Some(reversal.id.as_str()));
    }

    #[tokio::test]
    async fn reversing_an_already_reversed_entry_fails() {
        let store = seeded_store().await;
        let entry = transfer_entry("tnt_test1", "a", "b", 1_000, None);
        let committed = store
            .commit_entry(entry, RetryPolicy::default(), None)
            .await
            .expect("commit");
        store
            .reverse_entry(&committed.id, "rev-1".to_string(), RetryPolicy::default(), None)
            .await
            .expect("first reversal");

        let err = store
            .reverse_entry(&committed.id, "rev-2".to_string(), RetryPolicy::default(), None)
            .await
            .expect_err("second reversal must fail");
        assert!(matches!(err, StoreError::Ledger(LedgerError::Validation(_))));
    }
}

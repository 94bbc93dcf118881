#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The idempotent fast-path transfer: the hot path of the whole system.
//! `FastTransferService` builds the canonical two-posting journal entry
//! spec.md's design notes recommend, gates it on the caller's idempotency
//! key, posts it through the same `PostingEngine`/`LedgerStore` path as any
//! other entry, and fans it out through the outbox and realtime publisher
//! in the same commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::Account;
use ledger_core::AccountId;
use ledger_core::Currency;
use ledger_core::EntryOrigin;
use ledger_core::EntryStatus;
use ledger_core::JournalEntry;
use ledger_core::JournalEntryId;
use ledger_core::Posting;
use ledger_core::PostingSide;
use ledger_outbox::OutboxPublisher;
use ledger_realtime::RealtimePublisher;
use ledger_store::CommitHook;
use ledger_store::LedgerStore;
use ledger_store::RetryPolicy;
use ledger_store::StoreError;
use ledger_tenancy::TenancyError;
use ledger_tenancy::TenantContext;
use thiserror::Error;
use uuid::Uuid;

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
    #[error("transfer could not be committed after retries: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `amount_minor` must fall within this inclusive range (§4.4 step 1).
pub const MAX_TRANSFER_AMOUNT_MINOR: i64 = 1_000_000_000;
/// Idempotency keys longer than this are rejected outright.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct FastTransferRequest {
    pub idempotency_key: String,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount_minor: i64,
    pub currency: Currency,
    pub narration: String,
}

fn validate_narration(narration: &str) -> TransferResult<()> {
    let ok = !narration.is_empty()
        && narration.len() <= 200
        && narration
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | ',' | '-' | '_' | ':' | '/' | '\''));
    if ok {
        Ok(())
    } else {
        Err(TransferError::Validation(format!(
            "narration must be non-empty, at most 200 characters, and use only letters, digits, and . , - _ : / ' space: {narration:?}"
        )))
    }
}

/// Composes the outbox and realtime hooks so both fire from the single
/// `LedgerStore::commit_entry` call backing a fast transfer.
pub struct CompositeHook {
    outbox: Arc<OutboxPublisher>,
    realtime: Arc<RealtimePublisher>,
}

impl CompositeHook {
    pub fn new(outbox: Arc<OutboxPublisher>, realtime: Arc<RealtimePublisher>) -> Self {
        Self { outbox, realtime }
    }
}

#[async_trait]
impl CommitHook for CompositeHook {
    async fn on_commit(&self, entry: &JournalEntry, touched_accounts: &HashMap<AccountId, Account>) {
        self.outbox.on_commit(entry, touched_accounts).await;
        self.realtime.on_commit(entry, touched_accounts).await;
    }
}

pub struct FastTransferService {
    store: Arc<dyn LedgerStore>,
    hook: Arc<dyn CommitHook>,
    retry_policy: RetryPolicy,
}

impl FastTransferService {
    pub fn new(store: Arc<dyn LedgerStore>, hook: Arc<dyn CommitHook>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            hook,
            retry_policy,
        }
    }

    /// An account referenced for the first time is created on the spot
    /// rather than rejected, per the "created on first reference" account
    /// lifecycle rule. Races against a concurrent first reference are
    /// resolved by re-reading the account the other caller just inserted.
    async fn get_or_create_account(
        &self,
        account_id: &AccountId,
        tenant_id: &str,
        currency: &Currency,
    ) -> TransferResult<Account> {
        match self.store.get_account(account_id).await {
            Ok(account) => Ok(account),
            Err(StoreError::Ledger(ledger_core::LedgerError::NotFound(_))) => {
                let fresh = Account::new(account_id.clone(), tenant_id.to_string(), currency.clone())
                    .map_err(|err| TransferError::Validation(err.to_string()))?;
                match self.store.create_account(fresh).await {
                    Ok(account) => Ok(account),
                    Err(StoreError::AccountExists(_)) => Ok(self.store.get_account(account_id).await?),
                    Err(other) => Err(TransferError::Store(other)),
                }
            }
            Err(other) => Err(TransferError::Store(other)),
        }
    }

    pub async fn execute(
        &self,
        tenant: &TenantContext,
        request: FastTransferRequest,
    ) -> TransferResult<JournalEntry> {
        if request.from_account == request.to_account {
            return Err(TransferError::Validation(
                "from_account and to_account must differ".into(),
            ));
        }
        if request.amount_minor < 1 || request.amount_minor > MAX_TRANSFER_AMOUNT_MINOR {
            return Err(TransferError::Validation(format!(
                "amount_minor must be between 1 and {MAX_TRANSFER_AMOUNT_MINOR}"
            )));
        }
        if request.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(TransferError::Validation(format!(
                "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        validate_narration(&request.narration)?;

        let from = self
            .get_or_create_account(&request.from_account, &tenant.tenant_id, &request.currency)
            .await?;
        let to = self
            .get_or_create_account(&request.to_account, &tenant.tenant_id, &request.currency)
            .await?;
        tenant.assert_owns(&from.id, &from.tenant_id)?;
        tenant.assert_owns(&to.id, &to.tenant_id)?;

        let entry = JournalEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.tenant_id.clone(),
            postings: vec![
                Posting::new(request.from_account, PostingSide::Debit, request.amount_minor, request.currency.clone()),
                Posting::new(request.to_account, PostingSide::Credit, request.amount_minor, request.currency),
            ],
            origin: EntryOrigin::FastTransfer,
            status: EntryStatus::Posted,
            memo: Some(request.narration),
            idempotency_key: Some(request.idempotency_key),
            created_at: chrono::Utc::now(),
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        };

        self.store
            .commit_entry(entry, self.retry_policy, Some(self.hook.as_ref()))
            .await
            .map_err(|err| match err {
                StoreError::Conflict(attempts) => {
                    TransferError::Conflict(format!("exhausted {attempts} retries"))
                }
                other => TransferError::Store(other),
            })
    }

    /// Reverses an already-posted entry, checking the caller owns the
    /// tenant the original entry belongs to before touching the store.
    pub async fn reverse(
        &self,
        tenant: &TenantContext,
        entry_id: &JournalEntryId,
    ) -> TransferResult<JournalEntry> {
        let original = self.store.get_entry(entry_id).await?;
        if original.tenant_id != tenant.tenant_id {
            return Err(TransferError::Validation(format!(
                "entry {entry_id} does not belong to tenant {}",
                tenant.tenant_id
            )));
        }

        let new_entry_id = Uuid::new_v4().to_string();
        self.store
            .reverse_entry(entry_id, new_entry_id, self.retry_policy, Some(self.hook.as_ref()))
            .await
            .map_err(|err| match err {
                StoreError::Conflict(attempts) => {
                    TransferError::Conflict(format!("exhausted {attempts} retries"))
                }
                other => TransferError::Store(other),
            })
    }
}

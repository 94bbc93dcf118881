#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Value model and posting engine for the ledger core.
//!
//! Money moves only through balanced [`JournalEntry`] values: every entry's
//! [`Posting`] lines must sum to zero per currency before [`PostingEngine`]
//! will apply them to account balances. Account balances here are
//! liability-style: a `Credit` increases the balance, a `Debit` decreases
//! it, matching the dominant account type in this system: a
//! customer's e-money wallet is a liability the operator owes the customer.

use std::collections::HashMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type AccountId = String;
pub type TenantId = String;
pub type JournalEntryId = String;
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("insufficient funds in account {account_id}: balance {balance_minor}, requested {requested_minor}")]
    InsufficientFunds {
        account_id: AccountId,
        balance_minor: i64,
        requested_minor: i64,
    },
    #[error("currency mismatch: account {account_id} holds {account_currency} but posting used {posting_currency}")]
    CurrencyMismatch {
        account_id: AccountId,
        account_currency: String,
        posting_currency: String,
    },
    #[error("tenant isolation violation: account {account_id} does not belong to tenant {tenant_id}")]
    TenantIsolationViolation {
        tenant_id: TenantId,
        account_id: AccountId,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

/// An account id is opaque to the ledger beyond its shape: letters, digits,
/// `_`, `:`, `-`, 1 to 50 characters.
pub fn validate_account_id(id: &str) -> LedgerResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 50
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid account id: {id}")))
    }
}

/// A tenant id carries the literal `tnt_` prefix followed by 4 to 46
/// characters of letters, digits, `_`, or `-`.
pub fn validate_tenant_id(id: &str) -> LedgerResult<()> {
    let Some(rest) = id.strip_prefix("tnt_") else {
        return Err(LedgerError::Validation(format!("invalid tenant id: {id}")));
    };
    let ok = rest.len() >= 4
        && rest.len() <= 46
        && rest.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid tenant id: {id}")))
    }
}

/// Pure format check for a currency code: three uppercase ASCII letters.
/// Whether the code is one this deployment actually accepts is a
/// configuration concern handled above this crate (`SUPPORTED_CURRENCIES`).
pub fn validate_currency_code(code: &str) -> LedgerResult<()> {
    if code.len() == 3 && code.chars().all(|ch| ch.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid currency code: {code}")))
    }
}

/// An ISO-4217-shaped currency code together with its minor-unit precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub precision: u8,
}

impl Currency {
    pub fn new(code: impl Into<String>, precision: u8) -> LedgerResult<Self> {
        let code = code.into();
        validate_currency_code(&code)?;
        Ok(Self { code, precision })
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// An integer minor-unit amount in a specific currency. Never a float.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Money {
    /// Takes an already-validated [`Currency`]; there is nothing left for
    /// `Money` itself to reject.
    pub fn new(amount_minor: i64, currency: Currency) -> Self {
        Self {
            amount_minor,
            currency,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount_minor == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingSide {
    Debit,
    Credit,
}

impl PostingSide {
    fn signed_delta(self, amount_minor: i64) -> i64 {
        match self {
            PostingSide::Debit => -amount_minor,
            PostingSide::Credit => amount_minor,
        }
    }

}

/// One line of a [`JournalEntry`]: a single debit or credit against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub account_id: AccountId,
    pub side: PostingSide,
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Posting {
    pub fn new(
        account_id: impl Into<AccountId>,
        side: PostingSide,
        amount_minor: i64,
        currency: Currency,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            side,
            amount_minor,
            currency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Posted,
    Reversed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOrigin {
    FastTransfer,
    OfflineSync,
    DriftCompensation,
    Adjustment,
}

/// A balanced group of postings applied to the ledger atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub tenant_id: TenantId,
    pub postings: Vec<Posting>,
    pub origin: EntryOrigin,
    pub status: EntryStatus,
    pub memo: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reverses_entry_id: Option<JournalEntryId>,
    pub reversed_by_entry_id: Option<JournalEntryId>,
}

impl JournalEntry {
    /// `Σ debits == Σ credits`, computed per currency, over this entry's lines.
    pub fn is_balanced(&self) -> bool {
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for posting in &self.postings {
            *totals.entry(posting.currency.code.as_str()).or_insert(0) +=
                posting.side.signed_delta(posting.amount_minor);
        }
        totals.values().all(|total| *total == 0)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.postings.is_empty() {
            return Err(LedgerError::Validation(
                "journal entry must contain at least one posting".into(),
            ));
        }
        if self.postings.iter().any(|p| p.amount_minor <= 0) {
            return Err(LedgerError::Validation(
                "posting amounts must be positive minor-unit integers".into(),
            ));
        }
        if !self.is_balanced() {
            return Err(LedgerError::Validation(
                "journal entry must balance per currency".into(),
            ));
        }
        Ok(())
    }

    /// Builds the reversing entry: sides flipped, linked back to the original.
    pub fn build_reversal(&self, new_id: impl Into<JournalEntryId>) -> LedgerResult<JournalEntry> {
        if self.status != EntryStatus::Posted {
            return Err(LedgerError::Validation(
                "only a posted entry can be reversed".into(),
            ));
        }
        if self.reversed_by_entry_id.is_some() {
            return Err(LedgerError::Validation(
                "entry has already been reversed".into(),
            ));
        }
        let new_id = new_id.into();
        let reversed_lines = self
            .postings
            .iter()
            .map(|p| Posting {
                id: format!("{}-rev", p.id),
                account_id: p.account_id.clone(),
                side: match p.side {
                    PostingSide::Debit => PostingSide::Credit,
                    PostingSide::Credit => PostingSide::Debit,
                },
                amount_minor: p.amount_minor,
                currency: p.currency.clone(),
            })
            .collect();
        Ok(JournalEntry {
            id: new_id,
            tenant_id: self.tenant_id.clone(),
            postings: reversed_lines,
            origin: EntryOrigin::Adjustment,
            status: EntryStatus::Posted,
            memo: Some(format!("reversal of {}", self.id)),
            idempotency_key: None,
            created_at: self.created_at,
            reverses_entry_id: Some(self.id.clone()),
            reversed_by_entry_id: None,
        })
    }
}

/// A ledger account. Its currency is fixed at creation and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tenant_id: TenantId,
    pub currency: Currency,
    pub balance_minor: i64,
    pub is_suspense: bool,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, tenant_id: impl Into<TenantId>, currency: Currency) -> LedgerResult<Self> {
        let id = id.into();
        let tenant_id = tenant_id.into();
        validate_account_id(&id)?;
        validate_tenant_id(&tenant_id)?;
        Ok(Self {
            id,
            tenant_id,
            currency,
            balance_minor: 0,
            is_suspense: false,
        })
    }

    fn check_posting_currency(&self, posting: &Posting) -> LedgerResult<()> {
        if posting.currency != self.currency {
            return Err(LedgerError::CurrencyMismatch {
                account_id: self.id.clone(),
                account_currency: self.currency.code.clone(),
                posting_currency: posting.currency.code.clone(),
            });
        }
        Ok(())
    }

    fn projected_balance(&self, posting: &Posting) -> i64 {
        self.balance_minor + posting.side.signed_delta(posting.amount_minor)
    }
}

/// Pure domain logic for validating and applying balanced journal entries to
/// an in-memory map of account balances. Holds no state itself; the
/// transactional guarantees (serializable isolation, retry, locking order)
/// live in `ledger-store`.
#[derive(Debug, Default)]
pub struct PostingEngine;

impl PostingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Validates `entry` against the given accounts (currency match,
    /// sufficient funds for debits on non-suspense accounts) without
    /// mutating anything. Suspense accounts are permitted to go negative,
    /// since they exist to absorb compensating transfers (C7).
    pub fn validate_against_accounts(
        &self,
        entry: &JournalEntry,
        accounts: &HashMap<AccountId, Account>,
    ) -> LedgerResult<()> {
        entry.validate()?;
        for posting in &entry.postings {
            let account = accounts
                .get(&posting.account_id)
                .ok_or_else(|| LedgerError::NotFound(format!("account {}", posting.account_id)))?;
            if account.tenant_id != entry.tenant_id {
                return Err(LedgerError::TenantIsolationViolation {
                    tenant_id: entry.tenant_id.clone(),
                    account_id: account.id.clone(),
                });
            }
            account.check_posting_currency(posting)?;
            if posting.side == PostingSide::Debit && !account.is_suspense {
                let projected = account.projected_balance(posting);
                if projected < 0 {
                    return Err(LedgerError::InsufficientFunds {
                        account_id: account.id.clone(),
                        balance_minor: account.balance_minor,
                        requested_minor: posting.amount_minor,
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies `entry`'s postings to `accounts` in place. Caller must have
    /// already validated the entry; this never rejects based on balance.
    pub fn apply(&self, entry: &JournalEntry, accounts: &mut HashMap<AccountId, Account>) {
        for posting in &entry.postings {
            if let Some(account) = accounts.get_mut(&posting.account_id) {
                account.balance_minor += posting.side.signed_delta(posting.amount_minor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn usd() -> Currency {
        Currency::new("USD", 2).expect("valid currency")
    }

    fn entry(tenant: &str, postings: Vec<Posting>) -> JournalEntry {
        JournalEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.into(),
            postings,
            origin: EntryOrigin::FastTransfer,
            status: EntryStatus::Posted,
            memo: None,
            idempotency_key: None,
            created_at: Utc::now(),
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        }
    }

    #[test]
    fn balanced_entry_accepted() {
        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 2_500, usd()),
                Posting::new("b", PostingSide::Credit, 2_500, usd()),
            ],
        );
        assert!(e.is_balanced());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn unbalanced_entry_rejected() {
        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 2_500, usd()),
                Posting::new("b", PostingSide::Credit, 2_000, usd()),
            ],
        );
        assert!(!e.is_balanced());
        assert!(e.validate().is_err());
    }

    #[test]
    fn posting_engine_rejects_insufficient_funds() {
        let engine = PostingEngine::new();
        let mut accounts = HashMap::new();
        accounts.insert("a".to_string(), Account::new("a", "tnt_test1", usd()).expect("valid account"));
        accounts.insert("b".to_string(), Account::new("b", "tnt_test1", usd()).expect("valid account"));

        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 2_500, usd()),
                Posting::new("b", PostingSide::Credit, 2_500, usd()),
            ],
        );

        let err = engine
            .validate_against_accounts(&e, &accounts)
            .expect_err("should fail on insufficient funds");
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    }

    #[test]
    fn posting_engine_applies_balanced_transfer() {
        let engine = PostingEngine::new();
        let mut accounts = HashMap::new();
        let mut a = Account::new("a", "tnt_test1", usd()).expect("valid account");
        a.balance_minor = 10_000;
        accounts.insert("a".to_string(), a);
        accounts.insert("b".to_string(), Account::new("b", "tnt_test1", usd()).expect("valid account"));

        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 2_500, usd()),
                Posting::new("b", PostingSide::Credit, 2_500, usd()),
            ],
        );

        engine.validate_against_accounts(&e, &accounts).expect("valid");
        engine.apply(&e, &mut accounts);

        assert_eq!(accounts["a"].balance_minor, 7_500);
        assert_eq!(accounts["b"].balance_minor, 2_500);
    }

    #[test]
    fn suspense_account_may_go_negative() {
        let engine = PostingEngine::new();
        let mut accounts = HashMap::new();
        let mut suspense = Account::new("suspense", "tnt_test1", usd()).expect("valid account");
        suspense.is_suspense = true;
        accounts.insert("suspense".to_string(), suspense);
        accounts.insert("b".to_string(), Account::new("b", "tnt_test1", usd()).expect("valid account"));

        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("suspense", PostingSide::Debit, 500, usd()),
                Posting::new("b", PostingSide::Credit, 500, usd()),
            ],
        );

        engine.validate_against_accounts(&e, &accounts).expect("suspense allows deficit");
        engine.apply(&e, &mut accounts);
        assert_eq!(accounts["suspense"].balance_minor, -500);
    }

    #[test]
    fn cross_tenant_posting_is_rejected() {
        let engine = PostingEngine::new();
        let mut accounts = HashMap::new();
        accounts.insert("a".to_string(), Account::new("a", "tnt_other1", usd()).expect("valid account"));
        accounts.insert("b".to_string(), Account::new("b", "tnt_test1", usd()).expect("valid account"));

        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 100, usd()),
                Posting::new("b", PostingSide::Credit, 100, usd()),
            ],
        );

        let err = engine
            .validate_against_accounts(&e, &accounts)
            .expect_err("cross tenant posting must fail");
        assert!(matches!(err, LedgerError::TenantIsolationViolation { .. }));
    }

    #[test]
    fn reversal_flips_sides_and_links_back() {
        let e = entry(
            "tnt_test1",
            vec![
                Posting::new("a", PostingSide::Debit, 500, usd()),
                Posting::new("b", PostingSide::Credit, 500, usd()),
            ],
        );
        let reversal = e.build_reversal("rev-1").expect("builds reversal");
        assert_eq!(reversal.reverses_entry_id.as_deref(), Some(e.id.as_str()));
        assert_eq!(reversal.postings[0].side, PostingSide::Credit);
        assert_eq!(reversal.postings[1].side, PostingSide::Debit);
    }
}

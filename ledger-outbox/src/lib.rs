#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Transactional outbox: a committed `JournalEntry` fans out one balance
//! event per distinct account it touched, appended to that account's
//! `acct::{account_id}` partition in the same logical transaction as the
//! posting (see `ledger_store::CommitHook`). Delivery is at-least-once and
//! ordered within a partition, never globally ordered.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use ledger_core::Account;
use ledger_core::AccountId;
use ledger_core::JournalEntry;
use ledger_core::TenantId;
use ledger_store::CommitHook;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn account_topic(account_id: &AccountId) -> String {
    format!("acct::{account_id}")
}

/// One fact published after a committed posting: account `account_id`'s
/// balance changed to `balance_minor` as of journal entry `entry_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEventPayload {
    pub account_id: AccountId,
    pub tenant_id: TenantId,
    pub entry_id: String,
    pub balance_minor: i64,
    pub delta_minor: i64,
    pub origin_region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub topic: String,
    pub sequence: u64,
    pub payload: BalanceEventPayload,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, topic: String, payload: BalanceEventPayload) -> OutboxResult<OutboxMessage>;

    /// Messages in `topic` with `sequence > cursor`, oldest first, capped at
    /// `limit`. This is the read side of at-least-once, in-partition-ordered
    /// delivery: callers track their own cursor and never see a gap.
    async fn list_since(&self, topic: &str, cursor: u64, limit: usize) -> OutboxResult<Vec<OutboxMessage>>;

    async fn mark_delivered(&self, id: &str) -> OutboxResult<()>;
}

#[derive(Default)]
struct Partition {
    messages: Vec<OutboxMessage>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, topic: String, payload: BalanceEventPayload) -> OutboxResult<OutboxMessage> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(topic.clone()).or_default();
        partition.next_sequence += 1;
        let message = OutboxMessage {
            id: Uuid::new_v4().to_string(),
            topic,
            sequence: partition.next_sequence,
            payload,
            created_at: Utc::now(),
            delivered: false,
        };
        partition.messages.push(message.clone());
        Ok(message)
    }

    async fn list_since(&self, topic: &str, cursor: u64, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .messages
            .iter()
            .filter(|m| m.sequence > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: &str) -> OutboxResult<()> {
        let mut partitions = self.partitions.write().await;
        for partition in partitions.values_mut() {
            if let Some(message) = partition.messages.iter_mut().find(|m| m.id == id) {
                message.delivered = true;
                return Ok(());
            }
        }
        Err(OutboxError::NotFound(format!("outbox message {id}")))
    }
}

#[cfg(feature = "postgres-store")]
pub struct PostgresOutboxStore;

#[cfg(feature = "postgres-store")]
#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, _topic: String, _payload: BalanceEventPayload) -> OutboxResult<OutboxMessage> {
        Err(OutboxError::Internal("postgres-store not yet implemented".into()))
    }

    async fn list_since(&self, _topic: &str, _cursor: u64, _limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        Err(OutboxError::Internal("postgres-store not yet implemented".into()))
    }

    async fn mark_delivered(&self, _id: &str) -> OutboxResult<()> {
        Err(OutboxError::Internal("postgres-store not yet implemented".into()))
    }
}

/// Bridges a committed journal entry to outbox messages. Implements
/// `ledger_store::CommitHook` so `LedgerStore::commit_entry` can invoke it
/// while the entry's account locks are still held.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    origin_region: String,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, origin_region: impl Into<String>) -> Self {
        Self {
            store,
            origin_region: origin_region.into(),
        }
    }

    async fn publish_for_accounts(&self, entry: &JournalEntry, accounts: &HashMap<AccountId, Account>) {
        let touched: HashSet<&AccountId> = entry.postings.iter().map(|p| &p.account_id).collect();
        for account_id in touched {
            let Some(account) = accounts.get(account_id) else {
                warn!(account_id, "outbox publish skipped: account not in snapshot");
                continue;
            };
            let delta_minor: i64 = entry
                .postings
                .iter()
                .filter(|p| &p.account_id == account_id)
                .map(|p| match p.side {
                    ledger_core::PostingSide::Debit => -p.amount_minor,
                    ledger_core::PostingSide::Credit => p.amount_minor,
                })
                .sum();
            let payload = BalanceEventPayload {
                account_id: account_id.clone(),
                tenant_id: account.tenant_id.clone(),
                entry_id: entry.id.clone(),
                balance_minor: account.balance_minor,
                delta_minor,
                origin_region: self.origin_region.clone(),
            };
            if let Err(err) = self.store.append(account_topic(account_id), payload).await {
                warn!(account_id, error = %err, "failed to append outbox message");
            }
        }
    }
}

#[async_trait]
impl CommitHook for OutboxPublisher {
    async fn on_commit(&self, entry: &JournalEntry, touched_accounts: &HashMap<AccountId, Account>) {
        self.publish_for_accounts(entry, touched_accounts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Currency;
    use ledger_core::EntryOrigin;
    use ledger_core::EntryStatus;
    use ledger_core::Posting;
    use ledger_core::PostingSide;
    use pretty_assertions::assert_eq;

    fn usd() -> Currency {
        Currency::new("USD", 2).expect("valid currency")
    }

    #[tokio::test]
    async fn append_and_list_preserves_partition_order() {
        let store = InMemoryOutboxStore::new();
        let topic = account_topic(&"acc-1".to_string());
        for i in 1..=3 {
            store
                .append(
                    topic.clone(),
                    BalanceEventPayload {
                        account_id: "acc-1".into(),
                        tenant_id: "tnt_test1".into(),
                        entry_id: format!("e{i}"),
                        balance_minor: i * 100,
                        delta_minor: 100,
                        origin_region: "eu-west".into(),
                    },
                )
                .await
                .expect("append");
        }

        let messages = store.list_since(&topic, 0, 10).await.expect("list");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[2].sequence, 3);

        let since_one = store.list_since(&topic, 1, 10).await.expect("list since 1");
        assert_eq!(since_one.len(), 2);
    }

    #[tokio::test]
    async fn commit_hook_publishes_one_event_per_touched_account() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = OutboxPublisher::new(store.clone(), "eu-west");

        let entry = JournalEntry {
            id: "e1".into(),
            tenant_id: "tnt_test1".into(),
            postings: vec![
                Posting::new("a", PostingSide::Debit, 500, usd()),
                Posting::new("b", PostingSide::Credit, 500, usd()),
            ],
            origin: EntryOrigin::FastTransfer,
            status: EntryStatus::Posted,
            memo: None,
            idempotency_key: None,
            created_at: Utc::now(),
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        };

        let mut accounts: HashMap<AccountId, Account> = HashMap::new();
        accounts.insert("a".into(), Account { balance_minor: -500, ..Account::new("a", "tnt_test1", usd()).expect("valid account") });
        accounts.insert("b".into(), Account { balance_minor: 500, ..Account::new("b", "tnt_test1", usd()).expect("valid account") });
        publisher.on_commit(&entry, &accounts).await;

        let a_events = store.list_since(&account_topic(&"a".to_string()), 0, 10).await.unwrap();
        let b_events = store.list_since(&account_topic(&"b".to_string()), 0, 10).await.unwrap();
        assert_eq!(a_events.len(), 1);
        assert_eq!(b_events.len(), 1);
        assert_eq!(a_events[0].payload.delta_minor, -500);
        assert_eq!(b_events[0].payload.delta_minor, 500);
        assert_eq!(a_events[0].payload.origin_region, "eu-west");
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Realtime balance fan-out. A client subscribes to `acct::{account_id}`
//! and gets a channel of future balance updates plus the current balance
//! to seed its own state. There is no durable per-client queue: a
//! subscriber that disconnects and reconnects simply rehydrates from the
//! store and resumes listening, it does not replay what it missed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::Account;
use ledger_core::AccountId;
use ledger_core::JournalEntry;
use ledger_store::CommitHook;
use ledger_store::LedgerStore;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

pub type RealtimeResult<T> = Result<T, RealtimeError>;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] ledger_store::StoreError),
}

fn topic_for(account_id: &AccountId) -> String {
    format!("acct::{account_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub account_id: AccountId,
    pub entry_id: String,
    pub balance_minor: i64,
}

/// Everything a fresh subscriber needs: the balance as of subscription
/// time, plus the channel future updates will arrive on.
pub struct Subscription {
    pub initial_balance_minor: i64,
    pub receiver: broadcast::Receiver<BalanceUpdate>,
}

pub struct RealtimePublisher {
    store: Arc<dyn LedgerStore>,
    channels: RwLock<HashMap<String, broadcast::Sender<BalanceUpdate>>>,
}

impl RealtimePublisher {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<BalanceUpdate> {
        if let Some(sender) = self.channels.read().await.get(topic) {
            return sender.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Rehydrates the current balance from the store and hands back a
    /// receiver for subsequent updates. A subscriber that drops this
    /// receiver and reconnects later simply calls `subscribe` again; it
    /// never gets a backlog replay.
    pub async fn subscribe(&self, account_id: &AccountId) -> RealtimeResult<Subscription> {
        let account = self.store.get_account(account_id).await?;
        let topic = topic_for(account_id);
        let sender = self.sender_for(&topic).await;
        Ok(Subscription {
            initial_balance_minor: account.balance_minor,
            receiver: sender.subscribe(),
        })
    }
}

#[async_trait]
impl CommitHook for RealtimePublisher {
    async fn on_commit(&self, entry: &JournalEntry, touched_accounts: &HashMap<AccountId, Account>) {
        let mut touched: Vec<&AccountId> = entry.postings.iter().map(|p| &p.account_id).collect();
        touched.sort();
        touched.dedup();
        for account_id in touched {
            let Some(account) = touched_accounts.get(account_id) else {
                warn!(account_id, "realtime publish skipped: account not in snapshot");
                continue;
            };
            let topic = topic_for(account_id);
            // Only publish if a channel already exists: creating one here
            // for an account nobody subscribed to would leak a sender
            // forever, since nothing would ever drop it.
            if let Some(sender) = self.channels.read().await.get(&topic) {
                let _ = sender.send(BalanceUpdate {
                    account_id: account_id.clone(),
                    entry_id: entry.id.clone(),
                    balance_minor: account.balance_minor,
                });
            }
        }
    }
}

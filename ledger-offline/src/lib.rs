#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The offline device operation queue: a device signs operations locally
//! while disconnected, then submits a batch for verification and
//! at-most-once application once it reconnects. Replays are rejected by
//! nonce, not by re-checking application state, so a device can safely
//! resubmit the same batch after a dropped connection.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use ledger_core::Currency;
use ledger_core::EntryOrigin;
use ledger_core::EntryStatus;
use ledger_core::JournalEntry;
use ledger_core::Posting;
use ledger_core::PostingSide;
use ledger_store::LedgerStore;
use ledger_store::RetryPolicy;
use ledger_tenancy::TenantContext;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub type DeviceId = String;
pub type OfflineResult<T> = Result<T, OfflineError>;

/// A single `sync_device` call processes at most this many queued
/// operations, regardless of what the caller asks for.
pub const MAX_SYNC_BATCH: usize = 50;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("signature verification failed for device {0}")]
    SignatureInvalid(DeviceId),
    #[error("nonce {nonce} already used by device {device_id}")]
    ReplayedNonce { device_id: DeviceId, nonce: String },
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] ledger_store::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfflineOperationStatus {
    Pending,
    Applied,
    Rejected,
}

/// An operation as submitted by a device: everything needed to verify its
/// HMAC signature and, once verified, build a two-leg transfer from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedOperation {
    pub device_id: DeviceId,
    pub tenant_id: String,
    pub nonce: String,
    pub signature_hex: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub client_recorded_at: DateTime<Utc>,
}

impl SubmittedOperation {
    /// `device_id ‖ canonical(payload) ‖ nonce ‖ tenant_id`, the exact tuple
    /// the signature must cover so a signed op can't be replayed against a
    /// different tenant.
    pub fn canonical_message(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.device_id, self.from_account, self.to_account, self.amount_minor, self.currency.code, self.nonce, self.tenant_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: String,
    pub device_id: DeviceId,
    pub tenant_id: String,
    pub nonce: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub client_recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status: OfflineOperationStatus,
    pub applied_entry_id: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OfflineOperationFilter {
    pub device_id: Option<DeviceId>,
    pub status: Option<OfflineOperationStatus>,
}

/// Per-device HMAC signing keys. A device's key is provisioned out of band
/// at enrollment time; this crate only ever verifies, never issues, keys.
#[async_trait]
pub trait DeviceKeyStore: Send + Sync {
    async fn key_for_device(&self, device_id: &DeviceId) -> Option<Vec<u8>>;
}

#[derive(Default)]
pub struct InMemoryDeviceKeyStore {
    keys: RwLock<HashMap<DeviceId, Vec<u8>>>,
}

impl InMemoryDeviceKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn provision(&self, device_id: impl Into<DeviceId>, key: Vec<u8>) {
        self.keys.write().await.insert(device_id.into(), key);
    }
}

#[async_trait]
impl DeviceKeyStore for InMemoryDeviceKeyStore {
    async fn key_for_device(&self, device_id: &DeviceId) -> Option<Vec<u8>> {
        self.keys.read().await.get(device_id).cloned()
    }
}

fn verify_signature(key: &[u8], message: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex_decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

fn hex_decode(value: &str) -> Result<Vec<u8>, ()> {
    if value.len() % 2 != 0 {
        return Err(());
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

struct DeviceState {
    seen_nonces: HashSet<String>,
    pending: Vec<OfflineOperation>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            seen_nonces: HashSet::new(),
            pending: Vec::new(),
        }
    }
}

/// The offline queue itself. Sync is serialized per device: `sync_device`
/// applies one device's pending operations strictly in submission order,
/// one at a time, so a device's own operations never race each other even
/// if two requests for the same device land concurrently.
pub struct OfflineQueue {
    key_store: Arc<dyn DeviceKeyStore>,
    store: Arc<dyn LedgerStore>,
    devices: RwLock<HashMap<DeviceId, DeviceState>>,
    all_ops: RwLock<HashMap<String, OfflineOperation>>,
    sync_locks: RwLock<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OfflineQueue {
    pub fn new(key_store: Arc<dyn DeviceKeyStore>, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            key_store,
            store,
            devices: RwLock::new(HashMap::new()),
            all_ops: RwLock::new(HashMap::new()),
            sync_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn sync_lock_for(&self, device_id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.sync_locks.write().await;
        locks
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Verifies signature and nonce, then queues the operation as `Pending`.
    /// Does not touch the ledger: application happens in `sync_device`.
    pub async fn enqueue(&self, submission: SubmittedOperation) -> OfflineResult<OfflineOperation> {
        if submission.amount_minor <= 0 {
            return Err(OfflineError::Validation(
                "amount_minor must be positive".into(),
            ));
        }
        let key = self
            .key_store
            .key_for_device(&submission.device_id)
            .await
            .ok_or_else(|| OfflineError::UnknownDevice(submission.device_id.clone()))?;

        if !verify_signature(&key, &submission.canonical_message(), &submission.signature_hex) {
            return Err(OfflineError::SignatureInvalid(submission.device_id.clone()));
        }

        let mut devices = self.devices.write().await;
        let state = devices.entry(submission.device_id.clone()).or_default();
        if !state.seen_nonces.insert(submission.nonce.clone()) {
            return Err(OfflineError::ReplayedNonce {
                device_id: submission.device_id.clone(),
                nonce: submission.nonce.clone(),
            });
        }

        let op = OfflineOperation {
            id: Uuid::new_v4().to_string(),
            device_id: submission.device_id.clone(),
            tenant_id: submission.tenant_id.clone(),
            nonce: submission.nonce.clone(),
            from_account: submission.from_account,
            to_account: submission.to_account,
            amount_minor: submission.amount_minor,
            currency: submission.currency,
            client_recorded_at: submission.client_recorded_at,
            received_at: Utc::now(),
            status: OfflineOperationStatus::Pending,
            applied_entry_id: None,
            rejection_reason: None,
        };
        state.pending.push(op.clone());
        self.all_ops.write().await.insert(op.id.clone(), op.clone());
        info!(device_id = %op.device_id, op_id = %op.id, "offline operation enqueued");
        Ok(op)
    }

    /// Applies up to `max` pending operations for `device_id`, oldest first.
    /// A transient store conflict leaves the operation `queued` for the next
    /// call; only a permanent validation or funds failure marks it
    /// `Rejected`. Operations left unprocessed by the `max` bound, and any
    /// left `queued` after a transient failure, stay at the front of the
    /// device's queue in their original order.
    pub async fn sync_device(
        &self,
        tenant: &TenantContext,
        device_id: &DeviceId,
        max: usize,
    ) -> OfflineResult<Vec<OfflineOperation>> {
        let max = max.clamp(1, MAX_SYNC_BATCH);
        let lock = self.sync_lock_for(device_id).await;
        let _guard = lock.lock().await;

        let batch = {
            let mut devices = self.devices.write().await;
            let Some(state) = devices.get_mut(device_id) else {
                return Ok(Vec::new());
            };
            let take = max.min(state.pending.len());
            state.pending.drain(0..take).collect::<Vec<_>>()
        };

        let mut results = Vec::with_capacity(batch.len());
        let mut requeue = Vec::new();
        for mut op in batch {
            if op.tenant_id != tenant.tenant_id {
                op.status = OfflineOperationStatus::Rejected;
                op.rejection_reason = Some("tenant isolation violation".into());
                warn!(op_id = %op.id, "offline op rejected: tenant mismatch");
                self.all_ops.write().await.insert(op.id.clone(), op.clone());
                results.push(op);
                continue;
            }

            let entry = JournalEntry {
                id: op.id.clone(),
                tenant_id: op.tenant_id.clone(),
                postings: vec![
                    Posting::new(op.from_account.clone(), PostingSide::Debit, op.amount_minor, op.currency.clone()),
                    Posting::new(op.to_account.clone(), PostingSide::Credit, op.amount_minor, op.currency.clone()),
                ],
                origin: EntryOrigin::OfflineSync,
                status: EntryStatus::Posted,
                memo: Some(format!("offline op {} from device {}", op.id, op.device_id)),
                idempotency_key: Some(format!("offline:{}:{}", op.device_id, op.nonce)),
                created_at: op.client_recorded_at,
                reverses_entry_id: None,
                reversed_by_entry_id: None,
            };
            match self.store.commit_entry(entry, RetryPolicy::default(), None).await {
                Ok(committed) => {
                    op.status = OfflineOperationStatus::Applied;
                    op.applied_entry_id = Some(committed.id);
                }
                Err(ledger_store::StoreError::Conflict(attempts)) => {
                    warn!(op_id = %op.id, attempts, "offline op hit a transient store conflict, leaving queued for retry");
                    self.all_ops.write().await.insert(op.id.clone(), op.clone());
                    results.push(op.clone());
                    requeue.push(op);
                    continue;
                }
                Err(err) => {
                    op.status = OfflineOperationStatus::Rejected;
                    op.rejection_reason = Some(err.to_string());
                    warn!(op_id = %op.id, error = %err, "offline op rejected by ledger");
                }
            }
            self.all_ops.write().await.insert(op.id.clone(), op.clone());
            results.push(op);
        }

        if !requeue.is_empty() {
            let mut devices = self.devices.write().await;
            if let Some(state) = devices.get_mut(device_id) {
                requeue.append(&mut state.pending);
                state.pending = requeue;
            }
        }
        Ok(results)
    }

    pub async fn list(&self, filter: OfflineOperationFilter) -> Vec<OfflineOperation> {
        let ops = self.all_ops.read().await;
        let mut out: Vec<OfflineOperation> = ops
            .values()
            .filter(|op| filter.device_id.as_ref().is_none_or(|d| d == &op.device_id))
            .filter(|op| filter.status.is_none_or(|s| s == op.status))
            .cloned()
            .collect();
        out.sort_by_key(|op| op.received_at);
        out
    }
}

pub fn sign_message(key: &[u8], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Account;
    use ledger_store::InMemoryLedgerStore;
    use pretty_assertions::assert_eq;

    fn usd() -> Currency {
        Currency::new("USD", 2).expect("valid currency")
    }

    async fn seeded() -> (OfflineQueue, Arc<InMemoryLedgerStore>, Vec<u8>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let mut a = Account::new("a", "tnt_test1", usd()).expect("valid account");
        a.balance_minor = 5_000;
        store.create_account(a).await.unwrap();
        store.create_account(Account::new("b", "tnt_test1", usd()).expect("valid account")).await.unwrap();

        let key_store = Arc::new(InMemoryDeviceKeyStore::new());
        let key = b"device-secret-key".to_vec();
        key_store.provision("dev-1", key.clone()).await;

        (OfflineQueue::new(key_store, store.clone()), store, key)
    }

    fn submission(key: &[u8], nonce: &str, amount: i64) -> SubmittedOperation {
        let op = SubmittedOperation {
            device_id: "dev-1".into(),
            tenant_id: "tnt_test1".into(),
            nonce: nonce.into(),
            signature_hex: String::new(),
            from_account: "a".into(),
            to_account: "b".into(),
            amount_minor: amount,
            currency: usd(),
            client_recorded_at: Utc::now(),
        };
        let signature_hex = sign_message(key, &op.canonical_message());
        SubmittedOperation { signature_hex, ..op }
    }

    #[tokio::test]
    async fn enqueue_and_sync_applies_operation() {
        let (queue, store, key) = seeded().await;
        let tenant = TenantContext::new("tnt_test1", "dev-1", ledger_tenancy::Role::DeviceAgent).expect("valid tenant");

        queue.enqueue(submission(&key, "nonce-1", 1_000)).await.expect("enqueue");
        let results = queue.sync_device(&tenant, &"dev-1".to_string(), 50).await.expect("sync");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, OfflineOperationStatus::Applied);
        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 4_000);
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected_at_enqueue() {
        let (queue, _store, key) = seeded().await;
        queue.enqueue(submission(&key, "nonce-1", 500)).await.expect("first enqueue");
        let err = queue
            .enqueue(submission(&key, "nonce-1", 500))
            .await
            .expect_err("replay must fail");
        assert!(matches!(err, OfflineError::ReplayedNonce { .. }));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (queue, _store, _key) = seeded().await;
        let mut op = submission(b"wrong-key", "nonce-x", 200);
        op.signature_hex = sign_message(b"wrong-key", &op.canonical_message());
        let err = queue.enqueue(op).await.expect_err("bad signature must fail");
        assert!(matches!(err, OfflineError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn resubmitting_same_batch_after_apply_is_idempotent_via_ledger_key() {
        let (queue, store, key) = seeded().await;
        let tenant = TenantContext::new("tnt_test1", "dev-1", ledger_tenancy::Role::DeviceAgent).expect("valid tenant");

        queue.enqueue(submission(&key, "nonce-9", 750)).await.expect("enqueue");
        queue.sync_device(&tenant, &"dev-1".to_string(), 50).await.expect("first sync");

        // A second physical device op with the same nonce is rejected before
        // it ever reaches the ledger, so the balance only moves once.
        let replay_err = queue.enqueue(submission(&key, "nonce-9", 750)).await;
        assert!(replay_err.is_err());
        assert_eq!(store.get_account(&"a".to_string()).await.unwrap().balance_minor, 4_250);
    }

    #[tokio::test]
    async fn sync_device_honors_the_per_call_max() {
        let (queue, _store, key) = seeded().await;
        let tenant = TenantContext::new("tnt_test1", "dev-1", ledger_tenancy::Role::DeviceAgent).expect("valid tenant");

        for (i, nonce) in ["nonce-a", "nonce-b", "nonce-c"].into_iter().enumerate() {
            queue.enqueue(submission(&key, nonce, 100 + i as i64)).await.expect("enqueue");
        }

        let first_batch = queue.sync_device(&tenant, &"dev-1".to_string(), 2).await.expect("sync");
        assert_eq!(first_batch.len(), 2);
        assert!(first_batch.iter().all(|op| op.status == OfflineOperationStatus::Applied));

        let remaining = queue
            .list(OfflineOperationFilter {
                device_id: Some("dev-1".into()),
                status: Some(OfflineOperationStatus::Pending),
            })
            .await;
        assert_eq!(remaining.len(), 1);

        let second_batch = queue.sync_device(&tenant, &"dev-1".to_string(), 2).await.expect("sync");
        assert_eq!(second_batch.len(), 1);
        assert_eq!(second_batch[0].status, OfflineOperationStatus::Applied);
    }

    #[tokio::test]
    async fn sync_device_clamps_max_above_the_hard_cap() {
        let (queue, _store, key) = seeded().await;
        let tenant = TenantContext::new("tnt_test1", "dev-1", ledger_tenancy::Role::DeviceAgent).expect("valid tenant");
        queue.enqueue(submission(&key, "nonce-cap", 100)).await.expect("enqueue");

        let results = queue.sync_device(&tenant, &"dev-1".to_string(), 10_000).await.expect("sync");
        assert_eq!(results.len(), 1);
    }
}

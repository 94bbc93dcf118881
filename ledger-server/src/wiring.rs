//! Builds the shared backend once at startup: the in-memory store, the
//! outbox and realtime publishers composed behind one `CommitHook`, the
//! fast-transfer service, the offline queue, and the drift healer. Both
//! the HTTP router and the CLI harness operate on the same `Backend`.

use std::sync::Arc;

use ledger_api::ApiState;
use ledger_heal::DriftHealer;
use ledger_offline::InMemoryDeviceKeyStore;
use ledger_offline::OfflineQueue;
use ledger_outbox::InMemoryOutboxStore;
use ledger_outbox::OutboxPublisher;
use ledger_outbox::OutboxStore;
use ledger_realtime::RealtimePublisher;
use ledger_store::InMemoryLedgerStore;
use ledger_store::LedgerStore;
use ledger_transfer::CompositeHook;
use ledger_transfer::FastTransferService;

use crate::config::LedgerConfig;

pub struct Backend {
    pub store: Arc<dyn LedgerStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub realtime: Arc<RealtimePublisher>,
    pub device_keys: Arc<InMemoryDeviceKeyStore>,
    pub offline: Arc<OfflineQueue>,
    pub transfer: Arc<FastTransferService>,
    pub healer: Arc<DriftHealer>,
}

impl Backend {
    pub fn build(config: &LedgerConfig) -> Self {
        let store: Arc<dyn LedgerStore> =
            Arc::new(InMemoryLedgerStore::with_idempotency_retention(config.idempotency_retention()));
        let outbox: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(OutboxPublisher::new(outbox.clone(), config.origin_region.clone()));
        let realtime = Arc::new(RealtimePublisher::new(store.clone()));
        let hook = Arc::new(CompositeHook::new(publisher, realtime.clone()));
        let transfer = Arc::new(FastTransferService::new(
            store.clone(),
            hook,
            config.fast_transfer_retry_policy(),
        ));
        let device_keys = Arc::new(InMemoryDeviceKeyStore::new());
        let offline = Arc::new(OfflineQueue::new(device_keys.clone(), store.clone()));
        let healer = Arc::new(DriftHealer::new(store.clone(), config.heal_config()));

        Self {
            store,
            outbox,
            realtime,
            device_keys,
            offline,
            transfer,
            healer,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            transfer: self.transfer.clone(),
            offline: self.offline.clone(),
            outbox: self.outbox.clone(),
        }
    }

    pub async fn provision_device(&self, device_id: impl Into<String>, key: Vec<u8>) {
        self.device_keys.provision(device_id, key).await;
    }
}

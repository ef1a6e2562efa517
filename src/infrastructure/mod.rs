pub mod in_memory;
pub mod processor;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::ports::{
    SharedActivationAttemptStore, SharedFingerprintStore, SharedFraudFlagStore,
    SharedPaymentEventLedger, SharedSubscriptionStore, SharedTrialTokenStore,
};
use in_memory::{
    InMemoryActivationAttemptStore, InMemoryFingerprintStore, InMemoryFraudFlagStore,
    InMemoryPaymentEventLedger, InMemorySubscriptionStore, InMemoryTrialTokenStore,
};
use std::sync::Arc;

/// One backend wired into every store port.
#[derive(Clone)]
pub struct Storage {
    pub fingerprints: SharedFingerprintStore,
    pub trials: SharedTrialTokenStore,
    pub flags: SharedFraudFlagStore,
    pub attempts: SharedActivationAttemptStore,
    pub subscriptions: SharedSubscriptionStore,
    pub events: SharedPaymentEventLedger,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            fingerprints: Arc::new(InMemoryFingerprintStore::new()),
            trials: Arc::new(InMemoryTrialTokenStore::new()),
            flags: Arc::new(InMemoryFraudFlagStore::new()),
            attempts: Arc::new(InMemoryActivationAttemptStore::new()),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            events: Arc::new(InMemoryPaymentEventLedger::new()),
        }
    }

    /// Every port shares the same RocksDB instance (and its write gate).
    #[cfg(feature = "storage-rocksdb")]
    pub fn rocksdb<P: AsRef<std::path::Path>>(path: P) -> crate::error::Result<Self> {
        let store = self::rocksdb::RocksDBStore::open(path)?;
        Ok(Self {
            fingerprints: Arc::new(store.clone()),
            trials: Arc::new(store.clone()),
            flags: Arc::new(store.clone()),
            attempts: Arc::new(store.clone()),
            subscriptions: Arc::new(store.clone()),
            events: Arc::new(store),
        })
    }
}

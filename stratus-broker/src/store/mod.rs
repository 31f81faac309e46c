//! Durable-storage boundary.
//!
//! The broker talks to storage only through the [`Store`] trait; the concrete
//! backend is chosen once at startup from the `storage` config section and
//! the core never branches on it.

mod memory;
mod sled;

pub use self::memory::MemoryStore;
pub use self::sled::SledStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::settings::{StorageBackend, StorageSettings};

/// A client session as persisted: identity, clean-session flag and the
/// granted subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    pub clean_session: bool,
    pub subscriptions: Vec<SubscriptionRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub qos: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an error occurred accessing the storage backend")]
    Backend(#[from] ::sled::Error),

    #[error("an error occurred encoding a record")]
    Encode(#[from] bincode::Error),

    #[error("a storage lock was poisoned")]
    LockPoisoned,
}

/// Persistent storage operations used by the broker.
pub trait Store: Send + Sync {
    fn save_session(&self, session: &SessionRecord) -> Result<(), StoreError>;
    fn load_session(&self, client_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    fn delete_session(&self, client_id: &str) -> Result<(), StoreError>;

    /// Appends a message to the client's queue. Entries are kept in a
    /// monotonic per-client sequence so equal payloads never collide.
    fn enqueue_message(&self, client_id: &str, message: &MessageRecord) -> Result<(), StoreError>;

    /// Drains the client's queue, returning messages in enqueue order.
    fn dequeue_messages(&self, client_id: &str) -> Result<Vec<MessageRecord>, StoreError>;

    /// Stores the retained message for a topic. An empty payload removes the
    /// entry, mirroring the wire-level retained-clear semantics.
    fn store_retained(&self, topic: &str, message: &MessageRecord) -> Result<(), StoreError>;
    fn get_retained(&self, topic: &str) -> Result<Option<MessageRecord>, StoreError>;

    fn persist_inflight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &MessageRecord,
    ) -> Result<(), StoreError>;
    fn clear_inflight(&self, client_id: &str, packet_id: u16) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// Opens the store selected by the `storage` config section.
pub fn open(settings: &StorageSettings) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match settings.backend() {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sled => Arc::new(SledStore::open(settings.path())?),
    };
    Ok(store)
}

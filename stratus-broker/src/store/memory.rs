use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use super::{MessageRecord, SessionRecord, Store, StoreError};

/// Process-local [`Store`]. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    queues: HashMap<String, VecDeque<MessageRecord>>,
    retained: HashMap<String, MessageRecord>,
    inflight: HashMap<(String, u16), MessageRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .sessions
            .insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, client_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.sessions.get(client_id).cloned())
    }

    fn delete_session(&self, client_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner.sessions.remove(client_id);
        Ok(())
    }

    fn enqueue_message(&self, client_id: &str, message: &MessageRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .queues
            .entry(client_id.to_string())
            .or_default()
            .push_back(message.clone());
        Ok(())
    }

    fn dequeue_messages(&self, client_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner
            .queues
            .remove(client_id)
            .map(Vec::from)
            .unwrap_or_default())
    }

    fn store_retained(&self, topic: &str, message: &MessageRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        if message.payload.is_empty() {
            inner.retained.remove(topic);
        } else {
            inner.retained.insert(topic.to_string(), message.clone());
        }
        Ok(())
    }

    fn get_retained(&self, topic: &str) -> Result<Option<MessageRecord>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.retained.get(topic).cloned())
    }

    fn persist_inflight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &MessageRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .inflight
            .insert((client_id.to_string(), packet_id), message.clone());
        Ok(())
    }

    fn clear_inflight(&self, client_id: &str, packet_id: u16) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner.inflight.remove(&(client_id.to_string(), packet_id));
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

use std::convert::TryInto;
use std::path::Path;

use ::sled::{Db, Tree};

use super::{MessageRecord, SessionRecord, Store, StoreError};

const SEPARATOR: u8 = 0x00;

/// Embedded-KV [`Store`] backed by a sled database on disk.
///
/// Records are bincode-encoded. Queued messages are keyed by a monotonic
/// per-client sequence so drain order equals enqueue order.
#[derive(Debug)]
pub struct SledStore {
    db: Db,
    sessions: Tree,
    queue: Tree,
    queue_seq: Tree,
    retained: Tree,
    inflight: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = ::sled::open(path)?;
        let sessions = db.open_tree("sessions")?;
        let queue = db.open_tree("queue")?;
        let queue_seq = db.open_tree("queue_seq")?;
        let retained = db.open_tree("retained")?;
        let inflight = db.open_tree("inflight")?;

        Ok(Self {
            db,
            sessions,
            queue,
            queue_seq,
            retained,
            inflight,
        })
    }

    fn next_sequence(&self, client_id: &str) -> Result<u64, StoreError> {
        let value = self.queue_seq.update_and_fetch(client_id, |old| {
            let next = old
                .and_then(|bytes| bytes.try_into().ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0)
                + 1;
            Some(next.to_be_bytes().to_vec())
        })?;

        Ok(value
            .and_then(|bytes| bytes.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(1))
    }
}

fn composite_key(client_id: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(client_id.len() + 1 + suffix.len());
    key.extend_from_slice(client_id.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(suffix);
    key
}

fn queue_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

impl Store for SledStore {
    fn save_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let encoded = bincode::serialize(session)?;
        self.sessions.insert(session.client_id.as_bytes(), encoded)?;
        Ok(())
    }

    fn load_session(&self, client_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.sessions
            .get(client_id.as_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(StoreError::from))
            .transpose()
    }

    fn delete_session(&self, client_id: &str) -> Result<(), StoreError> {
        self.sessions.remove(client_id.as_bytes())?;
        Ok(())
    }

    fn enqueue_message(&self, client_id: &str, message: &MessageRecord) -> Result<(), StoreError> {
        let seq = self.next_sequence(client_id)?;
        let key = composite_key(client_id, &seq.to_be_bytes());
        let encoded = bincode::serialize(message)?;
        self.queue.insert(key, encoded)?;
        Ok(())
    }

    fn dequeue_messages(&self, client_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let entries = self
            .queue
            .scan_prefix(queue_prefix(client_id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            messages.push(bincode::deserialize(&value)?);
            self.queue.remove(key)?;
        }
        Ok(messages)
    }

    fn store_retained(&self, topic: &str, message: &MessageRecord) -> Result<(), StoreError> {
        if message.payload.is_empty() {
            self.retained.remove(topic.as_bytes())?;
        } else {
            let encoded = bincode::serialize(message)?;
            self.retained.insert(topic.as_bytes(), encoded)?;
        }
        Ok(())
    }

    fn get_retained(&self, topic: &str) -> Result<Option<MessageRecord>, StoreError> {
        self.retained
            .get(topic.as_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(StoreError::from))
            .transpose()
    }

    fn persist_inflight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &MessageRecord,
    ) -> Result<(), StoreError> {
        let key = composite_key(client_id, &packet_id.to_be_bytes());
        let encoded = bincode::serialize(message)?;
        self.inflight.insert(key, encoded)?;
        Ok(())
    }

    fn clear_inflight(&self, client_id: &str, packet_id: u16) -> Result<(), StoreError> {
        let key = composite_key(client_id, &packet_id.to_be_bytes());
        self.inflight.remove(key)?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

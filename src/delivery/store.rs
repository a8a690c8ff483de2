//! Durable delivery state backed by `sled`
//!
//! Three trees make up the on-disk layout:
//!
//! - `outbound`: big-endian packet id -> JSON [`PendingMessage`]
//! - `inbound_qos2`: big-endian packet id -> empty value
//! - `subscriptions`: topic filter -> JSON [`StoredSubscription`]

use super::PendingMessage;
use crate::protocol::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const OUTBOUND_TREE: &str = "outbound";
const INBOUND_TREE: &str = "inbound_qos2";
const SUBSCRIPTIONS_TREE: &str = "subscriptions";

/// Queue persistence failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record in '{tree}': {reason}")]
    Corrupt { tree: &'static str, reason: String },
}

/// Persisted subscription entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: QoS,
    pub seq: u64,
}

#[derive(Clone)]
pub struct DeliveryStore {
    db: sled::Db,
    outbound: sled::Tree,
    inbound: sled::Tree,
    subscriptions: sled::Tree,
}

impl DeliveryStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        Self::from_db(sled::open(path)?)
    }

    /// Store that lives only as long as the process
    pub fn temporary() -> Result<Self, PersistenceError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, PersistenceError> {
        Ok(Self {
            outbound: db.open_tree(OUTBOUND_TREE)?,
            inbound: db.open_tree(INBOUND_TREE)?,
            subscriptions: db.open_tree(SUBSCRIPTIONS_TREE)?,
            db,
        })
    }

    /// Insert or overwrite an outbound message; QoS 0 messages are not stored
    pub fn save_message(&self, message: &PendingMessage) -> Result<(), PersistenceError> {
        let Some(packet_id) = message.packet_id else {
            return Ok(());
        };
        let value = serde_json::to_vec(message)?;
        self.outbound.insert(packet_id.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn remove_message(&self, packet_id: u16) -> Result<(), PersistenceError> {
        self.outbound.remove(packet_id.to_be_bytes())?;
        Ok(())
    }

    /// Block until every earlier write is on disk
    pub fn flush_now(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    /// [`flush_now`](Self::flush_now) on sled's flusher instead of the caller's thread
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Outbound messages in original enqueue order
    pub fn load_messages(&self) -> Result<Vec<PendingMessage>, PersistenceError> {
        let mut messages = Vec::new();
        for entry in self.outbound.iter() {
            let (key, value) = entry?;
            let message: PendingMessage = serde_json::from_slice(&value)?;
            let key_id = <[u8; 2]>::try_from(key.as_ref())
                .ok()
                .map(u16::from_be_bytes);
            if key_id.is_none() || key_id != message.packet_id {
                return Err(PersistenceError::Corrupt {
                    tree: OUTBOUND_TREE,
                    reason: format!("key does not match packet id {:?}", message.packet_id),
                });
            }
            messages.push(message);
        }
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    pub fn add_inbound(&self, packet_id: u16) -> Result<(), PersistenceError> {
        self.inbound.insert(packet_id.to_be_bytes(), &[][..])?;
        Ok(())
    }

    pub fn remove_inbound(&self, packet_id: u16) -> Result<(), PersistenceError> {
        self.inbound.remove(packet_id.to_be_bytes())?;
        Ok(())
    }

    pub fn clear_inbound(&self) -> Result<(), PersistenceError> {
        self.inbound.clear()?;
        Ok(())
    }

    pub fn load_inbound(&self) -> Result<Vec<u16>, PersistenceError> {
        self.inbound
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                let bytes: [u8; 2] =
                    key.as_ref()
                        .try_into()
                        .map_err(|_| PersistenceError::Corrupt {
                            tree: INBOUND_TREE,
                            reason: format!("{}-byte key", key.len()),
                        })?;
                Ok(u16::from_be_bytes(bytes))
            })
            .collect()
    }

    pub fn save_subscription(
        &self,
        subscription: &StoredSubscription,
    ) -> Result<(), PersistenceError> {
        let value = serde_json::to_vec(subscription)?;
        self.subscriptions
            .insert(subscription.filter.as_bytes(), value)?;
        Ok(())
    }

    pub fn remove_subscription(&self, filter: &str) -> Result<(), PersistenceError> {
        self.subscriptions.remove(filter.as_bytes())?;
        Ok(())
    }

    /// Persisted subscriptions in registration order
    pub fn load_subscriptions(&self) -> Result<Vec<StoredSubscription>, PersistenceError> {
        let mut subscriptions = self
            .subscriptions
            .iter()
            .values()
            .map(|value| Ok(serde_json::from_slice::<StoredSubscription>(&value?)?))
            .collect::<Result<Vec<_>, PersistenceError>>()?;
        subscriptions.sort_by_key(|s| s.seq);
        Ok(subscriptions)
    }
}

impl std::fmt::Debug for DeliveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStore")
            .field("db", &"sled::Db")
            .field("outbound", &self.outbound.len())
            .field("inbound_qos2", &self.inbound.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

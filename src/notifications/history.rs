//! In-memory notification history, newest first

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest message kept in a notification, in characters
pub const MAX_MESSAGE_CHARS: usize = 200;

/// A notification that was shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub event_key: String,
    pub timestamp: DateTime<Utc>,
    /// Set once the user has opened the notification
    pub disclosed: bool,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        message: &str,
        event_key: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.chars().take(MAX_MESSAGE_CHARS).collect(),
            event_key: event_key.into(),
            timestamp,
            disclosed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationHistory {
    // newest first
    entries: Vec<Notification>,
    retention: Duration,
}

impl NotificationHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Vec::new(),
            retention,
        }
    }

    pub fn add(&mut self, notification: Notification) {
        let position = self
            .entries
            .iter()
            .position(|n| n.timestamp <= notification.timestamp)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, notification);
    }

    pub fn list(&self) -> Vec<Notification> {
        self.entries.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<&Notification> {
        self.entries.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark a notification as read
    pub fn disclose(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.disclosed = true;
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| n.id != id);
        self.entries.len() != before
    }

    /// Drop notifications older than the retention period
    pub fn delete_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.entries.len();
        self.entries.retain(|n| n.timestamp >= cutoff);
        before - self.entries.len()
    }

    pub fn delete_disclosed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|n| !n.disclosed);
        before - self.entries.len()
    }
}

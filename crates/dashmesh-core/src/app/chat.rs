//! Chat feed under `messages/`. Append-only, read back in timestamp order.

use std::sync::Arc;

use crate::domain::chat::{ChatMessage, MessageKind};
use crate::domain::errors::StoreError;
use crate::domain::ids::{Identity, MessageId};
use crate::ports::{Clock, Snapshot, StateStore, child_path};

pub const MESSAGES: &str = "messages";

pub struct ChatFeed {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ChatFeed {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn send(
        &self,
        sender: &Identity,
        sender_label: &str,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        self.append(sender, sender_label, content, MessageKind::Message)
            .await
    }

    /// A system line such as "node-a joined".
    pub async fn send_status(&self, sender: &Identity, content: &str) -> Result<MessageId, StoreError> {
        self.append(sender, "system", content, MessageKind::Status)
            .await
    }

    async fn append(
        &self,
        sender: &Identity,
        sender_label: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageId, StoreError> {
        let key = self.store.push_key(MESSAGES).await?;
        let message_id = MessageId::from_key(&key).map_err(|e| StoreError::codec(MESSAGES, e))?;
        let path = child_path(MESSAGES, &key);
        let message = ChatMessage {
            sender_id: sender.clone(),
            sender_name: sender_label.to_string(),
            content: content.to_string(),
            timestamp: self.clock.now(),
            kind,
        };
        let value = serde_json::to_value(&message).map_err(|e| StoreError::codec(&path, e))?;
        self.store.set(&path, value).await?;
        tracing::debug!(%message_id, sender = %sender, "chat message sent");
        Ok(message_id)
    }

    /// The last `limit` messages, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<(MessageId, ChatMessage)>, StoreError> {
        let mut messages = decode_messages(&self.store.children(MESSAGES).await?);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }
}

/// Well-formed messages sorted by timestamp, then key.
pub fn decode_messages(snapshot: &Snapshot) -> Vec<(MessageId, ChatMessage)> {
    let mut messages: Vec<(MessageId, ChatMessage)> = snapshot
        .iter()
        .filter_map(|(key, value)| {
            let id = MessageId::from_key(key).ok()?;
            match serde_json::from_value::<ChatMessage>(value.clone()) {
                Ok(message) => Some((id, message)),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping malformed chat message");
                    None
                }
            }
        })
        .collect();
    messages.sort_by_key(|(id, message)| (message.timestamp, *id));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn recent_returns_the_tail_in_order() {
        let store = InMemoryStore::new();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let feed = ChatFeed::new(Arc::new(store.client()), Arc::new(clock.clone()));
        let alice = Identity::new("alice");

        for n in 0..5 {
            feed.send(&alice, "Alice", &format!("line {n}")).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        feed.send_status(&alice, "node-a joined").await.unwrap();

        let recent = feed.recent(3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|(_, m)| m.content.as_str()).collect();
        assert_eq!(contents, vec!["line 3", "line 4", "node-a joined"]);
        assert_eq!(recent[2].1.kind, MessageKind::Status);
        assert_eq!(recent[0].1.kind, MessageKind::Message);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store = InMemoryStore::new();
        let client = store.client();
        let feed = ChatFeed::new(Arc::new(store.client()), Arc::new(crate::ports::SystemClock));
        let id = feed.send(&Identity::new("bob"), "Bob", "hi").await.unwrap();

        let bogus = client.push_key(MESSAGES).await.unwrap();
        client
            .set(&child_path(MESSAGES, &bogus), serde_json::json!({"content": 1}))
            .await
            .unwrap();

        let recent = feed.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0, id);
    }
}

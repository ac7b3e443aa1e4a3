//! Conversation state store
//!
//! In-memory, append-only message history keyed by conversation id. The map
//! is sharded, so conversations never contend with each other. Records are
//! evicted when idle for too long or when the store grows past its cap,
//! except while a query task holds an `ActivityGuard` on them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use fista_common::config::StoreConfig;
use fista_common::errors::{AppError, Result};
use fista_common::metrics;
use fista_common::models::{
    Completion, ConversationId, ConversationSummary, Message, MessageId, Role,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const TITLE_MAX_CHARS: usize = 60;
const UNTITLED: &str = "New conversation";

struct ConversationRecord {
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    active: Arc<AtomicUsize>,
}

impl ConversationRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            created_at: now,
            last_active: now,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == *id)
    }

    fn summary(&self, id: &ConversationId) -> ConversationSummary {
        let title = self
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| title_from(&m.content))
            .unwrap_or_else(|| UNTITLED.to_string());

        ConversationSummary {
            id: id.clone(),
            title,
            message_count: self.messages.len(),
            created_at: self.created_at,
            last_active_at: self.last_active,
        }
    }
}

fn title_from(content: &str) -> String {
    if content.chars().count() <= TITLE_MAX_CHARS {
        return content.to_string();
    }
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    title.push('…');
    title
}

/// Keeps a conversation exempt from eviction while alive
pub struct ActivityGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConversationStore {
    records: DashMap<ConversationId, ConversationRecord>,
    config: StoreConfig,
}

impl ConversationStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.records.contains_key(id)
    }

    fn create_record(&self, id: &ConversationId) -> ConversationRecord {
        let now = Utc::now();
        let mut record = ConversationRecord::new(now);
        if let Some(greeting) = &self.config.greeting {
            record.messages.push(Message::agent(greeting.clone()));
        }
        debug!(conversation_id = %id, "Conversation created");
        record
    }

    /// Append a message, creating the conversation if absent.
    ///
    /// Returns the message as stored. Its timestamp is moved one microsecond
    /// past its predecessor's when it would not be strictly increasing.
    pub fn append(&self, id: &ConversationId, mut message: Message) -> Message {
        let mut record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| self.create_record(id));

        if let Some(last) = record.messages.last() {
            if message.timestamp <= last.timestamp {
                message.timestamp = last.timestamp + ChronoDuration::microseconds(1);
            }
        }

        record.last_active = record.last_active.max(message.timestamp);
        record.messages.push(message.clone());

        let limit = self.config.max_messages.max(1);
        while record.messages.len() > limit {
            match record.messages.iter().position(|m| !m.partial) {
                Some(pos) => {
                    record.messages.remove(pos);
                }
                None => break,
            }
        }

        message
    }

    /// Snapshot of the conversation's messages in order
    pub fn get(&self, id: &ConversationId) -> Result<Vec<Message>> {
        self.records
            .get(id)
            .map(|r| r.messages.clone())
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
    }

    pub fn message(&self, id: &ConversationId, message_id: &MessageId) -> Result<Message> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })?;

        record
            .messages
            .iter()
            .find(|m| m.id == *message_id)
            .cloned()
            .ok_or_else(|| AppError::MessageNotFound {
                id: message_id.to_string(),
            })
    }

    /// Replace the content of a message that is still streaming
    pub fn update_partial(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        content: String,
    ) -> Result<()> {
        self.mutate(id, message_id, |message| {
            message.content = content;
        })
        .map(|_| ())
    }

    /// Set the final content of a streaming message and seal it
    pub fn finalize(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        content: String,
        completion: Completion,
        degraded_sources: Vec<String>,
    ) -> Result<Message> {
        self.mutate(id, message_id, |message| {
            message.content = content;
            message.partial = false;
            message.completion = Some(completion);
            message.degraded_sources = degraded_sources;
        })
    }

    fn mutate(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        apply: impl FnOnce(&mut Message),
    ) -> Result<Message> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })?;

        let message = record
            .find_mut(message_id)
            .ok_or_else(|| AppError::MessageNotFound {
                id: message_id.to_string(),
            })?;

        if !message.partial {
            return Err(AppError::MessageImmutable {
                id: message_id.to_string(),
            });
        }

        apply(message);
        let updated = message.clone();
        record.last_active = record.last_active.max(Utc::now());
        Ok(updated)
    }

    /// Conversation summaries, most recently active first
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .records
            .iter()
            .map(|entry| entry.value().summary(entry.key()))
            .collect();
        summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        summaries
    }

    /// Mark the conversation active, creating it if absent
    pub fn pin(&self, id: &ConversationId) -> ActivityGuard {
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| self.create_record(id));
        record.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            active: record.active.clone(),
        }
    }

    /// Sweep idle and excess conversations; returns how many were removed
    pub fn evict(&self) -> usize {
        self.evict_at(Utc::now())
    }

    pub fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let idle_ttl = ChronoDuration::from_std(self.config.idle_ttl())
            .unwrap_or_else(|_| ChronoDuration::days(365));

        let idle: Vec<ConversationId> = self
            .records
            .iter()
            .filter(|entry| !entry.is_active() && now - entry.last_active > idle_ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in idle {
            if self.records.remove_if(&id, |_, r| !r.is_active()).is_some() {
                evicted += 1;
            }
        }

        let overflow = self.records.len().saturating_sub(self.config.max_conversations);
        if overflow > 0 {
            let mut candidates: Vec<(ConversationId, DateTime<Utc>)> = self
                .records
                .iter()
                .filter(|entry| !entry.is_active())
                .map(|entry| (entry.key().clone(), entry.last_active))
                .collect();
            candidates.sort_by(|a, b| a.1.cmp(&b.1));

            for (id, _) in candidates.into_iter().take(overflow) {
                if self.records.remove_if(&id, |_, r| !r.is_active()).is_some() {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.records.len(), "Conversations evicted");
        }
        metrics::record_eviction(evicted, self.records.len());
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fista_common::models::TruncationReason;
    use tokio_test::assert_err;

    fn config() -> StoreConfig {
        StoreConfig {
            max_conversations: 3,
            idle_ttl_secs: 60,
            sweep_interval_secs: 1,
            max_messages: 200,
            greeting: None,
        }
    }

    fn cid(id: &str) -> ConversationId {
        ConversationId::new(id)
    }

    #[test]
    fn test_append_creates_conversation() {
        let store = ConversationStore::new(config());
        assert!(store.get(&cid("c1")).is_err());

        store.append(&cid("c1"), Message::user("best hiking trails"));
        let messages = store.get(&cid("c1")).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "best hiking trails");
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let store = ConversationStore::new(config());
        let first = Message::user("one");
        let mut second = Message::user("two");
        second.timestamp = first.timestamp;
        let mut third = Message::user("three");
        third.timestamp = first.timestamp - ChronoDuration::seconds(5);

        store.append(&cid("c1"), first);
        store.append(&cid("c1"), second);
        store.append(&cid("c1"), third);

        let messages = store.get(&cid("c1")).unwrap();
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn test_get_is_idempotent() {
        let store = ConversationStore::new(config());
        store.append(&cid("c1"), Message::user("trails"));
        store.append(&cid("c1"), Message::agent("trail A"));
        assert_eq!(store.get(&cid("c1")).unwrap(), store.get(&cid("c1")).unwrap());
    }

    #[test]
    fn test_greeting_seeds_new_conversation() {
        let mut config = config();
        config.greeting = Some("Hi! Ask me anything.".to_string());
        let store = ConversationStore::new(config);

        store.append(&cid("c1"), Message::user("trails"));
        let messages = store.get(&cid("c1")).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Agent);
        assert_eq!(messages[0].content, "Hi! Ask me anything.");
    }

    #[test]
    fn test_partial_messages_seal_on_finalize() {
        let store = ConversationStore::new(config());
        let placeholder = store.append(&cid("c1"), Message::placeholder());

        store
            .update_partial(&cid("c1"), &placeholder.id, "trail A".to_string())
            .unwrap();
        let sealed = store
            .finalize(
                &cid("c1"),
                &placeholder.id,
                "trail A\n\ntrail B".to_string(),
                Completion::Complete,
                Vec::new(),
            )
            .unwrap();
        assert!(!sealed.partial);

        let err = assert_err!(store.update_partial(&cid("c1"), &placeholder.id, "x".to_string()));
        assert!(matches!(err, AppError::MessageImmutable { .. }));

        let err = assert_err!(store.finalize(
            &cid("c1"),
            &placeholder.id,
            "x".to_string(),
            Completion::Truncated {
                reason: TruncationReason::Cancelled
            },
            Vec::new(),
        ));
        assert!(matches!(err, AppError::MessageImmutable { .. }));

        let stored = store.message(&cid("c1"), &placeholder.id).unwrap();
        assert_eq!(stored.content, "trail A\n\ntrail B");
    }

    #[test]
    fn test_complete_messages_are_immutable() {
        let store = ConversationStore::new(config());
        let user = store.append(&cid("c1"), Message::user("trails"));
        let err = assert_err!(store.update_partial(&cid("c1"), &user.id, "edited".to_string()));
        assert!(matches!(err, AppError::MessageImmutable { .. }));

        let err = assert_err!(store.message(&cid("c1"), &MessageId::new()));
        assert!(matches!(err, AppError::MessageNotFound { .. }));
    }

    #[test]
    fn test_window_keeps_partial_messages() {
        let mut config = config();
        config.max_messages = 3;
        let store = ConversationStore::new(config);

        let placeholder = store.append(&cid("c1"), Message::placeholder());
        for i in 0..4 {
            store.append(&cid("c1"), Message::user(format!("query {}", i)));
        }

        let messages = store.get(&cid("c1")).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, placeholder.id);
        assert_eq!(messages[1].content, "query 2");
        assert_eq!(messages[2].content, "query 3");
    }

    #[test]
    fn test_list_orders_by_activity() {
        let store = ConversationStore::new(config());
        store.append(&cid("c1"), Message::user("best hiking trails"));
        store.append(&cid("c2"), Message::agent("hello"));
        store.append(&cid("c1"), Message::user("x".repeat(100)));
        let mut late = Message::user("sourdough");
        late.timestamp = Utc::now() + ChronoDuration::seconds(10);
        store.append(&cid("c3"), late);

        let summaries = store.list();
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids[0], "c3");
        let c1 = summaries.iter().find(|s| s.id.as_str() == "c1").unwrap();
        assert_eq!(c1.title, "best hiking trails");
        assert_eq!(c1.message_count, 2);
        let c2 = summaries.iter().find(|s| s.id.as_str() == "c2").unwrap();
        assert_eq!(c2.title, UNTITLED);
    }

    #[test]
    fn test_long_titles_are_shortened() {
        let title = title_from(&"a".repeat(100));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_evicts_idle_conversations() {
        let store = ConversationStore::new(config());
        store.append(&cid("c1"), Message::user("one"));
        store.append(&cid("c2"), Message::user("two"));

        assert_eq!(store.evict_at(Utc::now()), 0);
        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(store.evict_at(later), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_evicts_oldest_over_capacity() {
        let store = ConversationStore::new(config());
        let base = Utc::now();
        for (i, id) in ["c1", "c2", "c3", "c4", "c5"].iter().enumerate() {
            let mut message = Message::user(*id);
            message.timestamp = base + ChronoDuration::milliseconds(i as i64 * 10);
            store.append(&cid(id), message);
        }

        assert_eq!(store.evict_at(base), 2);
        assert!(!store.contains(&cid("c1")));
        assert!(!store.contains(&cid("c2")));
        assert!(store.contains(&cid("c5")));
    }

    #[test]
    fn test_pinned_conversation_survives_eviction() {
        let store = ConversationStore::new(config());
        store.append(&cid("c1"), Message::user("one"));
        let guard = store.pin(&cid("c1"));

        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(store.evict_at(later), 0);
        assert!(store.contains(&cid("c1")));

        drop(guard);
        assert_eq!(store.evict_at(later), 1);
    }
}

//! Multi-turn conversation store.
//!
//! Conversations collect messages under per-conversation budgets and
//! build the model-facing prompt that embeds history. Messages may only
//! be appended while a conversation is active; completed and expired
//! conversations are read-only. System messages are stored but never
//! emitted in the history fed back to the model.

use crate::types::estimate_tokens;
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Default cap on messages per conversation.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// Default cap on aggregate estimated tokens per conversation.
pub const DEFAULT_MAX_TOKENS: u64 = 32_000;

/// Conversations idle longer than this expire during cleanup.
pub const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Lifecycle state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Active,
    Paused,
    Completed,
    Expired,
}

/// One stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub estimated_tokens: u64,
}

/// Aggregated counters for one conversation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConversationStats {
    pub message_count: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub estimated_tokens: u64,
}

/// Per-conversation budgets.
#[derive(Debug, Clone, Copy)]
pub struct ConversationBudgets {
    pub max_messages: usize,
    pub max_total_tokens: u64,
}

impl Default for ConversationBudgets {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_total_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone)]
struct Conversation {
    id: String,
    title: String,
    model: String,
    system_directive: Option<String>,
    state: ConversationState,
    messages: Vec<StoredMessage>,
    budgets: ConversationBudgets,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    stats: ConversationStats,
}

/// Summary row returned by [`ConversationStore::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub state: ConversationState,
    pub stats: ConversationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide conversation registry. Construct one and share the handle;
/// all methods take `&self` and are safe under concurrent use.
#[derive(Debug)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    default_budgets: ConversationBudgets,
    expiry_hours: i64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_budgets(ConversationBudgets::default(), DEFAULT_EXPIRY_HOURS)
    }

    pub fn with_budgets(default_budgets: ConversationBudgets, expiry_hours: i64) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            default_budgets,
            expiry_hours,
        }
    }

    /// Start a new conversation; returns its identifier.
    pub async fn start(
        &self,
        title: impl Into<String>,
        model: impl Into<String>,
        system_directive: Option<String>,
        budgets: Option<ConversationBudgets>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conversation = Conversation {
            id: id.clone(),
            title: title.into(),
            model: model.into(),
            system_directive,
            state: ConversationState::Active,
            messages: Vec::new(),
            budgets: budgets.unwrap_or(self.default_budgets),
            created_at: now,
            updated_at: now,
            completed_at: None,
            stats: ConversationStats::default(),
        };
        self.conversations
            .write()
            .await
            .insert(id.clone(), conversation);
        debug!(conversation = %id, "conversation started");
        id
    }

    /// Append a message.
    ///
    /// # Errors
    ///
    /// [`Error::Session`] when the conversation is unknown or not active;
    /// [`Error::Budget`] when the message would breach either budget.
    pub async fn append(&self, id: &str, role: Role, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown conversation"))?;

        if conversation.state != ConversationState::Active {
            return Err(Error::session(
                id,
                format!("cannot append in state {:?}", conversation.state),
            ));
        }

        if conversation.messages.len() + 1 > conversation.budgets.max_messages {
            return Err(Error::budget(
                "conversation_messages",
                format!(
                    "message limit of {} reached",
                    conversation.budgets.max_messages
                ),
            ));
        }

        let tokens = estimate_tokens(&content);
        if conversation.stats.estimated_tokens + tokens > conversation.budgets.max_total_tokens {
            return Err(Error::budget(
                "conversation_tokens",
                format!(
                    "appending {} tokens would exceed the {}-token budget",
                    tokens, conversation.budgets.max_total_tokens
                ),
            ));
        }

        conversation.messages.push(StoredMessage {
            role,
            content,
            timestamp: Utc::now(),
            estimated_tokens: tokens,
        });
        conversation.updated_at = Utc::now();
        conversation.stats.message_count += 1;
        conversation.stats.estimated_tokens += tokens;
        match role {
            Role::User => conversation.stats.user_messages += 1,
            Role::Assistant => conversation.stats.assistant_messages += 1,
            Role::System => {}
        }
        Ok(())
    }

    /// Full message history (including system messages).
    pub async fn history(&self, id: &str) -> Result<Vec<StoredMessage>> {
        let conversations = self.conversations.read().await;
        conversations
            .get(id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| Error::session(id, "unknown conversation"))
    }

    /// Build the model-facing prompt: system directive, one line per
    /// non-system message, the new user text, and a trailing instruction
    /// to continue as the assistant.
    pub async fn build_prompt(&self, id: &str, new_user_text: &str) -> Result<String> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(id)
            .ok_or_else(|| Error::session(id, "unknown conversation"))?;

        let mut prompt = String::new();
        if let Some(directive) = &conversation.system_directive {
            prompt.push_str(directive);
            prompt.push_str("\n\n");
        }
        for message in &conversation.messages {
            if message.role == Role::System {
                continue;
            }
            prompt.push_str(&format!("[{}]: {}\n", message.role.label(), message.content));
        }
        prompt.push_str(&format!("[user]: {}\n", new_user_text));
        prompt.push_str("Continue the conversation as the assistant.");
        Ok(prompt)
    }

    /// List conversations, optionally filtered by state.
    pub async fn list(&self, state: Option<ConversationState>) -> Vec<ConversationSummary> {
        let conversations = self.conversations.read().await;
        let mut rows: Vec<ConversationSummary> = conversations
            .values()
            .filter(|c| state.is_none_or(|s| c.state == s))
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                model: c.model.clone(),
                state: c.state,
                stats: c.stats,
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    /// Remove a conversation entirely.
    pub async fn clear(&self, id: &str) -> Result<()> {
        self.conversations
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::session(id, "unknown conversation"))
    }

    /// Mark a conversation completed. Only valid from the active state.
    pub async fn end(&self, id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown conversation"))?;
        if conversation.state != ConversationState::Active {
            return Err(Error::session(
                id,
                format!("cannot end in state {:?}", conversation.state),
            ));
        }
        conversation.state = ConversationState::Completed;
        conversation.completed_at = Some(Utc::now());
        conversation.updated_at = Utc::now();
        Ok(())
    }

    /// Pause an active conversation; `resume` reverses it.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.transition(id, ConversationState::Active, ConversationState::Paused)
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.transition(id, ConversationState::Paused, ConversationState::Active)
            .await
    }

    /// The model tag a conversation was started with.
    pub async fn model_of(&self, id: &str) -> Result<String> {
        let conversations = self.conversations.read().await;
        conversations
            .get(id)
            .map(|c| c.model.clone())
            .ok_or_else(|| Error::session(id, "unknown conversation"))
    }

    /// Per-conversation counters.
    pub async fn stats(&self, id: &str) -> Result<ConversationStats> {
        let conversations = self.conversations.read().await;
        conversations
            .get(id)
            .map(|c| c.stats)
            .ok_or_else(|| Error::session(id, "unknown conversation"))
    }

    /// Expire active conversations stale past the expiry window. Returns
    /// the number expired.
    pub async fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(self.expiry_hours);
        let mut conversations = self.conversations.write().await;
        let mut expired = 0;
        for conversation in conversations.values_mut() {
            if conversation.state == ConversationState::Active && conversation.updated_at < cutoff {
                conversation.state = ConversationState::Expired;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(count = expired, "conversations expired");
        }
        expired
    }

    /// Drop everything. Intended for tests.
    pub async fn reset(&self) {
        self.conversations.write().await.clear();
    }

    async fn transition(
        &self,
        id: &str,
        from: ConversationState,
        to: ConversationState,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| Error::session(id, "unknown conversation"))?;
        if conversation.state != from {
            return Err(Error::session(
                id,
                format!("illegal transition from {:?}", conversation.state),
            ));
        }
        conversation.state = to;
        conversation.updated_at = Utc::now();
        Ok(())
    }
}

//! Exchange types for the conversation window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl Role {
    /// Capitalised label used in archived chunk text
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A single turn of a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Unique exchange ID
    pub id: Uuid,

    /// Session this exchange was produced in
    pub session_id: String,

    /// Role of the sender
    pub role: Role,

    /// Message content
    pub content: String,

    /// Token count for this exchange
    pub token_count: u32,

    /// Timestamp when the exchange was created
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    /// Create a new exchange
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            token_count: 0, // Will be calculated later
            created_at: Utc::now(),
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    /// Set the token count
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.token_count = tokens;
        self
    }

    /// Set the creation time
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Check the exchange is well-formed on its own
    pub fn validate(&self) -> Result<()> {
        if self.role == Role::System {
            return Err(Error::invalid_exchange(
                "exchanges must be authored by the user or the assistant",
            ));
        }
        if self.content.trim().is_empty() {
            return Err(Error::invalid_exchange(format!(
                "{} exchange has no content",
                self.role
            )));
        }
        Ok(())
    }
}

/// Summary of token usage per role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Total tokens used
    pub total: u32,

    /// Tokens used by system blocks
    pub system: u32,

    /// Tokens used by user blocks
    pub user: u32,

    /// Tokens used by assistant blocks
    pub assistant: u32,
}

impl TokenUsage {
    /// Add tokens for a role
    pub fn add(&mut self, role: Role, tokens: u32) {
        self.total += tokens;
        match role {
            Role::System => self.system += tokens,
            Role::User => self.user += tokens,
            Role::Assistant => self.assistant += tokens,
        }
    }

    /// Utilization of a limit (0.0 - 1.0+)
    pub fn utilization(&self, limit: u32) -> f32 {
        if limit == 0 {
            return 1.0;
        }
        self.total as f32 / limit as f32
    }
}

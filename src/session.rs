//! Bounded window of the most recent exchanges
//!
//! The window holds at most `capacity` exchanges. When an append pushes it
//! over, the oldest complete user/assistant pairs are evicted and handed back
//! as overflow for archival. A pair is never split: if the oldest entries do
//! not form a complete pair, eviction waits until they do.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exchange::{Exchange, Role};

/// Ordered, bounded sequence of exchanges for one conversation
#[derive(Debug, Clone)]
pub struct SessionWindow {
    session_id: String,
    capacity: usize,
    exchanges: Vec<Exchange>,
}

/// Counts and timing for the current window
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub capacity: usize,
    pub total_exchanges: usize,
    pub user_exchanges: usize,
    pub assistant_exchanges: usize,
    pub total_tokens: u32,
    pub awaiting_response: bool,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

impl SessionWindow {
    /// Create a window holding at most `capacity` exchanges
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::config(format!(
                "session window capacity must hold a pair, got {}",
                capacity
            )));
        }
        Ok(Self {
            session_id: new_session_id(),
            capacity,
            exchanges: Vec::with_capacity(capacity + 1),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Exchanges in chronological order
    pub fn get_recent(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Whether the newest entry is a user exchange with no reply yet
    pub fn is_awaiting_response(&self) -> bool {
        self.exchanges
            .last()
            .is_some_and(|e| e.role == Role::User)
    }

    pub fn latest_user_message(&self) -> Option<&str> {
        self.exchanges
            .iter()
            .rev()
            .find(|e| e.role == Role::User)
            .map(|e| e.content.as_str())
    }

    /// Append one exchange, returning any evicted pairs.
    pub fn append(&mut self, exchange: Exchange) -> Result<Option<Vec<Exchange>>> {
        self.check_next(&exchange, self.is_awaiting_response())?;
        self.exchanges.push(exchange);
        Ok(self.evict())
    }

    /// Append a user exchange and its reply as one step.
    ///
    /// Both are validated before the window changes, so a rejected pair
    /// leaves the window untouched.
    pub fn append_pair(
        &mut self,
        user: Exchange,
        assistant: Exchange,
    ) -> Result<Option<Vec<Exchange>>> {
        if user.role != Role::User || assistant.role != Role::Assistant {
            return Err(Error::invalid_exchange(
                "a pair must be a user exchange followed by an assistant exchange",
            ));
        }
        self.check_next(&user, self.is_awaiting_response())?;
        assistant.validate()?;

        self.exchanges.push(user);
        self.exchanges.push(assistant);
        Ok(self.evict())
    }

    /// Drain the whole window and start a fresh session.
    pub fn clear(&mut self) -> Vec<Exchange> {
        let drained = std::mem::take(&mut self.exchanges);
        self.session_id = new_session_id();
        drained
    }

    pub fn summary(&self) -> SessionSummary {
        let user_exchanges = self
            .exchanges
            .iter()
            .filter(|e| e.role == Role::User)
            .count();

        SessionSummary {
            session_id: self.session_id.clone(),
            capacity: self.capacity,
            total_exchanges: self.exchanges.len(),
            user_exchanges,
            assistant_exchanges: self.exchanges.len() - user_exchanges,
            total_tokens: self.exchanges.iter().map(|e| e.token_count).sum(),
            awaiting_response: self.is_awaiting_response(),
            first_at: self.exchanges.first().map(|e| e.created_at),
            last_at: self.exchanges.last().map(|e| e.created_at),
        }
    }

    fn check_next(&self, exchange: &Exchange, awaiting: bool) -> Result<()> {
        exchange.validate()?;
        match (exchange.role, awaiting) {
            (Role::User, true) => Err(Error::invalid_exchange(
                "previous user exchange has not been answered",
            )),
            (Role::Assistant, false) => Err(Error::invalid_exchange(
                "assistant exchange without a preceding user exchange",
            )),
            _ => Ok(()),
        }
    }

    /// Remove the oldest complete pairs until the window fits again.
    fn evict(&mut self) -> Option<Vec<Exchange>> {
        let mut cut = 0;
        while self.exchanges.len() - cut > self.capacity {
            let complete_pair = matches!(
                (self.exchanges.get(cut), self.exchanges.get(cut + 1)),
                (Some(u), Some(a)) if u.role == Role::User && a.role == Role::Assistant
            );
            if !complete_pair {
                // Boundary falls mid-pair: wait for the reply
                break;
            }
            cut += 2;
        }

        if cut == 0 {
            return None;
        }

        debug!(
            session_id = %self.session_id,
            evicted = cut,
            remaining = self.exchanges.len() - cut,
            "Session window overflow"
        );
        Some(self.exchanges.drain(..cut).collect())
    }
}

fn new_session_id() -> String {
    format!(
        "session_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

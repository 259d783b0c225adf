//! One conversation's owned state and the turn flow
//!
//! A conversation owns its session window and preference store. Retrieval,
//! assembly and the background queue are shared services. The window changes
//! only after a response exists, and then by a single atomic pair append.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::{AssembledPrompt, ContextAssembler, PromptBlock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::preferences::{Outcome, PreferenceCategory, PreferenceEntry, PreferenceStore, TaskType};
use crate::retrieval::RetrievalEngine;
use crate::session::{SessionSummary, SessionWindow};
use crate::tasks::{Task, TaskSender};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Produces the assistant's reply from the assembled prompt
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, blocks: &[PromptBlock]) -> Result<String>;
}

/// Services shared by every conversation
#[derive(Clone)]
pub struct ContextServices {
    pub config: Config,
    pub retrieval: Arc<RetrievalEngine>,
    pub assembler: ContextAssembler,
    pub tasks: TaskSender,
}

/// What recording a completed turn changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnRecord {
    /// Exchanges handed to archival
    pub archived_exchanges: usize,
    /// Preference keys touched by detectors
    pub observed_preferences: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub prompt: AssembledPrompt,
    pub record: TurnRecord,
}

pub struct Conversation {
    id: Uuid,
    owner: String,
    system_prompt: String,
    window: SessionWindow,
    preferences: PreferenceStore,
    services: ContextServices,
}

impl Conversation {
    pub fn new(services: ContextServices, owner: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            window: SessionWindow::new(services.config.recent_message_limit)?,
            preferences: PreferenceStore::new(),
            services,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Start from a previously persisted profile
    pub fn with_preferences(mut self, preferences: PreferenceStore) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn window(&self) -> &SessionWindow {
        &self.window
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn session_summary(&self) -> SessionSummary {
        self.window.summary()
    }

    pub fn profile(&self) -> BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> {
        self.preferences.profile()
    }

    /// Build the prompt for `query` without touching any state
    pub async fn prepare(&self, query: &str) -> Result<AssembledPrompt> {
        if query.trim().is_empty() {
            return Err(Error::invalid_exchange("query has no content"));
        }

        let task = TaskType::infer(query);
        let retrieval = &self.services.retrieval;
        let retrieved = retrieval.search(query, retrieval.default_limit()).await;
        let preferences = self.preferences.relevant(task);

        let prompt = self.services.assembler.assemble(
            &self.system_prompt,
            self.window.get_recent(),
            query,
            &retrieved,
            &preferences,
            self.services.config.token_budget_limit,
        )?;

        debug!(
            conversation = %self.id,
            task = ?task,
            retrieved = retrieved.len(),
            tokens = prompt.total_tokens,
            "Prepared prompt"
        );
        Ok(prompt)
    }

    /// Record a completed turn: append the pair, learn from it, hand off
    /// overflow and preference changes to the background queue.
    pub async fn record(&mut self, query: &str, response: &str) -> Result<TurnRecord> {
        let session_id = self.window.session_id().to_string();
        let assembler = &self.services.assembler;
        let user = Exchange::user(&session_id, query).with_tokens(assembler.count(query));
        let assistant = Exchange::assistant(&session_id, response).with_tokens(assembler.count(response));

        let overflow = self.window.append_pair(user, assistant)?;
        let observed = self
            .preferences
            .observe(query, response, TaskType::infer(query));

        let mut record = TurnRecord {
            archived_exchanges: 0,
            observed_preferences: observed,
        };
        if let Some(batch) = overflow {
            record.archived_exchanges = batch.len();
            self.submit(Task::Archive { batch });
        }
        self.flush_preferences();

        Ok(record)
    }

    /// Full turn: prepare, generate, record
    pub async fn turn(&mut self, generator: &dyn Generator, query: &str) -> Result<TurnOutcome> {
        let prompt = self.prepare(query).await?;
        let response = generator.generate(&prompt.blocks).await?;
        let record = self.record(query, &response).await?;

        Ok(TurnOutcome {
            response,
            prompt,
            record,
        })
    }

    /// Report how a preference worked out; returns the new confidence.
    pub async fn reinforce(&mut self, key: &str, outcome: Outcome) -> Option<f64> {
        let confidence = self.preferences.reinforce(key, outcome);
        self.flush_preferences();
        confidence
    }

    /// Archive the whole window and begin a new session
    pub async fn end_session(&mut self) -> usize {
        let drained = self.window.clear();
        let count = drained.len();
        if count > 0 {
            self.submit(Task::Archive { batch: drained });
        }
        info!(conversation = %self.id, archived = count, "Session ended");
        count
    }

    fn flush_preferences(&mut self) {
        let changes = self.preferences.take_changes();
        for task in Task::from_changes(&self.owner, changes) {
            self.submit(task);
        }
    }

    /// Background work is best-effort: a full or closed queue costs the task,
    /// never the turn.
    fn submit(&self, task: Task) {
        let kind = task.kind();
        if let Err(e) = self.services.tasks.enqueue(task) {
            warn!(conversation = %self.id, kind, error = %e, "Background task not queued");
        }
    }
}

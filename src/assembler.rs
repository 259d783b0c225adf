//! Prompt assembly under a token budget
//!
//! Pieces are admitted by priority: the system prompt and the live query are
//! mandatory, then session history from newest to oldest, then retrieved
//! chunks by similarity, then preferences. Admission is strictly greedy: the
//! first optional piece that would overflow the budget ends selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exchange::{Exchange, Role, TokenUsage};
use crate::preferences::{PreferenceCategory, PreferenceEntry};
use crate::retrieval::RankedChunk;
use crate::tokens::TokenEstimator;

const PREFERENCE_HEADER: &str = "Known user preferences:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    System,
    Preferences,
    Retrieved,
    History,
    Query,
}

/// One role-tagged piece of the prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptBlock {
    pub role: Role,
    pub section: Section,
    pub content: String,
    pub tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledPrompt {
    /// Blocks in the order the generator sees them
    pub blocks: Vec<PromptBlock>,
    pub total_tokens: u32,
    pub budget: u32,
    pub usage: TokenUsage,
    pub dropped_history: usize,
    pub dropped_chunks: usize,
    pub dropped_preferences: usize,
}

impl AssembledPrompt {
    pub fn section(&self, section: Section) -> impl Iterator<Item = &PromptBlock> {
        self.blocks.iter().filter(move |b| b.section == section)
    }
}

/// Admission state shared by the optional classes
struct Admission {
    used: u32,
    budget: u32,
    closed: bool,
}

impl Admission {
    fn admit(&mut self, tokens: u32) -> bool {
        if self.closed || self.used.saturating_add(tokens) > self.budget {
            self.closed = true;
            return false;
        }
        self.used += tokens;
        true
    }
}

/// Builds prompts with one token estimator for every comparison
#[derive(Clone)]
pub struct ContextAssembler {
    counter: Arc<dyn TokenEstimator>,
}

impl ContextAssembler {
    pub fn new(counter: Arc<dyn TokenEstimator>) -> Self {
        Self { counter }
    }

    pub fn count(&self, text: &str) -> u32 {
        self.counter.count(text)
    }

    pub fn assemble(
        &self,
        system_prompt: &str,
        session: &[Exchange],
        query: &str,
        retrieved: &[RankedChunk],
        preferences: &BTreeMap<PreferenceCategory, Vec<PreferenceEntry>>,
        budget: u32,
    ) -> Result<AssembledPrompt> {
        let system_tokens = self.counter.count(system_prompt);
        let query_tokens = self.counter.count(query);
        let required = system_tokens + query_tokens;
        if required > budget {
            return Err(Error::BudgetExceeded { required, budget });
        }

        let mut admission = Admission {
            used: required,
            budget,
            closed: false,
        };

        // History, newest first
        let mut history: Vec<PromptBlock> = Vec::new();
        let mut dropped_history = 0;
        for exchange in session.iter().rev() {
            let tokens = self.counter.count(&exchange.content);
            if admission.admit(tokens) {
                history.push(PromptBlock {
                    role: exchange.role,
                    section: Section::History,
                    content: exchange.content.clone(),
                    tokens,
                });
            } else {
                dropped_history += 1;
            }
        }
        history.reverse();

        // A reply whose question was cut makes no sense alone
        if history.first().is_some_and(|b| b.role == Role::Assistant) && dropped_history > 0 {
            let orphan = history.remove(0);
            admission.used -= orphan.tokens;
            dropped_history += 1;
        }

        let mut ranked: Vec<&RankedChunk> = retrieved.iter().collect();
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let mut chunks = Vec::new();
        let mut dropped_chunks = 0;
        for chunk in ranked {
            let content = format!(
                "Earlier conversation ({}):\n{}",
                chunk.chunk.created_at.format("%Y-%m-%d"),
                chunk.chunk.text
            );
            let tokens = self.counter.count(&content);
            if admission.admit(tokens) {
                chunks.push(PromptBlock {
                    role: Role::System,
                    section: Section::Retrieved,
                    content,
                    tokens,
                });
            } else {
                dropped_chunks += 1;
            }
        }

        let mut entries: Vec<&PreferenceEntry> = preferences.values().flatten().collect();
        entries.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then_with(|| a.key.cmp(&b.key)));

        // The block is recounted whole after each line so separators are paid for
        let mut preference_block = String::new();
        let mut preference_tokens = 0;
        let mut dropped_preferences = 0;
        for entry in entries {
            let candidate = if preference_block.is_empty() {
                format!("{}\n- {}", PREFERENCE_HEADER, entry.render())
            } else {
                format!("{}\n- {}", preference_block, entry.render())
            };
            let candidate_tokens = self.counter.count(&candidate);
            if admission.admit(candidate_tokens.saturating_sub(preference_tokens)) {
                preference_block = candidate;
                preference_tokens = candidate_tokens;
            } else {
                dropped_preferences += 1;
            }
        }

        let mut blocks = Vec::with_capacity(history.len() + chunks.len() + 3);
        blocks.push(PromptBlock {
            role: Role::System,
            section: Section::System,
            content: system_prompt.to_string(),
            tokens: system_tokens,
        });
        if !preference_block.is_empty() {
            blocks.push(PromptBlock {
                role: Role::System,
                section: Section::Preferences,
                content: preference_block,
                tokens: preference_tokens,
            });
        }
        blocks.extend(chunks);
        blocks.extend(history);
        blocks.push(PromptBlock {
            role: Role::User,
            section: Section::Query,
            content: query.to_string(),
            tokens: query_tokens,
        });

        let mut usage = TokenUsage::default();
        for block in &blocks {
            usage.add(block.role, block.tokens);
        }

        debug!(
            total = usage.total,
            budget,
            utilization = usage.utilization(budget),
            dropped_history,
            dropped_chunks,
            dropped_preferences,
            "Assembled prompt"
        );

        Ok(AssembledPrompt {
            total_tokens: usage.total,
            blocks,
            budget,
            usage,
            dropped_history,
            dropped_chunks,
            dropped_preferences,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkPayload;
    use crate::tokens::WordEstimator;
    use chrono::Utc;
    use uuid::Uuid;

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(Arc::new(WordEstimator))
    }

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    fn session(pairs: usize, words_each: usize) -> Vec<Exchange> {
        (0..pairs)
            .flat_map(|_| {
                [
                    Exchange::user("s", words(words_each)),
                    Exchange::assistant("s", words(words_each)),
                ]
            })
            .collect()
    }

    fn chunk(text: &str, similarity: f32) -> RankedChunk {
        RankedChunk {
            id: Uuid::new_v4(),
            chunk: ChunkPayload {
                text: text.into(),
                created_at: Utc::now(),
                source_session: "old".into(),
                exchange_count: 2,
            },
            similarity,
        }
    }

    fn prefs() -> BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> {
        let mut map = BTreeMap::new();
        map.insert(
            PreferenceCategory::Communication,
            vec![PreferenceEntry {
                key: "communication_style".into(),
                value: crate::preferences::PreferenceValue::Text("concise".into()),
                confidence: 0.6,
                category: PreferenceCategory::Communication,
                last_updated: Utc::now(),
            }],
        );
        map
    }

    #[test]
    fn mandatory_pieces_over_budget_fail() {
        let result = assembler().assemble(&words(30), &[], &words(30), &[], &BTreeMap::new(), 50);
        assert!(matches!(
            result,
            Err(Error::BudgetExceeded {
                required: 60,
                budget: 50
            })
        ));
    }

    #[test]
    fn never_exceeds_budget() {
        let history = session(10, 7);
        let retrieved = vec![chunk(&words(20), 0.9), chunk(&words(5), 0.8)];
        for budget in [10, 25, 40, 77, 120, 400] {
            let prompt = assembler()
                .assemble(&words(5), &history, &words(5), &retrieved, &prefs(), budget)
                .unwrap();
            assert!(prompt.total_tokens <= budget, "budget {budget}");
            let sum: u32 = prompt.blocks.iter().map(|b| b.tokens).sum();
            assert_eq!(sum, prompt.total_tokens);
        }
    }

    #[test]
    fn history_fills_budget_before_chunks() {
        let history = session(3, 4);
        // system 2 + query 2 + history 24 = 28
        let retrieved = vec![chunk(&words(10), 0.95)];
        let prompt = assembler()
            .assemble(&words(2), &history, &words(2), &retrieved, &BTreeMap::new(), 30)
            .unwrap();

        assert_eq!(prompt.section(Section::History).count(), 6);
        assert_eq!(prompt.section(Section::Retrieved).count(), 0);
        assert_eq!(prompt.dropped_chunks, 1);
    }

    #[test]
    fn output_order_is_system_prefs_chunks_history_query() {
        let history = session(1, 2);
        let prompt = assembler()
            .assemble("sys", &history, "now?", &[chunk("old talk", 0.9)], &prefs(), 500)
            .unwrap();

        let sections: Vec<Section> = prompt.blocks.iter().map(|b| b.section).collect();
        assert_eq!(
            sections,
            vec![
                Section::System,
                Section::Preferences,
                Section::Retrieved,
                Section::History,
                Section::History,
                Section::Query,
            ]
        );
        assert_eq!(prompt.blocks[3].role, Role::User);
        assert_eq!(prompt.blocks.last().unwrap().content, "now?");
    }

    #[test]
    fn greedy_stops_at_first_overflow() {
        // Oldest pair is small, but a larger newer reply blocks it
        let history = vec![
            Exchange::user("s", words(1)),
            Exchange::assistant("s", words(1)),
            Exchange::user("s", words(1)),
            Exchange::assistant("s", words(10)),
        ];
        let prompt = assembler()
            .assemble("sys", &history, "q", &[], &BTreeMap::new(), 8)
            .unwrap();
        assert_eq!(prompt.section(Section::History).count(), 0);
        assert_eq!(prompt.dropped_history, 4);
    }

    #[test]
    fn orphaned_reply_is_dropped() {
        let history = vec![
            Exchange::user("s", words(6)),
            Exchange::assistant("s", words(2)),
            Exchange::user("s", words(2)),
            Exchange::assistant("s", words(2)),
        ];
        // 2 mandatory + 6 for the newest three; the oldest question does not fit
        let prompt = assembler()
            .assemble("sys", &history, "q", &[], &BTreeMap::new(), 8)
            .unwrap();

        let kept: Vec<Role> = prompt.section(Section::History).map(|b| b.role).collect();
        assert_eq!(kept, vec![Role::User, Role::Assistant]);
        assert_eq!(prompt.dropped_history, 2);
    }

    #[test]
    fn chunks_ordered_by_similarity() {
        let retrieved = vec![chunk("low", 0.4), chunk("high", 0.9)];
        let prompt = assembler()
            .assemble("sys", &[], "q", &retrieved, &BTreeMap::new(), 100)
            .unwrap();
        let texts: Vec<&str> = prompt.section(Section::Retrieved).map(|b| b.content.as_str()).collect();
        assert!(texts[0].ends_with("high"));
        assert!(texts[1].ends_with("low"));
    }

    fn many_prefs(n: usize) -> BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> {
        let entries = (0..n)
            .map(|i| PreferenceEntry {
                key: format!("habit_{i}"),
                value: crate::preferences::PreferenceValue::Text(format!("value number {i}")),
                confidence: 0.5 + i as f64 * 0.01,
                category: PreferenceCategory::Personal,
                last_updated: Utc::now(),
            })
            .collect();
        BTreeMap::from([(PreferenceCategory::Personal, entries)])
    }

    fn assert_declared_matches_content(counter: Arc<dyn TokenEstimator>) {
        let assembler = ContextAssembler::new(counter.clone());
        let prefs = many_prefs(8);

        let full = assembler
            .assemble("sys", &[], "q", &[], &prefs, 4000)
            .unwrap();
        for block in &full.blocks {
            assert_eq!(block.tokens, counter.count(&block.content), "{:?}", block.section);
        }

        // Every budget up to the full size: the recounted prompt still fits
        for budget in (full.total_tokens / 2)..=full.total_tokens {
            let prompt = assembler.assemble("sys", &[], "q", &[], &prefs, budget).unwrap();
            let recount: u32 = prompt.blocks.iter().map(|b| counter.count(&b.content)).sum();
            assert_eq!(recount, prompt.total_tokens);
            assert!(recount <= budget, "budget {budget}");
        }
    }

    #[test]
    fn preference_block_tokens_include_separators() {
        assert_declared_matches_content(Arc::new(crate::tokens::CharEstimator));
        assert_declared_matches_content(Arc::new(crate::tokens::TokenCounter::cl100k().unwrap()));
    }

    #[test]
    fn usage_splits_by_role() {
        let prompt = assembler()
            .assemble("be brief", &session(1, 3), "and now", &[], &BTreeMap::new(), 100)
            .unwrap();
        assert_eq!(prompt.usage.system, 2);
        assert_eq!(prompt.usage.user, 5);
        assert_eq!(prompt.usage.assistant, 3);
        tokio_test::assert_ok!(assembler().assemble("x", &[], "y", &[], &BTreeMap::new(), 2));
    }
}

//! Learned user-preference profile
//!
//! Detectors turn each completed turn into preference signals. A signal seen
//! for the first time enters at confidence 0.5; seeing it again, or a positive
//! outcome, grows confidence by 10% (capped at 1.0). Negative outcomes decay it
//! by 10%, and an entry that drops below 0.3 is forgotten.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

const INITIAL_CONFIDENCE: f64 = 0.5;
const GROWTH: f64 = 1.1;
const DECAY: f64 = 0.9;
const REMOVAL_THRESHOLD: f64 = 0.3;

/// Tool names picked up from user messages
const KNOWN_TOOLS: &[&str] = &[
    "git", "docker", "kubectl", "cargo", "npm", "pip", "make", "vim", "neovim", "vscode",
    "tmux", "terraform", "ansible", "curl", "jq", "bash", "zsh", "postgres", "sqlite", "redis",
];

const CODING_WORDS: &[&str] = &[
    "code", "function", "bug", "compile", "refactor", "implement", "snippet", "rust",
    "python", "javascript", "typescript",
];

const TOOL_WORDS: &[&str] = &["run", "install", "command", "terminal", "shell", "cli"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceCategory {
    Communication,
    Tools,
    CodingStyle,
    Personal,
}

impl std::fmt::Display for PreferenceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreferenceCategory::Communication => write!(f, "communication"),
            PreferenceCategory::Tools => write!(f, "tools"),
            PreferenceCategory::CodingStyle => write!(f, "coding_style"),
            PreferenceCategory::Personal => write!(f, "personal"),
        }
    }
}

impl PreferenceCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "communication" => Some(Self::Communication),
            "tools" => Some(Self::Tools),
            "coding_style" => Some(Self::CodingStyle),
            "personal" => Some(Self::Personal),
            _ => None,
        }
    }
}

/// A preference is either a single value or a set of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Text(String),
    List(Vec<String>),
}

impl std::fmt::Display for PreferenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreferenceValue::Text(text) => write!(f, "{}", text),
            PreferenceValue::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceEntry {
    pub key: String,
    pub value: PreferenceValue,
    pub confidence: f64,
    pub category: PreferenceCategory,
    pub last_updated: DateTime<Utc>,
}

impl PreferenceEntry {
    /// One prompt line, e.g. `preferred_tools: git, docker`
    pub fn render(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}

/// What a detector reports
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceSignal {
    pub key: String,
    pub value: PreferenceValue,
    pub category: PreferenceCategory,
}

impl PreferenceSignal {
    pub fn text(key: &str, value: impl Into<String>, category: PreferenceCategory) -> Self {
        Self {
            key: key.to_string(),
            value: PreferenceValue::Text(value.into()),
            category,
        }
    }
}

/// Kind of work the current query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    General,
    ToolUse,
    Coding,
}

impl TaskType {
    /// Guess the task type from the wording of a query
    pub fn infer(query: &str) -> Self {
        let lower = query.to_lowercase();
        if lower.contains("```") || words(&lower).any(|w| CODING_WORDS.contains(&w)) {
            TaskType::Coding
        } else if words(&lower).any(|w| TOOL_WORDS.contains(&w) || KNOWN_TOOLS.contains(&w)) {
            TaskType::ToolUse
        } else {
            TaskType::General
        }
    }

    /// Preference categories that matter for this kind of task
    pub fn facets(&self) -> &'static [PreferenceCategory] {
        use PreferenceCategory::*;
        match self {
            TaskType::General => &[Communication, Personal],
            TaskType::ToolUse => &[Communication, Personal, Tools],
            TaskType::Coding => &[Communication, Personal, Tools, CodingStyle],
        }
    }
}

/// A completed turn as seen by detectors
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub user_text: &'a str,
    pub assistant_text: &'a str,
    pub task: TaskType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Positive,
    Negative,
}

/// A mutation that still has to reach durable storage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreferenceChange {
    Upserted(PreferenceEntry),
    Removed { key: String },
}

pub type DetectorFn = dyn Fn(&Observation<'_>) -> Result<Option<PreferenceSignal>> + Send + Sync;

struct Detector {
    name: String,
    detect: Box<DetectorFn>,
}

/// Preference entries for one owner, plus the detectors that feed them
pub struct PreferenceStore {
    entries: HashMap<String, PreferenceEntry>,
    detectors: Vec<Detector>,
    changes: Vec<PreferenceChange>,
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceStore {
    /// Empty store with the built-in detectors registered
    pub fn new() -> Self {
        let mut store = Self::without_detectors();
        store.register("communication_style", detect_communication_style);
        store.register("preferred_tools", detect_preferred_tools);
        store.register("code_language", detect_code_language);
        store.register("name", detect_name);
        store.register("location", detect_location);
        store.register("age", detect_age);
        store.register("job", detect_job);
        store.register("origin", detect_origin);
        store.register("education", detect_education);
        store.register("goal", detect_goal);
        store.register("habits", detect_habits);
        store.register("avoids", detect_avoids);
        store
    }

    pub fn without_detectors() -> Self {
        Self {
            entries: HashMap::new(),
            detectors: Vec::new(),
            changes: Vec::new(),
        }
    }

    /// Restore persisted entries; restoring is not itself a change.
    pub fn from_entries(entries: impl IntoIterator<Item = PreferenceEntry>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            if entry.confidence >= REMOVAL_THRESHOLD {
                store.entries.insert(entry.key.clone(), entry);
            }
        }
        store
    }

    pub fn register<F>(&mut self, name: &str, detect: F)
    where
        F: Fn(&Observation<'_>) -> Result<Option<PreferenceSignal>> + Send + Sync + 'static,
    {
        self.detectors.push(Detector {
            name: name.to_string(),
            detect: Box::new(detect),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PreferenceEntry> {
        self.entries.get(key)
    }

    /// Run every detector over a completed turn; returns the keys touched.
    pub fn observe(&mut self, user_text: &str, assistant_text: &str, task: TaskType) -> Vec<String> {
        let observation = Observation {
            user_text,
            assistant_text,
            task,
        };

        let mut signals = Vec::new();
        for detector in &self.detectors {
            match catch_unwind(AssertUnwindSafe(|| (detector.detect)(&observation))) {
                Ok(Ok(Some(signal))) => signals.push(signal),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(detector = %detector.name, error = %e, "Preference detector failed"),
                Err(_) => warn!(detector = %detector.name, "Preference detector panicked"),
            }
        }

        signals
            .into_iter()
            .map(|signal| {
                let key = signal.key.clone();
                self.apply(signal);
                key
            })
            .collect()
    }

    /// Adjust confidence after an outcome; returns the new confidence.
    ///
    /// An entry that falls below the removal threshold is deleted, so a
    /// returned value under 0.3 means the key is gone.
    pub fn reinforce(&mut self, key: &str, outcome: Outcome) -> Option<f64> {
        let entry = self.entries.get_mut(key)?;
        entry.confidence = match outcome {
            Outcome::Positive => (entry.confidence * GROWTH).min(1.0),
            Outcome::Negative => entry.confidence * DECAY,
        };
        entry.last_updated = Utc::now();
        let confidence = entry.confidence;

        if confidence < REMOVAL_THRESHOLD {
            self.entries.remove(key);
            debug!(key, confidence, "Preference forgotten");
            self.changes.push(PreferenceChange::Removed {
                key: key.to_string(),
            });
        } else {
            let snapshot = entry.clone();
            self.changes.push(PreferenceChange::Upserted(snapshot));
        }
        Some(confidence)
    }

    /// Entries whose category is a facet of `task`, most confident first
    pub fn relevant(&self, task: TaskType) -> BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> {
        let facets = task.facets();
        let mut grouped: BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> = BTreeMap::new();

        for entry in self.entries.values() {
            if entry.confidence >= REMOVAL_THRESHOLD && facets.contains(&entry.category) {
                grouped.entry(entry.category).or_default().push(entry.clone());
            }
        }
        for entries in grouped.values_mut() {
            entries.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then_with(|| a.key.cmp(&b.key))
            });
        }
        grouped
    }

    /// Every entry grouped by category
    pub fn profile(&self) -> BTreeMap<PreferenceCategory, Vec<PreferenceEntry>> {
        self.relevant(TaskType::Coding)
    }

    /// Drain mutations not yet handed to persistence
    pub fn take_changes(&mut self) -> Vec<PreferenceChange> {
        std::mem::take(&mut self.changes)
    }

    fn apply(&mut self, signal: PreferenceSignal) {
        let now = Utc::now();
        let snapshot = match self.entries.get_mut(&signal.key) {
            Some(entry) => {
                let replacement = match (&mut entry.value, signal.value) {
                    (PreferenceValue::Text(current), PreferenceValue::Text(seen))
                        if *current == seen =>
                    {
                        None
                    }
                    (PreferenceValue::List(current), PreferenceValue::List(seen)) => {
                        for item in seen {
                            if !current.contains(&item) {
                                current.push(item);
                            }
                        }
                        None
                    }
                    (_, replacement) => Some(replacement),
                };
                match replacement {
                    // New belief supersedes the old one
                    Some(value) => {
                        entry.value = value;
                        entry.confidence = INITIAL_CONFIDENCE;
                    }
                    None => entry.confidence = (entry.confidence * GROWTH).min(1.0),
                }
                entry.category = signal.category;
                entry.last_updated = now;
                entry.clone()
            }
            None => {
                debug!(key = %signal.key, "New preference");
                let entry = PreferenceEntry {
                    key: signal.key.clone(),
                    value: signal.value,
                    confidence: INITIAL_CONFIDENCE,
                    category: signal.category,
                    last_updated: now,
                };
                self.entries.insert(signal.key, entry.clone());
                entry
            }
        };
        self.changes.push(PreferenceChange::Upserted(snapshot));
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '+'))
        .filter(|w| !w.is_empty())
}

fn detect_communication_style(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    let count = obs.user_text.split_whitespace().count();
    let style = match count {
        0 => return Ok(None),
        1..=12 => "concise",
        n if n >= 80 => "detailed",
        _ => return Ok(None),
    };
    Ok(Some(PreferenceSignal::text(
        "communication_style",
        style,
        PreferenceCategory::Communication,
    )))
}

fn detect_preferred_tools(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    let lower = obs.user_text.to_lowercase();
    let mut tools: Vec<String> = Vec::new();
    for word in words(&lower) {
        if KNOWN_TOOLS.contains(&word) && !tools.iter().any(|t| t == word) {
            tools.push(word.to_string());
        }
    }
    if tools.is_empty() {
        return Ok(None);
    }
    Ok(Some(PreferenceSignal {
        key: "preferred_tools".into(),
        value: PreferenceValue::List(tools),
        category: PreferenceCategory::Tools,
    }))
}

fn detect_code_language(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut inside = false;

    for line in obs.assistant_text.lines() {
        let Some(rest) = line.trim_start().strip_prefix("```") else {
            continue;
        };
        if inside {
            inside = false;
            continue;
        }
        inside = true;

        let tag = rest.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        match counts.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, n)) => *n += 1,
            None => counts.push((tag, 1)),
        }
    }

    // Earliest tag wins a tie
    let mut best: Option<(String, usize)> = None;
    for (tag, n) in counts {
        if best.as_ref().map_or(true, |(_, m)| n > *m) {
            best = Some((tag, n));
        }
    }

    Ok(best.map(|(tag, _)| {
        PreferenceSignal::text("code_language", tag, PreferenceCategory::CodingStyle)
    }))
}

/// Words that may open a clause without punctuation before them
const CLAUSE_JOINERS: &[&str] = &["and", "but", "so", "also", "actually", "well", "oh"];

/// Time words trimmed from the end of an extracted value
const TRAILING_FILLER: &[&str] = &["right now", "these days", "nowadays", "recently", "lately"];

/// Whether byte offset `at` of `lower` starts a sentence or clause
fn opens_clause(lower: &str, at: usize) -> bool {
    let before = lower[..at].trim_end();
    match before.chars().last() {
        None => true,
        Some('.' | '!' | '?' | ',' | ';' | ':' | '(') => true,
        Some(_) => before
            .rsplit(|c: char| !c.is_alphabetic())
            .next()
            .is_some_and(|word| CLAUSE_JOINERS.contains(&word)),
    }
}

/// Text after each clause-opening occurrence of any phrase, earliest first
fn phrase_tails<'a>(text: &'a str, phrases: &[&str]) -> Vec<&'a str> {
    let lowered = text.to_ascii_lowercase();
    let lower = lowered.as_str();
    let mut starts: Vec<usize> = phrases
        .iter()
        .flat_map(move |phrase| {
            lower
                .match_indices(*phrase)
                .filter(move |(at, _)| opens_clause(lower, *at))
                .map(move |(at, _)| at + phrase.len())
        })
        .collect();
    starts.sort_unstable();
    starts.dedup();
    starts.into_iter().map(|start| &text[start..]).collect()
}

fn after_phrase<'a>(text: &'a str, phrases: &[&str]) -> Option<&'a str> {
    phrase_tails(text, phrases).into_iter().next()
}

/// The clause that follows a phrase, without a leading article or trailing
/// time words
fn clause_value(rest: &str) -> Option<String> {
    let clause = rest
        .split(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | '\n'))
        .next()
        .unwrap_or("")
        .trim();

    let lower = clause.to_ascii_lowercase();
    let mut value = clause;
    for article in ["a ", "an ", "the "] {
        if lower.starts_with(article) {
            value = value[article.len()..].trim_start();
            break;
        }
    }
    let lower = value.to_ascii_lowercase();
    for filler in TRAILING_FILLER {
        if let Some(head) = lower.strip_suffix(filler) {
            if head.is_empty() || head.ends_with(' ') {
                value = value[..head.len()].trim_end();
                break;
            }
        }
    }

    (2..=60).contains(&value.len()).then(|| value.to_string())
}

fn personal_fact(
    obs: &Observation<'_>,
    key: &str,
    phrases: &[&str],
) -> Result<Option<PreferenceSignal>> {
    Ok(after_phrase(obs.user_text, phrases)
        .and_then(clause_value)
        .map(|value| PreferenceSignal::text(key, value, PreferenceCategory::Personal)))
}

fn personal_list(
    obs: &Observation<'_>,
    key: &str,
    phrases: &[&str],
) -> Result<Option<PreferenceSignal>> {
    let items: Vec<String> = phrase_tails(obs.user_text, phrases)
        .into_iter()
        .filter_map(clause_value)
        .collect();
    if items.is_empty() {
        return Ok(None);
    }
    Ok(Some(PreferenceSignal {
        key: key.to_string(),
        value: PreferenceValue::List(items),
        category: PreferenceCategory::Personal,
    }))
}

fn detect_name(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    let Some(rest) = after_phrase(obs.user_text, &["my name is ", "call me "]) else {
        return Ok(None);
    };
    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic() || *c == '-' || *c == '\'')
        .collect();
    // Names are written capitalized; "call me back" is not a name
    if name.chars().count() < 2 || !name.starts_with(char::is_uppercase) {
        return Ok(None);
    }
    Ok(Some(PreferenceSignal::text(
        "name",
        name,
        PreferenceCategory::Personal,
    )))
}

fn detect_location(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_fact(obs, "location", &["i live in "])
}

fn detect_age(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    for rest in phrase_tails(obs.user_text, &["i'm ", "i am "]) {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let after = rest[digits.len()..].to_ascii_lowercase();
        if !(after.starts_with(" years old") || after.starts_with(" year old")) {
            continue;
        }
        if let Ok(age @ 1..=120) = digits.parse::<u32>() {
            return Ok(Some(PreferenceSignal::text(
                "age",
                age.to_string(),
                PreferenceCategory::Personal,
            )));
        }
    }
    Ok(None)
}

fn detect_job(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_fact(obs, "job", &["i work as ", "my job is ", "my role is "])
}

fn detect_origin(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_fact(obs, "origin", &["i'm from ", "i am from ", "i come from "])
}

fn detect_education(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_fact(
        obs,
        "education",
        &["i study ", "i'm studying ", "i am studying ", "i major in "],
    )
}

fn detect_goal(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_fact(
        obs,
        "goal",
        &[
            "my goal is to ",
            "i want to ",
            "i'm trying to ",
            "i am trying to ",
            "i hope to ",
            "i plan to ",
        ],
    )
}

fn detect_habits(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_list(
        obs,
        "habits",
        &["i usually ", "i often ", "i always ", "i tend to "],
    )
}

fn detect_avoids(obs: &Observation<'_>) -> Result<Option<PreferenceSignal>> {
    personal_list(obs, "avoids", &["i never "])
}

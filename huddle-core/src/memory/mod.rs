//! Scoped memory stores, lexical prefilter, optional AI rerank, and context injection (§4.6).
//!
//! Grounded in `original_source/huddle_chat/repositories/memory_repository.py` (scoped
//! JSONL stores, append-only writes) and `original_source/huddle_chat/services/memory_service.py`
//! (`select_for_prompt`'s scoring weights and rerank fallback contract). The store split
//! mirrors the teacher's `Store` trait (`InMemoryStore` vs `SqliteStore`): [`JsonlMemoryStore`]
//! is the production, file-backed implementation; tests substitute a `Vec`-backed fixture.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::ai::provider::{AiProvider, CompletionRequest};
use crate::error::HuddleError;
use crate::model::MemoryEntry;

pub const RERANK_FALLBACK_WARNING: &str = "Memory rerank unavailable; using lexical memory selection.";
const PREFILTER_TOP_N: usize = 25;
const RERANK_TOP_N: usize = 5;
const CONTEXT_BLOCK_MAX_CHARS: usize = 2400;
const SUMMARY_MAX_CHARS: usize = 220;
const SOURCE_MAX_CHARS: usize = 80;
const DUPLICATE_SIMILARITY_THRESHOLD: f64 = 0.80;

/// Scoped, append-only store of [`MemoryEntry`] rows (§4.6.1 supplemental).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Loads all entries for one scope, skipping malformed rows (§4.6 Load).
    async fn load_scope(&self, scope: &str) -> Result<Vec<MemoryEntry>, HuddleError>;

    /// Appends one entry to the scope-matching backing store (§4.6 Draft+confirm).
    async fn append(&self, entry: &MemoryEntry) -> Result<(), HuddleError>;
}

/// File-backed [`MemoryStore`] over the scope→path mapping from §6's filesystem layout.
pub struct JsonlMemoryStore {
    storage: std::sync::Arc<crate::storage::Storage>,
    scope_paths: HashMap<String, std::path::PathBuf>,
}

impl JsonlMemoryStore {
    /// `scope_paths` maps scope name (`private`, `repo`, `team`) to its backing JSONL file,
    /// per §6 (`memory/global.jsonl` for team, `.local_chat/memory/{private,repo}.jsonl`).
    pub fn new(storage: std::sync::Arc<crate::storage::Storage>, scope_paths: HashMap<String, std::path::PathBuf>) -> Self {
        Self { storage, scope_paths }
    }
}

#[async_trait]
impl MemoryStore for JsonlMemoryStore {
    async fn load_scope(&self, scope: &str) -> Result<Vec<MemoryEntry>, HuddleError> {
        let Some(path) = self.scope_paths.get(scope) else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        let entries = content
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str::<MemoryEntry>(trimmed).ok()
            })
            .collect();
        Ok(entries)
    }

    async fn append(&self, entry: &MemoryEntry) -> Result<(), HuddleError> {
        let path = self
            .scope_paths
            .get(&entry.scope)
            .cloned()
            .ok_or_else(|| HuddleError::ValidationError(format!("unknown memory scope '{}'", entry.scope)))?;
        let row = serde_json::to_value(entry)?;
        self.storage.append_jsonl(&path, &row).await?;
        Ok(())
    }
}

/// In-memory fixture store for tests (§4.6.1 supplemental: "tests substitute an in-memory
/// `Vec`-backed fixture store").
#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: tokio::sync::Mutex<Vec<MemoryEntry>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(entries: Vec<MemoryEntry>) -> Self {
        Self { entries: tokio::sync::Mutex::new(entries) }
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn load_scope(&self, scope: &str) -> Result<Vec<MemoryEntry>, HuddleError> {
        Ok(self.entries.lock().await.iter().filter(|e| e.scope == scope).cloned().collect())
    }

    async fn append(&self, entry: &MemoryEntry) -> Result<(), HuddleError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .map(|tok| tok.to_ascii_lowercase())
        .filter(|tok| tok.len() >= 2)
        .collect()
}

fn confidence_boost(confidence: &str) -> f64 {
    match confidence {
        "high" => 0.4,
        "med" => 0.15,
        _ => 0.0,
    }
}

#[derive(Debug, Clone)]
struct ScoredEntry {
    entry: MemoryEntry,
    score: f64,
}

/// Lexical prefilter over `candidates` against `prompt` (§4.6 Prefilter). Returns the top
/// [`PREFILTER_TOP_N`] sorted by (score desc, confidence=high first, ts desc).
fn prefilter(prompt: &str, candidates: Vec<MemoryEntry>) -> Vec<ScoredEntry> {
    let prompt_tokens = tokenize(prompt);
    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .map(|entry| {
            let summary_tokens = tokenize(&entry.summary);
            let topic_tokens = tokenize(&entry.topic);
            let tag_tokens: HashSet<String> = entry.tags.iter().flat_map(|t| tokenize(t)).collect();
            let source_tokens = tokenize(&entry.source);

            let score = 2.2 * prompt_tokens.intersection(&summary_tokens).count() as f64
                + 1.6 * prompt_tokens.intersection(&topic_tokens).count() as f64
                + 1.1 * prompt_tokens.intersection(&tag_tokens).count() as f64
                + 0.4 * prompt_tokens.intersection(&source_tokens).count() as f64
                + confidence_boost(&entry.confidence)
                + if entry.ts.is_empty() { 0.0 } else { 0.05 };

            ScoredEntry { entry, score }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| confidence_rank(&b.entry.confidence).cmp(&confidence_rank(&a.entry.confidence)))
            .then_with(|| b.entry.ts.cmp(&a.entry.ts))
    });
    scored.truncate(PREFILTER_TOP_N);
    scored
}

fn confidence_rank(confidence: &str) -> u8 {
    match confidence {
        "high" => 2,
        "med" => 1,
        _ => 0,
    }
}

/// Result of [`select_for_prompt`]: the selected entries plus an optional fallback warning.
#[derive(Debug, Clone)]
pub struct MemorySelection {
    pub entries: Vec<MemoryEntry>,
    pub warning: Option<String>,
}

/// Selects up to [`RERANK_TOP_N`] memory entries for prompt injection (§4.6).
///
/// Loads every requested scope, lexically prefilters to [`PREFILTER_TOP_N`] candidates, then
/// optionally asks `rerank_provider` for a strict-JSON `{"ids":[...]}` reordering limited to
/// the candidate set. Any rerank failure (call error, invalid JSON, empty/unknown ids) falls
/// back to the lexical order and surfaces [`RERANK_FALLBACK_WARNING`] (§8 property 9).
pub async fn select_for_prompt(
    store: &dyn MemoryStore,
    prompt: &str,
    scopes: &[String],
    rerank_provider: Option<&dyn AiProvider>,
    rerank_model: &str,
) -> Result<MemorySelection, HuddleError> {
    let mut candidates = Vec::new();
    for scope in scopes {
        candidates.extend(store.load_scope(scope).await?);
    }
    let prefiltered = prefilter(prompt, candidates);

    if prefiltered.is_empty() {
        return Ok(MemorySelection { entries: Vec::new(), warning: None });
    }

    let Some(provider) = rerank_provider else {
        let entries = prefiltered.into_iter().take(RERANK_TOP_N).map(|s| s.entry).collect();
        return Ok(MemorySelection { entries, warning: None });
    };

    match rerank(provider, rerank_model, prompt, &prefiltered).await {
        Some(ordered_ids) => {
            let by_id: HashMap<&str, &MemoryEntry> = prefiltered.iter().map(|s| (s.entry.id.as_str(), &s.entry)).collect();
            let reranked: Vec<MemoryEntry> = ordered_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).map(|e| (*e).clone()))
                .take(RERANK_TOP_N)
                .collect();
            if reranked.is_empty() {
                let entries = prefiltered.into_iter().take(RERANK_TOP_N).map(|s| s.entry).collect();
                Ok(MemorySelection { entries, warning: Some(RERANK_FALLBACK_WARNING.to_string()) })
            } else {
                Ok(MemorySelection { entries: reranked, warning: None })
            }
        }
        None => {
            let entries = prefiltered.into_iter().take(RERANK_TOP_N).map(|s| s.entry).collect();
            Ok(MemorySelection { entries, warning: Some(RERANK_FALLBACK_WARNING.to_string()) })
        }
    }
}

/// Asks the rerank provider for `{"ids":[...]}` over the candidate set. Returns `None` on
/// any failure to parse or reach the provider — never propagates the error, since a rerank
/// failure is an expected, locally-recovered condition (§8 property 9).
async fn rerank(provider: &dyn AiProvider, model: &str, prompt: &str, candidates: &[ScoredEntry]) -> Option<Vec<String>> {
    let catalog: Vec<serde_json::Value> = candidates
        .iter()
        .map(|s| serde_json::json!({"id": s.entry.id, "topic": s.entry.topic, "summary": s.entry.summary}))
        .collect();
    let rerank_prompt = format!(
        "Given the user prompt and candidate memory entries, return strict JSON {{\"ids\":[...]}} \
         ordering the most relevant entry ids first. Only use ids from the candidate list.\n\nPrompt: {prompt}\n\nCandidates: {}",
        serde_json::Value::Array(catalog)
    );

    let outcome = provider
        .complete(CompletionRequest { prompt: rerank_prompt, model: model.to_string(), system_prompt: String::new(), streaming: false })
        .await
        .ok()?;

    let parsed = extract_json_object(&outcome.text)?;
    let ids = parsed.get("ids")?.as_array()?;
    let valid_ids: HashSet<&str> = candidates.iter().map(|s| s.entry.id.as_str()).collect();
    let filtered: Vec<String> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|id| valid_ids.contains(id))
        .map(|s| s.to_string())
        .collect();
    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

/// Leniently extracts the first top-level JSON object from `text`, tolerating surrounding
/// prose (§4.5 "parse leniently (accept JSON-in-text)").
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Builds the context block injected ahead of the provider prompt (§4.6 Context block):
/// one line per entry, bounded to [`CONTEXT_BLOCK_MAX_CHARS`] total, never truncating a
/// field mid-way — a line that would overflow the budget is dropped whole.
pub fn build_context_block(entries: &[MemoryEntry]) -> String {
    let mut lines = Vec::new();
    let mut total = 0usize;
    for entry in entries {
        let summary = truncate_chars(&entry.summary, SUMMARY_MAX_CHARS);
        let source = truncate_chars(&entry.source, SOURCE_MAX_CHARS);
        let line = format!("- {} | topic={} | confidence={} | summary={} | source={}", entry.id, entry.topic, entry.confidence, summary, source);
        let added = line.len() + 1;
        if total + added > CONTEXT_BLOCK_MAX_CHARS {
            break;
        }
        total += added;
        lines.push(line);
    }
    lines.join("\n")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// A draft memory entry awaiting confirmation (§4.6 Draft+confirm).
#[derive(Debug, Clone, Default)]
pub struct MemoryDraft {
    pub summary: String,
    pub topic: String,
    pub confidence: String,
    pub source: String,
    pub scope: String,
}

impl MemoryDraft {
    /// A confirmable draft requires a non-empty summary and source and a recognized
    /// confidence tag (§4.6 Draft+confirm).
    pub fn is_confirmable(&self) -> bool {
        !self.summary.trim().is_empty()
            && !self.source.trim().is_empty()
            && matches!(self.confidence.as_str(), "low" | "med" | "high")
    }
}

/// Token-overlap ratio: |A∩B| / max(|A|,|B|), 0 when both are empty.
fn token_overlap_ratio(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let denom = a.len().max(b.len());
    if denom == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / denom as f64
}

/// difflib-style character-sequence similarity ratio in `[0, 1]`, via longest-common-subsequence
/// length over combined length — close enough to Python's `SequenceMatcher.ratio()` for the
/// threshold check this gates (§4.6 Draft+confirm).
fn sequence_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let lcs = longest_common_subsequence(&a_chars, &b_chars);
    (2.0 * lcs as f64) / (a_chars.len() + b_chars.len()) as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ai in a {
        for (j, bj) in b.iter().enumerate() {
            curr[j + 1] = if ai == bj { prev[j] + 1 } else { prev[j + 1].max(curr[j]) };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Duplicate detection for `/memory add` (§4.6 Draft+confirm): combines difflib-style summary
/// similarity with a token-overlap ratio and a small topic-match bonus, against
/// [`DUPLICATE_SIMILARITY_THRESHOLD`].
pub fn is_probable_duplicate(draft: &MemoryDraft, existing: &MemoryEntry) -> bool {
    let similarity = sequence_similarity(&draft.summary, &existing.summary);
    let overlap = token_overlap_ratio(&tokenize(&draft.summary), &tokenize(&existing.summary));
    let topic_bonus = if !draft.topic.is_empty() && draft.topic.eq_ignore_ascii_case(&existing.topic) { 0.1 } else { 0.0 };
    let combined = (0.6 * similarity + 0.4 * overlap + topic_bonus).min(1.0);
    combined >= DUPLICATE_SIMILARITY_THRESHOLD
}

//! Single-active-request AI state machine and execution worker (§4.5).
//!
//! Grounded in `original_source/huddle_chat/services/ai_service.py` (the singleton guard,
//! the transient-retry/cancel contract, the `--act` second-call shape) and the teacher's
//! mutex-guarded process-context-scoped state (§9 design note: "global mutable state is
//! scoped to a single process context object").

pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::HuddleError;
use crate::memory::{self, MemoryStore};
use crate::model::Event;
use crate::storage::Storage;
use provider::{AiProvider, CompletionRequest};

/// Delay before the one transient-error retry (§4.5 Execution worker step 3).
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(1200);

/// In-flight state for the single active AI request (§3 AIRequestState).
#[derive(Debug, Clone)]
pub struct AIRequestState {
    pub request_id: String,
    pub started_at: String,
    pub provider: String,
    pub model: String,
    pub scope: Option<String>,
    pub room: String,
    pub retry_count: u32,
    pub preview_text: String,
}

/// Mutex-guarded singleton enforcing "at most one active AI request per process"
/// (§3 invariant, §8 invariant 4).
#[derive(Default)]
pub struct AIRequestSlot {
    state: Mutex<Option<AIRequestState>>,
    cancel_flag: std::sync::atomic::AtomicBool,
}

impl AIRequestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the slot, returning a fresh 10-hex request id, or `None` if a request is
    /// already active (§4.5 `start`, §8 invariant 4).
    pub async fn start(&self, provider: &str, model: &str, room: &str, scope: Option<String>, started_at: &str) -> Option<String> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return None;
        }
        let request_id = uuid::Uuid::new_v4().simple().to_string()[..10].to_string();
        self.cancel_flag.store(false, std::sync::atomic::Ordering::SeqCst);
        *guard = Some(AIRequestState {
            request_id: request_id.clone(),
            started_at: started_at.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            scope,
            room: room.to_string(),
            retry_count: 0,
            preview_text: String::new(),
        });
        Some(request_id)
    }

    /// Sets the cancel flag; the worker observes it at its next suspension point (§4.5 `cancel`).
    pub fn cancel(&self) {
        self.cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Releases the slot if `request_id` matches the active request; no-op otherwise
    /// (§4.5 `clear`).
    pub async fn clear(&self, request_id: &str) {
        let mut guard = self.state.lock().await;
        if guard.as_ref().map(|s| s.request_id.as_str()) == Some(request_id) {
            *guard = None;
        }
    }

    pub async fn status(&self) -> Option<AIRequestState> {
        self.state.lock().await.clone()
    }

    pub async fn set_preview(&self, request_id: &str, text: &str) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            if state.request_id == request_id {
                state.preview_text = text.to_string();
            }
        }
    }
}

/// Whether a provider error is the transient kind eligible for the single retry
/// (§4.5 step 3: "HTTP 429 / 5xx / timeout / temporarily unavailable").
fn is_transient(error: &HuddleError) -> bool {
    matches!(error, HuddleError::ProviderTransient(_) | HuddleError::Timeout(_))
}

/// A proposed tool action parsed from the `--act` second call (§4.5 step 4).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProposedAction {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub summary: String,
}

/// The strict-JSON contract asked of the provider on the `--act` second call.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ActResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub proposed_actions: Vec<ProposedAction>,
}

/// Leniently extracts `{answer, proposed_actions[]}` from provider text that may carry
/// surrounding prose (§4.5 step 4: "parse leniently (accept JSON-in-text)").
fn parse_act_response(text: &str) -> Option<ActResponse> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Inputs for one execution-worker run (§4.5 Execution worker).
pub struct ExecutionRequest {
    pub room: String,
    pub author: String,
    pub prompt: String,
    pub provider_name: String,
    pub model: String,
    pub memory_enabled: bool,
    pub memory_scopes: Vec<String>,
    pub act: bool,
    pub now_iso: String,
}

/// Outcome of a successful (non-cancelled) execution-worker run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub response_text: String,
    pub memory_ids_used: Vec<String>,
    pub memory_topics_used: Vec<String>,
    pub proposed_actions: Vec<ProposedAction>,
}

/// Runs one AI request end-to-end against `provider` (§4.5 Execution worker, steps 1–6).
///
/// Persists `ai_prompt` before calling out, retries once on a transient provider error,
/// honors `slot`'s cancel flag at every suspension point, and — unless cancelled — persists
/// `ai_response` with citation fields. Returns `Ok(None)` when the request was cancelled
/// (caller is responsible for appending the "cancelled" system row, per §8 invariant 5,
/// scenario D2, so the two writes stay visibly sequenced in tests).
pub async fn run_execution(
    storage: &Storage,
    slot: &AIRequestSlot,
    request_id: &str,
    memory_store: Option<&dyn MemoryStore>,
    rerank_provider: Option<&dyn AiProvider>,
    rerank_model: &str,
    provider: &dyn AiProvider,
    request: ExecutionRequest,
) -> Result<Option<ExecutionOutcome>, HuddleError> {
    let prompt_event = Event {
        request_id: Some(request_id.to_string()),
        ..Event::new("ai_prompt", &request.author, &request.prompt, &request.now_iso)
    };
    storage.append_event(&request.room, &prompt_event).await?;

    if slot.is_cancelled() {
        return Ok(None);
    }

    let (context_block, memory_ids, memory_topics, warning) = if request.memory_enabled {
        if let Some(store) = memory_store {
            let selection = memory::select_for_prompt(store, &request.prompt, &request.memory_scopes, rerank_provider, rerank_model).await?;
            let ids: Vec<String> = selection.entries.iter().map(|e| e.id.clone()).collect();
            let topics: Vec<String> = selection.entries.iter().map(|e| e.topic.clone()).collect();
            (memory::build_context_block(&selection.entries), ids, topics, selection.warning)
        } else {
            (String::new(), Vec::new(), Vec::new(), None)
        }
    } else {
        (String::new(), Vec::new(), Vec::new(), None)
    };

    let effective_prompt = if context_block.is_empty() { request.prompt.clone() } else { format!("{context_block}\n\n{}", request.prompt) };

    if slot.is_cancelled() {
        return Ok(None);
    }

    let completion_request = CompletionRequest { prompt: effective_prompt.clone(), model: request.model.clone(), system_prompt: String::new(), streaming: false };
    let first_attempt = provider.complete(completion_request.clone()).await;

    let outcome = match first_attempt {
        Ok(outcome) => outcome,
        Err(e) if is_transient(&e) => {
            tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
            if slot.is_cancelled() {
                return Ok(None);
            }
            provider.complete(completion_request).await?
        }
        Err(e) => return Err(e),
    };

    if slot.is_cancelled() {
        return Ok(None);
    }

    let mut proposed_actions = Vec::new();
    let mut response_text = outcome.text;

    if request.act {
        let act_prompt = format!(
            "{effective_prompt}\n\nRespond with strict JSON only: {{\"answer\": <string>, \"proposed_actions\": [{{\"tool\": <string>, \"arguments\": <object>, \"summary\": <string>}}]}}"
        );
        let act_request = CompletionRequest { prompt: act_prompt, model: request.model.clone(), system_prompt: String::new(), streaming: false };
        let act_outcome = provider.complete(act_request).await?;

        if slot.is_cancelled() {
            return Ok(None);
        }

        if let Some(parsed) = parse_act_response(&act_outcome.text) {
            response_text = parsed.answer;
            proposed_actions = parsed.proposed_actions;
        } else {
            response_text = act_outcome.text;
        }
    }

    let response_event = Event {
        provider: Some(request.provider_name.clone()),
        model: Some(request.model.clone()),
        request_id: Some(request_id.to_string()),
        memory_ids_used: memory_ids.clone(),
        memory_topics_used: memory_topics.clone(),
        ..Event::new("ai_response", "assistant", &response_text, &request.now_iso)
    };
    storage.append_event(&request.room, &response_event).await?;

    if let Some(warning) = warning {
        let warning_event = Event::new("system", "system", warning, &request.now_iso);
        storage.append_event(&request.room, &warning_event).await?;
    }
    if !memory_ids.is_empty() {
        let note = format!("Memory used: {}", memory_ids.join(", "));
        let note_event = Event::new("system", "system", note, &request.now_iso);
        storage.append_event(&request.room, &note_event).await?;
    }

    Ok(Some(ExecutionOutcome { response_text, memory_ids_used: memory_ids, memory_topics_used: memory_topics, proposed_actions }))
}

/// Appends the cancellation system row (§4.5 Cancellation contract, §8 invariant 5,
/// scenario D2). Callers invoke this after [`run_execution`] returns `Ok(None)`.
pub async fn append_cancelled_row(storage: &Storage, room: &str, now_iso: &str) -> Result<(), HuddleError> {
    let event = Event::new("system", "system", "AI request cancelled.", now_iso);
    storage.append_event(room, &event).await?;
    Ok(())
}

/// Owning handle bundling the slot with an `Arc<Storage>`, used by controller glue to spawn
/// a detached worker per `/ai` invocation while still observing cancellation (§5 Scheduling
/// model: "AI worker thread per active request").
pub struct AiLifecycle {
    pub slot: Arc<AIRequestSlot>,
    pub storage: Arc<Storage>,
}

impl AiLifecycle {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { slot: Arc::new(AIRequestSlot::new()), storage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMemoryStore;
    use provider::MockProvider;

    /// **Scenario (§8 invariant 4)**: a second `start` while one is active returns `None`.
    #[tokio::test]
    async fn start_is_singleton() {
        let slot = AIRequestSlot::new();
        let first = slot.start("mock", "m", "general", None, "ts").await;
        assert!(first.is_some());
        let second = slot.start("mock", "m", "general", None, "ts").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn clear_releases_slot_for_matching_id_only() {
        let slot = AIRequestSlot::new();
        let id = slot.start("mock", "m", "general", None, "ts").await.unwrap();
        slot.clear("not-the-id").await;
        assert!(slot.status().await.is_some());
        slot.clear(&id).await;
        assert!(slot.status().await.is_none());
    }

    /// **Scenario B1**: `--no-memory` yields two rows (`ai_prompt` then `ai_response`) with
    /// empty `memory_ids_used`.
    #[tokio::test]
    async fn execution_without_memory_persists_prompt_then_response() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let slot = AIRequestSlot::new();
        let provider = MockProvider::fixed("hi");

        let outcome = run_execution(
            &storage,
            &slot,
            "req0000001",
            None,
            None,
            "",
            &provider,
            ExecutionRequest {
                room: "general".into(),
                author: "alice".into(),
                prompt: "hello".into(),
                provider_name: "mock".into(),
                model: "m".into(),
                memory_enabled: false,
                memory_scopes: vec![],
                act: false,
                now_iso: "2026-01-01T00:00:00".into(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome.response_text, "hi");
        assert!(outcome.memory_ids_used.is_empty());

        let events = storage.read_recent("general", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "ai_prompt");
        assert_eq!(events[0].text, "hello");
        assert_eq!(events[1].kind, "ai_response");
        assert_eq!(events[1].text, "hi");
    }

    /// **Scenario B2**: memory is selected and cited via `memory_ids_used` and a system row.
    #[tokio::test]
    async fn execution_with_memory_cites_selected_entries() {
        use crate::model::MemoryEntry;

        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let slot = AIRequestSlot::new();
        let provider = MockProvider::fixed("hi");
        let memory_store = InMemoryMemoryStore::seed(vec![MemoryEntry {
            id: "mem_1".into(),
            ts: "2026-01-01T00:00:00".into(),
            author: "alice".into(),
            summary: "use runbook A for deploy failures".into(),
            topic: "deploy".into(),
            confidence: "high".into(),
            source: "runbook".into(),
            room: "general".into(),
            origin_event_ref: String::new(),
            tags: vec![],
            scope: "team".into(),
        }]);

        let outcome = run_execution(
            &storage,
            &slot,
            "req0000002",
            Some(&memory_store),
            None,
            "",
            &provider,
            ExecutionRequest {
                room: "general".into(),
                author: "alice".into(),
                prompt: "deploy runbook help".into(),
                provider_name: "mock".into(),
                model: "m".into(),
                memory_enabled: true,
                memory_scopes: vec!["team".into()],
                act: false,
                now_iso: "2026-01-01T00:00:00".into(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome.memory_ids_used, vec!["mem_1".to_string()]);
        let events = storage.read_recent("general", 10).unwrap();
        assert!(events.iter().any(|e| e.kind == "system" && e.text.contains("Memory used: mem_1")));
    }

    /// **Scenario (§8 invariant 5, scenario D2)**: a cancel observed before the response is
    /// persisted means no `ai_response` row is written.
    #[tokio::test]
    async fn cancel_before_response_skips_persisting_response() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let slot = AIRequestSlot::new();
        slot.start("mock", "m", "general", None, "ts").await;
        slot.cancel();
        let provider = MockProvider::fixed("hi");

        let outcome = run_execution(
            &storage,
            &slot,
            "req0000003",
            None,
            None,
            "",
            &provider,
            ExecutionRequest {
                room: "general".into(),
                author: "alice".into(),
                prompt: "hello".into(),
                provider_name: "mock".into(),
                model: "m".into(),
                memory_enabled: false,
                memory_scopes: vec![],
                act: false,
                now_iso: "2026-01-01T00:00:00".into(),
            },
        )
        .await
        .unwrap();
        assert!(outcome.is_none());

        append_cancelled_row(&storage, "general", "2026-01-01T00:00:01").await.unwrap();
        let events = storage.read_recent("general", 10).unwrap();
        assert!(!events.iter().any(|e| e.kind == "ai_response"));
        assert!(events.iter().any(|e| e.kind == "system" && e.text.contains("cancelled")));
    }

    /// **Scenario**: a transient provider error is retried once, then succeeds.
    #[tokio::test]
    async fn transient_error_retries_once_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let slot = AIRequestSlot::new();
        let provider = MockProvider::failing_then_succeeding("recovered", 1);

        let outcome = run_execution(
            &storage,
            &slot,
            "req0000004",
            None,
            None,
            "",
            &provider,
            ExecutionRequest {
                room: "general".into(),
                author: "alice".into(),
                prompt: "hello".into(),
                provider_name: "mock".into(),
                model: "m".into(),
                memory_enabled: false,
                memory_scopes: vec![],
                act: false,
                now_iso: "2026-01-01T00:00:00".into(),
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome.response_text, "recovered");
    }

    #[test]
    fn parse_act_response_tolerates_surrounding_prose() {
        let text = "Sure thing!\n{\"answer\":\"done\",\"proposed_actions\":[]}\nThanks.";
        let parsed = parse_act_response(text).unwrap();
        assert_eq!(parsed.answer, "done");
    }
}

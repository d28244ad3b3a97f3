//! Wires the core services together for one CLI session: storage, presence, the AI
//! lifecycle, memory, routing, actions, and agent profiles (§6 Filesystem layout).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use huddle_core::actions::{Actions, ToolCommand};
use huddle_core::agent_profiles::AgentProfileStore;
use huddle_core::ai::provider::EchoProvider;
use huddle_core::ai::AiLifecycle;
use huddle_core::event_bus::EventBus;
use huddle_core::memory::{JsonlMemoryStore, MemoryDraft};
use huddle_core::model::AgentProfile;
use huddle_core::routing::AiConfig;
use huddle_core::storage::Storage;
use huddle_core::tool_contract::{ArgType, ToolDefinition};

/// Builds the two demo tools shipped with the CLI: read-only filesystem inspection,
/// bounded to `allowed_roots` (§4.8 Execute). Vendor HTTP tools stay out of scope.
fn default_tool_registry() -> (HashMap<String, ToolDefinition>, HashMap<String, ToolCommand>) {
    let mut definitions = HashMap::new();
    definitions.insert(
        "read_file".to_string(),
        ToolDefinition::new("read_file").with_property("path", ArgType::String, true),
    );
    definitions.insert(
        "list_dir".to_string(),
        ToolDefinition::new("list_dir").with_property("path", ArgType::String, true),
    );

    let mut commands = HashMap::new();
    commands.insert(
        "read_file".to_string(),
        ToolCommand { program: "cat".to_string(), args_template: vec!["${path}".to_string()] },
    );
    commands.insert(
        "list_dir".to_string(),
        ToolCommand { program: "ls".to_string(), args_template: vec!["${path}".to_string()] },
    );
    (definitions, commands)
}

/// One CLI session's bound services plus its room/identity context.
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub ai: Arc<AiLifecycle>,
    pub actions: Arc<Actions>,
    pub profiles: Arc<AgentProfileStore>,
    pub event_bus: Arc<EventBus>,
    pub memory_store: Arc<JsonlMemoryStore>,
    pub provider: Arc<EchoProvider>,
    pub ai_config: AiConfig,
    pub active_profile: Mutex<AgentProfile>,
    pub pending_draft: Mutex<Option<MemoryDraft>>,
    pub room: String,
    pub author: String,
    pub color: String,
    pub client_id: String,
}

impl AppContext {
    /// Builds the full set of services rooted at `base_dir` (the shared tree) with
    /// `local_dir` (ordinarily `<cwd>/.local_chat`) holding the private/repo memory scopes
    /// and `ai_config.json` (§6).
    pub async fn bootstrap(
        base_dir: PathBuf,
        local_dir: PathBuf,
        room: String,
        author: String,
        color: String,
    ) -> Result<Self, huddle_core::HuddleError> {
        let storage = Arc::new(Storage::new(&base_dir));

        let (definitions, commands) = default_tool_registry();
        let actions = Arc::new(Actions::new(
            storage.clone(),
            definitions,
            commands,
            vec![base_dir.clone(), local_dir.clone()],
            base_dir.join("agents/audit.jsonl"),
        ));
        actions.rehydrate().await?;

        let profiles = Arc::new(AgentProfileStore::new(storage.clone(), base_dir.join("agents/profiles"), base_dir.join("agents/audit.jsonl")));
        let now_iso = now_iso();
        let default_profile = profiles.ensure_default(&author, &now_iso).await?;

        let mut scope_paths = HashMap::new();
        scope_paths.insert("team".to_string(), storage.paths().memory_dir().join("global.jsonl"));
        scope_paths.insert("private".to_string(), local_dir.join("memory/private.jsonl"));
        scope_paths.insert("repo".to_string(), local_dir.join("memory/repo.jsonl"));
        let memory_store = Arc::new(JsonlMemoryStore::new(storage.clone(), scope_paths));

        let ai_config = AiConfig::load(&local_dir.join("ai_config.json"))?;

        Ok(Self {
            ai: Arc::new(AiLifecycle::new(storage.clone())),
            actions,
            profiles,
            event_bus: Arc::new(EventBus::new()),
            memory_store,
            provider: Arc::new(EchoProvider),
            ai_config,
            active_profile: Mutex::new(default_profile),
            pending_draft: Mutex::new(None),
            storage,
            room,
            author,
            color,
            client_id: huddle_core::presence::generate_client_id(),
        })
    }
}

/// ISO timestamp in the row/log format the rest of the core uses (`%Y-%m-%dT%H:%M:%S`).
pub fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

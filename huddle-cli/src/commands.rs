//! Slash-command dispatch over [`AppContext`] (§6 CLI surface, the `CommandRouter`-dispatched
//! subset only: `/ai`, `/memory`, `/actions`, `/action`, `/approve`, `/deny`, `/agent`).

use huddle_core::actions::DEFAULT_EXEC_TIMEOUT;
use huddle_core::ai::{self, ExecutionRequest};
use huddle_core::memory::{self, MemoryDraft};
use huddle_core::model::{Event, RouteTarget};
use huddle_core::routing::resolve_route;

use crate::context::{now_iso, now_unix, AppContext};

/// Handles one line of user input. Plain text is a chat message; lines starting with `/`
/// are routed to the matching subcommand.
pub async fn handle_line(ctx: &AppContext, line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(rest) = trimmed.strip_prefix('/') {
        let tokens: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return "empty command".to_string();
        }
        let (name, args) = (tokens[0].to_ascii_lowercase(), &tokens[1..]);
        return match name.as_str() {
            "ai" => handle_ai(ctx, args).await,
            "memory" => handle_memory(ctx, args).await,
            "actions" => handle_actions(ctx, args).await,
            "action" => handle_action(ctx, args).await,
            "approve" => handle_decide(ctx, args, true).await,
            "deny" => handle_decide(ctx, args, false).await,
            "agent" => handle_agent(ctx, args).await,
            other => format!("unknown command '/{other}'"),
        };
    }
    handle_chat(ctx, trimmed).await
}

async fn handle_chat(ctx: &AppContext, text: &str) -> String {
    let event = Event::new("chat", &ctx.author, text, now_iso());
    match ctx.storage.append_event(&ctx.room, &event).await {
        Ok(true) => {
            ctx.event_bus.publish(huddle_core::event_bus::ControllerEvent::RefreshOutput, false).await;
            String::new()
        }
        Ok(false) => "message not saved: room log is locked or busy, try again".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

struct AiFlags {
    provider: Option<String>,
    model: Option<String>,
    private: bool,
    no_memory: bool,
    memory_scopes: Vec<String>,
    act: bool,
    prompt: String,
}

fn parse_ai_flags(args: &[String]) -> AiFlags {
    let mut provider = None;
    let mut model = None;
    let mut private = false;
    let mut no_memory = false;
    let mut memory_scopes = Vec::new();
    let mut act = false;
    let mut prompt_words = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--provider" => {
                provider = args.get(i + 1).cloned();
                i += 2;
            }
            "--model" => {
                model = args.get(i + 1).cloned();
                i += 2;
            }
            "--private" => {
                private = true;
                i += 1;
            }
            "--no-memory" => {
                no_memory = true;
                i += 1;
            }
            "--memory-scope" => {
                if let Some(scope) = args.get(i + 1) {
                    memory_scopes.push(scope.clone());
                }
                i += 2;
            }
            "--act" => {
                act = true;
                i += 1;
            }
            other => {
                prompt_words.push(other.to_string());
                i += 1;
            }
        }
    }

    AiFlags { provider, model, private, no_memory, memory_scopes, act, prompt: prompt_words.join(" ") }
}

/// Dispatches `/ai [flags] <prompt>` and `/ai cancel` (§4.5 Execution worker, §6 CLI surface).
async fn handle_ai(ctx: &AppContext, args: &[String]) -> String {
    if args.first().map(String::as_str) == Some("cancel") {
        ctx.ai.slot.cancel();
        return "cancellation requested".to_string();
    }

    let flags = parse_ai_flags(args);
    if flags.prompt.is_empty() {
        return "usage: /ai [--provider P] [--model M] [--private] [--no-memory] [--memory-scope S] [--act] <prompt>".to_string();
    }

    let profile = ctx.active_profile.lock().await.clone();

    // Only EchoProvider ships in this crate (§4.5.1); default to it unless the profile's
    // routing policy or an explicit override names something else.
    let provider_override = flags.provider.clone().or_else(|| {
        if profile.routing_policy.routes.contains_key("chat") {
            None
        } else {
            Some("echo".to_string())
        }
    });
    let mut ai_config = ctx.ai_config.clone();
    ai_config.providers.entry("echo".to_string()).or_insert_with(|| huddle_core::routing::AiProviderConfig {
        provider: "echo".to_string(),
        api_key: "local-dev".to_string(),
        default_model: "echo-1".to_string(),
    });

    let route = match resolve_route("chat", provider_override.as_deref(), flags.model.as_deref(), &profile, &ai_config) {
        Ok(route) => route,
        Err(e) => return e,
    };

    let memory_scopes = if flags.private {
        vec!["private".to_string()]
    } else if !flags.memory_scopes.is_empty() {
        flags.memory_scopes.clone()
    } else if !profile.memory_policy.scopes.is_empty() {
        profile.memory_policy.scopes.clone()
    } else {
        vec!["team".to_string()]
    };
    let memory_enabled = !flags.no_memory;

    let started_at = now_iso();
    let Some(request_id) = ctx.ai.slot.start(&route.provider, &route.model, &ctx.room, memory_scopes.first().cloned(), &started_at).await else {
        return "an AI request is already in progress; use /ai cancel first".to_string();
    };

    let provider: &dyn huddle_core::ai::provider::AiProvider = &*ctx.provider;
    let rerank_provider: Option<&dyn huddle_core::ai::provider::AiProvider> = if memory_enabled { Some(provider) } else { None };

    let result = ai::run_execution(
        &ctx.storage,
        &ctx.ai.slot,
        &request_id,
        if memory_enabled { Some(ctx.memory_store.as_ref() as &dyn huddle_core::memory::MemoryStore) } else { None },
        rerank_provider,
        &route.model,
        provider,
        ExecutionRequest {
            room: ctx.room.clone(),
            author: ctx.author.clone(),
            prompt: flags.prompt,
            provider_name: route.provider.clone(),
            model: route.model.clone(),
            memory_enabled,
            memory_scopes,
            act: flags.act,
            now_iso: started_at,
        },
    )
    .await;

    ctx.ai.slot.clear(&request_id).await;

    match result {
        Ok(None) => {
            let _ = ai::append_cancelled_row(&ctx.storage, &ctx.room, &now_iso()).await;
            "AI request cancelled".to_string()
        }
        Ok(Some(outcome)) => {
            let mut reply = outcome.response_text;
            if !outcome.memory_ids_used.is_empty() {
                reply.push_str(&format!("\n(memory used: {})", outcome.memory_ids_used.join(", ")));
            }
            if flags.act && !outcome.proposed_actions.is_empty() {
                let mut enqueued = Vec::new();
                for proposed in &outcome.proposed_actions {
                    let preview = format!("{} {}", proposed.tool, proposed.arguments);
                    match ctx
                        .actions
                        .create_from_proposal(
                            &profile,
                            Some(request_id.clone()),
                            Some(ctx.room.clone()),
                            &ctx.author,
                            &proposed.tool,
                            proposed.arguments.clone(),
                            &proposed.summary,
                            &preview,
                            "low",
                            now_unix(),
                            &now_iso(),
                        )
                        .await
                    {
                        Ok(action) => enqueued.push(action.action_id),
                        Err(e) => reply.push_str(&format!("\n(action proposal rejected: {e})")),
                    }
                }
                if !enqueued.is_empty() {
                    reply.push_str(&format!("\n(proposed actions pending approval: {})", enqueued.join(", ")));
                }
            }
            reply
        }
        Err(e) => format!("error: {e}"),
    }
}

/// Dispatches `/memory add|confirm|cancel|edit|scope|list|search` (§4.6 Draft+confirm).
async fn handle_memory(ctx: &AppContext, args: &[String]) -> String {
    let Some(sub) = args.first() else {
        return "usage: /memory add|confirm|cancel|edit|scope|list|search ...".to_string();
    };
    let rest = &args[1..];

    match sub.as_str() {
        "add" => handle_memory_add(ctx, rest).await,
        "confirm" => handle_memory_confirm(ctx).await,
        "cancel" => {
            let mut draft = ctx.pending_draft.lock().await;
            if draft.take().is_some() {
                "draft discarded".to_string()
            } else {
                "no pending draft".to_string()
            }
        }
        "edit" => handle_memory_edit(ctx, rest).await,
        "scope" => handle_memory_edit(ctx, &[vec!["scope".to_string()], rest.to_vec()].concat()).await,
        "list" => handle_memory_list(ctx, rest).await,
        "search" => handle_memory_search(ctx, rest).await,
        other => format!("unknown /memory subcommand '{other}'"),
    }
}

fn parse_memory_flags(args: &[String]) -> (MemoryDraft, Vec<String>) {
    let mut draft = MemoryDraft { scope: "team".to_string(), ..Default::default() };
    let mut words = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--topic" => {
                draft.topic = args.get(i + 1).cloned().unwrap_or_default();
                i += 2;
            }
            "--confidence" => {
                draft.confidence = args.get(i + 1).cloned().unwrap_or_default();
                i += 2;
            }
            "--source" => {
                draft.source = args.get(i + 1).cloned().unwrap_or_default();
                i += 2;
            }
            "--scope" => {
                draft.scope = args.get(i + 1).cloned().unwrap_or_else(|| "team".to_string());
                i += 2;
            }
            other => {
                words.push(other.to_string());
                i += 1;
            }
        }
    }
    (draft, words)
}

async fn handle_memory_add(ctx: &AppContext, args: &[String]) -> String {
    let (mut draft, words) = parse_memory_flags(args);
    draft.summary = words.join(" ");
    if !draft.is_confirmable() {
        return "a draft needs --source, --confidence low|med|high, and a non-empty summary".to_string();
    }

    let existing = match ctx.memory_store.load_scope(&draft.scope).await {
        Ok(entries) => entries,
        Err(e) => return format!("error: {e}"),
    };
    let duplicate = existing.iter().find(|e| memory::is_probable_duplicate(&draft, e));

    *ctx.pending_draft.lock().await = Some(draft);
    match duplicate {
        Some(dup) => format!("possible duplicate of {} ({}); /memory confirm to save anyway, /memory cancel to discard", dup.id, dup.summary),
        None => "draft ready; /memory confirm to save, /memory cancel to discard".to_string(),
    }
}

async fn handle_memory_confirm(ctx: &AppContext) -> String {
    let draft = ctx.pending_draft.lock().await.take();
    let Some(draft) = draft else {
        return "no pending draft".to_string();
    };
    let id = format!("mem_{}_{}", now_unix(), &uuid::Uuid::new_v4().simple().to_string()[..6]);
    let entry = huddle_core::model::MemoryEntry {
        id: id.clone(),
        ts: now_iso(),
        author: ctx.author.clone(),
        summary: draft.summary,
        topic: draft.topic,
        confidence: draft.confidence,
        source: draft.source,
        room: ctx.room.clone(),
        origin_event_ref: String::new(),
        tags: Vec::new(),
        scope: draft.scope,
    };
    match ctx.memory_store.append(&entry).await {
        Ok(()) => format!("saved memory entry {id}"),
        Err(e) => format!("error: {e}"),
    }
}

async fn handle_memory_edit(ctx: &AppContext, args: &[String]) -> String {
    let Some(field) = args.first() else {
        return "usage: /memory edit <field> <value>".to_string();
    };
    let value = args[1..].join(" ");
    let mut draft = ctx.pending_draft.lock().await;
    let Some(draft) = draft.as_mut() else {
        return "no pending draft".to_string();
    };
    match field.as_str() {
        "summary" => draft.summary = value,
        "topic" => draft.topic = value,
        "confidence" => draft.confidence = value,
        "source" => draft.source = value,
        "scope" => draft.scope = if value.is_empty() { "team".to_string() } else { value },
        other => return format!("unknown field '{other}'"),
    }
    "draft updated".to_string()
}

async fn handle_memory_list(ctx: &AppContext, args: &[String]) -> String {
    let scope = args.first().cloned().unwrap_or_else(|| "team".to_string());
    match ctx.memory_store.load_scope(&scope).await {
        Ok(entries) if entries.is_empty() => format!("no memory entries in scope '{scope}'"),
        Ok(entries) => entries
            .iter()
            .map(|e| format!("{} | {} | {} | {}", e.id, e.topic, e.confidence, e.summary))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => format!("error: {e}"),
    }
}

async fn handle_memory_search(ctx: &AppContext, args: &[String]) -> String {
    if args.is_empty() {
        return "usage: /memory search <query>".to_string();
    }
    let query = args.join(" ");
    let scopes = vec!["team".to_string(), "private".to_string(), "repo".to_string()];
    let store: &dyn memory::MemoryStore = ctx.memory_store.as_ref();
    match memory::select_for_prompt(store, &query, &scopes, None, "").await {
        Ok(selection) if selection.entries.is_empty() => "no matching memory entries".to_string(),
        Ok(selection) => selection
            .entries
            .iter()
            .map(|e| format!("{} | {} | {}", e.id, e.topic, e.summary))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => format!("error: {e}"),
    }
}

/// Dispatches `/actions` and `/actions prune` (§4.8 Prune).
async fn handle_actions(ctx: &AppContext, args: &[String]) -> String {
    if args.first().map(String::as_str) == Some("prune") {
        let removed = ctx.actions.prune().await;
        return format!("pruned {removed} non-pending action(s)");
    }
    let actions = ctx.actions.list().await;
    if actions.is_empty() {
        return "no tracked actions".to_string();
    }
    actions
        .iter()
        .map(|a| format!("{} | {} | {} | {}", a.action_id, a.status, a.tool, a.summary))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Dispatches `/action <id>` (§6 CLI surface).
async fn handle_action(ctx: &AppContext, args: &[String]) -> String {
    let Some(id) = args.first() else {
        return "usage: /action <id>".to_string();
    };
    match ctx.actions.get(id).await {
        Some(action) => format!(
            "{} | status={} | tool={} | summary={} | inputs={} | expires_at={}",
            action.action_id, action.status, action.tool, action.summary, action.inputs, action.expires_at
        ),
        None => format!("no such action '{id}'"),
    }
}

/// Dispatches `/approve <id>` and `/deny <id>` (§4.8 Decide, Execute: "approval schedules
/// synchronous execution").
async fn handle_decide(ctx: &AppContext, args: &[String], approve: bool) -> String {
    let Some(id) = args.first() else {
        return format!("usage: /{} <id>", if approve { "approve" } else { "deny" });
    };
    match ctx.actions.decide(id, approve, now_unix(), &now_iso()).await {
        Ok(status) if approve && status == huddle_core::model::ActionStatus::Approved => {
            match ctx.actions.execute(id, DEFAULT_EXEC_TIMEOUT, &now_iso()).await {
                Ok(result) => format!(
                    "approved and executed {id}: exit_code={:?} duration_ms={} truncated={}\n{}",
                    result.exit_code, result.duration_ms, result.truncated, result.output_preview
                ),
                Err(e) => format!("approved {id} but execution failed: {e}"),
            }
        }
        Ok(status) => format!("{id} -> {}", status.as_str()),
        Err(e) => format!("error: {e}"),
    }
}

/// Dispatches `/agent list|use|show|memory|route` (§4.10, §4.7).
async fn handle_agent(ctx: &AppContext, args: &[String]) -> String {
    let Some(sub) = args.first() else {
        return "usage: /agent list|use|show|memory|route ...".to_string();
    };
    let rest = &args[1..];
    match sub.as_str() {
        "list" => match ctx.profiles.list_ids() {
            Ok(ids) if ids.is_empty() => "no agent profiles".to_string(),
            Ok(ids) => ids.join("\n"),
            Err(e) => format!("error: {e}"),
        },
        "use" => {
            let Some(id) = rest.first() else {
                return "usage: /agent use <id>".to_string();
            };
            match ctx.profiles.load(id) {
                Ok(Some(profile)) => {
                    *ctx.active_profile.lock().await = profile;
                    format!("active profile set to '{id}'")
                }
                Ok(None) => format!("no such profile '{id}'"),
                Err(e) => format!("error: {e}"),
            }
        }
        "show" => {
            let profile = ctx.active_profile.lock().await.clone();
            format!(
                "id={} name={} version={} tool_policy.allowed_tools={:?} memory_policy.scopes={:?} routes={:?}",
                profile.id, profile.name, profile.version, profile.tool_policy.allowed_tools, profile.memory_policy.scopes, profile.routing_policy.routes
            )
        }
        "memory" => {
            if rest.is_empty() {
                return "usage: /agent memory <scope> [<scope> ...]".to_string();
            }
            let mut profile = ctx.active_profile.lock().await.clone();
            profile.memory_policy.scopes = rest.clone();
            match ctx.profiles.upsert(profile, &ctx.author, &now_iso()).await {
                Ok(saved) => {
                    *ctx.active_profile.lock().await = saved.clone();
                    format!("memory scopes set to {:?}", saved.memory_policy.scopes)
                }
                Err(e) => format!("error: {e}"),
            }
        }
        "route" => {
            if rest.len() < 3 {
                return "usage: /agent route <task_class> <provider> <model>".to_string();
            }
            let mut profile = ctx.active_profile.lock().await.clone();
            profile.routing_policy.routes.insert(rest[0].clone(), RouteTarget { provider: rest[1].clone(), model: rest[2].clone() });
            match ctx.profiles.upsert(profile, &ctx.author, &now_iso()).await {
                Ok(saved) => {
                    *ctx.active_profile.lock().await = saved;
                    format!("route '{}' -> {} / {}", rest[0], rest[1], rest[2])
                }
                Err(e) => format!("error: {e}"),
            }
        }
        other => format!("unknown /agent subcommand '{other}'"),
    }
}

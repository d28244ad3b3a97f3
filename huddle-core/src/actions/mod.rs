//! Approval-gated tool action lifecycle: proposal, decision, execution, rehydration (§4.8).
//!
//! Grounded in `original_source/huddle_chat/services/action_service.py` (create/decide/
//! execute/rehydrate/prune) and the teacher's subprocess dispatch style in
//! `tool_source` for capture-both-streams execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::HuddleError;
use crate::model::{ActionStatus, AgentProfile, ToolAction, ToolActionResult};
use crate::storage::Storage;
use crate::tool_contract::{self, ToolDefinition};

/// Action TTL (§3 ToolAction, §4.8 Create).
pub const ACTION_TTL_SECONDS: i64 = 24 * 60 * 60;
/// Default subprocess execution timeout (§4.8 Execute, §5 Cancellation & timeouts).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// Truncated preview length for captured stdout/stderr (§4.8 Execute).
pub const OUTPUT_PREVIEW_BYTES: usize = 2048;

/// One registered subprocess-backed tool (§4.8 Execute: "dispatched per tool name to a
/// bounded set of subprocess commands").
pub struct ToolCommand {
    pub program: String,
    pub args_template: Vec<String>,
}

/// Approval queue plus execution dispatch over a bounded tool registry (§4.8).
pub struct Actions {
    storage: Arc<Storage>,
    actions: Mutex<HashMap<String, ToolAction>>,
    definitions: HashMap<String, ToolDefinition>,
    commands: HashMap<String, ToolCommand>,
    allowed_roots: Vec<PathBuf>,
    audit_path: PathBuf,
}

impl Actions {
    pub fn new(
        storage: Arc<Storage>,
        definitions: HashMap<String, ToolDefinition>,
        commands: HashMap<String, ToolCommand>,
        allowed_roots: Vec<PathBuf>,
        audit_path: PathBuf,
    ) -> Self {
        Self { storage, actions: Mutex::new(HashMap::new()), definitions, commands, allowed_roots, audit_path }
    }

    /// Validates and enqueues a proposed tool invocation as `pending` (§4.8 Create, §8
    /// scenario C2). Rejects against both the registered [`ToolDefinition`] and the active
    /// profile's `tool_policy.allowed_tools` — an empty/missing list means no tools are
    /// proposable (§9 open question resolution).
    pub async fn create_from_proposal(
        &self,
        profile: &AgentProfile,
        request_id: Option<String>,
        room: Option<String>,
        user: &str,
        tool: &str,
        arguments: serde_json::Value,
        summary: &str,
        command_preview: &str,
        risk_level: &str,
        now_unix: i64,
        now_iso: &str,
    ) -> Result<ToolAction, HuddleError> {
        if !profile.tool_policy.allowed_tools.iter().any(|t| t == tool) {
            return Err(HuddleError::PolicyDenied(format!(
                "Problem: tool '{tool}' is not allowed.\nWhy: profile '{}' does not list it in allowed_tools.\nNext: run `/agent show` to review the policy.",
                profile.id
            )));
        }
        let definition = self
            .definitions
            .get(tool)
            .ok_or_else(|| HuddleError::ValidationError(format!("unknown tool '{tool}'")))?;
        tool_contract::validate(definition, &arguments).map_err(HuddleError::ValidationError)?;

        let action_id = random_hex_id(8);
        let action = ToolAction {
            action_id: action_id.clone(),
            ts: now_iso.to_string(),
            user: user.to_string(),
            agent_profile: profile.id.clone(),
            tool: tool.to_string(),
            summary: summary.to_string(),
            command_preview: command_preview.to_string(),
            risk_level: risk_level.to_string(),
            status: ActionStatus::Pending.as_str().to_string(),
            inputs: arguments,
            request_id,
            room,
            expires_at: now_unix + ACTION_TTL_SECONDS,
            ttl_seconds: ACTION_TTL_SECONDS,
        };

        self.actions.lock().await.insert(action_id, action.clone());
        self.append_audit_row("create", &action, now_iso).await?;
        Ok(action)
    }

    /// Applies an approve/deny decision (§4.8 Decide, §8 properties 6/7, scenario C1).
    /// An action past its `expires_at` transitions to `expired` and the decision is refused.
    pub async fn decide(&self, action_id: &str, approve: bool, now_unix: i64, now_iso: &str) -> Result<ActionStatus, HuddleError> {
        let mut actions = self.actions.lock().await;
        let action = actions
            .get_mut(action_id)
            .ok_or_else(|| HuddleError::ValidationError(format!("no such action '{action_id}'")))?;

        if action.status() != ActionStatus::Pending {
            return Err(HuddleError::PolicyDenied(format!(
                "Problem: action '{action_id}' is not pending.\nWhy: it is already '{}'.\nNext: check `/actions` for its current state.",
                action.status
            )));
        }
        if action.expires_at < now_unix {
            action.status = ActionStatus::Expired.as_str().to_string();
            let snapshot = action.clone();
            drop(actions);
            self.append_audit_row("expire", &snapshot, now_iso).await?;
            return Err(HuddleError::PolicyDenied(format!(
                "Problem: action '{action_id}' has expired.\nWhy: its TTL elapsed before a decision was made.\nNext: re-propose the action."
            )));
        }

        action.status = if approve { ActionStatus::Approved.as_str().to_string() } else { ActionStatus::Denied.as_str().to_string() };
        let snapshot = action.clone();
        let status = snapshot.status();
        drop(actions);
        self.append_audit_row(if approve { "approve" } else { "deny" }, &snapshot, now_iso).await?;
        Ok(status)
    }

    /// Runs an approved action's subprocess (§4.8 Execute). Path arguments must resolve
    /// inside one of `allowed_roots`; execution captures both streams, has no shell
    /// interpolation, and is bounded by `timeout`.
    pub async fn execute(&self, action_id: &str, timeout: Duration, now_iso: &str) -> Result<ToolActionResult, HuddleError> {
        let action = {
            let mut actions = self.actions.lock().await;
            let action = actions
                .get_mut(action_id)
                .ok_or_else(|| HuddleError::ValidationError(format!("no such action '{action_id}'")))?;
            if action.status() != ActionStatus::Approved {
                return Err(HuddleError::PolicyDenied(format!("action '{action_id}' is not approved")));
            }
            action.status = ActionStatus::Running.as_str().to_string();
            action.clone()
        };

        let command = self
            .commands
            .get(&action.tool)
            .ok_or_else(|| HuddleError::ValidationError(format!("no command registered for tool '{}'", action.tool)))?;

        for candidate in path_arguments(&action.inputs) {
            if !self.is_within_allowed_roots(&candidate) {
                return Err(HuddleError::PolicyDenied(format!(
                    "Problem: argument path '{}' escapes the allowed roots.\nWhy: filesystem tools may only touch base_dir or paths added via /toolpaths add.\nNext: add the directory with `/toolpaths add` if this was intentional.",
                    candidate.display()
                )));
            }
        }

        let start = std::time::Instant::now();
        let args = render_args(&command.args_template, &action.inputs);
        let run = tokio::time::timeout(timeout, run_subprocess(&command.program, &args)).await;

        let (exit_code, output_preview, truncated) = match run {
            Ok(Ok((code, output))) => {
                let (preview, truncated) = truncate_preview(&output);
                (Some(code), preview, truncated)
            }
            Ok(Err(e)) => (None, format!("execution error: {e}"), false),
            Err(_elapsed) => (None, "execution timed out".to_string(), true),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let final_status = if exit_code == Some(0) { ActionStatus::Completed } else { ActionStatus::Failed };
        {
            let mut actions = self.actions.lock().await;
            if let Some(entry) = actions.get_mut(action_id) {
                entry.status = final_status.as_str().to_string();
            }
        }

        let result = ToolActionResult { action_id: action_id.to_string(), ts: now_iso.to_string(), exit_code, duration_ms, truncated, output_preview };
        self.append_result_audit_row(&result, final_status).await?;
        Ok(result)
    }

    /// Resolves `candidate` to an absolute, symlink-free path and checks that it lies inside
    /// one of `allowed_roots` (§4.8 Execute: "resolved to an absolute path"). A candidate that
    /// does not exist yet is resolved against its nearest existing ancestor so `../` segments
    /// still can't walk it out of the sandbox.
    fn is_within_allowed_roots(&self, candidate: &Path) -> bool {
        let Some(resolved) = resolve_path(candidate) else { return false };
        self.allowed_roots.iter().filter_map(|root| resolve_path(root)).any(|root| resolved.starts_with(root))
    }

    /// Rebuilds the in-memory map from the actions audit log on startup (§4.8 Rehydration).
    pub async fn rehydrate(&self) -> Result<(), HuddleError> {
        if !self.audit_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.audit_path)?;
        let mut actions = self.actions.lock().await;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(row) = serde_json::from_str::<serde_json::Value>(trimmed) else { continue };
            let Some(kind) = row.get("kind").and_then(|v| v.as_str()) else { continue };
            if kind == "create" {
                if let Some(action_value) = row.get("action") {
                    if let Ok(action) = serde_json::from_value::<ToolAction>(action_value.clone()) {
                        actions.insert(action.action_id.clone(), action);
                    }
                }
            } else if let Some(status) = row.get("status").and_then(|v| v.as_str()) {
                if let Some(action_id) = row.get("action_id").and_then(|v| v.as_str()) {
                    if let Some(entry) = actions.get_mut(action_id) {
                        entry.status = status.to_string();
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes all non-`pending` entries from the in-memory map (§4.8 Prune). The audit log
    /// is never rewritten.
    pub async fn prune(&self) -> usize {
        let mut actions = self.actions.lock().await;
        let before = actions.len();
        actions.retain(|_, action| action.status() == ActionStatus::Pending);
        before - actions.len()
    }

    pub async fn get(&self, action_id: &str) -> Option<ToolAction> {
        self.actions.lock().await.get(action_id).cloned()
    }

    /// Lists all in-memory actions regardless of status, for the `/actions` listing surface
    /// (§6 CLI surface).
    pub async fn list(&self) -> Vec<ToolAction> {
        let mut actions: Vec<ToolAction> = self.actions.lock().await.values().cloned().collect();
        actions.sort_by(|a, b| a.ts.cmp(&b.ts));
        actions
    }

    async fn append_audit_row(&self, kind: &str, action: &ToolAction, ts: &str) -> Result<(), HuddleError> {
        let row = serde_json::json!({"kind": kind, "ts": ts, "action_id": action.action_id, "status": action.status, "action": action});
        self.storage.append_jsonl(&self.audit_path, &row).await?;
        Ok(())
    }

    async fn append_result_audit_row(&self, result: &ToolActionResult, status: ActionStatus) -> Result<(), HuddleError> {
        let row = serde_json::json!({"kind": "result", "ts": result.ts, "action_id": result.action_id, "status": status.as_str(), "result": result});
        self.storage.append_jsonl(&self.audit_path, &row).await?;
        Ok(())
    }
}

fn random_hex_id(bytes: usize) -> String {
    uuid::Uuid::new_v4().simple().to_string()[..bytes * 2].to_string()
}

/// Resolves `path` to an absolute, symlink-free form without requiring it to exist: walks up
/// to the nearest existing ancestor, canonicalizes that, then re-appends the missing suffix.
fn resolve_path(path: &Path) -> Option<PathBuf> {
    if let Ok(canon) = path.canonicalize() {
        return Some(canon);
    }
    let mut missing = Vec::new();
    let mut ancestor = path;
    loop {
        match ancestor.parent() {
            Some(parent) => {
                missing.push(ancestor.file_name()?.to_owned());
                ancestor = parent;
                if let Ok(canon) = ancestor.canonicalize() {
                    let mut resolved = canon;
                    for component in missing.into_iter().rev() {
                        resolved.push(component);
                    }
                    return Some(resolved);
                }
            }
            None => return None,
        }
    }
}

fn path_arguments(inputs: &serde_json::Value) -> Vec<PathBuf> {
    let Some(obj) = inputs.as_object() else { return Vec::new() };
    obj.values()
        .filter_map(|v| v.as_str())
        .filter(|s| s.contains('/') || s.contains('\\') || s.starts_with('.'))
        .map(PathBuf::from)
        .collect()
}

fn render_args(template: &[String], inputs: &serde_json::Value) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            if let Some(key) = arg.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                inputs.get(key).and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_default()
            } else {
                arg.clone()
            }
        })
        .collect()
}

async fn run_subprocess(program: &str, args: &[String]) -> std::io::Result<(i32, String)> {
    let output = tokio::process::Command::new(program).args(args).output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.code().unwrap_or(-1), combined))
}

fn truncate_preview(output: &str) -> (String, bool) {
    if output.len() <= OUTPUT_PREVIEW_BYTES {
        (output.to_string(), false)
    } else {
        let mut end = OUTPUT_PREVIEW_BYTES;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        (output[..end].to_string(), true)
    }
}

//! Task-class → (provider, model, api_key) resolution (§4.7).
//!
//! Grounded in `original_source/huddle_chat/services/routing_service.py`'s
//! `resolve_route`: override precedence over the active profile's `routing_policy`,
//! then provider config lookup for the api_key and default model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::HuddleError;
use crate::model::AgentProfile;

/// One provider's credentials and default model, keyed by provider name in [`AiConfig`]
/// (§3 "AI provider config").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub default_model: String,
}

/// Loaded from `ai_config.json` (§6); a missing file yields an empty config rather than
/// an error, so first run never fails on this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub providers: HashMap<String, AiProviderConfig>,
    #[serde(default)]
    pub streaming: bool,
}

impl AiConfig {
    /// Loads `ai_config.json` if present; returns the empty default otherwise (§3).
    pub fn load(path: &std::path::Path) -> Result<Self, HuddleError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(HuddleError::from(e)),
        }
    }
}

/// A resolved routing decision (§4.7, Glossary "Route").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub reason: String,
}

/// Resolves `(provider, model, api_key)` for `task_class`, given optional overrides, the
/// active profile's routing policy, and the loaded AI config (§4.7).
///
/// Precedence: explicit override wins; otherwise `profile.routing_policy.routes[task_class]`;
/// the provider's api_key and default model always come from `ai_config`.
pub fn resolve_route(
    task_class: &str,
    provider_override: Option<&str>,
    model_override: Option<&str>,
    profile: &AgentProfile,
    ai_config: &AiConfig,
) -> Result<ResolvedRoute, String> {
    let mut reason_parts = vec![format!("task={task_class}"), format!("profile={}", profile.id)];

    let (provider, provider_source) = if let Some(p) = provider_override {
        (p.to_string(), "override")
    } else if let Some(route) = profile.routing_policy.routes.get(task_class) {
        if route.provider.is_empty() {
            return Err(format!(
                "Problem: no provider configured for task '{task_class}'.\nWhy: profile '{}' has an empty routing entry.\nNext: run `/agent route` to set one.",
                profile.id
            ));
        }
        (route.provider.clone(), "policy")
    } else {
        return Err(format!(
            "Problem: no route for task '{task_class}'.\nWhy: profile '{}' has no matching routing_policy entry and no override was given.\nNext: run `/agent route` to add one, or pass --provider.",
            profile.id
        ));
    };
    reason_parts.push(format!("provider={provider_source}"));

    let provider_config = ai_config.providers.get(&provider).ok_or_else(|| {
        format!(
            "Problem: unknown provider '{provider}'.\nWhy: no entry for it in ai_config.json.\nNext: run `/aiconfig set-provider {provider}`."
        )
    })?;
    if provider_config.api_key.is_empty() {
        return Err(format!(
            "Problem: provider '{provider}' has no api_key.\nWhy: ai_config.json is missing credentials for it.\nNext: run `/aiconfig set-key {provider} <key>`."
        ));
    }

    let (model, model_source) = if let Some(m) = model_override {
        (m.to_string(), "override")
    } else if let Some(route) = profile.routing_policy.routes.get(task_class) {
        if !route.model.is_empty() {
            (route.model.clone(), "policy")
        } else if !provider_config.default_model.is_empty() {
            (provider_config.default_model.clone(), "default")
        } else {
            return Err(format!(
                "Problem: no model configured for provider '{provider}'.\nWhy: neither the routing policy nor ai_config.json set one.\nNext: run `/aiconfig set-model {provider} <model>`."
            ));
        }
    } else if !provider_config.default_model.is_empty() {
        (provider_config.default_model.clone(), "default")
    } else {
        return Err(format!(
            "Problem: no model configured for provider '{provider}'.\nWhy: neither the routing policy nor ai_config.json set one.\nNext: run `/aiconfig set-model {provider} <model>`."
        ));
    };
    reason_parts.push(format!("model={model_source}"));

    Ok(ResolvedRoute {
        provider,
        model,
        api_key: provider_config.api_key.clone(),
        reason: reason_parts.join(","),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RouteTarget, RoutingPolicy};

    fn profile_with_route(task_class: &str, provider: &str, model: &str) -> AgentProfile {
        let mut profile = AgentProfile::default_profile("tester", "2026-01-01T00:00:00");
        profile.routing_policy = RoutingPolicy {
            routes: [(task_class.to_string(), RouteTarget { provider: provider.to_string(), model: model.to_string() })]
                .into_iter()
                .collect(),
        };
        profile
    }

    fn config_with(provider: &str, api_key: &str, default_model: &str) -> AiConfig {
        AiConfig {
            providers: [(
                provider.to_string(),
                AiProviderConfig { provider: provider.to_string(), api_key: api_key.to_string(), default_model: default_model.to_string() },
            )]
            .into_iter()
            .collect(),
            streaming: false,
        }
    }

    #[test]
    fn policy_route_resolves_with_reason() {
        let profile = profile_with_route("code_analysis", "openai", "gpt-4o-mini");
        let config = config_with("openai", "sk-test", "gpt-4o");
        let route = resolve_route("code_analysis", None, None, &profile, &config).unwrap();
        assert_eq!(route.provider, "openai");
        assert_eq!(route.model, "gpt-4o-mini");
        assert_eq!(route.reason, "task=code_analysis,profile=default,provider=policy,model=policy");
    }

    #[test]
    fn override_wins_over_policy() {
        let profile = profile_with_route("code_analysis", "openai", "gpt-4o-mini");
        let config = config_with("openai", "sk-test", "gpt-4o");
        let mut config_two = config.clone();
        config_two.providers.insert("anthropic".into(), AiProviderConfig { provider: "anthropic".into(), api_key: "sk-other".into(), default_model: "claude".into() });
        let route = resolve_route("code_analysis", Some("anthropic"), Some("claude-override"), &profile, &config_two).unwrap();
        assert_eq!(route.provider, "anthropic");
        assert_eq!(route.model, "claude-override");
    }

    #[test]
    fn missing_api_key_fails_with_guided_message() {
        let profile = profile_with_route("code_analysis", "openai", "gpt-4o-mini");
        let config = config_with("openai", "", "gpt-4o");
        let err = resolve_route("code_analysis", None, None, &profile, &config).unwrap_err();
        assert!(err.contains("Problem:"));
        assert!(err.contains("api_key"));
    }

    #[test]
    fn unknown_task_class_without_override_fails() {
        let profile = AgentProfile::default_profile("tester", "2026-01-01T00:00:00");
        let config = AiConfig::default();
        let err = resolve_route("unrouted_task", None, None, &profile, &config).unwrap_err();
        assert!(err.contains("no route"));
    }
}

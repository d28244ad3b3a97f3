//! JSON-persisted agent profiles with a versioned audit trail (§4.10).
//!
//! Grounded in `original_source/huddle_chat/repositories/agent_profile_repository.py`
//! (one file per profile, directory-listing catalog, audit-on-write).

use std::path::PathBuf;

use crate::error::HuddleError;
use crate::model::AgentProfile;
use crate::storage::Storage;

/// One JSON-file-per-profile store under `agents/profiles/<id>.json` (§4.10).
pub struct AgentProfileStore {
    storage: std::sync::Arc<Storage>,
    profiles_dir: PathBuf,
    audit_path: PathBuf,
}

impl AgentProfileStore {
    pub fn new(storage: std::sync::Arc<Storage>, profiles_dir: PathBuf, audit_path: PathBuf) -> Self {
        Self { storage, profiles_dir, audit_path }
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.profiles_dir.join(format!("{id}.json"))
    }

    pub fn load(&self, id: &str) -> Result<Option<AgentProfile>, HuddleError> {
        let path = self.profile_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Directory-listing catalog of all persisted profile ids (§4.10).
    pub fn list_ids(&self) -> Result<Vec<String>, HuddleError> {
        if !self.profiles_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.profiles_dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Bumps `version`, stamps `updated_at`/`updated_by`, writes the file, and appends an
    /// audit row (§4.10 `upsert`).
    pub async fn upsert(&self, mut profile: AgentProfile, actor: &str, now_iso: &str) -> Result<AgentProfile, HuddleError> {
        let existing_version = self.load(&profile.id)?.map(|p| p.version).unwrap_or(0);
        profile.version = existing_version + 1;
        profile.updated_by = actor.to_string();
        profile.updated_at = now_iso.to_string();

        std::fs::create_dir_all(&self.profiles_dir)?;
        let serialized = serde_json::to_vec_pretty(&profile)?;
        std::fs::write(self.profile_path(&profile.id), serialized)?;

        let audit_row = serde_json::json!({"ts": now_iso, "action": "upsert", "profile_id": profile.id, "actor": actor, "version": profile.version});
        self.storage.append_jsonl(&self.audit_path, &audit_row).await?;
        Ok(profile)
    }

    /// Materializes the `default` profile on first start if no profile exists yet (§4.10).
    pub async fn ensure_default(&self, actor: &str, now_iso: &str) -> Result<AgentProfile, HuddleError> {
        if let Some(existing) = self.load("default")? {
            return Ok(existing);
        }
        self.upsert(AgentProfile::default_profile(actor, now_iso), actor, now_iso).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_bumps_version_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(Storage::new(dir.path()));
        let store = AgentProfileStore::new(storage, dir.path().join("agents/profiles"), dir.path().join("agents/audit.jsonl"));

        let profile = AgentProfile::default_profile("alice", "2026-01-01T00:00:00");
        let saved = store.upsert(profile, "alice", "2026-01-01T00:00:00").await.unwrap();
        assert_eq!(saved.version, 1);

        let saved_again = store.upsert(saved.clone(), "bob", "2026-01-02T00:00:00").await.unwrap();
        assert_eq!(saved_again.version, 2);
        assert_eq!(saved_again.updated_by, "bob");

        let reloaded = store.load("default").unwrap().unwrap();
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn ensure_default_materializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(Storage::new(dir.path()));
        let store = AgentProfileStore::new(storage, dir.path().join("agents/profiles"), dir.path().join("agents/audit.jsonl"));

        let first = store.ensure_default("alice", "2026-01-01T00:00:00").await.unwrap();
        assert_eq!(first.version, 1);
        let second = store.ensure_default("alice", "2026-01-02T00:00:00").await.unwrap();
        assert_eq!(second.version, 1);
    }

    #[test]
    fn list_ids_reflects_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(Storage::new(dir.path()));
        let profiles_dir = dir.path().join("agents/profiles");
        std::fs::create_dir_all(&profiles_dir).unwrap();
        std::fs::write(profiles_dir.join("default.json"), "{}").unwrap();
        std::fs::write(profiles_dir.join("reviewer.json"), "{}").unwrap();
        let store = AgentProfileStore::new(storage, profiles_dir, dir.path().join("agents/audit.jsonl"));
        assert_eq!(store.list_ids().unwrap(), vec!["default".to_string(), "reviewer".to_string()]);
    }
}

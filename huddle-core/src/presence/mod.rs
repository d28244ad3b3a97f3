//! Heartbeat writer, stale-entry expiry, and per-room / cross-room aggregation (§4.2).
//!
//! Grounded in `original_source/huddle_chat/repositories/presence_repository.py`:
//! `get_online_users` (drop-if-stale-then-parse), `get_online_users_all_rooms`
//! (last-seen-wins cross-room merge), and `write_presence_atomic`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::HuddleError;
use crate::model::PresenceEntry;
use crate::storage::{sanitize_room_name, Storage};

/// Entries whose mtime is this old or older are considered dead (§3 invariant).
pub const PRESENCE_STALE_SECONDS: u64 = 30;
/// Heartbeat cadence (§4.2).
pub const PRESENCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Sidebar refresh rate limit unless forced (§4.2).
pub const PRESENCE_SIDEBAR_MIN_REFRESH: Duration = Duration::from_millis(250);
/// Repeated-parse-failure threshold before quarantine (§4.2, §9 open question: left tuned).
pub const PRESENCE_QUARANTINE_THRESHOLD: u32 = 3;
pub const PRESENCE_QUARANTINE_DIR: &str = "_presence_quarantine";

/// Generates a stable 12-character random client id (§3 Presence entry).
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn now_unix_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Reads and parses one presence file, filling in defaults the way the Python loader does
/// when the JSON body is missing expected keys.
fn load_presence_entry(path: &Path, fallback_room: &str, mtime: f64) -> Result<PresenceEntry, HuddleError> {
    let raw = std::fs::read_to_string(path)?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;
    let obj = value.as_object_mut().ok_or_else(|| HuddleError::MalformedRow("presence file is not an object".into()))?;

    let name = obj.get("name").and_then(|v| v.as_str()).unwrap_or("Anonymous").trim().to_string();
    let name = if name.is_empty() { "Anonymous".to_string() } else { name };
    let room = obj
        .get("room")
        .and_then(|v| v.as_str())
        .map(sanitize_room_name)
        .unwrap_or_else(|| sanitize_room_name(fallback_room));
    let client_id = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let last_seen = obj.get("last_seen").and_then(|v| v.as_f64()).unwrap_or(mtime);

    Ok(PresenceEntry {
        name,
        color: obj.get("color").and_then(|v| v.as_str()).unwrap_or("white").to_string(),
        status: obj.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        client_id,
        room,
        last_seen,
    })
}

fn file_mtime_secs(path: &Path) -> Result<f64, HuddleError> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta.modified()?;
    Ok(mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64())
}

/// Tracks repeated parse failures per presence file so the reader can quarantine a file
/// after [`PRESENCE_QUARANTINE_THRESHOLD`] failures instead of retrying it forever.
#[derive(Default)]
pub struct QuarantineTracker {
    failures: Mutex<HashMap<std::path::PathBuf, u32>>,
}

impl QuarantineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `path`; quarantines (moves under `_presence_quarantine/`) and
    /// returns `true` once the threshold is reached.
    fn record_failure(&self, path: &Path) -> bool {
        let mut failures = self.failures.lock().expect("quarantine mutex poisoned");
        let count = failures.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        if *count >= PRESENCE_QUARANTINE_THRESHOLD {
            failures.remove(path);
            true
        } else {
            false
        }
    }
}

fn quarantine_file(path: &Path) {
    if let Some(parent) = path.parent() {
        let quarantine_dir = parent.join(PRESENCE_QUARANTINE_DIR);
        if std::fs::create_dir_all(&quarantine_dir).is_ok() {
            if let Some(name) = path.file_name() {
                let _ = std::fs::rename(path, quarantine_dir.join(name));
            }
        }
    }
}

/// Presence heartbeat + aggregation over the shared tree (§4.2).
pub struct Presence<'a> {
    storage: &'a Storage,
    quarantine: QuarantineTracker,
}

impl<'a> Presence<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage, quarantine: QuarantineTracker::new() }
    }

    /// Rewrites the peer's presence file for `room` via the atomic-write primitive
    /// (§4.2 Heartbeat loop).
    pub async fn heartbeat(
        &self,
        room: &str,
        client_id: &str,
        name: &str,
        color: &str,
        status: &str,
    ) -> Result<(), HuddleError> {
        let path = self.storage.paths().presence_dir(room).join(client_id);
        let entry = serde_json::json!({
            "name": name,
            "color": color,
            "status": status,
            "client_id": client_id,
            "room": sanitize_room_name(room),
            "last_seen": now_unix_secs(),
        });
        self.storage.write_presence_atomic(&path, &entry).await
    }

    /// Returns live (non-stale) presence entries for one room, unlinking stale files and
    /// quarantining files that repeatedly fail to parse (§4.2).
    pub fn online_users(&self, room: &str) -> HashMap<String, PresenceEntry> {
        let mut online = HashMap::new();
        let dir = self.storage.paths().presence_dir(room);
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return online;
        };
        let now = now_unix_secs();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(mtime) = file_mtime_secs(&path) else { continue };
            if now - mtime >= PRESENCE_STALE_SECONDS as f64 {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            match load_presence_entry(&path, room, mtime) {
                Ok(parsed) => {
                    online.insert(parsed.client_id.clone(), parsed);
                }
                Err(_) => {
                    if self.quarantine.record_failure(&path) {
                        quarantine_file(&path);
                    }
                }
            }
        }
        online
    }

    /// Aggregates presence across all rooms, keeping the entry with the most recent
    /// `last_seen` when the same `client_id` appears in more than one room
    /// (§4.2 Cross-room aggregation).
    pub fn online_users_all_rooms(&self) -> HashMap<String, PresenceEntry> {
        let mut online: HashMap<String, PresenceEntry> = HashMap::new();
        let root = self.storage.paths().rooms_root();
        let Ok(read_dir) = std::fs::read_dir(&root) else {
            return online;
        };
        for room_dir in read_dir.flatten() {
            if !room_dir.path().is_dir() {
                continue;
            }
            let room = room_dir.file_name().to_string_lossy().to_string();
            for (client_id, entry) in self.online_users(&room) {
                match online.get(&client_id) {
                    Some(existing) if existing.last_seen > entry.last_seen => {}
                    _ => {
                        online.insert(client_id, entry);
                    }
                }
            }
        }
        online
    }
}

/// Rate limiter for sidebar refresh (§4.2: "at most once per ~250ms unless forced").
pub struct SidebarRefreshGate {
    last_refresh_ms: AtomicU32,
}

impl Default for SidebarRefreshGate {
    fn default() -> Self {
        Self { last_refresh_ms: AtomicU32::new(0) }
    }
}

impl SidebarRefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a refresh should happen now. `forced` bypasses the rate limit
    /// (room switch, explicit `signal_refresh`).
    pub fn should_refresh(&self, now_ms: u32, forced: bool) -> bool {
        if forced {
            self.last_refresh_ms.store(now_ms, Ordering::SeqCst);
            return true;
        }
        let last = self.last_refresh_ms.load(Ordering::SeqCst);
        if now_ms.wrapping_sub(last) >= PRESENCE_SIDEBAR_MIN_REFRESH.as_millis() as u32 {
            self.last_refresh_ms.store(now_ms, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario (§8 invariant 10)**: a presence file last mtime'd more than 30s ago is not
    /// reported online and is unlinked by the next reader.
    #[tokio::test]
    async fn stale_presence_entry_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let presence = Presence::new(&storage);
        let path = storage.paths().presence_dir("general").join("client000000");
        storage
            .write_presence_atomic(
                &path,
                &serde_json::json!({"name": "bob", "client_id": "client000000", "room": "general", "last_seen": 0}),
            )
            .await
            .unwrap();
        let stale_time = std::time::SystemTime::now() - Duration::from_secs(60);
        filetime_set_mtime(&path, stale_time);

        let online = presence.online_users("general");
        assert!(online.is_empty());
        assert!(!path.exists());
    }

    /// **Scenario**: a fresh presence file is reported online.
    #[tokio::test]
    async fn fresh_presence_entry_is_online() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let presence = Presence::new(&storage);
        presence.heartbeat("general", "client000001", "alice", "green", "").await.unwrap();

        let online = presence.online_users("general");
        assert_eq!(online.len(), 1);
        assert_eq!(online.get("client000001").unwrap().name, "alice");
    }

    /// **Scenario**: the same client id in two rooms keeps only the most-recently-seen entry.
    #[tokio::test]
    async fn cross_room_aggregation_prefers_latest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let presence = Presence::new(&storage);
        presence.heartbeat("general", "dupclient0001", "alice", "green", "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        presence.heartbeat("random", "dupclient0001", "alice", "green", "away").await.unwrap();

        let merged = presence.online_users_all_rooms();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("dupclient0001").unwrap().room, "random");
    }

    /// Test-only mtime setter; std has no portable API for this, so we use a small shim.
    fn filetime_set_mtime(path: &Path, time: std::time::SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}

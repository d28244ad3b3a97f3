//! Append-only JSONL room logs, incremental tailing, schema validation, and atomic
//! presence file writes (§4.1).
//!
//! Grounded in `original_source/huddle_chat/services/storage_service.py`: the append
//! protocol (exclusive lock, append-mode write, flush+fsync, exponential backoff on
//! contention), the schema-validation rules in [`parse_event_line`], and the tail-with-
//! truncation-detection logic in [`tail_since`].

mod lock;

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HuddleError;
use crate::model::{Event, EVENT_ALLOWED_TYPES, EVENT_SCHEMA_VERSION};

/// Root of the shared tree, e.g. `<base_dir>` from §6's filesystem layout.
#[derive(Debug, Clone)]
pub struct RoomPaths {
    base_dir: PathBuf,
}

/// A sanitized room name: lowercase alphanumerics plus `-_`, bounded length (§3 Room).
pub fn sanitize_room_name(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let trimmed = if cleaned.len() > 64 { &cleaned[..64] } else { &cleaned };
    if trimmed.is_empty() {
        "general".to_string()
    } else {
        trimmed.to_string()
    }
}

impl RoomPaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn room_dir(&self, room: &str) -> PathBuf {
        self.base_dir.join("rooms").join(sanitize_room_name(room))
    }

    pub fn message_file(&self, room: &str) -> PathBuf {
        self.room_dir(room).join("messages.jsonl")
    }

    pub fn presence_dir(&self, room: &str) -> PathBuf {
        self.room_dir(room).join("presence")
    }

    pub fn rooms_root(&self) -> PathBuf {
        self.base_dir.join("rooms")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.base_dir.join("memory")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.base_dir.join("agents")
    }
}

/// Parses and schema-validates one JSONL row (§4.1 Schema validation, §8 property 3).
///
/// Returns `None` — never an error — for any malformed or out-of-schema row; tailing
/// must never abort on a single bad line.
pub fn parse_event_line(line: &str) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object_mut()?;

    let kind = obj.get("type")?.as_str()?.trim().to_ascii_lowercase();
    if !EVENT_ALLOWED_TYPES.contains(&kind.as_str()) {
        tracing::warn!(kind = %kind, "invalid event type ignored");
        return None;
    }
    let author = obj.get("author")?.as_str()?.to_string();
    let text = obj.get("text")?.as_str()?.to_string();

    if let Some(v) = obj.get("v") {
        let version = v.as_i64()?;
        if version > EVENT_SCHEMA_VERSION {
            tracing::warn!(version, "future event schema version ignored");
            return None;
        }
    } else {
        obj.insert("v".to_string(), serde_json::json!(EVENT_SCHEMA_VERSION));
    }
    if !obj.contains_key("ts") {
        let ts = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        obj.insert("ts".to_string(), serde_json::json!(ts));
    }
    obj.insert("type".to_string(), serde_json::json!(kind));
    obj.insert("author".to_string(), serde_json::json!(author));
    obj.insert("text".to_string(), serde_json::json!(text));

    serde_json::from_value(value).ok()
}

/// Encodes `event` as a single ASCII-safe JSON line (no embedded newline).
fn encode_event_line(event: &Event) -> Result<String, HuddleError> {
    let value = serde_json::to_value(event)?;
    let ascii_safe = ascii_escape_json(&value);
    Ok(ascii_safe)
}

/// `serde_json::to_string` already escapes control characters but leaves non-ASCII bytes
/// as UTF-8; §6 requires ASCII-safe rows, so non-ASCII scalars are escaped as `\uXXXX`.
fn ascii_escape_json(value: &serde_json::Value) -> String {
    let raw = serde_json::to_string(value).expect("Value always serializes");
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Per-room byte offsets tracked by the monitor/tailing logic (§4.1 Tailing).
#[derive(Default)]
pub struct OffsetTracker {
    offsets: Mutex<HashMap<String, u64>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room: &str) -> u64 {
        *self.offsets.lock().expect("offset mutex poisoned").get(room).unwrap_or(&0)
    }

    pub fn set(&self, room: &str, offset: u64) {
        self.offsets.lock().expect("offset mutex poisoned").insert(room.to_string(), offset);
    }
}

/// Append/tail/presence primitives over the shared filesystem tree (§4.1).
pub struct Storage {
    paths: RoomPaths,
}

impl Storage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { paths: RoomPaths::new(base_dir) }
    }

    pub fn paths(&self) -> &RoomPaths {
        &self.paths
    }

    /// Appends `event` to `room`'s log under an exclusive lock, retrying on contention
    /// (§4.1 Append protocol). Returns `Ok(false)` (not an error) on lock exhaustion or a
    /// transient OS failure, matching the Python `write_to_file -> bool` contract so
    /// callers can show a "network busy or locked" message without unwinding.
    pub async fn append_event(&self, room: &str, event: &Event) -> Result<bool, HuddleError> {
        let path = self.paths.message_file(room);
        let line = encode_event_line(event)?;
        self.append_line_locked(&path, &line).await
    }

    /// Appends one pre-serialized JSON row to an arbitrary path (memory/action/audit logs).
    pub async fn append_jsonl(&self, path: &Path, row: &serde_json::Value) -> Result<bool, HuddleError> {
        let line = ascii_escape_json(row);
        self.append_line_locked(path, &line).await
    }

    async fn append_line_locked(&self, path: &Path, line: &str) -> Result<bool, HuddleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = path.to_path_buf();
        let line = line.to_string();
        // File I/O + locking are blocking; run on a blocking thread so the async worker
        // that called us still observes cancellation at its own suspension points.
        tokio::task::spawn_blocking(move || -> Result<bool, HuddleError> {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let locked = lock::acquire_exclusive(&file);
            match locked {
                Ok(()) => {
                    let mut f = &file;
                    let result = (|| -> std::io::Result<()> {
                        f.write_all(line.as_bytes())?;
                        f.write_all(b"\n")?;
                        f.flush()?;
                        f.sync_all()?;
                        Ok(())
                    })();
                    lock::release(&file);
                    match result {
                        Ok(()) => Ok(true),
                        Err(_) => Ok(false),
                    }
                }
                Err(_busy) => Ok(false),
            }
        })
        .await
        .map_err(|e| HuddleError::Io(std::io::Error::other(e)))?
    }

    /// Reads new rows since `byte_offset`, detecting truncation by resetting to `0` when the
    /// observed file size shrank (§4.1 Tailing, §8 scenario A1).
    pub fn tail_since(&self, room: &str, byte_offset: u64) -> Result<(Vec<Event>, u64), HuddleError> {
        let path = self.paths.message_file(room);
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let mut file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();
        let start = if size < byte_offset { 0 } else { byte_offset };
        file.seek(SeekFrom::Start(start))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let new_offset = start + buf.len() as u64;

        let events = buf
            .lines()
            .filter_map(parse_event_line)
            .collect::<Vec<_>>();
        Ok((events, new_offset))
    }

    /// Reads the last `max_lines` valid rows without establishing a tail offset
    /// (used for initial room-switch backfill).
    pub fn read_recent(&self, room: &str, max_lines: usize) -> Result<Vec<Event>, HuddleError> {
        let path = self.paths.message_file(room);
        if !path.exists() || max_lines == 0 {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let events: Vec<Event> = content.lines().filter_map(parse_event_line).collect();
        let start = events.len().saturating_sub(max_lines);
        Ok(events[start..].to_vec())
    }

    /// Lists sanitized room names present under `rooms/`.
    pub fn list_rooms(&self) -> Result<Vec<String>, HuddleError> {
        let root = self.paths.rooms_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut rooms = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    rooms.push(name.to_string());
                }
            }
        }
        rooms.sort();
        Ok(rooms)
    }

    /// Writes `data` to `path` atomically: write a sibling temp file, flush+fsync, rename
    /// over the destination (§4.1 Atomic presence writes).
    pub async fn write_presence_atomic(&self, path: &Path, data: &serde_json::Value) -> Result<(), HuddleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        let rand = uuid::Uuid::new_v4().simple().to_string();
        let tmp_name = format!(".{}.tmp-{pid}-{}", path.file_name().and_then(|n| n.to_str()).unwrap_or("presence"), &rand[..8]);
        let tmp_path = path.with_file_name(tmp_name);
        let serialized = serde_json::to_vec(data)?;

        let result = (|| -> std::io::Result<()> {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&serialized)?;
            f.flush()?;
            f.sync_all()?;
            std::fs::rename(&tmp_path, path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result.map_err(HuddleError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(text: &str) -> Event {
        Event::new("chat", "alice", text, "2026-01-01T10:00:00")
    }

    /// **Scenario**: schema guard rejects a row with an unknown `type` without panicking
    /// (§8 property 3).
    #[test]
    fn parse_event_line_rejects_unknown_type() {
        let line = r#"{"type":"bogus","author":"a","text":"hi"}"#;
        assert!(parse_event_line(line).is_none());
    }

    /// **Scenario**: missing `v` is back-filled to the current schema version.
    #[test]
    fn parse_event_line_backfills_version() {
        let line = r#"{"type":"chat","author":"a","text":"hi"}"#;
        let event = parse_event_line(line).unwrap();
        assert_eq!(event.v, EVENT_SCHEMA_VERSION);
    }

    /// **Scenario**: a row from a future schema version is rejected.
    #[test]
    fn parse_event_line_rejects_future_version() {
        let line = r#"{"v":99,"type":"chat","author":"a","text":"hi"}"#;
        assert!(parse_event_line(line).is_none());
    }

    /// **Scenario A1**: appending three events then truncating to zero bytes is detected by
    /// `tail_since`, which resets to offset 0 and returns the (now empty) list without
    /// raising (§8 scenario A1).
    #[tokio::test]
    async fn tail_since_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        for i in 0..3 {
            storage.append_event("general", &sample_event(&format!("msg{i}"))).await.unwrap();
        }
        let (events, offset) = storage.tail_since("general", 0).unwrap();
        assert_eq!(events.len(), 3);

        let path = storage.paths().message_file("general");
        std::fs::File::create(&path).unwrap(); // truncate to 0 bytes

        let (events_after, new_offset) = storage.tail_since("general", offset).unwrap();
        assert!(events_after.is_empty());
        assert_eq!(new_offset, 0);
    }

    /// **Scenario A2**-lite: concurrent appenders each produce a complete, well-formed line;
    /// none interleave (§8 invariant 1, property 1).
    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(Storage::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.append_event("general", &sample_event(&format!("concurrent-{i}"))).await.unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        let content = std::fs::read_to_string(storage.paths().message_file("general")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
    }

    /// **Scenario**: atomic presence write leaves no temp file behind on success.
    #[tokio::test]
    async fn write_presence_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let path = storage.paths().presence_dir("general").join("client123");
        storage
            .write_presence_atomic(&path, &serde_json::json!({"name": "alice"}))
            .await
            .unwrap();
        assert!(path.exists());
        let siblings: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn sanitize_room_name_lowercases_and_strips() {
        assert_eq!(sanitize_room_name("General Chat!"), "generalchat");
        assert_eq!(sanitize_room_name(""), "general");
    }
}

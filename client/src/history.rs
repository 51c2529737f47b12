//! # Connection History
//!
//! Append-only record of tunnel sessions. Storage sits behind
//! [`HistoryStore`] so deployments can substitute their own backend; the
//! shipped implementation writes JSON lines, one record per event, under
//! the user data directory.

use fxtunnel_protocol::unix_millis;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// One tunnel's lifetime. Written on connect; byte totals and
/// `disconnected_at` follow as a separate record on disconnect.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub tunnel_type: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub connected_at: u64,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    event: &'static str,
    #[serde(flatten)]
    entry: Option<&'a HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disconnected_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_received: Option<u64>,
}

pub trait HistoryStore: Send + Sync {
    /// Allocates an id and appends the connected record.
    fn append(&self, entry: HistoryEntry) -> u64;

    /// Appends the disconnect record for a previously appended entry.
    fn record_disconnect(&self, id: u64, bytes_sent: u64, bytes_received: u64);

    /// Next unique entry id.
    fn next_id(&self) -> u64;
}

/// JSON-lines file store. Failures degrade to warnings; history must
/// never take the tunnel down.
pub struct JsonlHistory {
    file: Mutex<File>,
    next_id: AtomicU64,
}

impl JsonlHistory {
    pub fn open(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_path(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            // Millisecond base keeps ids unique across restarts.
            next_id: AtomicU64::new(unix_millis()),
        })
    }

    fn write(&self, record: &Record<'_>) {
        let Ok(mut line) = serde_json::to_string(record) else {
            return;
        };
        line.push('\n');
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(error = %e, "history write failed");
            }
        }
    }
}

impl HistoryStore for JsonlHistory {
    fn append(&self, entry: HistoryEntry) -> u64 {
        let id = entry.id;
        self.write(&Record {
            event: "connected",
            entry: Some(&entry),
            id: None,
            disconnected_at: None,
            bytes_sent: None,
            bytes_received: None,
        });
        id
    }

    fn record_disconnect(&self, id: u64, bytes_sent: u64, bytes_received: u64) {
        self.write(&Record {
            event: "disconnected",
            entry: None,
            id: Some(id),
            disconnected_at: Some(unix_millis()),
            bytes_sent: Some(bytes_sent),
            bytes_received: Some(bytes_received),
        });
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Store used when history is unavailable (e.g. no writable data dir).
pub struct NullHistory {
    next_id: AtomicU64,
}

impl NullHistory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(unix_millis()),
        }
    }
}

impl HistoryStore for NullHistory {
    fn append(&self, _entry: HistoryEntry) -> u64 {
        0
    }
    fn record_disconnect(&self, _id: u64, _bytes_sent: u64, _bytes_received: u64) {}
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn default_path() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fxtunnel")
        .join("history.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_disconnect_append_two_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = JsonlHistory::open(Some(path.clone())).unwrap();

        let id = store.next_id();
        store.append(HistoryEntry {
            id,
            bundle_id: None,
            tunnel_type: "http".into(),
            local_port: 3000,
            remote_addr: None,
            url: Some("http://abc.tunnel.test:8080".into()),
            connected_at: unix_millis(),
        });
        store.record_disconnect(id, 10, 20);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let connected: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(connected["event"], "connected");
        assert_eq!(connected["local_port"], 3000);
        let disconnected: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(disconnected["id"], id);
        assert_eq!(disconnected["bytes_received"], 20);
    }
}

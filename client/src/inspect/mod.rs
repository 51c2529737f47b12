//! # Inspector
//!
//! Captures, stores, streams and replays the HTTP exchanges flowing
//! through HTTP tunnels:
//!
//! - [`capture`] — the per-connection request/response parser
//! - [`api`]     — the local HTTP/SSE surface on `127.0.0.1:4040`
//! - [`ui`]      — the embedded dashboard assets
//!
//! This module owns the shared [`InspectorState`]: the bounded ring buffer
//! of finalized exchanges (the durable in-RAM record) and the broadcast
//! channel feeding SSE subscribers (ephemeral; a slow subscriber drops its
//! oldest events rather than back-pressuring the forwarder).

pub mod api;
pub mod capture;
pub mod ui;

use self::capture::ExchangeDraft;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;

/// Subscribers further behind than this lose their oldest events.
const BROADCAST_CAPACITY: usize = 64;

/// One finalized request/response pair as observed by the capture parser.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: String,
    pub tunnel_id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub request_truncated: bool,
    pub request_body_size: u64,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub response_truncated: bool,
    pub response_body_size: u64,
    /// Unix milliseconds of the first request byte.
    pub started_at: u64,
    pub duration_ns: u64,
    pub malformed: bool,
    /// Id of the exchange this one replays, when applicable.
    pub replay_ref: Option<String>,
}

/// Shared inspector state: ring buffer, SSE broadcast, counters.
pub struct InspectorState {
    pub enabled: bool,
    pub max_body_size: u64,
    max_entries: usize,
    ring: RwLock<VecDeque<Arc<Exchange>>>,
    broadcast: broadcast::Sender<Arc<Exchange>>,
    next_id: AtomicU64,
    /// Total exchanges recorded since boot; survives `DELETE`.
    total: AtomicU64,
    started: Instant,
}

impl InspectorState {
    pub fn new(enabled: bool, max_body_size: u64, max_entries: usize) -> Arc<Self> {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            enabled,
            max_body_size,
            max_entries: max_entries.max(1),
            ring: RwLock::new(VecDeque::new()),
            broadcast,
            next_id: AtomicU64::new(1),
            total: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    /// Assigns the next id, pushes into the ring (evicting the oldest
    /// under the same write lock) and broadcasts to SSE subscribers.
    pub fn record(&self, draft: ExchangeDraft) -> Arc<Exchange> {
        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let exchange = Arc::new(Exchange {
            id,
            tunnel_id: draft.tunnel_id,
            method: draft.method,
            host: draft.host,
            path: draft.path,
            request_headers: draft.request_headers,
            request_body: draft.request_body,
            request_truncated: draft.request_truncated,
            request_body_size: draft.request_body_size,
            response_status: draft.response_status,
            response_headers: draft.response_headers,
            response_body: draft.response_body,
            response_truncated: draft.response_truncated,
            response_body_size: draft.response_body_size,
            started_at: draft.started_at,
            duration_ns: draft.duration_ns,
            malformed: draft.malformed,
            replay_ref: draft.replay_ref,
        });

        {
            let mut ring = self.ring.write().expect("ring lock");
            if ring.len() == self.max_entries {
                ring.pop_front();
            }
            ring.push_back(exchange.clone());
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        let _ = self.broadcast.send(exchange.clone());
        exchange
    }

    /// Newest-last snapshot of the ring.
    pub fn snapshot(&self) -> Vec<Arc<Exchange>> {
        self.ring.read().expect("ring lock").iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Exchange>> {
        self.ring
            .read()
            .expect("ring lock")
            .iter()
            .find(|x| x.id == id)
            .cloned()
    }

    /// Empties the ring. Captures in progress and the running total are
    /// unaffected.
    pub fn clear(&self) {
        self.ring.write().expect("ring lock").clear();
    }

    pub fn len(&self) -> usize {
        self.ring.read().expect("ring lock").len()
    }

    pub fn total_exchanges(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Exchange>> {
        self.broadcast.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(path: &str) -> ExchangeDraft {
        ExchangeDraft {
            tunnel_id: "t-1".into(),
            method: "GET".into(),
            host: "h".into(),
            path: path.into(),
            request_headers: Vec::new(),
            request_body: Vec::new(),
            request_truncated: false,
            request_body_size: 0,
            response_status: 200,
            response_headers: Vec::new(),
            response_body: b"ok".to_vec(),
            response_truncated: false,
            response_body_size: 2,
            started_at: fxtunnel_protocol::unix_millis(),
            duration_ns: 1_000,
            malformed: false,
            replay_ref: None,
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let state = InspectorState::new(true, 1024, 10);
        assert_eq!(state.record(draft("/a")).id, "c-1");
        assert_eq!(state.record(draft("/b")).id, "c-2");
        assert_eq!(state.record(draft("/c")).id, "c-3");
    }

    #[test]
    fn ring_never_exceeds_capacity_and_evicts_oldest() {
        let state = InspectorState::new(true, 1024, 3);
        for i in 0..5 {
            state.record(draft(&format!("/{i}")));
        }
        let snapshot = state.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].path, "/2");
        assert_eq!(snapshot[2].path, "/4");
        assert_eq!(state.total_exchanges(), 5);
    }

    #[test]
    fn clear_is_idempotent_and_total_survives() {
        let state = InspectorState::new(true, 1024, 10);
        state.record(draft("/a"));
        state.record(draft("/b"));
        state.clear();
        assert_eq!(state.len(), 0);
        state.clear();
        assert_eq!(state.len(), 0);
        assert_eq!(state.total_exchanges(), 2);
        // Recording keeps counting upward from boot.
        state.record(draft("/c"));
        assert_eq!(state.total_exchanges(), 3);
        assert_eq!(state.snapshot()[0].id, "c-3");
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let state = InspectorState::new(true, 1024, 10);
        let mut rx = state.subscribe();
        state.record(draft("/live"));
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.path, "/live");
    }
}

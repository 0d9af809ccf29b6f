//! Application registry: the single source of truth the proxy consults

use crate::error::{Error, Result};
use crate::supervisor::ProcessHandle;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Lifecycle state of an application's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Process spawned, not yet accepting connections
    Starting,
    /// Backend accepted a connection or reported readiness
    Running,
    /// Process exited or became unreachable without being asked to
    Crashed,
    /// Process was terminated deliberately
    Stopped,
}

impl AppState {
    /// `Crashed` and `Stopped` admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, AppState::Crashed | AppState::Stopped)
    }

    pub fn can_transition_to(self, next: AppState) -> bool {
        matches!(
            (self, next),
            (AppState::Starting, AppState::Running)
                | (AppState::Starting, AppState::Crashed)
                | (AppState::Starting, AppState::Stopped)
                | (AppState::Running, AppState::Crashed)
                | (AppState::Running, AppState::Stopped)
        )
    }
}

/// Registry entry binding an id to a supervised backend process and port
pub struct AppRecord {
    id: String,
    port: u16,
    source_path: PathBuf,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    state: watch::Sender<AppState>,
    handle: Mutex<Option<ProcessHandle>>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    exit_reason: Mutex<Option<String>>,
    /// Bearer token the backend presents to the readiness callback
    ready_token: Option<String>,
}

impl AppRecord {
    pub(crate) fn new(
        id: String,
        port: u16,
        source_path: PathBuf,
        handle: Option<ProcessHandle>,
    ) -> Self {
        let (state, _) = watch::channel(AppState::Starting);
        Self {
            id,
            port,
            source_path,
            created_at: Utc::now(),
            pid: handle.as_ref().and_then(|h| h.pid()),
            state,
            handle: Mutex::new(handle),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            exit_reason: Mutex::new(None),
            ready_token: None,
        }
    }

    pub(crate) fn with_ready_token(mut self, token: Option<String>) -> Self {
        self.ready_token = token;
        self
    }

    pub fn ready_token(&self) -> Option<&str> {
        self.ready_token.as_deref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }

    /// Apply a state transition; returns false if the state machine forbids it
    pub fn transition(&self, next: AppState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            info!(app_id = %self.id, port = self.port, ?from, to = ?next, "Application state changed");
        }
        changed
    }

    /// Wait until the record leaves `Starting`, up to `timeout`
    pub async fn wait_until_started(&self, timeout: Duration) -> AppState {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| *s != AppState::Starting)).await;
        match waited {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    pub(crate) fn take_handle(&self) -> Option<ProcessHandle> {
        self.handle.lock().take()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Count a request as in flight until the guard is dropped
    pub fn begin_request(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        InFlightGuard { counter: &self.in_flight }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason.lock().clone()
    }

    /// Record why the process ended; the first reason wins
    pub(crate) fn set_exit_reason(&self, reason: impl Into<String>) {
        let mut guard = self.exit_reason.lock();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    pub fn summary(&self) -> AppSummary {
        AppSummary {
            id: self.id.clone(),
            state: self.state(),
            port: self.port,
            pid: self.pid,
            in_flight: self.in_flight(),
            created_at: self.created_at.to_rfc3339(),
            exit_reason: self.exit_reason(),
        }
    }
}

impl std::fmt::Debug for AppRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRecord")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Decrements the in-flight counter on drop, including on cancellation
pub struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Status information for one application
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    pub id: String,
    pub state: AppState,
    pub port: u16,
    pub pid: Option<u32>,
    pub in_flight: usize,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
}

/// Concurrent map from application id to its record.
///
/// Created once and shared behind an `Arc` by the submission endpoint, the
/// router and the admin API. Every id ever issued is remembered so that no id
/// is handed out twice, even after its record has been removed.
#[derive(Default)]
pub struct AppRegistry {
    apps: DashMap<String, Arc<AppRecord>>,
    issued: DashSet<String>,
}

impl AppRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue a fresh application id
    pub fn reserve_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Whether this id was ever issued by this registry
    pub fn was_issued(&self, id: &str) -> bool {
        self.issued.contains(id)
    }

    pub fn put(&self, record: Arc<AppRecord>) {
        self.issued.insert(record.id().to_string());
        self.apps.insert(record.id().to_string(), record);
    }

    pub fn get(&self, id: &str) -> Result<Arc<AppRecord>> {
        self.apps
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<Arc<AppRecord>> {
        self.apps
            .remove(id)
            .map(|(_, record)| record)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<Arc<AppRecord>> {
        self.apps.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Status of all applications, oldest first
    pub fn list(&self) -> Vec<AppSummary> {
        let mut records = self.records();
        records.sort_by_key(|r| r.created_at());
        records.iter().map(|r| r.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn detached_record(id: &str, port: u16) -> Arc<AppRecord> {
        Arc::new(AppRecord::new(
            id.to_string(),
            port,
            PathBuf::from(format!("/tmp/{}/app.py", id)),
            None,
        ))
    }

    #[test]
    fn test_state_machine_transitions() {
        use AppState::*;

        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Crashed));
        assert!(Starting.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Crashed, Stopped] {
            assert!(terminal.is_terminal());
            for next in [Starting, Running, Crashed, Stopped] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Starting.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_record_transition_rejects_leaving_terminal_state() {
        let record = detached_record("a", 4000);
        assert_eq!(record.state(), AppState::Starting);

        assert!(record.transition(AppState::Running));
        assert!(record.transition(AppState::Crashed));
        assert!(!record.transition(AppState::Running));
        assert!(!record.transition(AppState::Stopped));
        assert_eq!(record.state(), AppState::Crashed);
    }

    #[test]
    fn test_put_then_get_observes_write() {
        let registry = AppRegistry::new();
        registry.put(detached_record("app-1", 4001));

        let record = registry.get("app-1").unwrap();
        assert_eq!(record.port(), 4001);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = AppRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "missing"));
    }

    #[test]
    fn test_remove_then_get_is_not_found() {
        let registry = AppRegistry::new();
        registry.put(detached_record("gone", 4002));

        let removed = registry.remove("gone").unwrap();
        assert_eq!(removed.id(), "gone");
        assert!(matches!(registry.get("gone"), Err(Error::NotFound(_))));
        assert!(matches!(registry.remove("gone"), Err(Error::NotFound(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserved_ids_are_never_reissued() {
        let registry = AppRegistry::new();
        let mut ids = HashSet::new();
        for _ in 0..500 {
            let id = registry.reserve_id();
            assert!(registry.was_issued(&id));
            assert!(ids.insert(id));
        }

        // Removal does not make an id available again
        let id = registry.reserve_id();
        registry.put(detached_record(&id, 4003));
        registry.remove(&id).unwrap();
        assert!(registry.was_issued(&id));
        assert_ne!(registry.reserve_id(), id);
    }

    #[test]
    fn test_in_flight_guard_decrements_on_drop() {
        let record = detached_record("busy", 4004);
        {
            let _a = record.begin_request();
            let _b = record.begin_request();
            assert_eq!(record.in_flight(), 2);
        }
        assert_eq!(record.in_flight(), 0);
    }

    #[test]
    fn test_exit_reason_first_wins() {
        let record = detached_record("r", 4005);
        assert!(record.exit_reason().is_none());
        record.set_exit_reason("connection refused");
        record.set_exit_reason("exit status: 1");
        assert_eq!(record.exit_reason().as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_list_reports_summaries() {
        let registry = AppRegistry::new();
        registry.put(detached_record("one", 4010));
        registry.put(detached_record("two", 4011));
        registry.get("two").unwrap().transition(AppState::Running);

        let list = registry.list();
        assert_eq!(list.len(), 2);
        let two = list.iter().find(|s| s.id == "two").unwrap();
        assert_eq!(two.state, AppState::Running);
        assert_eq!(two.port, 4011);

        let json = serde_json::to_value(two).unwrap();
        assert_eq!(json["state"], "running");
        assert!(json.get("exit_reason").is_none());
    }

    #[tokio::test]
    async fn test_wait_until_started_observes_transition() {
        let record = detached_record("w", 4020);
        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.wait_until_started(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        record.transition(AppState::Running);
        assert_eq!(waiter.await.unwrap(), AppState::Running);
    }

    #[tokio::test]
    async fn test_wait_until_started_times_out() {
        let record = detached_record("slow", 4021);
        let state = record.wait_until_started(Duration::from_millis(30)).await;
        assert_eq!(state, AppState::Starting);
    }

    #[test]
    fn test_concurrent_put_and_get() {
        let registry = AppRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", t, i);
                        registry.put(detached_record(&id, 5000));
                        assert_eq!(registry.get(&id).unwrap().id(), id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}

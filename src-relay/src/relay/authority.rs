//! Canonical state the relay arbitrates and rebroadcasts.
//!
//! `SessionBook` owns one canonical session per category and enforces
//! first-writer-wins. `ScheduleSource` is the seam to the schedule evaluator,
//! which the relay only reads. `UsageLedger` keeps per-connection heartbeat
//! totals.
//!
//! All guards here are short-held `std::sync` locks; nothing awaits while
//! holding one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use super::protocol::{CanonicalSession, ScheduleSnapshot, UsageReport};

/// Heartbeat length assumed when the message does not carry one
pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 15;

/// Upper bound on the seconds a single heartbeat may report
pub const MAX_HEARTBEAT_SECONDS: u64 = 5 * 60;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Most categories the session book keeps, ended sessions included
pub const MAX_TRACKED_CATEGORIES: usize = 64;

/// Handles the relay needs, passed in at construction
#[derive(Clone)]
pub struct Authorities {
    pub sessions: Arc<SessionBook>,
    pub schedule: Arc<dyn ScheduleSource>,
    pub usage: Arc<UsageLedger>,
}

impl Authorities {
    pub fn new(schedule: Arc<dyn ScheduleSource>) -> Self {
        Self {
            sessions: Arc::new(SessionBook::new()),
            schedule,
            usage: Arc::new(UsageLedger::new()),
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Caller-supplied parameters for starting or amending a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub intent: Option<String>,
    pub categories: Option<Vec<String>>,
    pub duration_minutes: Option<u32>,
}

/// Result of a first-writer-wins start attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The caller's session is now canonical
    Accepted(CanonicalSession),
    /// A session was already active; it is returned unchanged
    AlreadyActive(CanonicalSession),
    /// Every tracked category holds an active session and the book is at capacity
    Full,
}

/// Canonical sessions keyed by category
pub struct SessionBook {
    sessions: RwLock<BTreeMap<String, CanonicalSession>>,
    changes: broadcast::Sender<String>,
}

impl SessionBook {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Copy of every category's canonical session
    pub fn snapshot(&self) -> BTreeMap<String, CanonicalSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, category: &str) -> Option<CanonicalSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category)
            .cloned()
    }

    pub fn is_active(&self, category: &str) -> bool {
        self.get(category).map(|s| s.active).unwrap_or(false)
    }

    /// Start a session unless one is already active for `category`.
    ///
    /// The check and the insert happen under one write guard, so of two
    /// racing callers exactly one is accepted.
    pub fn try_start(
        &self,
        category: &str,
        params: SessionParams,
        now: DateTime<Utc>,
    ) -> StartOutcome {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = sessions.get(category).filter(|s| s.active) {
            return StartOutcome::AlreadyActive(existing.clone());
        }

        if !sessions.contains_key(category) && sessions.len() >= MAX_TRACKED_CATEGORIES {
            match oldest_ended(&sessions) {
                Some(evicted) => {
                    debug!(category = %evicted, "evicting ended session to make room");
                    sessions.remove(&evicted);
                }
                None => {
                    debug!(category, "session book full, refusing start");
                    return StartOutcome::Full;
                }
            }
        }

        let session = CanonicalSession {
            active: true,
            intent: params.intent,
            categories: params.categories,
            started_at: now,
            ended_at: None,
            duration_minutes: params.duration_minutes,
        };
        sessions.insert(category.to_string(), session.clone());
        StartOutcome::Accepted(session)
    }

    /// End the active session for `category`, returning it if there was one
    pub fn end(&self, category: &str, now: DateTime<Utc>) -> Option<CanonicalSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get_mut(category).filter(|s| s.active)?;
        session.active = false;
        session.ended_at = Some(now);
        Some(session.clone())
    }

    /// Amend the active session for `category`; `None` fields are left as is
    pub fn update(&self, category: &str, params: SessionParams) -> Option<CanonicalSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get_mut(category).filter(|s| s.active)?;

        if params.intent.is_some() {
            session.intent = params.intent;
        }
        if params.categories.is_some() {
            session.categories = params.categories;
        }
        if params.duration_minutes.is_some() {
            session.duration_minutes = params.duration_minutes;
        }
        Some(session.clone())
    }

    /// End a session on behalf of the owning process (timer elapsed, user
    /// action in the overlay) and notify subscribers.
    pub fn expire(&self, category: &str, now: DateTime<Utc>) -> Option<CanonicalSession> {
        let ended = self.end(category, now)?;
        debug!(category, "session expired by policy");
        // No subscribers is fine
        let _ = self.changes.send(category.to_string());
        Some(ended)
    }

    /// Categories whose session changed outside the relay
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// Category of the ended session that ended first, if any
fn oldest_ended(sessions: &BTreeMap<String, CanonicalSession>) -> Option<String> {
    sessions
        .iter()
        .filter(|(_, s)| !s.active)
        .min_by_key(|(_, s)| s.ended_at)
        .map(|(category, _)| category.clone())
}

impl Default for SessionBook {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// The schedule evaluator, as seen by the relay
pub trait ScheduleSource: Send + Sync {
    /// Current state, synchronously
    fn snapshot(&self) -> ScheduleSnapshot;

    /// Receives a fresh snapshot after every block transition
    fn subscribe(&self) -> broadcast::Receiver<ScheduleSnapshot>;
}

/// Holds the latest snapshot pushed by the schedule evaluator
pub struct ScheduleCell {
    current: RwLock<ScheduleSnapshot>,
    changes: broadcast::Sender<ScheduleSnapshot>,
}

impl ScheduleCell {
    pub fn new(initial: ScheduleSnapshot) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            current: RwLock::new(initial),
            changes,
        }
    }

    /// Replace the current snapshot and notify subscribers
    pub fn publish(&self, snapshot: ScheduleSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        let _ = self.changes.send(snapshot);
    }
}

impl Default for ScheduleCell {
    fn default() -> Self {
        Self::new(ScheduleSnapshot::disabled())
    }
}

impl ScheduleSource for ScheduleCell {
    fn snapshot(&self) -> ScheduleSnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ScheduleSnapshot> {
        self.changes.subscribe()
    }
}

// ============================================================================
// Usage
// ============================================================================

/// Heartbeat totals per connection
#[derive(Default)]
pub struct UsageLedger {
    reports: Mutex<HashMap<String, UsageReport>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one heartbeat and return the connection's updated totals
    pub fn record(
        &self,
        connection: &str,
        domain: &str,
        category: Option<&str>,
        seconds: Option<u64>,
    ) -> UsageReport {
        let seconds = seconds
            .unwrap_or(DEFAULT_HEARTBEAT_SECONDS)
            .min(MAX_HEARTBEAT_SECONDS);

        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        let report = reports.entry(connection.to_string()).or_default();

        *report.by_domain.entry(domain.to_string()).or_insert(0) += seconds;
        if let Some(category) = category {
            *report.by_category.entry(category.to_string()).or_insert(0) += seconds;
        }
        report.total_seconds += seconds;
        report.clone()
    }

    pub fn report(&self, connection: &str) -> UsageReport {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a connection's totals once it disconnects
    pub fn forget(&self, connection: &str) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection);
    }
}

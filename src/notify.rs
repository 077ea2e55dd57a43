//! Change notification with per-transaction buffering.
//!
//! Outside a transaction an event is delivered to every subscriber as soon as
//! the statement that caused it succeeds. Inside one, events accumulate in the
//! transaction's [`TransactionScope`] and are delivered together, once, when the
//! scope completes as committed. Any other completion discards them.
//!
//! Delivery always happens outside the scope and subscriber locks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::statement::Filter;
use crate::table::DataTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Mixed,
    Unknown,
}

impl ChangeKind {
    /// One label for a set of events: their common kind, or `Mixed`.
    pub fn summarize<'a, I>(events: I) -> Option<ChangeKind>
    where
        I: IntoIterator<Item = &'a ChangeEvent>,
    {
        let mut kinds = events.into_iter().map(ChangeEvent::kind);
        let first = kinds.next()?;
        if kinds.all(|k| k == first) {
            Some(first)
        } else {
            Some(ChangeKind::Mixed)
        }
    }
}

type SnapshotLoader = Box<dyn Fn() -> Result<DataTable> + Send + Sync>;

struct LazySnapshot {
    loader: SnapshotLoader,
    rows: OnceCell<DataTable>,
}

/// One successful mutation of one table.
#[derive(Clone)]
pub struct ChangeEvent {
    table: String,
    kind: ChangeKind,
    conditions: Option<Filter>,
    snapshot: Option<Arc<LazySnapshot>>,
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("table", &self.table)
            .field("kind", &self.kind)
            .field("conditions", &self.conditions)
            .field("has_snapshot", &self.snapshot.is_some())
            .finish()
    }
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            kind,
            conditions: None,
            snapshot: None,
        }
    }

    /// Event for a free-form statement, if its verb and table are recognized.
    pub fn from_statement(sql: &str) -> Option<Self> {
        classify_statement(sql).map(|(kind, table)| Self::new(table, kind))
    }

    pub fn with_conditions(mut self, conditions: Filter) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Attach a loader for the affected rows; it runs at most once, on request.
    pub fn with_snapshot<F>(mut self, loader: F) -> Self
    where
        F: Fn() -> Result<DataTable> + Send + Sync + 'static,
    {
        self.snapshot = Some(Arc::new(LazySnapshot {
            loader: Box::new(loader),
            rows: OnceCell::new(),
        }));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Condition that identified the affected rows.
    pub fn conditions(&self) -> Option<&Filter> {
        self.conditions.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// The affected rows, materialized on first call.
    ///
    /// A failed load is returned and retried on the next call.
    pub fn snapshot(&self) -> Result<Option<&DataTable>> {
        match &self.snapshot {
            Some(lazy) => lazy.rows.get_or_try_init(|| (lazy.loader)()).map(Some),
            None => Ok(None),
        }
    }
}

static STATEMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?P<verb>INSERT\s+(?:INTO\s+)?|UPDATE\s+|DELETE\s+(?:FROM\s+)?)\W?(?P<table>\w+)",
    )
    .expect("statement pattern is valid")
});

/// Recognize `INSERT [INTO]`, `UPDATE` or `DELETE [FROM]` followed by a table.
pub fn classify_statement(sql: &str) -> Option<(ChangeKind, String)> {
    let caps = STATEMENT_PATTERN.captures(sql)?;
    let verb = caps.name("verb")?.as_str().trim_start();
    let table = caps.name("table")?.as_str().to_string();
    let kind = match verb.as_bytes().first()?.to_ascii_uppercase() {
        b'I' => ChangeKind::Insert,
        b'U' => ChangeKind::Update,
        b'D' => ChangeKind::Delete,
        _ => return None,
    };
    Some((kind, table))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    InDoubt,
}

#[derive(Debug)]
struct ScopeState {
    status: TransactionStatus,
    events: Vec<ChangeEvent>,
}

#[derive(Debug)]
struct ScopeInner {
    id: u64,
    state: Mutex<ScopeState>,
}

/// Event buffer bound to one transaction. Clones share the buffer, so
/// threads working in the same transaction can append concurrently.
#[derive(Debug, Clone)]
pub struct TransactionScope {
    inner: Arc<ScopeInner>,
}

impl TransactionScope {
    fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id,
                state: Mutex::new(ScopeState {
                    status: TransactionStatus::Active,
                    events: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Number of buffered events.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Buffer `event`; refused once the scope is no longer active.
    fn append(&self, event: ChangeEvent) -> std::result::Result<(), ChangeEvent> {
        let mut state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(event);
        }
        state.events.push(event);
        Ok(())
    }

    /// Move to a terminal status and drain the buffer.
    ///
    /// Returns the events to deliver (empty unless committed), or `None` when
    /// the scope had already completed.
    fn finish(&self, status: TransactionStatus) -> Option<Vec<ChangeEvent>> {
        let mut state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            return None;
        }
        state.status = status;
        let events = std::mem::take(&mut state.events);
        if status == TransactionStatus::Committed {
            Some(events)
        } else {
            Some(Vec::new())
        }
    }
}

/// Opaque handle returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub type ChangeHandler = Arc<dyn Fn(&[ChangeEvent]) + Send + Sync>;

/// Subscriber registry and transaction state machine.
#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: RwLock<Vec<(SubscriptionToken, ChangeHandler)>>,
    next_token: AtomicU64,
    next_scope: AtomicU64,
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&[ChangeEvent]) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let handler: ChangeHandler = Arc::new(handler);
        self.subscribers.write().push((token, handler));
        token
    }

    /// Returns false if the token was not registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    /// Open a buffer for a new transaction.
    pub fn begin(&self) -> TransactionScope {
        let scope = TransactionScope::new(self.next_scope.fetch_add(1, Ordering::Relaxed));
        debug!("Transaction scope {} started", scope.id());
        scope
    }

    /// Report a successful mutation.
    ///
    /// `event` is only built when someone is subscribed. Without a scope it is
    /// delivered now; with an active scope it is buffered.
    pub fn publish<F>(&self, scope: Option<&TransactionScope>, event: F)
    where
        F: FnOnce() -> ChangeEvent,
    {
        if !self.has_subscribers() {
            return;
        }

        match scope {
            None => self.deliver(&[event()]),
            Some(scope) => {
                if let Err(event) = scope.append(event()) {
                    warn!(
                        "Dropping {:?} event for table {}: transaction scope {} is {:?}",
                        event.kind(),
                        event.table(),
                        scope.id(),
                        scope.status()
                    );
                }
            }
        }
    }

    /// Close `scope`. Committed scopes deliver their buffer once; anything
    /// else discards it. Returns the number of events delivered.
    pub fn complete(&self, scope: &TransactionScope, status: TransactionStatus) -> usize {
        if status == TransactionStatus::Active {
            warn!("Ignoring completion of scope {} with Active status", scope.id());
            return 0;
        }

        let Some(events) = scope.finish(status) else {
            debug!("Transaction scope {} already completed", scope.id());
            return 0;
        };

        debug!(
            "Transaction scope {} completed as {:?} ({} events)",
            scope.id(),
            status,
            events.len()
        );
        if events.is_empty() {
            return 0;
        }
        self.deliver(&events);
        events.len()
    }

    fn deliver(&self, events: &[ChangeEvent]) {
        let handlers: Vec<ChangeHandler> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(events);
        }
    }
}

//! Change feed engine
//!
//! The document store keeps one row per id holding the most recent sequence
//! written for that id, so a scan by sequence yields each document once, at
//! its newest position. Filters run on the loaded winning body after the
//! read.
//!
//! The continuous form registers with the `ChangeNotifier` before it catches
//! up, then re-runs the query from its cursor on every notification for the
//! database.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::document::is_local;
use crate::error::Result;
use crate::notifier::ChangeNotifier;
use crate::revision::RevisionId;
use crate::storage::{Backend, StorageError, TxnMode};

/// Predicate deciding whether a document body passes a filter
pub type ChangeFilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Callback receiving each delivered change
pub type ChangeCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Filter of a change feed
#[derive(Clone)]
pub enum ChangeFilter {
    /// Predicate registered on the database under this name
    Named(String),
    Predicate(ChangeFilterFn),
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeFilter::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ChangeFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Which revisions a change lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangesStyle {
    /// Only the winning revision
    #[default]
    MainOnly,
    /// Every leaf, winner first
    AllDocs,
}

#[derive(Clone, Default)]
pub struct ChangesOptions {
    pub since: u64,
    /// Walk a snapshot newest first; `since` is ignored
    pub descending: bool,
    pub filter: Option<ChangeFilter>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub style: ChangesStyle,
    /// Invoked once per change of a one-shot query
    pub on_change: Option<ChangeCallback>,
}

impl fmt::Debug for ChangesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesOptions")
            .field("since", &self.since)
            .field("descending", &self.descending)
            .field("filter", &self.filter)
            .field("include_docs", &self.include_docs)
            .field("conflicts", &self.conflicts)
            .field("style", &self.style)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRev {
    pub rev: RevisionId,
}

/// One entry of a change feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub id: String,
    /// Most recent sequence of the document
    pub seq: u64,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangesResponse {
    pub results: Vec<Change>,
    pub last_seq: u64,
}

/// Rows of one fetch, plus the highest sequence scanned
pub(crate) struct Fetched {
    pub changes: Vec<Change>,
    pub scanned_seq: u64,
}

/// Read the changes after `since`
pub(crate) fn fetch(
    backend: &dyn Backend,
    options: &ChangesOptions,
    filter: Option<&ChangeFilterFn>,
    since: u64,
) -> Result<Fetched> {
    let mut txn = backend.begin(TxnMode::Read)?;
    let from = if options.descending { 0 } else { since };
    let docs = txn.scan_documents_by_seq(from, options.descending)?;

    let mut changes = Vec::with_capacity(docs.len());
    let mut scanned_seq = since;
    for doc in docs {
        if is_local(&doc.id) {
            continue;
        }
        scanned_seq = scanned_seq.max(doc.seq);
        let leaves = doc.forest.leaves();
        let Some(winner) = leaves.first() else {
            continue;
        };
        let record = txn.get_sequence(doc.winning_seq)?.ok_or_else(|| {
            StorageError::Backend(format!("{} has no body at sequence {}", doc.id, doc.winning_seq))
        })?;

        let mut body = record.body;
        if options.conflicts {
            let conflicts = doc.forest.conflicts();
            if let (false, Value::Object(map)) = (conflicts.is_empty(), &mut body) {
                let list = conflicts.iter().map(|r| Value::String(r.to_string())).collect();
                map.insert("_conflicts".into(), Value::Array(list));
            }
        }
        if let Some(filter) = filter {
            if !filter(&body) {
                continue;
            }
        }

        let revs = match options.style {
            ChangesStyle::MainOnly => vec![ChangeRev { rev: winner.rev.clone() }],
            ChangesStyle::AllDocs => leaves.iter().map(|l| ChangeRev { rev: l.rev.clone() }).collect(),
        };
        changes.push(Change {
            id: doc.id,
            seq: doc.seq,
            changes: revs,
            deleted: winner.deleted,
            doc: options.include_docs.then_some(body),
        });
    }

    tracing::debug!("changes since {}: {} rows", since, changes.len());
    Ok(Fetched { changes, scanned_seq })
}

/// Lifecycle of a continuous feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Initializing,
    Fetching,
    Delivering,
    IdleListening,
    Completed,
}

impl FeedState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FeedState::Initializing,
            1 => FeedState::Fetching,
            2 => FeedState::Delivering,
            3 => FeedState::IdleListening,
            _ => FeedState::Completed,
        }
    }
}

/// State shared between a feed handle, its task and its listener
pub(crate) struct FeedControl {
    db_name: String,
    notifier: Arc<ChangeNotifier>,
    state: AtomicU8,
    cancelled: AtomicBool,
    cursor: AtomicU64,
    wake: tokio::sync::Notify,
    listener_id: std::sync::Mutex<Option<String>>,
}

impl FeedControl {
    fn transition(&self, state: FeedState) {
        if state == FeedState::Completed || !self.is_cancelled() {
            self.state.store(state as u8, Ordering::SeqCst);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .listener_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = listener {
            self.notifier.remove_listener(&self.db_name, &id);
        }
        self.transition(FeedState::Completed);
        self.wake.notify_one();
    }

    /// Deliver fetched changes in order, stopping as soon as the feed is
    /// cancelled
    fn deliver(&self, fetched: Fetched, on_change: &ChangeCallback) {
        self.transition(FeedState::Delivering);
        for change in &fetched.changes {
            if self.is_cancelled() {
                return;
            }
            on_change(change);
            self.cursor.fetch_max(change.seq, Ordering::SeqCst);
        }
        self.cursor.fetch_max(fetched.scanned_seq, Ordering::SeqCst);
        self.transition(FeedState::IdleListening);
    }
}

/// Handle of a continuous change feed
///
/// Dropping the handle cancels the feed.
pub struct ChangesFeed {
    control: Arc<FeedControl>,
}

impl ChangesFeed {
    /// Catch up from `options.since`, then follow every commit
    pub(crate) fn start(
        backend: Arc<dyn Backend>,
        notifier: Arc<ChangeNotifier>,
        db_name: &str,
        mut options: ChangesOptions,
        filter: Option<ChangeFilterFn>,
        on_change: ChangeCallback,
    ) -> Result<Self> {
        options.descending = false;
        let control = Arc::new(FeedControl {
            db_name: db_name.to_string(),
            notifier: notifier.clone(),
            state: AtomicU8::new(FeedState::Initializing as u8),
            cancelled: AtomicBool::new(false),
            cursor: AtomicU64::new(options.since),
            wake: tokio::sync::Notify::new(),
            listener_id: std::sync::Mutex::new(None),
        });

        let weak: Weak<FeedControl> = Arc::downgrade(&control);
        let listener_id = notifier.add_listener(
            db_name,
            Arc::new(move |_: &str| {
                if let Some(control) = weak.upgrade() {
                    control.wake.notify_one();
                }
            }),
        );
        *control.listener_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener_id);

        control.transition(FeedState::Fetching);
        let fetched = match fetch(backend.as_ref(), &options, filter.as_ref(), options.since) {
            Ok(fetched) => fetched,
            Err(e) => {
                control.cancel();
                return Err(e);
            }
        };
        control.deliver(fetched, &on_change);

        let task_control = control.clone();
        tokio::spawn(async move {
            let control = task_control;
            loop {
                control.wake.notified().await;
                if control.is_cancelled() {
                    break;
                }
                control.transition(FeedState::Fetching);
                let since = control.cursor.load(Ordering::SeqCst);
                match fetch(backend.as_ref(), &options, filter.as_ref(), since) {
                    Ok(fetched) => control.deliver(fetched, &on_change),
                    Err(e) => {
                        tracing::warn!("Change feed on {} failed to fetch since {}: {}", control.db_name, since, e);
                        control.transition(FeedState::IdleListening);
                    }
                }
            }
            control.transition(FeedState::Completed);
        });

        Ok(Self { control })
    }

    /// Stop the feed
    ///
    /// No delivery starts after this returns. A callback already running on
    /// the feed task is allowed to finish.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.control.state.load(Ordering::SeqCst))
    }

    /// Highest sequence delivered so far
    pub fn last_seq(&self) -> u64 {
        self.control.cursor.load(Ordering::SeqCst)
    }

    pub(crate) fn control(&self) -> Weak<FeedControl> {
        Arc::downgrade(&self.control)
    }
}

impl Drop for ChangesFeed {
    fn drop(&mut self) {
        self.control.cancel();
    }
}

impl fmt::Debug for ChangesFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesFeed")
            .field("db_name", &self.control.db_name)
            .field("state", &self.state())
            .field("last_seq", &self.last_seq())
            .finish()
    }
}

//! Recommendation store: the latest advisor recommendations plus the overlay
//! enable flag, observed through registered callbacks.
//!
//! A snapshot is immutable and replaced whole, so a reader on any thread
//! sees either the previous or the new complete snapshot. Listeners live in a
//! copy-on-write registry: notification iterates the registry as it was when
//! notification began, and registering or removing during a notification
//! only affects later ones.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::events::{BridgeEvent, EventSink};

/// Value of the `type` field that marks a recommendations message.
pub const RECOMMENDATIONS_TYPE: &str = "recommendations";

const SCORES_FIELD: &str = "cardScores";
const ACTION_FIELD: &str = "recommendedAction";
const REASON_FIELD: &str = "reason";

/// One immutable recommendations snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    /// Increments on every accepted update.
    pub version: u64,
    pub scores: BTreeMap<String, i32>,
    pub action: Option<String>,
    pub reason: Option<String>,
    /// The source document as received.
    pub raw: Value,
}

impl Recommendation {
    /// Parse a recommendations document. Malformed fields degrade to absent
    /// values; nothing here fails.
    fn from_document(version: u64, document: Map<String, Value>) -> Self {
        let scores = match document.get(SCORES_FIELD) {
            Some(Value::Object(entries)) => parse_scores(entries),
            Some(other) => {
                warn!(field = SCORES_FIELD, "expected an object, got {other}; using no scores");
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };
        let action = text_field(&document, ACTION_FIELD);
        let reason = text_field(&document, REASON_FIELD);

        Self {
            version,
            scores,
            action,
            reason,
            raw: Value::Object(document),
        }
    }

    /// The document to send to viewers.
    pub fn payload(&self) -> String {
        self.raw.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.action.is_none()
    }
}

fn parse_scores(entries: &Map<String, Value>) -> BTreeMap<String, i32> {
    let mut scores = BTreeMap::new();
    for (item, value) in entries {
        match parse_score(value) {
            Some(score) => {
                scores.insert(item.clone(), score);
            }
            None => warn!(item = %item, "failed to parse score {value}; skipping"),
        }
    }
    scores
}

/// Integers, floats (truncated toward zero) and integer strings.
fn parse_score(value: &Value) -> Option<i32> {
    match value {
        Value::Number(number) => {
            if let Some(n) = number.as_i64() {
                i32::try_from(n).ok()
            } else {
                number
                    .as_f64()
                    .filter(|f| f.is_finite() && *f >= f64::from(i32::MIN) && *f <= f64::from(i32::MAX))
                    .map(|f| f.trunc() as i32)
            }
        }
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(document: &Map<String, Value>, field: &str) -> Option<String> {
    match document.get(field)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null => None,
        other => {
            warn!(field, "expected a string, got {other}; ignoring");
            None
        }
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type RecommendationCallback = Arc<dyn Fn(Option<&Recommendation>) + Send + Sync>;
type ToggleCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Recommendations(RecommendationCallback),
    Toggle(ToggleCallback),
}

#[derive(Clone)]
struct Registered {
    id: ListenerId,
    callback: Callback,
}

pub struct RecommendationStore {
    current: RwLock<Option<Arc<Recommendation>>>,
    next_version: AtomicU64,
    enabled: AtomicBool,
    listeners: RwLock<Arc<Vec<Registered>>>,
    next_listener: AtomicU64,
    events: EventSink,
}

impl Default for RecommendationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecommendationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationStore")
            .field("current", &self.get())
            .field("enabled", &self.is_enabled())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl RecommendationStore {
    /// An empty, enabled store.
    pub fn new() -> Self {
        Self::with_events(EventSink::disabled())
    }

    pub fn with_events(events: EventSink) -> Self {
        Self {
            current: RwLock::new(None),
            next_version: AtomicU64::new(1),
            enabled: AtomicBool::new(true),
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            events,
        }
    }

    /// Parse `payload` and, if it is a recommendations document, replace the
    /// snapshot and notify listeners.
    ///
    /// Returns false for blank input, invalid JSON, non-object JSON, or a
    /// document whose `type` is present but not `"recommendations"`.
    pub fn update(&self, payload: &str) -> bool {
        if payload.trim().is_empty() {
            warn!("received empty recommendations payload");
            return false;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => self.update_value(value),
            Err(e) => {
                error!("failed to parse recommendations JSON: {e}");
                false
            }
        }
    }

    /// Same as [`update`](Self::update) for an already parsed document.
    pub fn update_value(&self, value: Value) -> bool {
        let Value::Object(document) = value else {
            warn!("recommendations JSON is not an object");
            return false;
        };
        if let Some(kind) = document.get("type") {
            if kind.as_str() != Some(RECOMMENDATIONS_TYPE) {
                debug!(kind = %kind, "ignoring non-recommendations message");
                return false;
            }
        }

        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            let snapshot = Arc::new(Recommendation::from_document(version, document));
            *current = Some(Arc::clone(&snapshot));
            snapshot
        };

        info!(
            version = snapshot.version,
            scores = snapshot.scores.len(),
            action = snapshot.action.as_deref().unwrap_or("-"),
            "updated recommendations"
        );
        self.events.emit(BridgeEvent::RecommendationsUpdated {
            version: snapshot.version,
            scores: snapshot.scores.len(),
        });
        self.notify_recommendations(Some(&snapshot));
        true
    }

    /// The current snapshot, if any.
    pub fn get(&self) -> Option<Arc<Recommendation>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the current snapshot and notify listeners with `None`.
    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("recommendations cleared");
        self.events.emit(BridgeEvent::RecommendationsCleared);
        self.notify_recommendations(None);
    }

    /// Score for one item, if the current snapshot has it.
    pub fn score_for(&self, item: &str) -> Option<i32> {
        self.get()?.scores.get(item).copied()
    }

    pub fn all_scores(&self) -> BTreeMap<String, i32> {
        self.get().map(|s| s.scores.clone()).unwrap_or_default()
    }

    pub fn action(&self) -> Option<String> {
        self.get()?.action.clone()
    }

    pub fn reason(&self) -> Option<String> {
        self.get()?.reason.clone()
    }

    /// True when the snapshot carries any score or an action.
    pub fn has_recommendations(&self) -> bool {
        self.get().is_some_and(|s| !s.is_empty())
    }

    /// Toggle listeners fire only when the value actually changes.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            info!(enabled, "overlay toggled");
            self.notify_toggle(enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enable flag and return the new value.
    pub fn toggle_enabled(&self) -> bool {
        let enabled = !self.enabled.fetch_xor(true, Ordering::SeqCst);
        info!(enabled, "overlay toggled");
        self.notify_toggle(enabled);
        enabled
    }

    pub fn add_recommendation_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(Option<&Recommendation>) + Send + Sync + 'static,
    {
        self.register(Callback::Recommendations(Arc::new(callback)))
    }

    pub fn add_toggle_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.register(Callback::Toggle(Arc::new(callback)))
    }

    /// Returns false if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| l.id == id) {
            return false;
        }
        let remaining: Vec<_> = listeners.iter().filter(|l| l.id != id).cloned().collect();
        *listeners = Arc::new(remaining);
        debug!(listener = id.0, "removed store listener");
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = Vec::with_capacity(listeners.len() + 1);
        updated.extend(listeners.iter().cloned());
        updated.push(Registered { id, callback });
        *listeners = Arc::new(updated);
        debug!(listener = id.0, "added store listener");
        id
    }

    fn registry(&self) -> Arc<Vec<Registered>> {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn notify_recommendations(&self, snapshot: Option<&Recommendation>) {
        for listener in self.registry().iter() {
            if let Callback::Recommendations(ref callback) = listener.callback {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                    error!(listener = listener.id.0, "listener panicked on recommendations update");
                }
            }
        }
    }

    fn notify_toggle(&self, enabled: bool) {
        for listener in self.registry().iter() {
            if let Callback::Toggle(ref callback) = listener.callback {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(enabled))).is_err() {
                    error!(listener = listener.id.0, "listener panicked on overlay toggle");
                }
            }
        }
    }
}

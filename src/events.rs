//! Hierarchical event bus.
//!
//! Events are addressed by slash-separated paths (`received/message/channel`).
//! Each path segment is an [`EventNode`]; nodes are created lazily the first
//! time they are addressed through [`EventNode::on`] and are keyed
//! case-insensitively. The bus owns the whole tree. Nodes refer to their
//! place in it only by path string.
//!
//! Delivery is synchronous and in registration order. A subscriber can stop
//! further delivery by consuming the event, and a subscriber that fails
//! (returns `Err` or panics) is logged and skipped without affecting the
//! others or the caller.
//!
//! Emissions are buffered per node so that a subscriber hooked with replay
//! can catch up. Under the default [`HistoryPolicy::UntilFirstHook`], the
//! first `hook` on a node ends buffering for good, whether or not that hook
//! asked for replay. [`HistoryPolicy::Retain`] keeps a bounded window
//! instead, for buses whose late subscribers must always see recent history.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::error;

/// Key/value data carried by one emission.
pub type Payload = Map<String, Value>;

/// What a subscriber hands back to the emitter.
pub type HookResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// A subscriber. Shared so one callback can sit on several nodes.
pub type Callback = Arc<dyn Fn(&mut Event) -> HookResult + Send + Sync>;

/// Bookkeeping hook run when a subscriber is added (argument: node path).
pub type SubscribeNotify = Box<dyn Fn(&str) + Send + Sync>;
/// Bookkeeping hook run when a child node is created (parent path, child path).
pub type ChildNotify = Box<dyn Fn(&str, &str) + Send + Sync>;
/// Bookkeeping hook run on every emission (node path, event).
pub type EmitNotify = Box<dyn Fn(&str, &Event) + Send + Sync>;

/// How long a node keeps emissions around for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryPolicy {
    /// Buffer until the first subscriber is hooked, then never again.
    #[default]
    UntilFirstHook,
    /// Always keep the most recent `limit` emissions.
    Retain { limit: usize },
}

/// One emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    path: String,
    payload: Payload,
    consumed: bool,
}

impl Event {
    pub fn new(path: &str, payload: Payload) -> Self {
        Self {
            path: path.to_owned(),
            payload,
            consumed: false,
        }
    }

    /// Path of the node this event was emitted on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.payload.contains_key(key)
    }

    /// Stop delivery to any subscriber after the current one.
    pub fn consume(&mut self) {
        self.consumed = true;
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

/// One node of the event tree.
pub struct EventNode {
    name: String,
    path: String,
    subscribers: Vec<Callback>,
    children: HashMap<String, EventNode>,
    history: Option<VecDeque<Event>>,
    history_policy: HistoryPolicy,
    on_subscribe: Option<SubscribeNotify>,
    on_child: Option<ChildNotify>,
    on_emit: Option<EmitNotify>,
}

impl fmt::Debug for EventNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNode")
            .field("path", &self.path)
            .field("subscribers", &self.subscribers.len())
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("history", &self.history.as_ref().map(VecDeque::len))
            .finish()
    }
}

impl EventNode {
    fn new(name: &str, path: String, history_policy: HistoryPolicy) -> Self {
        Self {
            name: name.to_owned(),
            path,
            subscribers: Vec::new(),
            children: HashMap::new(),
            history: Some(VecDeque::new()),
            history_policy,
            on_subscribe: None,
            on_child: None,
            on_emit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Lowercased names of the children created so far.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Whether emissions are still being kept for replay.
    pub fn is_buffering(&self) -> bool {
        self.history.is_some()
    }

    /// Direct child by name, created on first use.
    pub fn child(&mut self, name: &str) -> &mut EventNode {
        let parent_path = &self.path;
        let on_child = &self.on_child;
        let history = self.history_policy;
        self.children
            .entry(name.to_lowercase())
            .or_insert_with(|| {
                let path = if parent_path.is_empty() {
                    name.to_owned()
                } else {
                    format!("{parent_path}/{name}")
                };
                let node = EventNode::new(name, path, history);
                if let Some(notify) = on_child {
                    notify(parent_path, &node.path);
                }
                node
            })
    }

    /// Node at a slash-separated path below this one, creating as needed.
    pub fn on(&mut self, path: &str) -> &mut EventNode {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(self, |node, segment| node.child(segment))
    }

    /// Fan-out over several sibling paths below this node.
    pub fn on_each<'a>(&'a mut self, paths: &[&str]) -> FanOut<'a> {
        let mut unique: Vec<String> = Vec::new();
        for path in paths {
            let lowered = path.to_lowercase();
            if !unique.contains(&lowered) {
                unique.push(lowered);
            }
        }
        FanOut {
            base: self,
            paths: unique,
        }
    }

    /// Node at a path below this one, without creating anything.
    pub fn single(&self, path: &str) -> Option<&EventNode> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, segment| node.children.get(&segment.to_lowercase()))
    }

    /// Append a subscriber.
    pub fn hook<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut Event) -> HookResult + Send + Sync + 'static,
    {
        self.hook_callback(Arc::new(callback), false)
    }

    /// Append a subscriber and immediately hand it every buffered emission,
    /// oldest first.
    pub fn hook_replay<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut Event) -> HookResult + Send + Sync + 'static,
    {
        self.hook_callback(Arc::new(callback), true)
    }

    pub fn hook_callback(&mut self, callback: Callback, replay: bool) -> &mut Self {
        if let Some(notify) = &self.on_subscribe {
            notify(&self.path);
        }
        self.subscribers.push(Arc::clone(&callback));

        let backlog: Vec<Event> = match self.history_policy {
            HistoryPolicy::UntilFirstHook => self.history.take().into_iter().flatten().collect(),
            HistoryPolicy::Retain { .. } if replay => {
                self.history.iter().flatten().cloned().collect()
            }
            HistoryPolicy::Retain { .. } => Vec::new(),
        };
        if replay {
            for mut event in backlog {
                let _ = invoke(&self.path, &callback, &mut event);
            }
        }
        self
    }

    /// Emit to every subscriber (until one consumes the event).
    pub fn call(&mut self, payload: Payload) -> Vec<Value> {
        self.emit(None, payload)
    }

    /// Emit to at most `max` subscribers.
    pub fn call_limited(&mut self, max: usize, payload: Payload) -> Vec<Value> {
        self.emit(Some(max), payload)
    }

    fn emit(&mut self, max: Option<usize>, payload: Payload) -> Vec<Value> {
        let mut event = Event::new(&self.path, payload);
        if let Some(history) = &mut self.history {
            history.push_back(event.clone());
            if let HistoryPolicy::Retain { limit } = self.history_policy {
                while history.len() > limit {
                    history.pop_front();
                }
            }
        }
        if let Some(notify) = &self.on_emit {
            notify(&self.path, &event);
        }

        let mut returns = Vec::new();
        for (called, subscriber) in self.subscribers.iter().enumerate() {
            if max.is_some_and(|max| called >= max) || event.is_consumed() {
                break;
            }
            if let Some(value) = invoke(&self.path, subscriber, &mut event) {
                returns.push(value);
            }
        }
        returns
    }

    pub fn set_subscribe_notify(&mut self, notify: SubscribeNotify) {
        self.on_subscribe = Some(notify);
    }

    pub fn set_child_notify(&mut self, notify: ChildNotify) {
        self.on_child = Some(notify);
    }

    pub fn set_emit_notify(&mut self, notify: EmitNotify) {
        self.on_emit = Some(notify);
    }
}

/// Run one subscriber, containing any failure.
fn invoke(path: &str, subscriber: &Callback, event: &mut Event) -> Option<Value> {
    match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(path, "events: subscriber failed: {e}");
            None
        }
        Err(_) => {
            error!(path, "events: subscriber panicked");
            None
        }
    }
}

/// Forwards `hook` and `call` to several nodes. Not itself part of the tree.
pub struct FanOut<'a> {
    base: &'a mut EventNode,
    paths: Vec<String>,
}

impl FanOut<'_> {
    pub fn hook<F>(self, callback: F) -> Self
    where
        F: Fn(&mut Event) -> HookResult + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        for path in &self.paths {
            self.base.on(path).hook_callback(Arc::clone(&callback), false);
        }
        self
    }

    pub fn hook_replay<F>(self, callback: F) -> Self
    where
        F: Fn(&mut Event) -> HookResult + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        for path in &self.paths {
            self.base.on(path).hook_callback(Arc::clone(&callback), true);
        }
        self
    }

    /// Emit the same payload on each node; returns all subscriber values.
    pub fn call(self, payload: Payload) -> Vec<Value> {
        let mut returns = Vec::new();
        for path in &self.paths {
            returns.extend(self.base.on(path).call(payload.clone()));
        }
        returns
    }

    /// Like [`FanOut::call`], but each node stops after `max` subscribers.
    pub fn call_limited(self, max: usize, payload: Payload) -> Vec<Value> {
        let mut returns = Vec::new();
        for path in &self.paths {
            returns.extend(self.base.on(path).call_limited(max, payload.clone()));
        }
        returns
    }
}

/// Owner of the event tree.
#[derive(Debug)]
pub struct EventBus {
    root: EventNode,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history(HistoryPolicy::default())
    }

    /// A bus whose nodes all follow `policy`.
    pub fn with_history(policy: HistoryPolicy) -> Self {
        Self {
            root: EventNode::new("", String::new(), policy),
        }
    }

    pub fn root(&mut self) -> &mut EventNode {
        &mut self.root
    }

    pub fn on(&mut self, path: &str) -> &mut EventNode {
        self.root.on(path)
    }

    pub fn on_each<'a>(&'a mut self, paths: &[&str]) -> FanOut<'a> {
        self.root.on_each(paths)
    }

    pub fn single(&self, path: &str) -> Option<&EventNode> {
        self.root.single(path)
    }
}

/// Build a payload from a `json!` object literal.
///
/// Non-object values produce an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&mut Event) -> HookResult {
        let log = Arc::clone(log);
        move |event: &mut Event| {
            let n = event.get("n").cloned().unwrap_or(Value::Null);
            log.lock().unwrap().push(format!("{tag}:{n}"));
            Ok(json!(tag))
        }
    }

    // ── Tree shape ───────────────────────────────────────────────

    #[test]
    fn on_is_case_insensitive_and_lazy() {
        let mut bus = EventBus::new();
        assert!(bus.single("received/join").is_none());
        bus.on("Received/JOIN");
        let node = bus.single("received/join").unwrap();
        assert_eq!(node.path(), "Received/JOIN");
        assert_eq!(bus.on("received").on("join").path(), "Received/JOIN");
    }

    #[test]
    fn single_never_creates_or_notifies() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        let counter = Arc::clone(&created);
        bus.root()
            .set_child_notify(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        assert!(bus.single("self").is_none());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        bus.on("self");
        bus.on("self");
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(bus.single("self").is_some());
    }

    // ── Delivery ─────────────────────────────────────────────────

    #[test]
    fn delivery_in_registration_order_with_returns() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.hook(recorder(&log, "a")).hook(recorder(&log, "b"));

        let returns = node.call(payload(json!({"n": 1})));
        assert_eq!(returns, vec![json!("a"), json!("b")]);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn consumed_event_stops_later_subscribers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.hook(recorder(&log, "a"));
        node.hook(|event: &mut Event| {
            event.consume();
            Ok(json!("eater"))
        });
        node.hook(recorder(&log, "c"));

        let returns = node.call(payload(json!({"n": 1})));
        assert_eq!(returns, vec![json!("a"), json!("eater")]);
        assert_eq!(*log.lock().unwrap(), vec!["a:1"]);
    }

    #[test]
    fn max_limits_deliveries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.hook(recorder(&log, "a"))
            .hook(recorder(&log, "b"))
            .hook(recorder(&log, "c"));

        assert_eq!(node.call_limited(2, payload(json!({"n": 7}))).len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7"]);
    }

    #[test]
    fn failing_subscribers_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.hook(|_: &mut Event| Err("boom".into()));
        node.hook(|_: &mut Event| -> HookResult { panic!("kaboom") });
        node.hook(recorder(&log, "survivor"));

        let returns = node.call(payload(json!({"n": 3})));
        assert_eq!(returns, vec![json!("survivor")]);
        assert_eq!(*log.lock().unwrap(), vec!["survivor:3"]);
    }

    #[test]
    fn event_carries_path_and_payload() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        bus.on("received/numeric").hook(move |event: &mut Event| {
            *slot.lock().unwrap() = Some(event.clone());
            Ok(Value::Null)
        });
        bus.on("received/numeric").call(payload(json!({"number": "001"})));

        let event = seen.lock().unwrap().clone().unwrap();
        assert_eq!(event.path(), "received/numeric");
        assert_eq!(event.get_str("number"), Some("001"));
        assert!(!event.is_consumed());
    }

    // ── Replay ───────────────────────────────────────────────────

    #[test]
    fn replay_before_any_hook_gets_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.call(payload(json!({"n": 1})));
        node.call(payload(json!({"n": 2})));
        node.hook_replay(recorder(&log, "late"));
        node.call(payload(json!({"n": 3})));
        assert_eq!(*log.lock().unwrap(), vec!["late:1", "late:2", "late:3"]);
    }

    #[test]
    fn replay_after_first_hook_gets_only_the_buffer_it_saw() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.call(payload(json!({"n": 1})));
        node.call(payload(json!({"n": 2})));
        node.hook_replay(recorder(&log, "late"));
        assert!(!node.is_buffering());
        node.call(payload(json!({"n": 3})));

        // Buffering ended with the first hook, so a second replay sees nothing.
        node.hook_replay(recorder(&log, "later"));
        node.call(payload(json!({"n": 4})));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["late:1", "late:2", "late:3", "late:4", "later:4"]
        );
    }

    #[test]
    fn plain_hook_disables_buffering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");
        node.call(payload(json!({"n": 1})));
        node.hook(recorder(&log, "early"));
        node.call(payload(json!({"n": 2})));
        node.hook_replay(recorder(&log, "late"));
        assert_eq!(*log.lock().unwrap(), vec!["early:2"]);
    }

    #[test]
    fn retained_history_replays_to_late_subscriber() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::with_history(HistoryPolicy::Retain { limit: 16 });
        let node = bus.on("tick");
        node.hook(recorder(&log, "first"));
        node.call(payload(json!({"n": 1})));
        node.call(payload(json!({"n": 2})));

        node.hook_replay(recorder(&log, "second"));
        node.call(payload(json!({"n": 3})));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:1", "first:2", "second:1", "second:2", "first:3", "second:3"]
        );
    }

    #[test]
    fn retained_history_is_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::with_history(HistoryPolicy::Retain { limit: 2 });
        let node = bus.on("a").on("b");
        for n in 1..=5 {
            node.call(payload(json!({ "n": n })));
        }
        node.hook_replay(recorder(&log, "late"));
        assert_eq!(*log.lock().unwrap(), vec!["late:4", "late:5"]);
    }

    // ── Fan-out and notifications ────────────────────────────────

    #[test]
    fn fan_out_hooks_and_calls_every_sibling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on_each(&["received/join", "self/join", "SELF/JOIN"])
            .hook(recorder(&log, "any"));

        assert_eq!(bus.on("received/join").subscriber_count(), 1);
        assert_eq!(bus.on("self/join").subscriber_count(), 1);

        let returns = bus
            .on_each(&["received/join", "self/join"])
            .call(payload(json!({"n": 5})));
        assert_eq!(returns.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["any:5", "any:5"]);
        assert!(bus.single("received/join/self").is_none());
    }

    #[test]
    fn fan_out_limit_applies_per_sibling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on_each(&["received/kick", "self/kick"])
            .hook(recorder(&log, "first"))
            .hook(recorder(&log, "second"));

        let returns = bus
            .on_each(&["received/kick", "self/kick"])
            .call_limited(1, payload(json!({"n": 7})));
        assert_eq!(returns, vec![json!("first"), json!("first")]);
        assert_eq!(*log.lock().unwrap(), vec!["first:7", "first:7"]);
    }

    #[test]
    fn management_callbacks_fire() {
        let subscribed = Arc::new(AtomicUsize::new(0));
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let node = bus.on("tick");

        let counter = Arc::clone(&subscribed);
        node.set_subscribe_notify(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let sink = Arc::clone(&emitted);
        node.set_emit_notify(Box::new(move |path, event| {
            sink.lock().unwrap().push(format!("{path}:{}", event.payload().len()));
        }));

        node.hook(|_: &mut Event| Ok(Value::Null));
        node.call(payload(json!({"a": 1, "b": 2})));

        assert_eq!(subscribed.load(Ordering::SeqCst), 1);
        assert_eq!(*emitted.lock().unwrap(), vec!["tick:2"]);
    }
}

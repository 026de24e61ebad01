use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A tagged asynchronous result addressed by `(callback_id, name)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    callback_id: String,
    name: String,
    /// Milliseconds since the Unix epoch at creation.
    time: u64,
    data: JsonMap<String, JsonValue>,
}

impl Event {
    pub fn new(callback_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            callback_id: callback_id.into(),
            name: name.into(),
            time: now_ms(),
            data: JsonMap::new(),
        }
    }

    pub fn with_data(mut self, data: JsonMap<String, JsonValue>) -> Self {
        self.data = data;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn data(&self) -> &JsonMap<String, JsonValue> {
        &self.data
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "callbackId": self.callback_id,
            "name": self.name,
            "time": self.time,
            "data": self.data,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct QueueKey {
    callback_id: String,
    name: String,
}

impl QueueKey {
    fn new(callback_id: &str, name: &str) -> Self {
        Self { callback_id: callback_id.to_string(), name: name.to_string() }
    }
}

#[derive(Debug, Default)]
struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    ready: Condvar,
}

/// Bounded per-key FIFO queues of events, shared by every session.
///
/// The key map lock is held only to find or create a queue. Each queue has its
/// own lock and condition variable, so a slow waiter on one key never blocks
/// posts to another.
#[derive(Debug)]
pub struct EventCache {
    queues: Mutex<HashMap<QueueKey, Arc<EventQueue>>>,
    capacity: usize,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_QUEUE_CAPACITY, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_limits(capacity: usize, default_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            default_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn queue(&self, callback_id: &str, name: &str) -> Arc<EventQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(QueueKey::new(callback_id, name)).or_default())
    }

    fn existing_queue(&self, callback_id: &str, name: &str) -> Option<Arc<EventQueue>> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(&QueueKey::new(callback_id, name)).cloned()
    }

    /// Appends an event, evicting the oldest ones once the queue is full.
    pub fn post(&self, event: Event) {
        let queue = self.queue(&event.callback_id, &event.name);
        let mut events = queue.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            if let Some(evicted) = events.pop_front() {
                log::debug!(
                    "events: queue {}|{} full, dropping event from {}",
                    evicted.callback_id,
                    evicted.name,
                    evicted.time
                );
            }
        }
        events.push_back(event);
        drop(events);
        queue.ready.notify_all();
    }

    /// Removes and returns the oldest event, waiting up to `timeout`
    /// (or the cache default) for one to arrive.
    pub fn wait(&self, callback_id: &str, name: &str, timeout: Option<Duration>) -> Option<Event> {
        self.wait_with(callback_id, name, timeout, VecDeque::pop_front)
    }

    /// Like [`EventCache::wait`] but leaves the event in the queue.
    pub fn peek(&self, callback_id: &str, name: &str, timeout: Option<Duration>) -> Option<Event> {
        self.wait_with(callback_id, name, timeout, |events| events.front().cloned())
    }

    fn wait_with<F>(
        &self,
        callback_id: &str,
        name: &str,
        timeout: Option<Duration>,
        take: F,
    ) -> Option<Event>
    where
        F: FnOnce(&mut VecDeque<Event>) -> Option<Event>,
    {
        let queue = self.queue(callback_id, name);
        let events = queue.events.lock().unwrap_or_else(PoisonError::into_inner);
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (mut events, _) = queue
            .ready
            .wait_timeout_while(events, timeout, |events| events.is_empty() && !self.is_closed())
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return None;
        }
        take(&mut events)
    }

    /// Drains every queued event for the key, oldest first.
    pub fn get_all(&self, callback_id: &str, name: &str) -> Vec<Event> {
        let Some(queue) = self.existing_queue(callback_id, name) else {
            return Vec::new();
        };
        let mut events = queue.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.drain(..).collect()
    }

    pub fn pending(&self, callback_id: &str, name: &str) -> usize {
        self.existing_queue(callback_id, name).map_or(0, |queue| {
            queue.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    /// Empties every queue.
    pub fn clear_all(&self) {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        for queue in queues.values() {
            queue.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        log::debug!("events: cleared {} queues", queues.len());
    }

    /// Wakes every blocked waiter and makes all current and future waits
    /// return `None` at once. Posting still works.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        for queue in queues.values() {
            // Taking the queue lock orders the flag before any waiter's re-check.
            drop(queue.events.lock().unwrap_or_else(PoisonError::into_inner));
            queue.ready.notify_all();
        }
        log::debug!("events: closed {} queues", queues.len());
    }
}

//! Pattern-based event dispatch.
//!
//! The `EventBus` keeps an ordered list of (pattern, handler) listeners.
//! Every line read from the site manager is matched against each pattern
//! in registration order and every matching handler runs synchronously on
//! the dispatching task with the line and its named captures.
//!
//! # Concurrency
//!
//! The listener list is guarded by a mutex that is never held while a
//! handler runs, so handlers may subscribe and unsubscribe freely and other
//! tasks may do so concurrently with dispatch. Dispatch iterates over a
//! snapshot; a listener removed after the snapshot was taken is skipped,
//! and a listener added during dispatch only sees later lines.
//!
//! Listeners are identified by `ListenerId`, never by pattern text: two
//! one-shot waits on the same pattern are independent listeners.
//!
//! Handlers must not block. A slow handler stalls every later line.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::trace;

use tbm_protocol::LineMatch;

/// Callback invoked for every line matching its pattern.
pub type Handler = Arc<dyn Fn(&LineMatch) + Send + Sync>;

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Listener {
    id: ListenerId,
    pattern: Regex,
    handler: Handler,
    active: AtomicBool,
}

struct BusInner {
    listeners: Mutex<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
}

/// Registry of line listeners. Cheap to clone; clones share listeners.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `handler` for lines matching `pattern`.
    pub fn subscribe<F>(&self, pattern: Regex, handler: F) -> ListenerId
    where
        F: Fn(&LineMatch) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            pattern,
            handler: Arc::new(handler),
            active: AtomicBool::new(true),
        });

        let mut listeners = self.inner.listeners.lock();
        trace!(%id, pattern = %listener.pattern, total = listeners.len() + 1, "Listener subscribed");
        listeners.push(listener);
        id
    }

    /// Registers a listener that is removed when the returned guard drops.
    pub fn subscribe_scoped<F>(&self, pattern: Regex, handler: F) -> Subscription
    where
        F: Fn(&LineMatch) + Send + Sync + 'static,
    {
        let id = self.subscribe(pattern, handler);
        Subscription {
            bus: self.clone(),
            id,
            released: false,
        }
    }

    /// Removes the listener with this id.
    ///
    /// Returns `false` if it was not registered (already removed, or never
    /// part of this bus). Never panics, so racing removals are harmless.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        match listeners.iter().position(|l| l.id == id) {
            Some(index) => {
                let listener = listeners.remove(index);
                listener.active.store(false, Ordering::Release);
                trace!(%id, total = listeners.len(), "Listener unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Returns true if the listener is currently registered.
    pub fn is_subscribed(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().iter().any(|l| l.id == id)
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `line` to every matching listener, in registration order.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, line: &str) -> usize {
        let snapshot: Vec<Arc<Listener>> = self.inner.listeners.lock().clone();

        let mut invoked = 0;
        for listener in snapshot {
            if !listener.active.load(Ordering::Acquire) {
                continue;
            }
            if let Some(matched) = LineMatch::capture(&listener.pattern, line) {
                (listener.handler)(&matched);
                invoked += 1;
            }
        }

        trace!(invoked, "Dispatched line");
        invoked
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Guard owning one listener registration.
///
/// The listener is removed exactly once: by `cancel()` or, failing that,
/// when the guard is dropped.
#[must_use = "dropping a Subscription removes its listener"]
pub struct Subscription {
    bus: EventBus,
    id: ListenerId,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener now. Returns whether it was still registered.
    pub fn cancel(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.bus.unsubscribe(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

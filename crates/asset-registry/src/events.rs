//! Registry notifications and the deferred-event outbox.
//!
//! Mutating operations never fire callbacks while the interface lock is
//! held. They collect their intended notifications into an [`EventContext`]
//! value; the top-level operation releases the lock and hands the context to
//! the [`EventDispatcher`]. Contexts produced off the notification thread
//! are appended to a deferred buffer (its own light lock) and flushed the
//! next time the notification thread ticks, preserving relative order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::types::AssetRecord;

/// One registry notification.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    PathAdded(String),
    PathRemoved(String),
    AssetAdded(AssetRecord),
    AssetUpdated(AssetRecord),
    AssetRemoved(AssetRecord),
    /// Periodic gather progress, throttled by the scheduler.
    ScanProgress {
        packages_processed: usize,
        is_discovery_complete: bool,
    },
    /// Package files that could not be read this gather.
    FilesBlocked(Vec<PathBuf>),
    /// The search-all-assets pass finished. Ordered after every asset event
    /// produced by the same gather.
    InitialSearchCompleted,
    /// A mount added after the initial search finished scanning.
    AdditionalMountSearchCompleted,
}

/// Value-typed batch of pending notifications collected under the lock.
#[derive(Debug, Default)]
pub struct EventContext {
    events: Vec<RegistryEvent>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, event: RegistryEvent) {
        self.events.push(event);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEvent> {
        self.events.iter()
    }

    fn take(self) -> Vec<RegistryEvent> {
        self.events
    }
}

/// Subscriber callback. Runs on the notification thread with no registry
/// lock held; re-entering read queries from inside a handler is allowed.
pub type EventHandler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Owns the subscriber list and the cross-thread deferred buffer.
pub struct EventDispatcher {
    subscribers: Mutex<Vec<(SubscriberId, EventHandler)>>,
    next_id: AtomicU64,
    deferred: Mutex<Vec<RegistryEvent>>,
    /// The only thread allowed to run user callbacks; recorded at
    /// construction.
    notify_thread: ThreadId,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            deferred: Mutex::new(Vec::new()),
            notify_thread: thread::current().id(),
        }
    }

    pub fn subscribe(&self, handler: EventHandler) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    #[inline]
    pub fn is_notify_thread(&self) -> bool {
        thread::current().id() == self.notify_thread
    }

    /// Whether deferred events are waiting for the notification thread.
    pub fn has_pending(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// Delivers a context's events. On the notification thread this flushes
    /// the deferred buffer first (older events broadcast before newer ones)
    /// and then dispatches directly; on any other thread the context is
    /// appended to the deferred buffer instead.
    pub fn broadcast_or_defer(&self, context: EventContext) {
        if context.is_empty() && !self.is_notify_thread() {
            return;
        }
        if self.is_notify_thread() {
            self.pump();
            self.dispatch(context.take());
        } else {
            self.deferred.lock().extend(context.take());
        }
    }

    /// Flushes the deferred buffer. Only meaningful on the notification
    /// thread; a no-op elsewhere.
    pub fn pump(&self) {
        if !self.is_notify_thread() {
            return;
        }
        loop {
            let batch: Vec<RegistryEvent> = std::mem::take(&mut *self.deferred.lock());
            if batch.is_empty() {
                return;
            }
            self.dispatch(batch);
        }
    }

    fn dispatch(&self, events: Vec<RegistryEvent>) {
        if events.is_empty() {
            return;
        }
        // Snapshot the handlers so a handler that (un)subscribes re-entrantly
        // does not deadlock on the subscriber list.
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for event in &events {
            for handler in &handlers {
                handler(event);
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribe_dispatch_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_handler = seen.clone();
        let id = dispatcher.subscribe(Arc::new(move |_| {
            seen_handler.fetch_add(1, Ordering::SeqCst);
        }));

        let mut context = EventContext::new();
        context.push(RegistryEvent::PathAdded("/Game".into()));
        context.push(RegistryEvent::PathAdded("/Engine".into()));
        dispatcher.broadcast_or_defer(context);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));

        let mut context = EventContext::new();
        context.push(RegistryEvent::PathAdded("/Other".into()));
        dispatcher.broadcast_or_defer(context);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_thread_contexts_defer_until_pump() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_handler = order.clone();
        dispatcher.subscribe(Arc::new(move |event| {
            if let RegistryEvent::PathAdded(path) = event {
                order_handler.lock().push(path.clone());
            }
        }));

        let worker_dispatcher = dispatcher.clone();
        thread::spawn(move || {
            let mut context = EventContext::new();
            context.push(RegistryEvent::PathAdded("/FromWorker".into()));
            worker_dispatcher.broadcast_or_defer(context);
        })
        .join()
        .unwrap();

        assert!(dispatcher.has_pending());
        assert!(order.lock().is_empty());

        // The notification thread's next broadcast flushes deferred events
        // first, preserving cross-thread order.
        let mut context = EventContext::new();
        context.push(RegistryEvent::PathAdded("/FromMain".into()));
        dispatcher.broadcast_or_defer(context);
        assert!(!dispatcher.has_pending());
        assert_eq!(*order.lock(), vec!["/FromWorker".to_string(), "/FromMain".to_string()]);
    }

    #[test]
    fn reentrant_subscribe_does_not_deadlock() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.subscribe(Arc::new(move |_| {
            inner.subscribe(Arc::new(|_| {}));
        }));
        let mut context = EventContext::new();
        context.push(RegistryEvent::PathAdded("/Game".into()));
        dispatcher.broadcast_or_defer(context);
        assert_eq!(dispatcher.subscribers.lock().len(), 2);
    }
}

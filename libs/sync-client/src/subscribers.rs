//! Observer registry with removal tokens.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Independent subscribers to one event type, called in subscription order.
pub struct Subscribers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut registry = self.inner.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().handlers.retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    /// Call every handler. The lock is released first, so handlers may
    /// subscribe or unsubscribe while running.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`Subscribers::subscribe`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

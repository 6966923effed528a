//! Log sink owned by the bake service and handed to components by reference.
//!
//! Every record is forwarded to the [`log`] facade and to the listeners subscribed to this
//! particular sink. A listener stays subscribed for as long as its [`Subscription`] lives.

use log::Level;
use parking_lot::Mutex;
use std::{
    fmt::Arguments,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

type Listener = Arc<dyn Fn(Level, &str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

/// Log sink with explicit subscription management.
#[derive(Clone, Default)]
pub struct Logger {
    listeners: Arc<Listeners>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener, it is removed when returned subscription is dropped.
    #[must_use = "listener is unsubscribed when subscription is dropped"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Level, &str) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .lock()
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.entries.lock().len()
    }

    pub fn log(&self, level: Level, args: Arguments) {
        log::log!(level, "{}", args);
        let listeners = self
            .listeners
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        if listeners.is_empty() {
            return;
        }
        let message = args.to_string();
        for listener in listeners {
            listener(level, &message);
        }
    }

    pub fn info(&self, args: Arguments) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: Arguments) {
        self.log(Level::Warn, args)
    }

    pub fn debug(&self, args: Arguments) {
        self.log(Level::Debug, args)
    }
}

/// Handle of a subscribed listener.
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

//! Observable state cells.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A value that can be read, replaced and observed from any thread.
///
/// Each state field of a query or mutation is its own cell, so readers can
/// follow a single field without being woken up by unrelated changes.
pub struct StateCell<T> {
    tx: watch::Sender<T>,
}

impl<T> StateCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Replace the value only if it differs, notifying subscribers only then.
    pub fn set_if_changed(&self, value: T)
    where
        T: PartialEq,
    {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Subscribe to changes.
    ///
    /// The receiver starts out with the current value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Read the value through a closure without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }
}

impl<T: Clone> StateCell<T> {
    /// The current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&*self.tx.borrow()).finish()
    }
}

/// Counts concurrently running tasks and exposes whether any are running.
///
/// The boolean only changes on 0 -> 1 and 1 -> 0 transitions. An activity
/// can forward to a parent, which is how every mutation feeds the
/// client-wide "is anything mutating" signal.
#[derive(Debug)]
pub(crate) struct Activity {
    running: Mutex<usize>,
    active: StateCell<bool>,
    parent: Option<Arc<Activity>>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(0),
            active: StateCell::new(false),
            parent: None,
        }
    }

    pub fn with_parent(parent: Arc<Activity>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    pub fn enter(&self) {
        {
            let mut running = self.running.lock();
            *running += 1;
            if *running == 1 {
                self.active.set(true);
            }
        }
        if let Some(parent) = &self.parent {
            parent.enter();
        }
    }

    pub fn exit(&self) {
        {
            let mut running = self.running.lock();
            *running = running.saturating_sub(1);
            if *running == 0 {
                self.active.set_if_changed(false);
            }
        }
        if let Some(parent) = &self.parent {
            parent.exit();
        }
    }

    /// Enter now and exit when the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ActivityGuard {
        self.enter();
        ActivityGuard(self.clone())
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }
}

pub(crate) struct ActivityGuard(Arc<Activity>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

//! Task completion context.
//!
//! Resource owners register cleanup callbacks at construction; the
//! callbacks run exactly once when the task completes, whether it
//! succeeds, fails, or is cancelled. Dropping the context without an
//! explicit `complete` call also runs them, so scope exit is covered.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Per-task registry of completion callbacks.
pub struct TaskContext {
    callbacks: Mutex<Vec<CompletionCallback>>,
    completed: AtomicBool,
}

impl TaskContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    /// Registers a callback to run at task completion.
    ///
    /// If the task has already completed, the callback runs immediately.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.completed.load(Ordering::Acquire) {
            callback();
            return;
        }
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Returns true once the task has completed.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Marks the task complete and runs all registered callbacks.
    ///
    /// Idempotent; callbacks run at most once, in registration order.
    pub fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.complete();
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("completed", &self.is_completed())
            .field("pending_callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

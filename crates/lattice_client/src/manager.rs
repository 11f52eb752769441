//! Poll-loop driver for active commit tasks.
//!
//! One manager belongs to one client. It runs inside the client's poll loop
//! and cooperatively steps every task that is mid-commit; a task suspends
//! only by returning from `perform_step`.

use std::sync::{Arc, Mutex};

use crate::commit::CommitTask;
use crate::context::ClientContext;

/// Schedules all of a client's in-flight commit tasks.
#[derive(Default)]
pub struct TransactionManager {
    active: Vec<Arc<Mutex<CommitTask>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the active set; it will be stepped on every poll until
    /// it reports DONE.
    pub fn start(&mut self, task: Arc<Mutex<CommitTask>>) {
        self.active.push(task);
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Step every active task once, retiring the ones that finished.
    pub fn poll(&mut self, ctx: &ClientContext) {
        self.active.retain(|task| {
            let Ok(mut task) = task.lock() else {
                return false;
            };
            task.perform_step(ctx);
            !task.is_done()
        });
    }

    /// Drive the client-wide poll until `task` reports DONE.
    ///
    /// Progress needs both the transport (dispatch poll) and the task
    /// scheduler; retries are unbounded at this layer, so liveness relies on
    /// the transport and the object finder eventually converging.
    pub fn try_finish(&mut self, task: &Arc<Mutex<CommitTask>>, ctx: &ClientContext) {
        loop {
            if task.lock().map(|t| t.is_done()).unwrap_or(true) {
                return;
            }
            ctx.dispatch.poll();
            self.poll(ctx);
        }
    }
}

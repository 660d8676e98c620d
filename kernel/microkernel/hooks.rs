//! AetherOS Lifecycle Hooks
//! Notification points for later kernel phases

use crossbeam_queue::SegQueue;
use serde::Serialize;

use crate::process::Pid;

/// Callbacks fired on process creation, termination and switch.
/// Return values are never consumed.
pub trait LifecycleHooks: Send + Sync {
    fn process_created(&self, _pid: Pid) {}

    fn process_terminated(&self, _pid: Pid) {}

    /// `from` is `None` for the first switch out of the boot context
    fn process_switched(&self, _from: Option<Pid>, _to: Pid) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Recorded hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HookEvent {
    Created(Pid),
    Terminated(Pid),
    Switched { from: Option<Pid>, to: Pid },
}

/// Hooks that record every event in arrival order
#[derive(Debug, Default)]
pub struct EventLog {
    events: SegQueue<HookEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all events recorded so far
    pub fn drain(&self) -> Vec<HookEvent> {
        std::iter::from_fn(|| self.events.pop()).collect()
    }
}

impl LifecycleHooks for EventLog {
    fn process_created(&self, pid: Pid) {
        self.events.push(HookEvent::Created(pid));
    }

    fn process_terminated(&self, pid: Pid) {
        self.events.push(HookEvent::Terminated(pid));
    }

    fn process_switched(&self, from: Option<Pid>, to: Pid) {
        self.events.push(HookEvent::Switched { from, to });
    }
}

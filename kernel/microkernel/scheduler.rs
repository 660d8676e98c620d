//! AetherOS Microkernel Scheduler
//! Non-preemptive priority dispatcher over per-priority FIFO ready queues

use std::collections::VecDeque;

use crate::process::{ProcessStatus, SlotRef};
use crate::{Fatal, Kernel, KernelState, Running};

/// One FIFO per priority level; level 1 is served first
pub struct ReadyQueues {
    levels: Vec<VecDeque<SlotRef>>,
}

impl ReadyQueues {
    /// Create `levels` empty queues for priorities `1..=levels`
    pub fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Append to the tail of `priority`'s queue
    pub fn enqueue(&mut self, priority: u8, slot: SlotRef) {
        let last = self.levels.len().saturating_sub(1);
        let index = (priority as usize).saturating_sub(1).min(last);
        debug_assert_eq!(index + 1, priority as usize, "priority {} has no queue", priority);
        self.levels[index].push_back(slot);
    }

    /// Head of the highest-priority non-empty queue
    pub fn peek_highest(&self) -> Option<SlotRef> {
        self.levels.iter().find_map(|queue| queue.front().copied())
    }

    pub fn dequeue_highest(&mut self) -> Option<SlotRef> {
        self.levels.iter_mut().find_map(|queue| queue.pop_front())
    }

    /// Entries waiting at `priority`
    pub fn level_len(&self, priority: u8) -> usize {
        (priority as usize)
            .checked_sub(1)
            .and_then(|index| self.levels.get(index))
            .map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub fn contains(&self, slot: SlotRef) -> bool {
        self.levels.iter().any(|queue| queue.contains(&slot))
    }
}

impl KernelState {
    /// Pop ready entries until one resolves to a ready process with a context
    fn take_next_ready(&mut self) -> Option<Running> {
        while let Some(slot) = self.ready.dequeue_highest() {
            let Some(pcb) = self.table.get_mut(slot) else {
                log::warn!("dispatcher(): dropping stale ready entry for slot {}", slot.index());
                continue;
            };
            let Some(context) = pcb.context.filter(|_| pcb.status == ProcessStatus::Ready) else {
                log::warn!("dispatcher(): pid {} queued while {}", pcb.pid, pcb.status);
                continue;
            };
            pcb.status = ProcessStatus::Running;
            pcb.dispatches += 1;
            return Some(Running { slot, pid: pcb.pid, context });
        }
        None
    }
}

impl Kernel {
    /// Switch to the highest-priority ready process.
    ///
    /// The caller has already moved the running process out of `Running`
    /// (blocked or quit); it is switched away from and resumes here later, if
    /// ever.
    pub(crate) fn dispatcher(&self) {
        let (outgoing, incoming) = {
            let _cs = self.critical("dispatcher");
            let mut state = self.state.lock();
            let outgoing = state.current.take();
            let Some(incoming) = state.take_next_ready() else {
                drop(state);
                self.fatal(Fatal::NoIdleProcess);
            };
            state.current = Some(incoming);
            (outgoing, incoming)
        };

        log::trace!(
            "dispatcher(): {:?} -> pid {}",
            outgoing.map(|r| r.pid),
            incoming.pid
        );
        self.hooks.process_switched(outgoing.map(|r| r.pid), incoming.pid);
        self.machine
            .context_switch(outgoing.map(|r| r.context), incoming.context);
    }
}

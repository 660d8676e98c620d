//! AetherOS Sentinel
//! Idle process and deadlock detection

use std::sync::Arc;

use crate::lifecycle::EntryPoint;
use crate::process::{ProcessStatus, ProcessTable, SlotRef};
use crate::{Fatal, Kernel};

/// Outcome of a deadlock check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Some other process can still run
    Progress,
    /// Only the sentinel is left
    Completed,
    /// Processes remain but none of them can ever become ready
    Deadlock { live: usize },
}

/// Judge the table as seen by the sentinel.
///
/// Every occupied slot other than the sentinel's counts, zombies included.
/// A running caller can still unblock others, so it counts as progress.
pub fn assess(table: &ProcessTable, sentinel: Option<SlotRef>) -> Verdict {
    let mut remaining = 0;
    for (slot, pcb) in table.iter() {
        if Some(slot) == sentinel {
            continue;
        }
        if matches!(pcb.status, ProcessStatus::Ready | ProcessStatus::Running) {
            return Verdict::Progress;
        }
        remaining += 1;
    }

    match remaining {
        0 => Verdict::Completed,
        live => Verdict::Deadlock { live },
    }
}

/// Entry point of the sentinel process
pub(crate) fn sentinel() -> EntryPoint {
    Arc::new(|kernel: &Kernel, _arg: &str| -> i32 {
        log::debug!("sentinel(): called");
        loop {
            kernel.check_deadlock();
            kernel.machine().wait_int();
        }
    })
}

impl Kernel {
    /// Halt if nothing but the sentinel can ever run again
    pub fn check_deadlock(&self) {
        let verdict = {
            let state = self.state.lock();
            assess(&state.table, state.sentinel)
        };
        match verdict {
            Verdict::Progress => {}
            Verdict::Completed => {
                self.machine.console("All processes completed.");
                self.machine.halt(0);
            }
            Verdict::Deadlock { live } => self.fatal(Fatal::Deadlock { live }),
        }
    }
}

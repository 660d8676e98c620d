//! AetherOS Process Lifecycle
//! fork / join / quit, block and unblock, and the launch trampoline

use std::sync::Arc;

use crate::hardware::{self, Trampoline};
use crate::process::{BlockReason, Pid, ProcessInfo, ProcessStatus};
use crate::{Fatal, Kernel};

/// Function a process runs once dispatched; its return value is the exit status
pub type EntryPoint = Arc<dyn Fn(&Kernel, &str) -> i32 + Send + Sync>;

/// Wrap a closure as a fork entry point
pub fn entry_point<F>(f: F) -> Option<EntryPoint>
where
    F: Fn(&Kernel, &str) -> i32 + Send + Sync + 'static,
{
    Some(Arc::new(f))
}

/// Which priority band a creation request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Ordinary,
    Sentinel,
}

impl Kernel {
    /// Create a process and make it ready at `priority`.
    ///
    /// The new process becomes the youngest child of the caller, if a process
    /// is running. The caller keeps the CPU.
    pub fn fork(
        &self,
        name: &str,
        entry: Option<EntryPoint>,
        arg: Option<&str>,
        stack_size: usize,
        priority: u8,
    ) -> Result<Pid, Error> {
        self.create(name, entry, arg, stack_size, priority, Role::Ordinary)
    }

    pub(crate) fn create(
        &self,
        name: &str,
        entry: Option<EntryPoint>,
        arg: Option<&str>,
        stack_size: usize,
        priority: u8,
        role: Role,
    ) -> Result<Pid, Error> {
        log::debug!("fork(): creating process {}", name);
        let _cs = self.critical("fork");

        if name.is_empty() {
            return Err(Error::NullName);
        }
        let Some(entry) = entry else {
            return Err(Error::NullEntryPoint);
        };
        let priority_ok = match role {
            Role::Ordinary => self.config.is_ordinary_priority(priority),
            Role::Sentinel => priority == self.config.sentinel_priority(),
        };
        if !priority_ok {
            return Err(Error::InvalidPriority(priority));
        }
        if stack_size < self.config.min_stack {
            return Err(Error::StackTooSmall {
                requested: stack_size,
                minimum: self.config.min_stack,
            });
        }
        if name.len() >= self.config.max_name - 1 {
            self.fatal(Fatal::NameTooLong);
        }
        let arg = arg.unwrap_or("");
        if arg.len() >= self.config.max_arg - 1 {
            self.fatal(Fatal::ArgTooLong);
        }

        let mut state = self.state.lock();
        let Some((slot, pid)) = state.table.allocate() else {
            log::debug!("fork(): process table is full");
            return Err(Error::TableFull);
        };
        let context = self
            .machine
            .context_init(name, stack_size, self.trampoline(entry, arg.to_string()))
            .map_err(Error::Context)?;

        let parent = state.current.map(|running| running.slot);
        if let Some(pcb) = state.table.get_mut(slot) {
            pcb.status = ProcessStatus::Ready;
            pcb.name = name.to_string();
            pcb.arg = arg.to_string();
            pcb.priority = priority;
            pcb.stack_size = stack_size;
            pcb.context = Some(context);
            pcb.parent = parent;
        }
        if let Some(parent) = parent.and_then(|p| state.table.get_mut(p)) {
            parent.children.push(slot);
            parent.children_created += 1;
        }
        state.ready.enqueue(priority, slot);
        if role == Role::Sentinel {
            state.sentinel = Some(slot);
        }
        drop(state);

        log::debug!("fork(): {} is pid {} at priority {}", name, pid, priority);
        self.hooks.process_created(pid);
        Ok(pid)
    }

    fn trampoline(&self, entry: EntryPoint, arg: String) -> Trampoline {
        let kernel = self.this.clone();
        Box::new(move || {
            if let Some(kernel) = kernel.upgrade() {
                kernel.launch(&entry, &arg);
            }
        })
    }

    /// First code run by every process: enable interrupts, run the entry
    /// point, quit with its result.
    fn launch(&self, entry: &EntryPoint, arg: &str) -> ! {
        if let Err(e) = self.status_register().set_interrupts(true) {
            log::warn!("launch(): failed to enable interrupts: {}", e);
        }
        let status = entry(self, arg);
        log::debug!("launch(): process {:?} returned {}", self.getpid(), status);
        self.quit(status)
    }

    /// Reap one terminated child, waiting for one to quit if none has yet.
    ///
    /// Children are reaped in the order they quit.
    pub fn join(&self) -> Result<(Pid, i32), Error> {
        let (pid, reaped) = {
            let _cs = self.critical("join");
            let mut state = self.state.lock();
            let Some(running) = state.current else {
                drop(state);
                self.fatal(Fatal::NoCurrentProcess { op: "join" });
            };
            let Some(pcb) = state.table.get_mut(running.slot) else {
                self.fatal(Fatal::NoCurrentProcess { op: "join" });
            };

            if pcb.children_created == 0 {
                return Err(Error::NoChildren);
            }
            // Oldest zombie first, otherwise wait for a child to quit
            let reaped = match pcb.zombies.pop_front() {
                Some(zombie) => {
                    pcb.joins_completed += 1;
                    let record = state
                        .table
                        .get(zombie)
                        .map(|z| (z.pid, z.exit_status.unwrap_or_default()));
                    let context = state.reap(zombie);
                    Some((record, context))
                }
                None if pcb.joins_completed >= pcb.children_created => {
                    return Err(Error::AlreadyReaped);
                }
                None => {
                    pcb.status = ProcessStatus::Blocked(BlockReason::Join);
                    log::debug!("join(): pid {} waits for a child", running.pid);
                    None
                }
            };
            (running.pid, reaped)
        };

        if let Some((record, context)) = reaped {
            self.retire(context);
            return match record {
                Some((child, status)) => {
                    log::debug!("join(): reaped pid {} status {}", child, status);
                    Ok((child, status))
                }
                None => self.fatal(Fatal::LostJoinRecord { pid }),
            };
        }

        self.dispatcher();

        // Woken by quit with the child's record already delivered
        let _cs = self.critical("join");
        let mut state = self.state.lock();
        let record = state
            .table
            .find(pid)
            .and_then(|slot| state.table.get_mut(slot))
            .and_then(|pcb| pcb.join_result.take());
        drop(state);
        match record {
            Some(record) => Ok(record),
            None => self.fatal(Fatal::LostJoinRecord { pid }),
        }
    }

    /// Terminate the running process with `status`. Never returns.
    ///
    /// Halts the machine if any child is still ready, running or blocked.
    /// Unjoined zombies of the caller are discarded.
    pub fn quit(&self, status: i32) -> ! {
        let (pid, retired) = {
            let _cs = self.critical("quit");
            let mut state = self.state.lock();
            let Some(running) = state.current else {
                drop(state);
                self.fatal(Fatal::NoCurrentProcess { op: "quit" });
            };
            let slot = running.slot;

            // Every child must be gone or waiting to be joined
            let live = state.table.get(slot).map_or(0, |pcb| {
                pcb.children
                    .iter()
                    .filter(|child| state.table.get(**child).is_some_and(|c| c.status.is_live()))
                    .count()
            });
            if live > 0 {
                drop(state);
                self.fatal(Fatal::LiveChildren { pid: running.pid, live });
            }

            let (parent, orphans) = match state.table.get_mut(slot) {
                Some(pcb) => {
                    pcb.status = ProcessStatus::Quit;
                    pcb.exit_status = Some(status);
                    (pcb.parent, std::mem::take(&mut pcb.zombies))
                }
                None => (None, Default::default()),
            };

            // Nobody will join our zombies now
            let mut retired: Vec<_> = orphans
                .into_iter()
                .filter_map(|orphan| state.reap(orphan))
                .collect();

            // Hand the status to a waiting parent or queue up as a zombie
            let parent = parent.filter(|p| state.table.get(*p).is_some());
            match parent {
                Some(parent_slot) => {
                    let mut wake = None;
                    if let Some(parent) = state.table.get_mut(parent_slot) {
                        parent.children.retain(|child| *child != slot);
                        if parent.status == ProcessStatus::Blocked(BlockReason::Join) {
                            parent.join_result = Some((running.pid, status));
                            parent.joins_completed += 1;
                            parent.status = ProcessStatus::Ready;
                            wake = Some(parent.priority);
                        } else {
                            parent.zombies.push_back(slot);
                        }
                    }
                    if let Some(priority) = wake {
                        state.ready.enqueue(priority, parent_slot);
                        retired.extend(state.reap(slot));
                    }
                }
                None => retired.extend(state.reap(slot)),
            }

            log::debug!("quit(): pid {} exits with {}", running.pid, status);
            (running.pid, retired)
        };

        // Free stacks, then switch away for good
        self.retire(retired);
        self.hooks.process_terminated(pid);
        self.dispatcher();
        self.fatal(Fatal::QuitReturned)
    }

    /// Block the running process until another process unblocks it
    pub fn block_me(&self, code: u32) {
        {
            let _cs = self.critical("block_me");
            let mut state = self.state.lock();
            let current = state.current;
            let Some(pcb) = current.and_then(|running| state.table.get_mut(running.slot)) else {
                self.fatal(Fatal::NoCurrentProcess { op: "block_me" });
            };
            pcb.status = ProcessStatus::Blocked(BlockReason::Custom(code));
            log::debug!("block_me(): pid {} blocks with code {}", pcb.pid, code);
        }
        self.dispatcher();
    }

    /// Make a process blocked in `block_me` ready again, behind its peers.
    /// The caller keeps the CPU.
    pub fn unblock_proc(&self, pid: Pid) -> Result<(), Error> {
        let _cs = self.critical("unblock_proc");
        let mut state = self.state.lock();
        let slot = state.table.find(pid).ok_or(Error::NoSuchProcess(pid))?;
        let pcb = state.table.get_mut(slot).ok_or(Error::NoSuchProcess(pid))?;
        if !matches!(pcb.status, ProcessStatus::Blocked(BlockReason::Custom(_))) {
            return Err(Error::NotBlocked(pid));
        }
        pcb.status = ProcessStatus::Ready;
        let priority = pcb.priority;
        state.ready.enqueue(priority, slot);
        log::debug!("unblock_proc(): pid {} is ready", pid);
        Ok(())
    }

    /// Pid of the running process
    pub fn getpid(&self) -> Option<Pid> {
        self.state.lock().current.map(|running| running.pid)
    }

    /// Snapshot every occupied slot and print it to the console
    pub fn dump_processes(&self) -> Vec<ProcessInfo> {
        let snapshot = {
            let _cs = self.critical("dump_processes");
            self.state.lock().table.snapshot()
        };

        self.machine.console(&format!(
            "{:<5} {:<6} {:<8} {:<12} {:<5} {:<7} {:<10} {}",
            "PID", "Parent", "Priority", "Status", "Kids", "Zombies", "Dispatches", "Name"
        ));
        for info in &snapshot {
            let parent = info.parent.map_or_else(|| "-".to_string(), |p| p.to_string());
            self.machine.console(&format!(
                "{:<5} {:<6} {:<8} {:<12} {:<5} {:<7} {:<10} {}",
                info.pid,
                parent,
                info.priority,
                info.status.to_string(),
                info.children,
                info.zombies,
                info.dispatches,
                info.name
            ));
        }
        snapshot
    }
}

/// Error types for lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("process table is full")]
    TableFull,
    #[error("priority {0} is out of range")]
    InvalidPriority(u8),
    #[error("stack size {requested} is below the minimum of {minimum}")]
    StackTooSmall { requested: usize, minimum: usize },
    #[error("process name is empty")]
    NullName,
    #[error("no start function given")]
    NullEntryPoint,
    #[error("process has no children")]
    NoChildren,
    #[error("all children have already been joined")]
    AlreadyReaped,
    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),
    #[error("process {0} is not blocked")]
    NotBlocked(Pid),
    #[error(transparent)]
    Context(hardware::Error),
}

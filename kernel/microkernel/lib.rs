//! AetherOS Process Kernel
//! Process table, ready queues, lifecycle management and dispatcher
//! for the single-CPU machine simulator

#[path = "../config.rs"]
pub mod config;
pub mod cpu;
pub mod hardware;
pub mod hooks;
pub mod lifecycle;
pub mod monitor;
pub mod process;
pub mod scheduler;

use std::sync::{Arc, Weak};

use spin::Mutex;

pub use config::KernelConfig;
pub use cpu::{CriticalSection, Psr, StatusRegister};
pub use hardware::{ContextId, Halt, Machine, ThreadMachine};
pub use hooks::{EventLog, HookEvent, LifecycleHooks, NoHooks};
pub use lifecycle::{entry_point, EntryPoint, Error};
pub use monitor::Verdict;
pub use process::{BlockReason, Pid, ProcessInfo, ProcessStatus};

use process::{ProcessTable, SlotRef};
use scheduler::ReadyQueues;

/// Kernel state: the single scheduler context shared by every process
pub struct Kernel {
    config: KernelConfig,
    machine: Arc<dyn Machine>,
    hooks: Arc<dyn LifecycleHooks>,
    state: Mutex<KernelState>,
    this: Weak<Kernel>,
}

/// The process currently holding the CPU
#[derive(Debug, Clone, Copy)]
pub(crate) struct Running {
    pub slot: SlotRef,
    pub pid: Pid,
    pub context: ContextId,
}

/// Table and queues; only touched with interrupts disabled
pub(crate) struct KernelState {
    pub table: ProcessTable,
    pub ready: ReadyQueues,
    pub current: Option<Running>,
    pub sentinel: Option<SlotRef>,
    pub started: bool,
}

impl KernelState {
    fn new(config: &KernelConfig) -> Self {
        Self {
            table: ProcessTable::new(config.max_proc),
            ready: ReadyQueues::new(config.priority_levels()),
            current: None,
            sentinel: None,
            started: false,
        }
    }

    /// Release a terminated process's slot, returning the context to retire
    pub(crate) fn reap(&mut self, slot: SlotRef) -> Option<ContextId> {
        let context = self.table.get(slot)?.context;
        self.table.release(slot);
        context
    }
}

impl Kernel {
    /// Create a kernel with no lifecycle hooks
    pub fn new(config: KernelConfig, machine: Arc<dyn Machine>) -> Result<Arc<Self>, config::Error> {
        Self::with_hooks(config, machine, Arc::new(NoHooks))
    }

    /// Create a kernel reporting lifecycle events to `hooks`
    pub fn with_hooks(
        config: KernelConfig,
        machine: Arc<dyn Machine>,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Arc<Self>, config::Error> {
        config.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            state: Mutex::new(KernelState::new(&config)),
            config,
            machine,
            hooks,
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    /// Mode and interrupt bits of the simulated CPU
    pub fn status_register(&self) -> StatusRegister<'_> {
        StatusRegister::new(self.machine())
    }

    /// Start the sentinel and `start1`, dispatch, and run until the machine halts
    pub fn startup(&self, start1: EntryPoint) -> Halt {
        {
            let mut state = self.state.lock();
            if state.started {
                log::error!("startup(): kernel already started");
                return Halt {
                    code: 1,
                    message: Some("kernel already started".to_string()),
                };
            }
            state.started = true;
        }

        let halt = self.machine.run(&mut || self.boot(start1.clone()));
        log::info!("finish(): machine halted with code {}", halt.code);
        halt
    }

    fn boot(&self, start1: EntryPoint) {
        log::debug!("startup(): calling fork for sentinel");
        let sentinel_priority = self.config.sentinel_priority();
        if let Err(e) = self.create(
            "sentinel",
            Some(monitor::sentinel()),
            None,
            self.config.min_stack,
            sentinel_priority,
            lifecycle::Role::Sentinel,
        ) {
            self.fatal(Fatal::SentinelForkFailed(e));
        }

        log::debug!("startup(): calling fork for start1");
        if let Err(e) = self.fork(
            "start1",
            Some(start1),
            None,
            self.config.start_stack(),
            self.config.start_priority,
        ) {
            self.fatal(Fatal::StartForkFailed(e));
        }

        self.dispatcher();
    }

    /// Report an invariant violation and halt the machine
    pub fn fatal(&self, fatal: Fatal) -> ! {
        let message = fatal.to_string();
        log::error!("{}", message);
        self.machine.console(&message);
        self.machine.halt(1)
    }

    /// Enter a critical section, halting unless in kernel mode
    pub(crate) fn critical(&self, op: &'static str) -> CriticalSection<'_> {
        if !self.status_register().is_kernel_mode() {
            self.fatal(Fatal::UserMode { op });
        }
        match CriticalSection::enter(self.machine()) {
            Ok(cs) => cs,
            Err(source) => self.fatal(Fatal::StatusRegister { op, source }),
        }
    }

    /// Free the stacks of reaped processes
    pub(crate) fn retire(&self, contexts: impl IntoIterator<Item = ContextId>) {
        for context in contexts {
            self.machine.context_free(context);
        }
    }
}

/// Invariant violations that halt the machine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    #[error("{op}(): called while in user mode. Halting...")]
    UserMode { op: &'static str },
    #[error("{op}(): {source}. Halting...")]
    StatusRegister { op: &'static str, source: hardware::Error },
    #[error("quit(): process {pid} still has {live} active children. Halting...")]
    LiveChildren { pid: Pid, live: usize },
    #[error("dispatcher(): no process ready, sentinel missing. Halting...")]
    NoIdleProcess,
    #[error("fork(): process name is too long. Halting...")]
    NameTooLong,
    #[error("fork(): argument too long. Halting...")]
    ArgTooLong,
    #[error("{op}(): no process is running. Halting...")]
    NoCurrentProcess { op: &'static str },
    #[error("join(): process {pid} woke without a child record. Halting...")]
    LostJoinRecord { pid: Pid },
    #[error("check_deadlock(): {live} processes blocked, only sentinel should be left. Halting...")]
    Deadlock { live: usize },
    #[error("startup(): fork of sentinel failed: {0}. Halting...")]
    SentinelForkFailed(lifecycle::Error),
    #[error("startup(): fork of start1 failed: {0}. Halting...")]
    StartForkFailed(lifecycle::Error),
    #[error("quit(): terminated process was resumed. Halting...")]
    QuitReturned,
}

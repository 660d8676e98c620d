//! Shared harness for kernel scenario tests

#![allow(dead_code)]

use std::sync::Arc;

use aetheros_proc::{EventLog, Halt, Kernel, KernelConfig, ThreadMachine};

/// A kernel booted on a fresh host-thread machine
pub struct Sim {
    pub machine: Arc<ThreadMachine>,
    pub kernel: Arc<Kernel>,
    pub events: Arc<EventLog>,
}

impl Sim {
    pub fn new(config: KernelConfig) -> Self {
        init_logging();
        let machine = Arc::new(ThreadMachine::new());
        let events = Arc::new(EventLog::new());
        let kernel = Kernel::with_hooks(config, machine.clone(), events.clone())
            .expect("valid test config");
        Self { machine, kernel, events }
    }

    /// Boot with `start1` and block until the machine halts
    pub fn run<F>(&self, start1: F) -> Halt
    where
        F: Fn(&Kernel, &str) -> i32 + Send + Sync + 'static,
    {
        self.kernel.startup(Arc::new(start1))
    }

    pub fn console(&self) -> Vec<String> {
        self.machine.console_output()
    }
}

pub fn sim() -> Sim {
    Sim::new(KernelConfig::default())
}

/// Ordered record of what processes did
#[derive(Clone, Default)]
pub struct Trace(Arc<spin::Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Minimum stack from the default config
pub const STACK: usize = 80 * 1024;

pub const START_PID: u32 = 2;

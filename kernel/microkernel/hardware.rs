//! AetherOS Hardware Simulation Layer
//! Context save/restore, status register, console and halt for the process kernel

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use hashbrown::HashMap;
use spin::{Mutex, Once, RwLock};

use crate::cpu::Psr;

/// Opaque handle to a saved execution context
pub type ContextId = u64;

/// Code a fresh context runs the first time it is switched to
pub type Trampoline = Box<dyn FnOnce() + Send + 'static>;

/// Host threads never get less stack than this, whatever the simulated size
pub const HOST_STACK_FLOOR: usize = 256 * 1024;

/// Why and how the machine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub code: i32,
    /// Last console line written before the halt
    pub message: Option<String>,
}

/// Services the process kernel consumes from the simulated hardware
pub trait Machine: Send + Sync {
    /// Prepare a context that runs `entry` on its own stack once switched to
    fn context_init(&self, name: &str, stack_size: usize, entry: Trampoline)
        -> Result<ContextId, Error>;

    /// Save `from` (`None` is the boot context) and resume `to`
    fn context_switch(&self, from: Option<ContextId>, to: ContextId);

    /// Release a context and its stack; it never runs again
    fn context_free(&self, context: ContextId);

    fn psr_get(&self) -> Psr;

    /// Write the status register; unknown bits are rejected
    fn psr_set(&self, bits: u32) -> Result<(), Error>;

    fn console(&self, message: &str);

    /// Stop the whole machine
    fn halt(&self, code: i32) -> !;

    /// Idle until the next interrupt
    fn wait_int(&self);

    /// Run `boot` on the boot context, then wait for the machine to halt
    fn run(&self, boot: &mut dyn FnMut()) -> Halt;
}

/// Unwind payload used to retire a host thread
struct ContextExit;

/// Per-context run token
struct Gate {
    token: AtomicBool,
    retired: AtomicBool,
    thread: Once<Thread>,
}

impl Gate {
    fn new() -> Self {
        Self {
            token: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            thread: Once::new(),
        }
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

struct Shared {
    gates: RwLock<HashMap<ContextId, Arc<Gate>>>,
    next_context: AtomicU64,
    psr: AtomicU32,
    transcript: Mutex<Vec<String>>,
    halt: Mutex<Option<Halt>>,
    halted: AtomicBool,
    boot: Mutex<Option<Thread>>,
}

impl Shared {
    /// Park until this context holds the run token
    fn wait_turn(&self, gate: &Gate) {
        loop {
            if self.halted.load(Ordering::Acquire) || gate.retired.load(Ordering::Acquire) {
                panic::resume_unwind(Box::new(ContextExit));
            }
            if gate.token.swap(false, Ordering::AcqRel) {
                return;
            }
            thread::park();
        }
    }

    fn write_console(&self, message: &str) {
        log::info!(target: "console", "{}", message);
        self.transcript.lock().push(message.to_string());
    }

    /// First halt wins; wakes every waiter so their threads can exit
    fn record_halt(&self, code: i32) {
        {
            let mut halt = self.halt.lock();
            if halt.is_some() {
                return;
            }
            let message = self.transcript.lock().last().cloned();
            log::debug!("machine halted with code {}", code);
            *halt = Some(Halt { code, message });
        }
        self.halted.store(true, Ordering::Release);

        if let Some(boot) = self.boot.lock().as_ref() {
            boot.unpark();
        }
        for gate in self.gates.read().values() {
            gate.wake();
        }
    }
}

/// Host-thread implementation of the machine: one parked thread per context,
/// with exactly one of them (or the boot thread) holding the run token.
pub struct ThreadMachine {
    shared: Arc<Shared>,
}

impl Default for ThreadMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadMachine {
    /// Create a machine in kernel mode with interrupts disabled
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                gates: RwLock::new(HashMap::new()),
                next_context: AtomicU64::new(1),
                psr: AtomicU32::new(Psr::KERNEL_MODE.bits()),
                transcript: Mutex::new(Vec::new()),
                halt: Mutex::new(None),
                halted: AtomicBool::new(false),
                boot: Mutex::new(None),
            }),
        }
    }

    /// Everything written to the console so far
    pub fn console_output(&self) -> Vec<String> {
        self.shared.transcript.lock().clone()
    }

    /// The halt record, once the machine has stopped
    pub fn halted(&self) -> Option<Halt> {
        self.shared.halt.lock().clone()
    }

    /// Number of contexts that have not been freed
    pub fn live_contexts(&self) -> usize {
        self.shared.gates.read().len()
    }
}

impl Machine for ThreadMachine {
    fn context_init(&self, name: &str, stack_size: usize, entry: Trampoline)
        -> Result<ContextId, Error>
    {
        let id = self.shared.next_context.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());

        let shared = self.shared.clone();
        let thread_gate = gate.clone();
        let handle = thread::Builder::new()
            .name(format!("ctx{}-{}", id, name))
            .stack_size(stack_size.max(HOST_STACK_FLOOR))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    shared.wait_turn(&thread_gate);
                    entry();
                }));
                if let Err(payload) = outcome {
                    if !payload.is::<ContextExit>() {
                        shared.write_console(&format!(
                            "context {} panicked: {}",
                            id,
                            panic_message(payload.as_ref())
                        ));
                        shared.record_halt(1);
                    }
                }
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        gate.thread.call_once(|| handle.thread().clone());
        self.shared.gates.write().insert(id, gate);
        Ok(id)
    }

    fn context_switch(&self, from: Option<ContextId>, to: ContextId) {
        let (target, outgoing) = {
            let gates = self.shared.gates.read();
            (gates.get(&to).cloned(), from.map(|id| gates.get(&id).cloned()))
        };

        let Some(target) = target else {
            self.console(&format!("context_switch(): unknown context {}", to));
            self.halt(1);
        };
        target.token.store(true, Ordering::Release);
        target.wake();

        match outgoing {
            // Boot context keeps running until the machine halts
            None => {}
            Some(Some(gate)) => self.shared.wait_turn(&gate),
            // Freed before switching away: this thread is done
            Some(None) => panic::resume_unwind(Box::new(ContextExit)),
        }
    }

    fn context_free(&self, context: ContextId) {
        if let Some(gate) = self.shared.gates.write().remove(&context) {
            gate.retired.store(true, Ordering::Release);
            gate.wake();
        }
    }

    fn psr_get(&self) -> Psr {
        Psr::from_bits_truncate(self.shared.psr.load(Ordering::Acquire))
    }

    fn psr_set(&self, bits: u32) -> Result<(), Error> {
        let psr = Psr::from_bits(bits).ok_or(Error::InvalidPsr(bits))?;
        self.shared.psr.store(psr.bits(), Ordering::Release);
        Ok(())
    }

    fn console(&self, message: &str) {
        self.shared.write_console(message);
    }

    fn halt(&self, code: i32) -> ! {
        self.shared.record_halt(code);
        panic::resume_unwind(Box::new(ContextExit))
    }

    fn wait_int(&self) {
        thread::sleep(Duration::from_millis(1));
    }

    fn run(&self, boot: &mut dyn FnMut()) -> Halt {
        *self.shared.boot.lock() = Some(thread::current());

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| boot())) {
            if !payload.is::<ContextExit>() {
                panic::resume_unwind(payload);
            }
        }

        loop {
            if let Some(halt) = self.halted() {
                return halt;
            }
            thread::park();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Error types for hardware operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid status register value {0:#x}")]
    InvalidPsr(u32),
    #[error("failed to create context: {0}")]
    Spawn(String),
}

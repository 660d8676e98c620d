//! AetherOS CPU Status Register
//! Mode and interrupt bits, and the critical-section scope built on them

use std::thread;

use bitflags::bitflags;

use crate::hardware::{Error, Machine};

bitflags! {
    /// Processor status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Psr: u32 {
        const KERNEL_MODE = 0x1;
        const INTERRUPTS = 0x2;
        const PREV_KERNEL_MODE = 0x4;
        const PREV_INTERRUPTS = 0x8;
    }
}

/// Get/set view over the machine's status register
#[derive(Clone, Copy)]
pub struct StatusRegister<'a> {
    machine: &'a dyn Machine,
}

impl<'a> StatusRegister<'a> {
    pub fn new(machine: &'a dyn Machine) -> Self {
        Self { machine }
    }

    /// Raw register contents
    pub fn get(&self) -> Psr {
        self.machine.psr_get()
    }

    pub fn is_kernel_mode(&self) -> bool {
        self.get().contains(Psr::KERNEL_MODE)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.get().contains(Psr::INTERRUPTS)
    }

    /// Switch between kernel and user mode
    pub fn set_kernel_mode(&self, on: bool) -> Result<(), Error> {
        self.update(Psr::KERNEL_MODE, on)
    }

    /// Enable or disable interrupts
    pub fn set_interrupts(&self, on: bool) -> Result<(), Error> {
        self.update(Psr::INTERRUPTS, on)
    }

    fn update(&self, bit: Psr, on: bool) -> Result<(), Error> {
        let mut psr = self.get();
        psr.set(bit, on);
        self.machine.psr_set(psr.bits())
    }
}

/// Interrupts-off scope around multi-step table and queue mutation.
///
/// Interrupts are restored on drop only if they were enabled on entry, so
/// sections nest. Nothing is restored while the thread is unwinding.
pub struct CriticalSection<'a> {
    regs: StatusRegister<'a>,
    restore: bool,
}

impl<'a> CriticalSection<'a> {
    /// Disable interrupts until the returned guard is dropped
    pub fn enter(machine: &'a dyn Machine) -> Result<Self, Error> {
        let regs = StatusRegister::new(machine);
        let restore = regs.interrupts_enabled();
        if restore {
            regs.set_interrupts(false)?;
        }
        Ok(Self { regs, restore })
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        if !self.restore || thread::panicking() {
            return;
        }
        if let Err(e) = self.regs.set_interrupts(true) {
            log::error!("critical section: failed to re-enable interrupts: {}", e);
        }
    }
}

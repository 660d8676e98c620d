//! AetherOS Process Table
//! Fixed-capacity arena of process control blocks with generation-checked slots

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::hardware::ContextId;

/// Process identifier
pub type Pid = u32;

/// Pid given to the first process created (the sentinel)
pub const FIRST_PID: Pid = 1;

/// Stable reference to a table slot. The generation changes every time the
/// slot is released, so a reference to a freed or recycled slot never resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    generation: u32,
}

impl SlotRef {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Reasons a process may be blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockReason {
    /// Waiting in join for a child to quit
    Join,
    /// Blocked through block_me with a caller-chosen code
    Custom(u32),
}

/// Process states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    Empty,
    Ready,
    Running,
    Blocked(BlockReason),
    Quit,
}

impl ProcessStatus {
    /// Ready, running or blocked
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Blocked(_))
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("EMPTY"),
            Self::Ready => f.write_str("READY"),
            Self::Running => f.write_str("RUNNING"),
            Self::Blocked(BlockReason::Join) => f.write_str("JOIN_BLOCK"),
            Self::Blocked(BlockReason::Custom(code)) => write!(f, "BLOCKED({})", code),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

/// Process control block
#[derive(Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub status: ProcessStatus,
    pub name: String,
    pub arg: String,
    pub priority: u8,
    pub stack_size: usize,
    pub context: Option<ContextId>,
    pub parent: Option<SlotRef>,
    /// Live children, in creation order
    pub children: Vec<SlotRef>,
    /// Quit but not yet joined, in termination order
    pub zombies: VecDeque<SlotRef>,
    pub children_created: u32,
    pub joins_completed: u32,
    pub exit_status: Option<i32>,
    /// Child record handed over by quit while this process waits in join
    pub join_result: Option<(Pid, i32)>,
    pub dispatches: u64,
    generation: u32,
}

impl Pcb {
    fn empty() -> Self {
        Self {
            pid: 0,
            status: ProcessStatus::Empty,
            name: String::new(),
            arg: String::new(),
            priority: 0,
            stack_size: 0,
            context: None,
            parent: None,
            children: Vec::new(),
            zombies: VecDeque::new(),
            children_created: 0,
            joins_completed: 0,
            exit_status: None,
            join_result: None,
            dispatches: 0,
            generation: 0,
        }
    }

    fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::empty();
        self.generation = generation;
    }
}

/// Snapshot of one occupied slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub priority: u8,
    pub status: ProcessStatus,
    pub children: usize,
    pub zombies: usize,
    pub dispatches: u64,
    pub name: String,
}

/// Process table
pub struct ProcessTable {
    slots: Vec<Pcb>,
    next_pid: Pid,
}

impl ProcessTable {
    /// Create a table with `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Pcb::empty()).collect(),
            next_pid: FIRST_PID,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the slot for the next free pid.
    ///
    /// The pid is the smallest value at or after the last one handed out whose
    /// slot (`pid % capacity`) is empty. The slot is left `Empty` for the
    /// caller to populate.
    pub fn allocate(&mut self) -> Option<(SlotRef, Pid)> {
        if self.is_full() {
            return None;
        }

        let capacity = self.capacity();
        while self.slots[self.slot_of(self.next_pid)].status != ProcessStatus::Empty {
            self.next_pid = self.next_pid.wrapping_add(1);
        }
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1);

        let index = pid as usize % capacity;
        let pcb = &mut self.slots[index];
        pcb.pid = pid;
        Some((SlotRef { index, generation: pcb.generation }, pid))
    }

    /// Return a slot to the free pool
    pub fn release(&mut self, slot: SlotRef) {
        if let Some(pcb) = self.get_mut(slot) {
            pcb.reset();
        }
    }

    /// Look up a live or zombie process by pid
    pub fn find(&self, pid: Pid) -> Option<SlotRef> {
        let index = self.slot_of(pid);
        let pcb = &self.slots[index];
        (pcb.status != ProcessStatus::Empty && pcb.pid == pid)
            .then_some(SlotRef { index, generation: pcb.generation })
    }

    pub fn get(&self, slot: SlotRef) -> Option<&Pcb> {
        self.slots
            .get(slot.index)
            .filter(|pcb| pcb.generation == slot.generation)
    }

    pub fn get_mut(&mut self, slot: SlotRef) -> Option<&mut Pcb> {
        self.slots
            .get_mut(slot.index)
            .filter(|pcb| pcb.generation == slot.generation)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|pcb| pcb.status != ProcessStatus::Empty)
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|pcb| pcb.status != ProcessStatus::Empty).count()
    }

    /// Occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SlotRef, &Pcb)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, pcb)| pcb.status != ProcessStatus::Empty)
            .map(|(index, pcb)| (SlotRef { index, generation: pcb.generation }, pcb))
    }

    /// Pid of the process in `slot`, if it still exists
    pub fn pid_of(&self, slot: SlotRef) -> Option<Pid> {
        self.get(slot).map(|pcb| pcb.pid)
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.iter()
            .map(|(_, pcb)| ProcessInfo {
                pid: pcb.pid,
                parent: pcb.parent.and_then(|p| self.pid_of(p)),
                priority: pcb.priority,
                status: pcb.status,
                children: pcb.children.len(),
                zombies: pcb.zombies.len(),
                dispatches: pcb.dispatches,
                name: pcb.name.clone(),
            })
            .collect()
    }

    fn slot_of(&self, pid: Pid) -> usize {
        pid as usize % self.capacity()
    }
}

//! cinder-kernel: a preemptive three-level multilevel-feedback thread
//! scheduler for a simulated uniprocessor.
//!
//! Threads live in one of three ready bands selected by priority: band 1
//! dispatches shortest-remaining-burst first, band 2 by priority, band 3
//! round-robin under a 100-tick quantum. A periodic timer drives
//! accounting and aging; preemption is requested through the interrupt
//! gate and performed when the handler returns to the interrupted thread.

pub mod error;
pub mod thread;
pub mod trace;
pub mod types;

pub use cinder_machine::{Machine, MachineConfig};
pub use error::KernelError;
pub use thread::{
    MlfqScheduler, Tcb, ThreadManager, ThreadStatus, ThreadTable, AGING_THRESHOLD, TIME_QUANTUM,
};
pub use trace::{SchedEvent, TraceLog};
pub use types::{Priority, QueueLevel, ThreadHandle};

use cinder_machine::IntStatus;

/// The kernel: the simulated machine, the thread subsystem, and the
/// scheduling trace, wired to a deterministic tick driver.
pub struct Kernel {
    machine: Machine,
    thread_manager: ThreadManager,
    trace: TraceLog,
}

impl Kernel {
    pub fn new(config: MachineConfig) -> Result<Self, KernelError> {
        Ok(Self {
            machine: Machine::new(config)?,
            thread_manager: ThreadManager::new(),
            trace: TraceLog::new(),
        })
    }

    /// Advance the simulation by one tick.
    ///
    /// When the periodic timer is due, the alarm callback runs with
    /// interrupts disabled; any preemption it requested is honored at the
    /// interrupt epilogue, as if the interrupted thread had yielded where
    /// it stood.
    pub fn tick(&mut self) {
        if !self.machine.clock_tick() {
            return;
        }

        let old_level = self.machine.interrupt.set_level(IntStatus::Off);
        self.thread_manager
            .timer_tick(&mut self.machine, &mut self.trace);
        self.machine.interrupt.set_level(old_level);

        if self.machine.interrupt.take_yield_request() {
            self.thread_manager
                .yield_current(&mut self.machine, &mut self.trace);
        }
    }

    /// Advance the simulation by `ticks` ticks.
    pub fn run_for(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn spawn(&mut self, name: &str, priority: u8) -> Result<ThreadHandle, KernelError> {
        let priority = Priority::new(priority).ok_or(KernelError::InvalidPriority(priority))?;
        self.thread_manager
            .spawn(name, priority, &mut self.machine, &mut self.trace)
    }

    pub fn spawn_user(
        &mut self,
        name: &str,
        priority: u8,
        asid: u32,
    ) -> Result<ThreadHandle, KernelError> {
        let priority = Priority::new(priority).ok_or(KernelError::InvalidPriority(priority))?;
        self.thread_manager
            .spawn_user(name, priority, asid, &mut self.machine, &mut self.trace)
    }

    pub fn yield_current(&mut self) {
        self.thread_manager
            .yield_current(&mut self.machine, &mut self.trace);
    }

    pub fn block_current(&mut self) {
        self.thread_manager
            .block_current(&mut self.machine, &mut self.trace);
    }

    pub fn finish_current(&mut self) {
        self.thread_manager
            .finish_current(&mut self.machine, &mut self.trace);
    }

    pub fn wake(&mut self, handle: ThreadHandle) {
        self.thread_manager
            .wake(handle, &mut self.machine, &mut self.trace);
    }

    pub fn current(&self) -> ThreadHandle {
        self.thread_manager.current()
    }

    pub fn now(&self) -> u64 {
        self.machine.now()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn thread(&self, handle: ThreadHandle) -> Option<&Tcb> {
        self.thread_manager.threads.get(handle)
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Option<&mut Tcb> {
        self.thread_manager.threads.get_mut(handle)
    }

    pub fn scheduler(&self) -> &MlfqScheduler {
        &self.thread_manager.scheduler
    }

    pub fn trace_events(&self) -> &[SchedEvent] {
        self.trace.events()
    }

    pub fn take_trace(&mut self) -> Vec<SchedEvent> {
        self.trace.take()
    }

    /// Ready-list contents, for debugging.
    pub fn dump_ready_lists(&self) -> String {
        self.thread_manager
            .scheduler
            .dump(&self.thread_manager.threads)
    }
}

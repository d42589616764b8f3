pub mod alarm;
pub mod scheduler;
pub mod tcb;

pub use alarm::TIME_QUANTUM;
pub use scheduler::{MlfqScheduler, SchedCtx, AGING_THRESHOLD};
pub use tcb::{AddressSpace, Tcb, ThreadStatus};

use crate::error::KernelError;
use crate::trace::TraceLog;
use crate::types::{Priority, ThreadHandle};
use cinder_machine::{IntStatus, Machine};
use log::{debug, info};
use std::collections::BTreeMap;

/// Arena of all live TCBs, keyed by handle. Scheduler queues hold handles;
/// the table owns the records. A handle that misses the table is a
/// dangling reference, which is an invariant violation.
#[derive(Default)]
pub struct ThreadTable {
    map: BTreeMap<ThreadHandle, Tcb>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tcb: Tcb) {
        let handle = tcb.handle();
        let previous = self.map.insert(handle, tcb);
        assert!(previous.is_none(), "duplicate thread handle [{handle}]");
    }

    pub fn get(&self, handle: ThreadHandle) -> Option<&Tcb> {
        self.map.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ThreadHandle) -> Option<&mut Tcb> {
        self.map.get_mut(&handle)
    }

    pub fn tcb(&self, handle: ThreadHandle) -> &Tcb {
        self.get(handle)
            .unwrap_or_else(|| panic!("unknown thread handle [{handle}]"))
    }

    pub fn tcb_mut(&mut self, handle: ThreadHandle) -> &mut Tcb {
        self.get_mut(handle)
            .unwrap_or_else(|| panic!("unknown thread handle [{handle}]"))
    }

    pub fn remove(&mut self, handle: ThreadHandle) -> Tcb {
        self.map
            .remove(&handle)
            .unwrap_or_else(|| panic!("unknown thread handle [{handle}]"))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Base of the synthetic code region fresh threads start in.
const ENTRY_BASE: u32 = 0x8000_0000;

/// Thread lifecycle on top of the scheduler: creation, yield, sleep,
/// finish, wakeup. Exactly one thread is current at any time; the boot
/// thread is current from construction.
pub struct ThreadManager {
    pub threads: ThreadTable,
    pub scheduler: MlfqScheduler,
    pub current: ThreadHandle,
    next_handle: u32,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        let main = ThreadHandle::new(1).unwrap();
        let mut threads = ThreadTable::new();
        threads.insert(Tcb::bootstrap(main, "main"));
        Self {
            threads,
            scheduler: MlfqScheduler::new(),
            current: main,
            next_handle: 2,
        }
    }

    pub fn current(&self) -> ThreadHandle {
        self.current
    }

    /// Create a kernel thread and queue it for execution.
    pub fn spawn(
        &mut self,
        name: &str,
        priority: Priority,
        machine: &mut Machine,
        trace: &mut TraceLog,
    ) -> Result<ThreadHandle, KernelError> {
        self.spawn_inner(name, priority, None, machine, trace)
    }

    /// Create a thread owning a user address space. The space is saved
    /// and restored around every context switch the thread is part of.
    pub fn spawn_user(
        &mut self,
        name: &str,
        priority: Priority,
        asid: u32,
        machine: &mut Machine,
        trace: &mut TraceLog,
    ) -> Result<ThreadHandle, KernelError> {
        self.spawn_inner(name, priority, Some(AddressSpace::new(asid)), machine, trace)
    }

    fn spawn_inner(
        &mut self,
        name: &str,
        priority: Priority,
        space: Option<AddressSpace>,
        machine: &mut Machine,
        trace: &mut TraceLog,
    ) -> Result<ThreadHandle, KernelError> {
        let id = self.next_handle;
        let handle = ThreadHandle::new(id).ok_or(KernelError::TooManyThreads)?;
        self.next_handle = id.checked_add(1).ok_or(KernelError::TooManyThreads)?;

        let mut tcb = Tcb::new(handle, name, priority, ENTRY_BASE + id * 0x1000);
        tcb.set_address_space(space);
        self.threads.insert(tcb);
        info!(
            "forked thread [{handle}] ({name}) at priority {}",
            priority.get()
        );

        let old_level = machine.interrupt.set_level(IntStatus::Off);
        let Self {
            threads, scheduler, ..
        } = self;
        scheduler.ready_to_run(
            handle,
            &mut SchedCtx {
                threads,
                machine: &mut *machine,
                trace,
            },
        );
        machine.interrupt.set_level(old_level);
        Ok(handle)
    }

    /// Relinquish the CPU. The current thread goes back to its ready
    /// queue first, so it is dispatched again immediately when nothing
    /// better is queued.
    pub fn yield_current(&mut self, machine: &mut Machine, trace: &mut TraceLog) {
        let old_level = machine.interrupt.set_level(IntStatus::Off);
        debug!("yielding thread [{}]", self.current);

        let Self {
            threads,
            scheduler,
            current,
            ..
        } = self;
        let mut ctx = SchedCtx {
            threads,
            machine: &mut *machine,
            trace,
        };
        scheduler.ready_to_run(*current, &mut ctx);
        let next = scheduler
            .find_next_to_run(&mut ctx)
            .expect("ready lists cannot be empty after a requeue");
        scheduler.run(next, false, &mut ctx, current);

        machine.interrupt.set_level(old_level);
    }

    /// Block the current thread until someone wakes it.
    pub fn block_current(&mut self, machine: &mut Machine, trace: &mut TraceLog) {
        let old_level = machine.interrupt.set_level(IntStatus::Off);
        self.sleep_current(false, machine, trace);
        machine.interrupt.set_level(old_level);
    }

    /// Terminate the current thread. Its TCB is reclaimed by the next
    /// thread to run, once we are no longer executing on this stack.
    pub fn finish_current(&mut self, machine: &mut Machine, trace: &mut TraceLog) {
        let old_level = machine.interrupt.set_level(IntStatus::Off);
        info!("thread [{}] finishing", self.current);
        self.sleep_current(true, machine, trace);
        machine.interrupt.set_level(old_level);
    }

    /// Put the current thread to sleep and dispatch its successor.
    ///
    /// This is the RUNNING -> BLOCKED transition: T is finalized and
    /// folded into the burst estimate here, before the dispatch. With
    /// `finishing`, the thread becomes a zombie instead and never joins
    /// the waiting list.
    pub fn sleep_current(&mut self, finishing: bool, machine: &mut Machine, trace: &mut TraceLog) {
        assert_eq!(
            machine.interrupt.level(),
            IntStatus::Off,
            "sleep requires interrupts disabled"
        );
        let now = machine.now();
        debug!("sleeping thread [{}], finishing {finishing}", self.current);

        let Self {
            threads,
            scheduler,
            current,
            ..
        } = self;
        {
            let tcb = threads.tcb_mut(*current);
            tcb.update_running_ticks(now);
            tcb.reset_start_running_tick(now);
            if finishing {
                tcb.set_status(ThreadStatus::Zombie);
            } else {
                tcb.set_status(ThreadStatus::Blocked);
                tcb.update_remaining_burst();
                tcb.reset_start_waiting_tick(now);
            }
        }
        if !finishing {
            scheduler.wait_append(*current);
        }

        let mut ctx = SchedCtx {
            threads,
            machine,
            trace,
        };
        let next = scheduler.find_next_to_run(&mut ctx).unwrap_or_else(|| {
            panic!(
                "thread [{current}] went to sleep with no runnable successor; \
                 wake sources live outside the scheduler"
            )
        });
        scheduler.run(next, finishing, &mut ctx, current);
    }

    /// Run the timer-interrupt policy for this tick: accounting, the
    /// wait-tick sweep, aging, and the preemption decision. Called with
    /// interrupts disabled; any yield it requests is performed by the
    /// caller at the interrupt epilogue.
    pub fn timer_tick(&mut self, machine: &mut Machine, trace: &mut TraceLog) {
        let Self {
            threads,
            scheduler,
            current,
            ..
        } = self;
        alarm::call_back(
            scheduler,
            &mut SchedCtx {
                threads,
                machine,
                trace,
            },
            *current,
        );
    }

    /// Make a blocked thread runnable again.
    pub fn wake(&mut self, handle: ThreadHandle, machine: &mut Machine, trace: &mut TraceLog) {
        assert_eq!(
            self.threads.tcb(handle).status(),
            ThreadStatus::Blocked,
            "waking thread [{handle}] which is not blocked"
        );
        let old_level = machine.interrupt.set_level(IntStatus::Off);
        let Self {
            threads, scheduler, ..
        } = self;
        scheduler.ready_to_run(
            handle,
            &mut SchedCtx {
                threads,
                machine: &mut *machine,
                trace,
            },
        );
        machine.interrupt.set_level(old_level);
    }
}

use crate::types::{Priority, QueueLevel, ThreadHandle};
use cinder_machine::{Machine, MachineContext, NUM_REGS};

/// Size of a thread's private stack image, in words.
pub const STACK_WORDS: usize = 8 * 1024;

/// Sentinel written at the bottom of every allocated stack. If it gets
/// clobbered, the thread overflowed its stack.
const STACK_FENCEPOST: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    JustCreated,
    Running,
    Ready,
    Blocked,
    Zombie,
}

/// A user address space. The simulated MMU only tracks which space is
/// installed, so the state to save is just the identifier.
#[derive(Debug)]
pub struct AddressSpace {
    asid: u32,
}

impl AddressSpace {
    pub fn new(asid: u32) -> Self {
        Self { asid }
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// Hook run when the owning thread leaves the CPU. The page mapping
    /// lives in the space itself, so there is nothing to spill.
    pub fn save_state(&self, _machine: &mut Machine) {}

    /// Hook run when the owning thread is dispatched: reinstall the space
    /// on the MMU.
    pub fn restore_state(&self, machine: &mut Machine) {
        machine.active_asid = Some(self.asid);
    }
}

/// Thread control block.
///
/// Tick counters: `run_ticks` (T) accumulates while the thread runs and is
/// zeroed when it next enters the CPU after blocking; `wait_ticks` (W)
/// accumulates while the thread sits in a ready queue or the waiting list
/// and is zeroed at dispatch. Both advance incrementally from their start
/// markers. `burst_estimate` is the exponential average of past run
/// episodes, refreshed only when the thread blocks.
pub struct Tcb {
    handle: ThreadHandle,
    name: String,
    status: ThreadStatus,
    priority: Priority,
    queue_level: QueueLevel,
    run_ticks: u64,
    wait_ticks: u64,
    start_running_tick: u64,
    start_waiting_tick: u64,
    burst_estimate: f64,
    pub context: MachineContext,
    user_regs: [u32; NUM_REGS],
    address_space: Option<AddressSpace>,
    stack: Vec<u32>,
}

impl Tcb {
    /// A fresh thread with its own stack image, not yet on any queue.
    pub fn new(handle: ThreadHandle, name: &str, priority: Priority, entry_point: u32) -> Self {
        let mut stack = vec![0u32; STACK_WORDS];
        stack[0] = STACK_FENCEPOST;
        Self {
            handle,
            name: name.to_string(),
            status: ThreadStatus::JustCreated,
            priority,
            queue_level: priority.band(),
            run_ticks: 0,
            wait_ticks: 0,
            start_running_tick: 0,
            start_waiting_tick: 0,
            burst_estimate: 0.0,
            context: MachineContext::at_entry(entry_point, (STACK_WORDS * 4) as u32),
            user_regs: [0; NUM_REGS],
            address_space: None,
            stack,
        }
    }

    /// The boot thread: already running, borrowing the boot stack rather
    /// than owning one.
    pub fn bootstrap(handle: ThreadHandle, name: &str) -> Self {
        let mut tcb = Self::new(handle, name, Priority::MIN, 0);
        tcb.status = ThreadStatus::Running;
        tcb.stack = Vec::new();
        tcb
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ThreadStatus) {
        self.status = status;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn queue_level(&self) -> QueueLevel {
        self.queue_level
    }

    pub fn set_queue_level(&mut self, level: QueueLevel) {
        self.queue_level = level;
    }

    pub fn run_ticks(&self) -> u64 {
        self.run_ticks
    }

    pub fn wait_ticks(&self) -> u64 {
        self.wait_ticks
    }

    pub fn burst_estimate(&self) -> f64 {
        self.burst_estimate
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub fn set_address_space(&mut self, space: Option<AddressSpace>) {
        self.address_space = space;
    }

    /// Add the ticks elapsed since the running episode's start marker to T.
    pub fn update_running_ticks(&mut self, now: u64) {
        self.run_ticks += now - self.start_running_tick;
    }

    /// Add the ticks elapsed since the waiting episode's start marker to W.
    pub fn update_waiting_ticks(&mut self, now: u64) {
        self.wait_ticks += now - self.start_waiting_tick;
    }

    pub fn reset_start_running_tick(&mut self, now: u64) {
        self.start_running_tick = now;
    }

    pub fn reset_start_waiting_tick(&mut self, now: u64) {
        self.start_waiting_tick = now;
    }

    pub fn reset_running_ticks(&mut self) {
        self.run_ticks = 0;
    }

    pub fn reset_waiting_ticks(&mut self) {
        self.wait_ticks = 0;
    }

    /// Fold the just-finished run episode into the burst estimate:
    /// `burst <- 0.5 * T + 0.5 * burst`. Called only when the thread
    /// blocks; T must already be up to date.
    pub fn update_remaining_burst(&mut self) {
        self.burst_estimate = 0.5 * self.run_ticks as f64 + 0.5 * self.burst_estimate;
    }

    /// Aging boost: +10 priority, saturating at 149.
    pub fn promote(&mut self) {
        self.priority = self.priority.promoted();
    }

    /// Verify the stack fencepost. The boot thread has no owned stack and
    /// is exempt.
    pub fn check_overflow(&self) {
        if !self.stack.is_empty() {
            assert_eq!(
                self.stack[0], STACK_FENCEPOST,
                "thread [{}] ({}) overflowed its stack",
                self.handle, self.name
            );
        }
    }

    pub fn save_user_state(&mut self, machine: &Machine) {
        if self.address_space.is_some() {
            self.user_regs = machine.context.regs;
        }
    }

    pub fn restore_user_state(&self, machine: &mut Machine) {
        if self.address_space.is_some() {
            machine.context.regs = self.user_regs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_machine::MachineConfig;

    fn tcb(id: u32, priority: u8) -> Tcb {
        Tcb::new(
            ThreadHandle::new(id).unwrap(),
            "worker",
            Priority::new(priority).unwrap(),
            0x8000_0000,
        )
    }

    #[test]
    fn counters_advance_incrementally() {
        let mut t = tcb(1, 20);
        t.reset_start_running_tick(10);
        t.update_running_ticks(25);
        assert_eq!(t.run_ticks(), 15);
        t.reset_start_running_tick(25);
        t.update_running_ticks(30);
        assert_eq!(t.run_ticks(), 20);

        t.reset_start_waiting_tick(30);
        t.update_waiting_ticks(42);
        assert_eq!(t.wait_ticks(), 12);
    }

    #[test]
    fn burst_estimate_is_an_exponential_average() {
        let mut t = tcb(1, 120);
        t.reset_start_running_tick(0);
        t.update_running_ticks(40);
        t.update_remaining_burst();
        assert_eq!(t.burst_estimate(), 20.0);

        t.reset_running_ticks();
        t.reset_start_running_tick(100);
        t.update_running_ticks(110);
        t.update_remaining_burst();
        assert_eq!(t.burst_estimate(), 15.0);
    }

    #[test]
    fn promote_saturates() {
        let mut t = tcb(1, 145);
        t.promote();
        assert_eq!(t.priority(), Priority::MAX);
    }

    #[test]
    fn intact_fencepost_passes_overflow_check() {
        tcb(1, 20).check_overflow();
    }

    #[test]
    #[should_panic(expected = "overflowed its stack")]
    fn clobbered_fencepost_aborts() {
        let mut t = tcb(1, 20);
        t.stack[0] = 0;
        t.check_overflow();
    }

    #[test]
    fn user_state_roundtrips_through_the_machine() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        let mut t = tcb(1, 20);
        t.set_address_space(Some(AddressSpace::new(7)));

        machine.context.regs[0] = 0xAB;
        t.save_user_state(&machine);
        machine.context.regs[0] = 0;
        t.restore_user_state(&mut machine);
        assert_eq!(machine.context.regs[0], 0xAB);

        t.address_space().unwrap().restore_state(&mut machine);
        assert_eq!(machine.active_asid, Some(7));
    }

    #[test]
    fn kernel_thread_user_state_is_inert() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        let mut t = tcb(1, 20);
        machine.context.regs[0] = 0xAB;
        t.save_user_state(&machine);
        machine.context.regs[0] = 1;
        t.restore_user_state(&mut machine);
        assert_eq!(machine.context.regs[0], 1);
    }
}

pub mod context;
pub mod error;
pub mod interrupt;
pub mod stats;

pub use context::*;
pub use error::*;
pub use interrupt::*;
pub use stats::*;

pub struct MachineConfig {
    /// Ticks between periodic timer interrupts.
    pub timer_interval: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { timer_interval: 1 }
    }
}

/// The simulated uniprocessor: one active register file, one interrupt
/// gate, one clock. Time advances only through `clock_tick`.
pub struct Machine {
    pub context: MachineContext,
    pub interrupt: Interrupt,
    pub stats: Stats,
    /// Address space currently installed on the MMU, if any.
    pub active_asid: Option<u32>,
    timer_interval: u64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        if config.timer_interval == 0 {
            return Err(MachineError::InvalidTimerInterval);
        }
        Ok(Self {
            context: MachineContext::default(),
            interrupt: Interrupt::new(),
            stats: Stats::new(),
            active_asid: None,
            timer_interval: config.timer_interval,
        })
    }

    /// Advance the clock by one tick. Returns true when the periodic
    /// timer is due, in which case the caller runs its interrupt handler
    /// before executing anything else.
    pub fn clock_tick(&mut self) -> bool {
        self.stats.advance(1);
        let due = self.stats.total_ticks() % self.timer_interval == 0;
        if due {
            self.stats.count_timer_interrupt();
        }
        due
    }

    /// Current wall-clock tick.
    pub fn now(&self) -> u64 {
        self.stats.total_ticks()
    }

    /// The machine-level SWITCH primitive: store the active register file
    /// into `old` and install `next`. Contexts are plain register images,
    /// so on the simulated machine this is a pair of copies.
    pub fn switch_context(&mut self, old: &mut MachineContext, next: &MachineContext) {
        *old = self.context;
        self.context = *next;
    }
}

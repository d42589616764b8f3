//! Scheduling trace.
//!
//! Every ready-list insertion, removal, and context switch is recorded as a
//! typed event. The rendered lines are stable so tests can assert on them;
//! each event is also mirrored to the `sched` log target.

use crate::types::{QueueLevel, ThreadHandle};
use core::fmt;
use log::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    /// A thread entered a ready queue.
    Inserted {
        tick: u64,
        thread: ThreadHandle,
        level: QueueLevel,
    },
    /// A thread left a ready queue, either through dispatch or the aging
    /// drain.
    Removed {
        tick: u64,
        thread: ThreadHandle,
        level: QueueLevel,
    },
    /// A context switch between two distinct threads.
    Switched {
        tick: u64,
        thread: ThreadHandle,
        replaced: ThreadHandle,
        ran_ticks: u64,
    },
}

impl fmt::Display for SchedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedEvent::Inserted { tick, thread, level } => write!(
                f,
                "[A] Tick [{tick}]: Thread [{thread}] is inserted into queue L[{level}]"
            ),
            SchedEvent::Removed { tick, thread, level } => write!(
                f,
                "[B] Tick [{tick}]: Thread [{thread}] is removed from queue L[{level}]"
            ),
            SchedEvent::Switched {
                tick,
                thread,
                replaced,
                ran_ticks,
            } => write!(
                f,
                "[E] Tick [{tick}]: Thread [{thread}] is now selected for execution, \
                 thread [{replaced}] is replaced, and it has executed [{ran_ticks}] ticks"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct TraceLog {
    events: Vec<SchedEvent>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: SchedEvent) {
        debug!(target: "sched", "{event}");
        self.events.push(event);
    }

    pub fn events(&self) -> &[SchedEvent] {
        &self.events
    }

    /// Drain the recorded events, leaving the log empty.
    pub fn take(&mut self) -> Vec<SchedEvent> {
        core::mem::take(&mut self.events)
    }
}

//! Timer-interrupt policy: accounting, aging, and the preemption decision.
//!
//! Runs with interrupts disabled. A preemption never switches contexts
//! here; it sets the interrupt gate's yield-on-return flag, and the
//! interrupted thread yields once the handler has returned to it.

use crate::thread::scheduler::{MlfqScheduler, SchedCtx};
use crate::thread::tcb::ThreadStatus;
use crate::types::{QueueLevel, ThreadHandle};
use cinder_machine::IntStatus;
use core::cmp::Ordering;

/// Round-robin quantum for band 3, in ticks.
pub const TIME_QUANTUM: u64 = 100;

/// Timer callback, invoked on every timer interrupt.
///
/// Preemption rules by band of the interrupted thread:
/// band 3 yields when its quantum is spent or any higher band has work;
/// band 2 yields when band 1 has work; band 1 yields when the band-1
/// front has a strictly smaller remaining-burst estimate.
pub fn call_back(scheduler: &mut MlfqScheduler, ctx: &mut SchedCtx<'_>, current: ThreadHandle) {
    assert_eq!(
        ctx.machine.interrupt.level(),
        IntStatus::Off,
        "timer callback with interrupts enabled"
    );
    let now = ctx.machine.now();

    // accounting for the interrupted thread, then a fresh episode marker
    {
        let tcb = ctx.threads.tcb_mut(current);
        if tcb.status() == ThreadStatus::Blocked {
            tcb.update_waiting_ticks(now);
            tcb.reset_start_waiting_tick(now);
        } else {
            tcb.update_running_ticks(now);
            tcb.reset_start_running_tick(now);
        }
    }

    scheduler.update_all_wait_ticks(ctx);
    scheduler.aging(ctx);

    let tcb = ctx.threads.tcb(current);
    let should_yield = match tcb.queue_level() {
        QueueLevel::L3 => {
            tcb.run_ticks() >= TIME_QUANTUM
                || !scheduler.level2_empty()
                || !scheduler.level1_empty()
        }
        QueueLevel::L2 => !scheduler.level1_empty(),
        QueueLevel::L1 => scheduler.level1_front().is_some_and(|front| {
            MlfqScheduler::level1_cmp(ctx.threads.tcb(front), tcb) == Ordering::Less
        }),
    };

    if should_yield {
        ctx.machine.interrupt.yield_on_return();
    }
}

//! Routines to choose the next thread to run and to dispatch to it.
//!
//! Every operation here assumes interrupts are already disabled; on a
//! uniprocessor that is the mutual exclusion. Locks cannot be used inside
//! the scheduler: waiting for a busy lock would reenter the dispatcher.
//!
//! Three ready lists, selected by priority band: L1 orders by estimated
//! remaining CPU burst (shortest first), L2 by priority (highest first),
//! L3 is plain FIFO. Dispatch always drains higher bands first.

use crate::thread::tcb::{Tcb, ThreadStatus};
use crate::thread::ThreadTable;
use crate::trace::{SchedEvent, TraceLog};
use crate::types::{QueueLevel, ThreadHandle};
use cinder_machine::{IntStatus, Machine};
use core::cmp::Ordering;
use log::{debug, info};
use std::collections::VecDeque;

/// Accumulated waiting ticks at which aging promotes a thread.
pub const AGING_THRESHOLD: u64 = 1500;

/// The kernel state a scheduler operation works against, passed explicitly
/// so the scheduler itself owns nothing but its queues.
pub struct SchedCtx<'a> {
    pub threads: &'a mut ThreadTable,
    pub machine: &'a mut Machine,
    pub trace: &'a mut TraceLog,
}

pub struct MlfqScheduler {
    level1: VecDeque<ThreadHandle>,
    level2: VecDeque<ThreadHandle>,
    level3: VecDeque<ThreadHandle>,
    /// Membership list of blocked threads, kept only so the wait-tick
    /// sweep can reach them.
    waiting: Vec<ThreadHandle>,
    /// Finishing thread to be reclaimed by the next thread that runs.
    to_be_destroyed: Option<ThreadHandle>,
}

impl Default for MlfqScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MlfqScheduler {
    pub fn new() -> Self {
        Self {
            level1: VecDeque::new(),
            level2: VecDeque::new(),
            level3: VecDeque::new(),
            waiting: Vec::new(),
            to_be_destroyed: None,
        }
    }

    /// Orders L1: lower estimated remaining burst runs first.
    pub fn level1_cmp(x: &Tcb, y: &Tcb) -> Ordering {
        x.burst_estimate()
            .partial_cmp(&y.burst_estimate())
            .unwrap_or(Ordering::Equal)
    }

    /// Orders L2: higher priority runs first.
    pub fn level2_cmp(x: &Tcb, y: &Tcb) -> Ordering {
        y.priority().cmp(&x.priority())
    }

    /// Mark a thread ready and queue it in the band its priority selects.
    ///
    /// Legal prior states: RUNNING (yield), BLOCKED (wakeup), JUST_CREATED
    /// (first enqueue).
    pub fn ready_to_run(&mut self, handle: ThreadHandle, ctx: &mut SchedCtx<'_>) {
        assert_eq!(
            ctx.machine.interrupt.level(),
            IntStatus::Off,
            "scheduler entered with interrupts enabled"
        );
        let status = ctx.threads.tcb(handle).status();
        assert!(
            matches!(
                status,
                ThreadStatus::Running | ThreadStatus::Blocked | ThreadStatus::JustCreated
            ),
            "thread [{handle}] cannot become ready from {status:?}"
        );
        assert!(
            !self.contains(handle),
            "thread [{handle}] is already on a ready list"
        );
        debug!(
            "putting thread on ready list: {}",
            ctx.threads.tcb(handle).name()
        );

        let now = ctx.machine.now();
        {
            let tcb = ctx.threads.tcb_mut(handle);
            tcb.set_status(ThreadStatus::Ready);
            // the ready-queue waiting episode starts here
            tcb.reset_start_waiting_tick(now);
        }
        if let Some(pos) = self.waiting.iter().position(|&h| h == handle) {
            self.waiting.remove(pos);
        }
        self.insert_to_ready_list(handle, ctx);
    }

    /// Return the next thread to dispatch, removed from its ready list:
    /// front of L1, else front of L2, else front of L3, else none.
    pub fn find_next_to_run(&mut self, ctx: &mut SchedCtx<'_>) -> Option<ThreadHandle> {
        assert_eq!(
            ctx.machine.interrupt.level(),
            IntStatus::Off,
            "scheduler entered with interrupts enabled"
        );

        let next = self
            .level1
            .pop_front()
            .or_else(|| self.level2.pop_front())
            .or_else(|| self.level3.pop_front())?;

        ctx.trace.record(SchedEvent::Removed {
            tick: ctx.machine.now(),
            thread: next,
            level: ctx.threads.tcb(next).queue_level(),
        });
        Some(next)
    }

    /// Dispatch the CPU to `next`: finalize the leaving thread's
    /// accounting, save and restore machine state around the context
    /// switch, and reclaim a finished predecessor.
    ///
    /// The caller has already set the leaving thread's status to READY,
    /// BLOCKED, or ZOMBIE, and `next` is no longer on any ready list.
    /// With `finishing`, the leaving thread is reclaimed once its
    /// successor is on the CPU.
    pub fn run(
        &mut self,
        next: ThreadHandle,
        finishing: bool,
        ctx: &mut SchedCtx<'_>,
        current: &mut ThreadHandle,
    ) {
        assert_eq!(
            ctx.machine.interrupt.level(),
            IntStatus::Off,
            "scheduler entered with interrupts enabled"
        );
        assert!(
            !self.contains(next),
            "thread [{next}] is still on a ready list"
        );

        let old = *current;
        let now = ctx.machine.now();

        if next != old {
            let old_tcb = ctx.threads.tcb_mut(old);
            old_tcb.update_running_ticks(now);
            let ran_ticks = old_tcb.run_ticks();
            ctx.trace.record(SchedEvent::Switched {
                tick: now,
                thread: next,
                replaced: old,
                ran_ticks,
            });
        }
        if ctx.threads.tcb(old).status() == ThreadStatus::Blocked {
            // the burst estimate already consumed T when the thread went
            // to sleep; the next run episode starts from zero
            ctx.threads.tcb_mut(old).reset_running_ticks();
        }

        if finishing {
            assert!(
                self.to_be_destroyed.is_none(),
                "a finished thread is already pending reclamation"
            );
            self.to_be_destroyed = Some(old);
        }

        ctx.threads.tcb_mut(old).save_user_state(ctx.machine);
        if let Some(space) = ctx.threads.tcb(old).address_space() {
            space.save_state(ctx.machine);
        }

        ctx.threads.tcb(old).check_overflow();

        ctx.threads.tcb_mut(old).reset_waiting_ticks();
        {
            let next_tcb = ctx.threads.tcb_mut(next);
            next_tcb.reset_waiting_ticks();
            next_tcb.reset_start_running_tick(now);
        }

        *current = next;
        ctx.threads.tcb_mut(next).set_status(ThreadStatus::Running);
        debug!("switching from thread [{old}] to thread [{next}]");

        let next_context = ctx.threads.tcb(next).context;
        let mut old_context = ctx.threads.tcb(old).context;
        ctx.machine.switch_context(&mut old_context, &next_context);
        ctx.threads.tcb_mut(old).context = old_context;

        // the successor owns the CPU now; interrupts stay off until the
        // caller of the dispatch re-enables them
        self.check_to_be_destroyed(ctx);

        ctx.threads.tcb(next).restore_user_state(ctx.machine);
        if let Some(space) = ctx.threads.tcb(next).address_space() {
            space.restore_state(ctx.machine);
        }
    }

    /// Reclaim the thread that finished on our stack, if any.
    pub fn check_to_be_destroyed(&mut self, ctx: &mut SchedCtx<'_>) {
        if let Some(handle) = self.to_be_destroyed.take() {
            let tcb = ctx.threads.remove(handle);
            info!("reclaimed thread [{}] ({})", handle, tcb.name());
        }
    }

    /// Advance W for every thread that is queued or blocked, then re-mark
    /// the episode start so the next sweep is incremental. Idempotent
    /// within a tick.
    pub fn update_all_wait_ticks(&self, ctx: &mut SchedCtx<'_>) {
        let now = ctx.machine.now();
        for &handle in self
            .level1
            .iter()
            .chain(self.level2.iter())
            .chain(self.level3.iter())
            .chain(self.waiting.iter())
        {
            let tcb = ctx.threads.tcb_mut(handle);
            tcb.update_waiting_ticks(now);
            tcb.reset_start_waiting_tick(now);
        }
    }

    /// Promote threads that have waited past the threshold.
    ///
    /// Every list is drained and reinserted unconditionally: a promoted
    /// thread migrates to the band its new priority selects, and the L1/L2
    /// sort keys are refreshed in the same pass. W is deliberately left
    /// alone, so a thread stuck past the threshold keeps being promoted on
    /// subsequent ticks until it reaches the cap or gets dispatched.
    pub fn aging(&mut self, ctx: &mut SchedCtx<'_>) {
        let now = ctx.machine.now();
        let mut drained: Vec<ThreadHandle> = Vec::new();

        for queue in [&mut self.level3, &mut self.level2, &mut self.level1] {
            while let Some(handle) = queue.pop_front() {
                ctx.trace.record(SchedEvent::Removed {
                    tick: now,
                    thread: handle,
                    level: ctx.threads.tcb(handle).queue_level(),
                });
                let tcb = ctx.threads.tcb_mut(handle);
                if tcb.wait_ticks() >= AGING_THRESHOLD {
                    tcb.promote();
                }
                drained.push(handle);
            }
        }

        for handle in drained {
            self.insert_to_ready_list(handle, ctx);
        }
    }

    /// Record a blocked thread so the wait-tick sweep reaches it. The
    /// caller sets the thread's status and waiting-episode marker.
    pub fn wait_append(&mut self, handle: ThreadHandle) {
        assert!(
            !self.waiting.contains(&handle),
            "thread [{handle}] is already on the waiting list"
        );
        self.waiting.push(handle);
    }

    pub fn level1_empty(&self) -> bool {
        self.level1.is_empty()
    }

    pub fn level2_empty(&self) -> bool {
        self.level2.is_empty()
    }

    pub fn level3_empty(&self) -> bool {
        self.level3.is_empty()
    }

    pub fn level1_front(&self) -> Option<ThreadHandle> {
        self.level1.front().copied()
    }

    pub fn level2_front(&self) -> Option<ThreadHandle> {
        self.level2.front().copied()
    }

    pub fn level3_front(&self) -> Option<ThreadHandle> {
        self.level3.front().copied()
    }

    /// Whether a thread sits on any of the three ready lists.
    pub fn contains(&self, handle: ThreadHandle) -> bool {
        self.level1.contains(&handle)
            || self.level2.contains(&handle)
            || self.level3.contains(&handle)
    }

    /// Ready-list contents, for debugging.
    pub fn dump(&self, threads: &ThreadTable) -> String {
        use std::fmt::Write;

        let mut out = String::from("ready list contents:\n");
        for (label, queue) in [
            ("L1", &self.level1),
            ("L2", &self.level2),
            ("L3", &self.level3),
        ] {
            let _ = write!(out, "  {label}:");
            for &handle in queue {
                let tcb = threads.tcb(handle);
                let _ = write!(
                    out,
                    " [{}] {} (prio {}, burst {})",
                    handle,
                    tcb.name(),
                    tcb.priority().get(),
                    tcb.burst_estimate()
                );
            }
            out.push('\n');
        }
        out
    }

    /// Route a thread to the list matching its priority band, refreshing
    /// the cached queue level. Ordered bands place ties after existing
    /// equal elements, preserving arrival order.
    fn insert_to_ready_list(&mut self, handle: ThreadHandle, ctx: &mut SchedCtx<'_>) {
        let level = ctx.threads.tcb(handle).priority().band();
        ctx.threads.tcb_mut(handle).set_queue_level(level);

        match level {
            QueueLevel::L1 => {
                insert_sorted(&mut self.level1, handle, ctx.threads, Self::level1_cmp)
            }
            QueueLevel::L2 => {
                insert_sorted(&mut self.level2, handle, ctx.threads, Self::level2_cmp)
            }
            QueueLevel::L3 => self.level3.push_back(handle),
        }

        ctx.trace.record(SchedEvent::Inserted {
            tick: ctx.machine.now(),
            thread: handle,
            level,
        });
    }
}

fn insert_sorted(
    queue: &mut VecDeque<ThreadHandle>,
    handle: ThreadHandle,
    threads: &ThreadTable,
    cmp: fn(&Tcb, &Tcb) -> Ordering,
) {
    let pos = queue
        .iter()
        .position(|&queued| cmp(threads.tcb(handle), threads.tcb(queued)) == Ordering::Less)
        .unwrap_or(queue.len());
    queue.insert(pos, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use cinder_machine::MachineConfig;

    struct Fixture {
        threads: ThreadTable,
        machine: Machine,
        trace: TraceLog,
        scheduler: MlfqScheduler,
    }

    impl Fixture {
        fn new() -> Self {
            let mut machine = Machine::new(MachineConfig::default()).unwrap();
            machine.interrupt.set_level(IntStatus::Off);
            Self {
                threads: ThreadTable::new(),
                machine,
                trace: TraceLog::new(),
                scheduler: MlfqScheduler::new(),
            }
        }

        fn spawn(&mut self, id: u32, priority: u8) -> ThreadHandle {
            let handle = ThreadHandle::new(id).unwrap();
            self.threads.insert(Tcb::new(
                handle,
                &format!("t{id}"),
                Priority::new(priority).unwrap(),
                0,
            ));
            handle
        }

        /// Give a thread a burst estimate of `ticks / 2` by folding one
        /// run episode of `ticks` into a fresh estimate.
        fn with_burst(&mut self, handle: ThreadHandle, ticks: u64) {
            let tcb = self.threads.tcb_mut(handle);
            tcb.reset_start_running_tick(0);
            tcb.update_running_ticks(ticks);
            tcb.update_remaining_burst();
            tcb.reset_running_ticks();
        }

        fn with_wait(&mut self, handle: ThreadHandle, ticks: u64) {
            let tcb = self.threads.tcb_mut(handle);
            tcb.reset_start_waiting_tick(0);
            tcb.update_waiting_ticks(ticks);
        }

        fn ready(&mut self, handle: ThreadHandle) {
            let Fixture {
                threads,
                machine,
                trace,
                scheduler,
            } = self;
            scheduler.ready_to_run(
                handle,
                &mut SchedCtx {
                    threads,
                    machine,
                    trace,
                },
            );
        }

        fn next(&mut self) -> Option<ThreadHandle> {
            let Fixture {
                threads,
                machine,
                trace,
                scheduler,
            } = self;
            scheduler.find_next_to_run(&mut SchedCtx {
                threads,
                machine,
                trace,
            })
        }

        fn run(&mut self, next: ThreadHandle, finishing: bool, current: &mut ThreadHandle) {
            let Fixture {
                threads,
                machine,
                trace,
                scheduler,
            } = self;
            scheduler.run(
                next,
                finishing,
                &mut SchedCtx {
                    threads,
                    machine,
                    trace,
                },
                current,
            );
        }

        fn sweep(&mut self) {
            let Fixture {
                threads,
                machine,
                trace,
                scheduler,
            } = self;
            scheduler.update_all_wait_ticks(&mut SchedCtx {
                threads,
                machine,
                trace,
            });
        }

        fn age(&mut self) {
            let Fixture {
                threads,
                machine,
                trace,
                scheduler,
            } = self;
            scheduler.aging(&mut SchedCtx {
                threads,
                machine,
                trace,
            });
        }
    }

    #[test]
    fn insertion_routes_by_priority_band() {
        let mut f = Fixture::new();
        let low = f.spawn(1, 20);
        let mid = f.spawn(2, 75);
        let high = f.spawn(3, 120);
        f.ready(low);
        f.ready(mid);
        f.ready(high);

        assert_eq!(f.scheduler.level3_front(), Some(low));
        assert_eq!(f.scheduler.level2_front(), Some(mid));
        assert_eq!(f.scheduler.level1_front(), Some(high));
        assert_eq!(f.threads.tcb(low).queue_level(), QueueLevel::L3);
        assert_eq!(f.threads.tcb(mid).queue_level(), QueueLevel::L2);
        assert_eq!(f.threads.tcb(high).queue_level(), QueueLevel::L1);
        assert_eq!(f.threads.tcb(low).status(), ThreadStatus::Ready);

        let inserts: Vec<_> = f
            .trace
            .events()
            .iter()
            .filter(|e| matches!(e, SchedEvent::Inserted { .. }))
            .collect();
        assert_eq!(inserts.len(), 3);
    }

    #[test]
    fn level2_orders_by_priority_with_stable_ties() {
        let mut f = Fixture::new();
        let a = f.spawn(1, 60);
        let b = f.spawn(2, 80);
        let c = f.spawn(3, 60);
        let d = f.spawn(4, 70);
        for h in [a, b, c, d] {
            f.ready(h);
        }

        let order: Vec<_> = std::iter::from_fn(|| f.next()).collect();
        assert_eq!(order, vec![b, d, a, c]);
    }

    #[test]
    fn level1_orders_by_burst_with_stable_ties() {
        let mut f = Fixture::new();
        let a = f.spawn(1, 120);
        let b = f.spawn(2, 130);
        let c = f.spawn(3, 110);
        f.with_burst(a, 80); // burst 40
        f.with_burst(b, 20); // burst 10
        f.with_burst(c, 20); // burst 10, arrives after b
        f.ready(a);
        f.ready(b);
        f.ready(c);

        let order: Vec<_> = std::iter::from_fn(|| f.next()).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn dispatch_drains_higher_bands_first() {
        let mut f = Fixture::new();
        let low = f.spawn(1, 10);
        let mid = f.spawn(2, 60);
        let high = f.spawn(3, 140);
        f.ready(low);
        f.ready(mid);
        f.ready(high);

        assert_eq!(f.next(), Some(high));
        assert_eq!(f.next(), Some(mid));
        assert_eq!(f.next(), Some(low));
        assert_eq!(f.next(), None);
    }

    #[test]
    fn threads_sit_on_one_list_at_a_time() {
        let mut f = Fixture::new();
        let handles: Vec<_> = (1..=4).map(|id| f.spawn(id, (id * 30) as u8)).collect();
        for &h in &handles {
            f.ready(h);
        }
        f.age();

        for &h in &handles {
            let on = [
                f.scheduler.level1.contains(&h),
                f.scheduler.level2.contains(&h),
                f.scheduler.level3.contains(&h),
            ];
            assert_eq!(on.iter().filter(|&&b| b).count(), 1, "thread {h}");
        }
    }

    #[test]
    fn run_dispatches_and_resets_dispatch_state() {
        let mut f = Fixture::new();
        let main = f.spawn(1, 0);
        f.threads.tcb_mut(main).set_status(ThreadStatus::Running);
        let a = f.spawn(2, 20);
        f.with_wait(a, 7);
        f.ready(a);

        f.threads.tcb_mut(main).set_status(ThreadStatus::Ready);
        let next = f.next().unwrap();
        assert_eq!(next, a);

        let mut current = main;
        f.run(next, false, &mut current);

        assert_eq!(current, a);
        let tcb = f.threads.tcb(a);
        assert_eq!(tcb.status(), ThreadStatus::Running);
        assert_eq!(tcb.wait_ticks(), 0);
        assert!(f
            .trace
            .events()
            .iter()
            .any(|e| matches!(e, SchedEvent::Switched { thread, replaced, .. }
                if *thread == a && *replaced == main)));
    }

    #[test]
    fn run_zeroes_t_for_a_blocked_predecessor() {
        let mut f = Fixture::new();
        let main = f.spawn(1, 0);
        f.threads.tcb_mut(main).set_status(ThreadStatus::Running);
        let a = f.spawn(2, 20);
        f.ready(a);

        // main blocks: T was folded into its burst estimate already
        {
            let tcb = f.threads.tcb_mut(main);
            tcb.reset_start_running_tick(0);
            tcb.update_running_ticks(30);
            tcb.update_remaining_burst();
            tcb.set_status(ThreadStatus::Blocked);
        }
        let next = f.next().unwrap();
        let mut current = main;
        f.run(next, false, &mut current);

        assert_eq!(f.threads.tcb(main).run_ticks(), 0);
        assert_eq!(f.threads.tcb(main).burst_estimate(), 15.0);
    }

    #[test]
    fn finishing_thread_is_reclaimed_after_the_switch() {
        let mut f = Fixture::new();
        let main = f.spawn(1, 0);
        f.threads.tcb_mut(main).set_status(ThreadStatus::Running);
        let a = f.spawn(2, 20);
        f.ready(a);

        // main yields to a
        let mut current = main;
        f.ready(main);
        let next = f.next().unwrap();
        assert_eq!(next, a);
        f.run(next, false, &mut current);
        assert_eq!(current, a);

        // a finishes; main takes over and reclaims it
        f.threads.tcb_mut(a).set_status(ThreadStatus::Zombie);
        let next = f.next().unwrap();
        assert_eq!(next, main);
        f.run(next, true, &mut current);

        assert_eq!(current, main);
        assert!(f.threads.get(a).is_none());
    }

    #[test]
    fn wait_tick_sweep_reaches_ready_and_blocked_threads() {
        let mut f = Fixture::new();
        let queued = f.spawn(1, 20);
        let blocked = f.spawn(2, 20);
        f.ready(queued);
        f.threads.tcb_mut(blocked).set_status(ThreadStatus::Blocked);
        f.scheduler.wait_append(blocked);

        for _ in 0..5 {
            f.machine.clock_tick();
        }
        f.sweep();
        assert_eq!(f.threads.tcb(queued).wait_ticks(), 5);
        assert_eq!(f.threads.tcb(blocked).wait_ticks(), 5);

        // second sweep at the same tick adds nothing
        f.sweep();
        assert_eq!(f.threads.tcb(queued).wait_ticks(), 5);
    }

    #[test]
    fn waking_removes_the_thread_from_the_waiting_list() {
        let mut f = Fixture::new();
        let blocked = f.spawn(1, 20);
        f.threads.tcb_mut(blocked).set_status(ThreadStatus::Blocked);
        f.scheduler.wait_append(blocked);

        f.ready(blocked);
        assert!(f.scheduler.waiting.is_empty());
        assert_eq!(f.scheduler.level3_front(), Some(blocked));
    }

    #[test]
    fn aging_promotes_past_the_threshold_and_migrates_bands() {
        let mut f = Fixture::new();
        let starved = f.spawn(1, 40);
        let fresh = f.spawn(2, 40);
        f.ready(starved);
        f.ready(fresh);
        f.with_wait(starved, AGING_THRESHOLD);

        f.age();

        let tcb = f.threads.tcb(starved);
        assert_eq!(tcb.priority(), Priority::new(50).unwrap());
        assert_eq!(tcb.queue_level(), QueueLevel::L2);
        assert_eq!(f.scheduler.level2_front(), Some(starved));
        assert_eq!(f.threads.tcb(fresh).priority(), Priority::new(40).unwrap());
        assert_eq!(f.scheduler.level3_front(), Some(fresh));
    }

    #[test]
    fn aging_leaves_w_alone_so_promotion_repeats() {
        let mut f = Fixture::new();
        let starved = f.spawn(1, 40);
        f.ready(starved);
        f.with_wait(starved, AGING_THRESHOLD + 3);

        f.age();
        assert_eq!(f.threads.tcb(starved).wait_ticks(), AGING_THRESHOLD + 3);
        f.age();
        assert_eq!(
            f.threads.tcb(starved).priority(),
            Priority::new(60).unwrap()
        );

        // promotion saturates at the cap even while W stays high
        for _ in 0..20 {
            f.age();
        }
        assert_eq!(f.threads.tcb(starved).priority(), Priority::MAX);
        assert_eq!(f.threads.tcb(starved).queue_level(), QueueLevel::L1);
    }

    #[test]
    fn aging_emits_drain_and_reinsert_events() {
        let mut f = Fixture::new();
        let starved = f.spawn(1, 40);
        f.ready(starved);
        f.with_wait(starved, AGING_THRESHOLD);
        f.trace.take();

        f.age();

        let events = f.trace.take();
        assert!(matches!(
            events[0],
            SchedEvent::Removed {
                level: QueueLevel::L3,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            SchedEvent::Inserted {
                level: QueueLevel::L2,
                ..
            }
        ));
    }

    #[test]
    #[should_panic(expected = "interrupts enabled")]
    fn scheduler_entry_requires_interrupts_off() {
        let mut f = Fixture::new();
        let a = f.spawn(1, 20);
        f.machine.interrupt.set_level(IntStatus::On);
        f.ready(a);
    }
}

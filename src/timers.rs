//! Public timer surface: timeouts, intervals, ref/unref, immediates.
//!
//! Everything here is sugar and policy over the enroll protocol and the
//! dispatch loop in `scheduler.rs`; the only state it owns is the
//! immediate queue.

use crate::arena::{ImmediateState, NodeKind, TimerState};
use crate::scheduler::{Deferred, FireTarget, ImmediateId, Scheduler, TimerId};
use crate::{CallbackError, TIMEOUT_MAX, list};

/// Public-API coercion: anything outside `[1, TIMEOUT_MAX]` (including
/// NaN and non-finite values) becomes 1ms. Fractional values truncate.
fn clamp_after(after: f64) -> u64 {
    if after >= 1.0 && after <= TIMEOUT_MAX as f64 {
        after as u64
    } else {
        1
    }
}

impl<C> Scheduler<C> {
    // ==================== Timeouts and intervals ====================

    /// Schedule `callback` to run once, `after` milliseconds from now.
    ///
    /// Arguments for the callback are closure captures; the callback also
    /// receives the scheduler and the host context, so it may schedule
    /// and cancel other timers re-entrantly.
    pub fn set_timeout<F>(&mut self, callback: F, after: f64) -> TimerId
    where
        F: FnMut(&mut Scheduler<C>, &mut C) -> Result<(), CallbackError> + 'static,
    {
        self.spawn_timer(Box::new(callback), clamp_after(after), None)
    }

    /// Schedule `callback` every `every` milliseconds until cleared.
    ///
    /// Re-arming is period-from-fire against the loop clock, so slow
    /// callbacks do not accumulate drift within a turn.
    pub fn set_interval<F>(&mut self, callback: F, every: f64) -> TimerId
    where
        F: FnMut(&mut Scheduler<C>, &mut C) -> Result<(), CallbackError> + 'static,
    {
        let every = clamp_after(every);
        self.spawn_timer(Box::new(callback), every, Some(every))
    }

    fn spawn_timer(
        &mut self,
        callback: crate::Callback<C>,
        msecs: u64,
        repeat: Option<u64>,
    ) -> TimerId {
        let key = self.arena.alloc(NodeKind::Timer(TimerState {
            idle_timeout: Some(msecs),
            idle_start: None,
            callback: Some(callback),
            repeat,
            called: false,
            handle: None,
            domain: self.current_domain.clone(),
        }));
        self.insert_item(key, false);
        TimerId(key)
    }

    /// Cancel a one-shot. No-op on unknown, fired, or already-cleared
    /// timers, so double-clearing is safe.
    pub fn clear_timeout(&mut self, id: TimerId) {
        self.close(id);
    }

    /// Cancel an interval.
    pub fn clear_interval(&mut self, id: TimerId) {
        if let Some(state) = self.timer_state_mut(id.0) {
            state.repeat = None;
        }
        self.close(id);
    }

    /// Drop the callback and release whatever backs the timer: the
    /// private handle if it migrated, otherwise its bucket slot.
    pub fn close(&mut self, id: TimerId) {
        let Some(state) = self.timer_state_mut(id.0) else {
            return;
        };
        state.callback = None;
        let handle = state.handle.take();

        if let Some(handle) = handle {
            self.backend.stop(handle);
            self.backend.close(handle);
            self.fire_targets.remove(&handle);
        } else {
            self.unenroll(id);
        }
        self.destroy_if_dead(id.0);
    }

    // ==================== Liveness ====================

    /// Restore the process-liveness contribution removed by
    /// [`unref_timer`](Self::unref_timer). Timers on shared buckets are
    /// already ref'd; stale ids are ignored.
    pub fn ref_timer(&mut self, id: TimerId) {
        let handle = match self.timer_state(id.0) {
            None => return,
            Some(state) => state.handle,
        };
        if let Some(handle) = handle {
            self.backend.ref_handle(handle);
        }
    }

    /// Stop this timer from keeping the process alive.
    ///
    /// A shared bucket's handle cannot be ref-counted per item, so the
    /// item migrates to a private unref'd handle armed for its remaining
    /// delay. When the migration empties the ref'd bucket, the bucket's
    /// handle is reused instead of closed, saving a wakeup.
    pub fn unref_timer(&mut self, id: TimerId) {
        let key = id.0;
        let (handle, called, repeat, idle_timeout, idle_start) = match self.timer_state(key) {
            None => return,
            Some(state) => (
                state.handle,
                state.called,
                state.repeat,
                state.idle_timeout,
                state.idle_start,
            ),
        };

        if let Some(handle) = handle {
            self.backend.unref_handle(handle);
            return;
        }
        // Already fired and not periodic: nothing left to migrate. This
        // also catches unref from inside the one-shot's own callback.
        if called && repeat.is_none() {
            self.unenroll(id);
            return;
        }
        let Some(msecs) = idle_timeout else {
            return;
        };

        let now = self.backend.now();
        let start = idle_start.unwrap_or(now);
        if idle_start.is_none() {
            if let Some(state) = self.timer_state_mut(key) {
                state.idle_start = Some(now);
            }
        }
        let delay = (start + msecs).saturating_sub(now);

        list::remove(&mut self.arena, key);
        let reusable = self
            .refed
            .get(msecs)
            .is_some_and(|bucket| list::is_empty(&self.arena, bucket.sentinel));
        let handle = if reusable {
            match self.refed.remove(msecs) {
                Some(bucket) => {
                    self.backend.stop(bucket.handle);
                    self.fire_targets.remove(&bucket.handle);
                    self.arena.free(bucket.sentinel);
                    bucket.handle
                }
                None => self.backend.create(),
            }
        } else {
            self.backend.create()
        };

        self.backend.arm(handle, delay);
        self.backend.unref_handle(handle);
        if let Some(state) = self.timer_state_mut(key) {
            state.handle = Some(handle);
        }
        self.fire_targets.insert(handle, FireTarget::Timer(key));
        log::trace!("migrated timer to private unref'd handle, {delay}ms remaining");
    }

    // ==================== Immediates ====================

    /// Queue `callback` for the next event-loop turn, bypassing the
    /// duration buckets entirely.
    pub fn set_immediate<F>(&mut self, callback: F) -> ImmediateId
    where
        F: FnMut(&mut Scheduler<C>, &mut C) -> Result<(), CallbackError> + 'static,
    {
        let key = self.arena.alloc(NodeKind::Immediate(ImmediateState {
            callback: Some(Box::new(callback)),
            domain: self.current_domain.clone(),
        }));
        list::append(&mut self.arena, self.immediate_sentinel, key);
        self.need_immediate = true;
        ImmediateId(key)
    }

    /// Remove a queued immediate. No-op once it has run or been cleared.
    pub fn clear_immediate(&mut self, id: ImmediateId) {
        if self
            .arena
            .get(id.0)
            .and_then(|node| node.kind.immediate())
            .is_none()
        {
            return;
        }
        list::remove(&mut self.arena, id.0);
        self.arena.free(id.0);
        if list::is_empty(&self.arena, self.immediate_sentinel) {
            self.need_immediate = false;
        }
    }

    /// Whether the host should call [`run_immediates`](Self::run_immediates)
    /// this turn.
    pub fn needs_immediate_callback(&self) -> bool {
        self.need_immediate
    }

    /// Drain the immediates queued before this call, in order.
    ///
    /// Immediates queued by running callbacks land on the live queue and
    /// run on the next turn, never in the current drain. On an unabsorbed
    /// callback error the unprocessed remainder is spliced back ahead of
    /// fresh entries, a resumption is deferred, and the error propagates.
    pub fn run_immediates(&mut self, ctx: &mut C) -> Result<usize, CallbackError> {
        let mut ran = 0;
        list::take_all(&mut self.arena, self.immediate_sentinel, self.drain_sentinel);

        while let Some(key) = list::shift(&mut self.arena, self.drain_sentinel) {
            // The node is released before the callback runs; clearing the
            // running immediate from inside itself is a stale no-op.
            let Some(node) = self.arena.free(key) else {
                continue;
            };
            let NodeKind::Immediate(state) = node.kind else {
                continue;
            };
            let Some(mut callback) = state.callback else {
                continue;
            };
            let domain = state.domain;

            if let Some(domain) = &domain {
                domain.enter();
            }
            let result = callback(self, ctx);
            if let Some(domain) = &domain {
                domain.exit();
            }

            match result {
                Ok(()) => ran += 1,
                Err(error) => {
                    if domain.as_ref().is_some_and(|d| d.absorb(&error)) {
                        ran += 1;
                        continue;
                    }
                    // Unprocessed snapshot items keep priority over fresh
                    // entries queued during this drain.
                    list::take_all(&mut self.arena, self.immediate_sentinel, self.drain_sentinel);
                    list::take_all(&mut self.arena, self.drain_sentinel, self.immediate_sentinel);
                    self.need_immediate = true;
                    self.deferred.push_back(Deferred::Immediates);
                    return Err(error);
                }
            }
        }

        self.need_immediate = !list::is_empty(&self.arena, self.immediate_sentinel);
        Ok(ran)
    }
}


#[cfg(test)]
mod latency_tests {
    use hdrhistogram::Histogram;

    use super::*;
    use crate::backend::mock::MockBackend;

    const WARMUP: u64 = 10_000;
    const ITERATIONS: u64 = 200_000;

    fn print_histogram(name: &str, hist: &Histogram<u64>) {
        println!("\n=== {} ===", name);
        println!("  count:  {}", hist.len());
        println!("  min:    {} ns", hist.min());
        println!("  max:    {} ns", hist.max());
        println!("  mean:   {:.1} ns", hist.mean());
        println!("  p50:    {} ns", hist.value_at_quantile(0.50));
        println!("  p99:    {} ns", hist.value_at_quantile(0.99));
        println!("  p99.9:  {} ns", hist.value_at_quantile(0.999));
    }

    #[test]
    #[ignore]
    fn hdr_schedule_cancel_latency() {
        let mock = MockBackend::new();
        let mut sched: Scheduler<()> = Scheduler::new(Box::new(mock.clone()));
        let mut hist = Histogram::<u64>::new(3).unwrap();

        for i in 0..WARMUP {
            let id = sched.set_timeout(|_, _| Ok(()), ((i % 500) + 10) as f64);
            sched.clear_timeout(id);
        }

        for i in 0..ITERATIONS {
            let after = ((i % 500) + 10) as f64;
            let start = std::time::Instant::now();
            let id = sched.set_timeout(|_, _| Ok(()), after);
            sched.clear_timeout(id);
            let elapsed = start.elapsed().as_nanos() as u64;
            hist.record(elapsed).unwrap();
        }

        print_histogram("Schedule + Cancel Latency", &hist);
    }
}

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::arena::{NodeArena, NodeKey, NodeKind, TimerState};
use crate::backend::{HandleId, TimerBackend};
use crate::bucket::{Bucket, BucketTable};
use crate::domain::Domain;
use crate::{Callback, CallbackError, EnrollError, TIMEOUT_MAX, list};

/// Handle to a scheduled (or schedulable) timer item.
///
/// Plain `Copy` data: the scheduler owns the item, the id only names it.
/// Once the item fires for the last time or is cleared, the id goes
/// stale and every operation on it is a safe no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) NodeKey);

/// Handle to a queued immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImmediateId(pub(crate) NodeKey);

/// What to do when a native handle fires.
#[derive(Clone, Copy)]
pub(crate) enum FireTarget {
    /// Shared per-duration bucket: drain its list.
    Bucket { msecs: u64, unrefed: bool },
    /// Private handle owned by one unref'd item.
    Timer(NodeKey),
}

/// Work postponed to the next turn after a callback error.
pub(crate) enum Deferred {
    Bucket { msecs: u64, unrefed: bool },
    Immediates,
}

/// The timer scheduling core of a single-threaded event loop.
///
/// Owned by the loop and threaded into callbacks by reference; there is
/// no global state. `C` is the host context handed to every callback,
/// alongside the scheduler itself so callbacks can schedule and cancel
/// re-entrantly.
///
/// The host contract is small: call [`on_fire`](Self::on_fire) when a
/// native handle fires, poll
/// [`needs_immediate_callback`](Self::needs_immediate_callback) /
/// [`run_immediates`](Self::run_immediates) once per turn, and drain
/// [`run_deferred`](Self::run_deferred) when
/// [`has_deferred`](Self::has_deferred) reports work.
pub struct Scheduler<C> {
    pub(crate) arena: NodeArena<C>,
    pub(crate) backend: Box<dyn TimerBackend>,
    pub(crate) refed: BucketTable,
    pub(crate) unrefed: BucketTable,
    pub(crate) fire_targets: HashMap<HandleId, FireTarget>,
    pub(crate) deferred: VecDeque<Deferred>,
    pub(crate) immediate_sentinel: NodeKey,
    pub(crate) drain_sentinel: NodeKey,
    pub(crate) need_immediate: bool,
    pub(crate) current_domain: Option<Rc<dyn Domain>>,
}

impl<C> Scheduler<C> {
    pub fn new(backend: Box<dyn TimerBackend>) -> Self {
        let mut arena = NodeArena::new();
        let immediate_sentinel = arena.alloc(NodeKind::Sentinel);
        let drain_sentinel = arena.alloc(NodeKind::Sentinel);
        Self {
            arena,
            backend,
            refed: BucketTable::new(),
            unrefed: BucketTable::new(),
            fire_targets: HashMap::new(),
            deferred: VecDeque::new(),
            immediate_sentinel,
            drain_sentinel,
            need_immediate: false,
            current_domain: None,
        }
    }

    /// Install the domain captured by subsequently scheduled items.
    pub fn set_current_domain(&mut self, domain: Option<Rc<dyn Domain>>) {
        self.current_domain = domain;
    }

    // ==================== Enroll protocol ====================

    /// Allocate a bare timer item for the enroll protocol: unenrolled,
    /// unlinked, carrying the current domain. Embedders that stamp idle
    /// deadlines onto long-lived resources (sockets, sessions) create one
    /// item per resource and drive it with [`enroll`](Self::enroll) /
    /// [`active`](Self::active) / [`unenroll`](Self::unenroll).
    pub fn create<F>(&mut self, callback: F) -> TimerId
    where
        F: FnMut(&mut Scheduler<C>, &mut C) -> Result<(), CallbackError> + 'static,
    {
        let key = self.arena.alloc(NodeKind::Timer(TimerState {
            idle_timeout: None,
            idle_start: None,
            callback: Some(Box::new(callback)),
            repeat: None,
            called: false,
            handle: None,
            domain: self.current_domain.clone(),
        }));
        TimerId(key)
    }

    /// Replace the item's domain. Embedder hook; the public constructors
    /// capture the current domain instead.
    pub fn set_domain(&mut self, id: TimerId, domain: Option<Rc<dyn Domain>>) {
        if let Some(state) = self.timer_state_mut(id.0) {
            state.domain = domain;
        }
    }

    /// Set the item's arming duration without arming it.
    ///
    /// Detaches the item from any list it is on. Durations above
    /// [`TIMEOUT_MAX`] clamp; non-finite and negative durations are
    /// rejected before any state changes.
    pub fn enroll(&mut self, id: TimerId, msecs: f64) -> Result<(), EnrollError> {
        if !msecs.is_finite() {
            return Err(EnrollError::NonFinite(msecs));
        }
        if msecs < 0.0 {
            return Err(EnrollError::Negative(msecs));
        }
        let msecs = if msecs > TIMEOUT_MAX as f64 {
            TIMEOUT_MAX
        } else {
            msecs as u64
        };

        if self.timer_state(id.0).is_none() {
            return Ok(());
        }
        if list::is_linked(&self.arena, id.0) {
            self.unenroll(id);
        }
        if let Some(state) = self.timer_state_mut(id.0) {
            state.idle_timeout = Some(msecs);
        }
        Ok(())
    }

    /// Stamp the activation time and append to the ref'd bucket for the
    /// item's duration, creating the bucket if needed. A no-op for
    /// unenrolled items, which is how cancelled items fail safe.
    pub fn active(&mut self, id: TimerId) {
        self.insert_item(id.0, false);
    }

    /// [`active`](Self::active), but the bucket does not keep the process
    /// alive.
    pub fn unref_active(&mut self, id: TimerId) {
        self.insert_item(id.0, true);
    }

    /// Remove from its list and mark unenrolled.
    ///
    /// If this empties the ref'd bucket for the item's duration, the
    /// bucket is collapsed on the spot. Empty unref'd buckets are left
    /// for the dispatch loop to collapse when their handle fires.
    pub fn unenroll(&mut self, id: TimerId) {
        let Some(state) = self.timer_state(id.0) else {
            return;
        };
        let msecs = state.idle_timeout;
        list::remove(&mut self.arena, id.0);

        if let Some(msecs) = msecs {
            let emptied = self
                .refed
                .get(msecs)
                .is_some_and(|bucket| list::is_empty(&self.arena, bucket.sentinel));
            if emptied {
                self.drop_bucket(msecs, false);
            }
        }

        if let Some(state) = self.timer_state_mut(id.0) {
            state.idle_timeout = None;
        }
    }

    pub(crate) fn insert_item(&mut self, key: NodeKey, unrefed: bool) {
        let now = self.backend.now();
        let Some(state) = self.timer_state_mut(key) else {
            return;
        };
        let Some(msecs) = state.idle_timeout else {
            return;
        };
        state.idle_start = Some(now);

        let sentinel = self.get_or_create_bucket(msecs, unrefed);
        list::append(&mut self.arena, sentinel, key);
    }

    // ==================== Buckets ====================

    fn table(&self, unrefed: bool) -> &BucketTable {
        if unrefed { &self.unrefed } else { &self.refed }
    }

    fn table_mut(&mut self, unrefed: bool) -> &mut BucketTable {
        if unrefed { &mut self.unrefed } else { &mut self.refed }
    }

    fn get_or_create_bucket(&mut self, msecs: u64, unrefed: bool) -> NodeKey {
        if let Some(bucket) = self.table(unrefed).get(msecs) {
            return bucket.sentinel;
        }

        let handle = self.backend.create();
        if unrefed {
            self.backend.unref_handle(handle);
        }
        self.backend.arm(handle, msecs);
        let sentinel = self.arena.alloc(NodeKind::Sentinel);
        self.fire_targets
            .insert(handle, FireTarget::Bucket { msecs, unrefed });
        self.table_mut(unrefed).insert(Bucket {
            msecs,
            handle,
            sentinel,
            unrefed,
        });
        log::trace!(
            "opened {}ms bucket ({})",
            msecs,
            if unrefed { "unref'd" } else { "ref'd" }
        );
        sentinel
    }

    pub(crate) fn drop_bucket(&mut self, msecs: u64, unrefed: bool) {
        let Some(bucket) = self.table_mut(unrefed).remove(msecs) else {
            return;
        };
        self.backend.stop(bucket.handle);
        self.backend.close(bucket.handle);
        self.fire_targets.remove(&bucket.handle);
        self.arena.free(bucket.sentinel);
        log::trace!("closed {}ms bucket", msecs);
    }

    // ==================== Dispatch ====================

    /// Entry point for the host: a native handle fired.
    ///
    /// Returns the number of callbacks run. An error is a callback
    /// failure that no domain absorbed; a resumption for the remaining
    /// siblings is already queued (see [`run_deferred`](Self::run_deferred))
    /// and the error should be surfaced by the host.
    pub fn on_fire(&mut self, handle: HandleId, ctx: &mut C) -> Result<usize, CallbackError> {
        match self.fire_targets.get(&handle).copied() {
            Some(FireTarget::Bucket { msecs, unrefed }) => self.fire_bucket(msecs, unrefed, ctx),
            Some(FireTarget::Timer(key)) => self.fire_private(key, ctx),
            None => Ok(0),
        }
    }

    /// True when a callback error or immediate error left work for the
    /// next turn.
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Run resumptions queued by failing callbacks. The host calls this
    /// once per turn, like a next-tick queue.
    pub fn run_deferred(&mut self, ctx: &mut C) -> Result<usize, CallbackError> {
        let mut ran = 0;
        while let Some(deferred) = self.deferred.pop_front() {
            ran += match deferred {
                Deferred::Bucket { msecs, unrefed } => self.fire_bucket(msecs, unrefed, ctx)?,
                Deferred::Immediates => self.run_immediates(ctx)?,
            };
        }
        Ok(ran)
    }

    fn fire_bucket(&mut self, msecs: u64, unrefed: bool, ctx: &mut C) -> Result<usize, CallbackError> {
        let now = self.backend.now();
        let mut fired = 0;

        loop {
            // Re-resolve every iteration: callbacks may collapse or even
            // recreate this bucket.
            let Some(bucket) = self.table(unrefed).get(msecs).copied() else {
                return Ok(fired);
            };
            debug_assert_eq!(bucket.unrefed, unrefed);
            let Some(head) = list::peek(&self.arena, bucket.sentinel) else {
                self.drop_bucket(msecs, unrefed);
                return Ok(fired);
            };

            let Some(state) = self.timer_state(head) else {
                list::remove(&mut self.arena, head);
                continue;
            };
            let idle_start = state.idle_start.unwrap_or(now);
            let diff = now.saturating_sub(idle_start);
            if diff < msecs {
                // Head not due yet: either later activations follow, or a
                // cancelled head pushed the effective deadline out.
                self.backend.arm(bucket.handle, msecs - diff);
                return Ok(fired);
            }

            list::remove(&mut self.arena, head);

            let (has_callback, domain) = match self.timer_state(head) {
                None => continue,
                Some(state) => (state.callback.is_some(), state.domain.clone()),
            };
            if !has_callback {
                // Cancelled after this drain started.
                self.destroy_if_dead(head);
                continue;
            }
            if let Some(domain) = &domain {
                if domain.is_disposed() {
                    // Terminal: the bucket keeps its surviving items but is
                    // not re-armed here; later activations re-arm the
                    // duration.
                    return Ok(fired);
                }
            }

            let Some(state) = self.timer_state_mut(head) else {
                continue;
            };
            state.called = true;
            let Some(mut callback) = state.callback.take() else {
                continue;
            };

            if let Some(domain) = &domain {
                domain.enter();
            }
            let result = callback(self, ctx);
            if let Some(domain) = &domain {
                domain.exit();
            }

            match result {
                Ok(()) => {
                    self.finish_fire(head, callback, now);
                    fired += 1;
                }
                Err(error) => {
                    if domain.as_ref().is_some_and(|d| d.absorb(&error)) {
                        self.finish_fire(head, callback, now);
                        fired += 1;
                        continue;
                    }
                    // Siblings must not starve, but must not run in this
                    // stack frame either: resume on the next turn and
                    // re-raise.
                    drop(callback);
                    self.destroy_if_dead(head);
                    self.deferred.push_back(Deferred::Bucket { msecs, unrefed });
                    return Err(error);
                }
            }
        }
    }

    fn fire_private(&mut self, key: NodeKey, ctx: &mut C) -> Result<usize, CallbackError> {
        let now = self.backend.now();
        let (has_callback, domain) = match self.timer_state(key) {
            None => return Ok(0),
            Some(state) => (state.callback.is_some(), state.domain.clone()),
        };
        if !has_callback {
            self.destroy_if_dead(key);
            return Ok(0);
        }
        if let Some(domain) = &domain {
            if domain.is_disposed() {
                return Ok(0);
            }
        }

        let Some(state) = self.timer_state_mut(key) else {
            return Ok(0);
        };
        state.called = true;
        let Some(mut callback) = state.callback.take() else {
            return Ok(0);
        };

        if let Some(domain) = &domain {
            domain.enter();
        }
        let result = callback(self, ctx);
        if let Some(domain) = &domain {
            domain.exit();
        }

        match result {
            Ok(()) => {
                self.finish_fire(key, callback, now);
                Ok(1)
            }
            Err(error) => {
                if domain.as_ref().is_some_and(|d| d.absorb(&error)) {
                    self.finish_fire(key, callback, now);
                    return Ok(1);
                }
                // A private handle has no siblings; nothing to resume.
                drop(callback);
                self.destroy_if_dead(key);
                Err(error)
            }
        }
    }

    /// Restore a fired item: intervals get their callback back and
    /// re-arm, one-shots are reclaimed.
    fn finish_fire(&mut self, key: NodeKey, callback: Callback<C>, now: u64) {
        let repeat = match self.timer_state(key) {
            // Reclaimed during its own callback.
            None => return,
            Some(state) => state.repeat,
        };
        let Some(period) = repeat else {
            drop(callback);
            self.destroy_if_dead(key);
            return;
        };

        let Some(state) = self.timer_state_mut(key) else {
            return;
        };
        state.callback = Some(callback);
        state.idle_timeout = Some(period);
        let handle = state.handle;
        if let Some(handle) = handle {
            state.idle_start = Some(now);
            self.backend.arm(handle, period);
        } else {
            self.insert_item(key, false);
        }
    }

    // ==================== Item plumbing ====================

    pub(crate) fn timer_state(&self, key: NodeKey) -> Option<&TimerState<C>> {
        self.arena.get(key)?.kind.timer()
    }

    pub(crate) fn timer_state_mut(&mut self, key: NodeKey) -> Option<&mut TimerState<C>> {
        self.arena.get_mut(key)?.kind.timer_mut()
    }

    /// Reclaim an item that can never fire again: no callback and not on
    /// any list. Closes a private handle if the item migrated.
    pub(crate) fn destroy_if_dead(&mut self, key: NodeKey) {
        let handle = match self.timer_state(key) {
            None => return,
            Some(state) => {
                if state.callback.is_some() || list::is_linked(&self.arena, key) {
                    return;
                }
                state.handle
            }
        };
        if let Some(handle) = handle {
            self.backend.stop(handle);
            self.backend.close(handle);
            self.fire_targets.remove(&handle);
        }
        self.arena.free(key);
    }

    // ==================== Introspection ====================

    pub fn refed_bucket_count(&self) -> usize {
        self.refed.len()
    }

    pub fn unrefed_bucket_count(&self) -> usize {
        self.unrefed.len()
    }

    /// Nothing armed, queued, or pending.
    pub fn is_idle(&self) -> bool {
        self.refed.is_empty()
            && self.unrefed.is_empty()
            && self.fire_targets.is_empty()
            && self.deferred.is_empty()
            && !self.need_immediate
    }
}

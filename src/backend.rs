//! Clock and native timer contract consumed by the scheduler.
//!
//! The scheduler never sleeps or spawns threads itself; it asks the host
//! for one-shot native timers and reacts when the host reports a fire.
//! Production hosts wrap whatever their event loop provides (epoll
//! timeouts, kqueue timers, a reactor wheel); [`mock::MockBackend`] is a
//! deterministic stand-in for tests and benchmarks.

/// Opaque identifier for a native timer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Host-provided clock plus native one-shot timers.
///
/// # Contract
///
/// - `now()` is monotonic milliseconds, non-decreasing for the process
///   lifetime. Hosts are expected to cache it per event-loop turn, so it
///   does not advance while a drain is running; interval re-arming relies
///   on this to stay drift-free.
/// - `arm` schedules exactly one fire at `now() + delay_ms`. A delay of 0
///   means "as soon as possible, but never synchronously". Re-arming an
///   armed handle replaces its deadline.
/// - New handles contribute to process liveness until `unref_handle`.
/// - When a handle fires, the host calls back into the scheduler
///   ([`crate::Scheduler::on_fire`]) with the handle; the scheduler keeps
///   the per-handle dispatch routing itself.
pub trait TimerBackend {
    /// Monotonic milliseconds.
    fn now(&self) -> u64;

    /// Allocate a fresh handle, ref'd and unarmed.
    fn create(&mut self) -> HandleId;

    /// Schedule a single fire `delay_ms` from now.
    fn arm(&mut self, handle: HandleId, delay_ms: u64);

    /// Cancel a pending fire without releasing the handle.
    fn stop(&mut self, handle: HandleId);

    /// Stop and release.
    fn close(&mut self, handle: HandleId);

    /// The handle keeps the process alive while armed.
    fn ref_handle(&mut self, handle: HandleId);

    /// The handle no longer keeps the process alive.
    fn unref_handle(&mut self, handle: HandleId);
}

pub mod mock {
    //! Deterministic backend for tests and benchmarks.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::{HandleId, TimerBackend};

    struct HandleState {
        refed: bool,
        /// Armed deadline plus an arm sequence number for stable ordering
        /// between handles sharing a deadline.
        armed: Option<(u64, u64)>,
    }

    #[derive(Default)]
    struct State {
        now: u64,
        next_handle: u64,
        next_seq: u64,
        handles: HashMap<HandleId, HandleState>,
        created: usize,
        closed: usize,
    }

    /// Mock clock and timer registry.
    ///
    /// Clones share state, so a test can hand one clone to the scheduler
    /// and keep another for driving time and inspecting liveness. Any
    /// operation on a closed or unknown handle panics; the scheduler is
    /// expected never to do that.
    #[derive(Clone, Default)]
    pub struct MockBackend {
        state: Rc<RefCell<State>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the clock without firing anything. Must not move backwards.
        pub fn set_now(&self, now: u64) {
            let mut state = self.state.borrow_mut();
            assert!(now >= state.now, "mock clock may not move backwards");
            state.now = now;
        }

        /// Advance the clock and return every handle whose deadline came
        /// due, in fire order (deadline, then arm order). Fired handles
        /// are disarmed, mirroring a one-shot native timer.
        pub fn advance_to(&self, now: u64) -> Vec<HandleId> {
            let mut state = self.state.borrow_mut();
            assert!(now >= state.now, "mock clock may not move backwards");
            state.now = now;

            let mut due: Vec<(u64, u64, HandleId)> = Vec::new();
            for (&handle, hs) in state.handles.iter_mut() {
                if let Some((deadline, seq)) = hs.armed {
                    if deadline <= now {
                        hs.armed = None;
                        due.push((deadline, seq, handle));
                    }
                }
            }
            due.sort_unstable_by_key(|&(deadline, seq, _)| (deadline, seq));
            due.into_iter().map(|(_, _, handle)| handle).collect()
        }

        pub fn now(&self) -> u64 {
            self.state.borrow().now
        }

        pub fn live_handles(&self) -> usize {
            self.state.borrow().handles.len()
        }

        pub fn created_handles(&self) -> usize {
            self.state.borrow().created
        }

        pub fn closed_handles(&self) -> usize {
            self.state.borrow().closed
        }

        pub fn armed_handles(&self) -> usize {
            self.state
                .borrow()
                .handles
                .values()
                .filter(|hs| hs.armed.is_some())
                .count()
        }

        /// Milliseconds until the handle fires, or `None` if unarmed.
        pub fn remaining(&self, handle: HandleId) -> Option<u64> {
            let state = self.state.borrow();
            let hs = state.handles.get(&handle)?;
            hs.armed.map(|(deadline, _)| deadline.saturating_sub(state.now))
        }

        pub fn is_refed(&self, handle: HandleId) -> bool {
            self.state
                .borrow()
                .handles
                .get(&handle)
                .is_some_and(|hs| hs.refed)
        }

        /// True while any ref'd handle is armed, the libuv notion of
        /// "the loop has work left".
        pub fn keeps_process_alive(&self) -> bool {
            self.state
                .borrow()
                .handles
                .values()
                .any(|hs| hs.refed && hs.armed.is_some())
        }
    }

    impl State {
        fn handle_mut(&mut self, handle: HandleId, op: &str) -> &mut HandleState {
            self.handles
                .get_mut(&handle)
                .unwrap_or_else(|| panic!("{op} on closed handle {handle:?}"))
        }
    }

    impl TimerBackend for MockBackend {
        fn now(&self) -> u64 {
            self.state.borrow().now
        }

        fn create(&mut self) -> HandleId {
            let mut state = self.state.borrow_mut();
            let handle = HandleId(state.next_handle);
            state.next_handle += 1;
            state.created += 1;
            state.handles.insert(
                handle,
                HandleState {
                    refed: true,
                    armed: None,
                },
            );
            handle
        }

        fn arm(&mut self, handle: HandleId, delay_ms: u64) {
            let mut state = self.state.borrow_mut();
            let deadline = state.now + delay_ms;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.handle_mut(handle, "arm").armed = Some((deadline, seq));
        }

        fn stop(&mut self, handle: HandleId) {
            self.state.borrow_mut().handle_mut(handle, "stop").armed = None;
        }

        fn close(&mut self, handle: HandleId) {
            let mut state = self.state.borrow_mut();
            assert!(
                state.handles.remove(&handle).is_some(),
                "close on closed handle {handle:?}"
            );
            state.closed += 1;
        }

        fn ref_handle(&mut self, handle: HandleId) {
            self.state.borrow_mut().handle_mut(handle, "ref").refed = true;
        }

        fn unref_handle(&mut self, handle: HandleId) {
            self.state.borrow_mut().handle_mut(handle, "unref").refed = false;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fires_in_deadline_then_arm_order() {
            let mock = MockBackend::new();
            let mut backend = mock.clone();

            let a = backend.create();
            let b = backend.create();
            let c = backend.create();
            backend.arm(a, 20);
            backend.arm(b, 10);
            backend.arm(c, 10);

            assert_eq!(mock.advance_to(5), vec![]);
            assert_eq!(mock.advance_to(20), vec![b, c, a]);
            assert_eq!(mock.armed_handles(), 0);
        }

        #[test]
        fn rearm_replaces_deadline() {
            let mock = MockBackend::new();
            let mut backend = mock.clone();

            let h = backend.create();
            backend.arm(h, 10);
            backend.arm(h, 50);
            assert_eq!(mock.advance_to(10), vec![]);
            assert_eq!(mock.remaining(h), Some(40));
        }

        #[test]
        fn liveness_tracks_refed_armed_handles() {
            let mock = MockBackend::new();
            let mut backend = mock.clone();

            let h = backend.create();
            assert!(!mock.keeps_process_alive());

            backend.arm(h, 10);
            assert!(mock.keeps_process_alive());

            backend.unref_handle(h);
            assert!(!mock.keeps_process_alive());

            backend.ref_handle(h);
            assert!(mock.keeps_process_alive());

            backend.close(h);
            assert_eq!(mock.live_handles(), 0);
            assert_eq!(mock.closed_handles(), 1);
        }

        #[test]
        #[should_panic(expected = "arm on closed handle")]
        fn arm_after_close_panics() {
            let mut backend = MockBackend::new();
            let h = backend.create();
            backend.close(h);
            backend.arm(h, 1);
        }
    }
}

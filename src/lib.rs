//! Per-duration intrusive timer lists for single-threaded event loops.
//!
//! Every armed duration owns one native timer handle plus a FIFO list of
//! items, so ten thousand 30-second keepalives cost one handle and O(1)
//! per arm/cancel/fire. The scheduler is a plain value owned by the event
//! loop; the loop supplies the clock and native one-shot timers through
//! [`backend::TimerBackend`] and reports fires back via
//! [`Scheduler::on_fire`].
//!
//! Three layers share one invariant set:
//!
//! - the enroll protocol ([`Scheduler::enroll`] / [`Scheduler::active`] /
//!   [`Scheduler::unenroll`]) for embedders stamping idle deadlines onto
//!   long-lived resources,
//! - the timeout API ([`Scheduler::set_timeout`],
//!   [`Scheduler::set_interval`], clear/ref/unref), and
//! - the immediate queue ([`Scheduler::set_immediate`]), drained once per
//!   loop turn.
//!
//! ```
//! use ticklist::{Scheduler, backend::mock::MockBackend};
//!
//! let mock = MockBackend::new();
//! let mut sched: Scheduler<Vec<&'static str>> = Scheduler::new(Box::new(mock.clone()));
//! let mut ctx = Vec::new();
//!
//! sched.set_timeout(|_, ctx| Ok(ctx.push("fired")), 10.0);
//! for handle in mock.advance_to(10) {
//!     sched.on_fire(handle, &mut ctx).unwrap();
//! }
//! assert_eq!(ctx, ["fired"]);
//! ```

pub mod backend;
mod arena;
mod bucket;
mod domain;
mod list;
mod scheduler;
mod timers;

pub use domain::Domain;
pub use scheduler::{ImmediateId, Scheduler, TimerId};

/// Largest representable duration in milliseconds; longer enrollments
/// clamp here, longer public-API delays coerce to 1.
pub const TIMEOUT_MAX: u64 = 2_147_483_647;

/// Timer and immediate callbacks: re-entrant access to the scheduler plus
/// the host context.
pub type Callback<C> = Box<dyn FnMut(&mut Scheduler<C>, &mut C) -> Result<(), CallbackError>>;

/// Rejected [`Scheduler::enroll`] duration. Validation fails before any
/// state is touched.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum EnrollError {
    #[error("timeout duration must be finite, got {0}")]
    NonFinite(f64),
    #[error("timeout duration must be non-negative, got {0}")]
    Negative(f64),
}

/// A user callback failed during dispatch.
///
/// The scheduler re-raises these to the host after queueing a resumption
/// for any siblings still due, unless the item's domain absorbs them.
#[derive(Debug, thiserror::Error)]
#[error("timer callback failed: {0}")]
pub struct CallbackError(Box<dyn std::error::Error>);

impl CallbackError {
    pub fn new(source: impl Into<Box<dyn std::error::Error>>) -> Self {
        Self(source.into())
    }
}

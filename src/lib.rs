pub mod checks;
pub mod config;
pub mod registry;
pub mod sinks;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// Outcome of a single check execution.
///
/// `Failure` means the check's predicate was not satisfied or the remote was
/// unreachable within the timeout. `Error` means the check mechanism itself
/// could not complete (e.g. a transport failure that is not a timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Error,
}

impl Outcome {
    /// Numeric code used by sinks that emit results to the wire.
    pub fn code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::Error => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "Success"),
            Outcome::Failure => write!(f, "Failure"),
            Outcome::Error => write!(f, "Error"),
        }
    }
}

/// Immutable outcome of one check execution.
///
/// The timestamp marks when the check was dispatched; the duration covers
/// dispatch to terminal response (or the full timeout, if one elapsed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub duration: Duration,
}

impl CheckResult {
    pub fn new(outcome: Outcome, duration: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            duration,
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.outcome,
            self.duration
        )
    }
}

/// Future produced by one invocation of a check closure.
pub type CheckFuture = BoxFuture<'static, CheckResult>;

/// A ready-to-run check: takes no arguments, yields one [`CheckResult`].
///
/// Produced by a check constructor at registration time. The closure must
/// enforce any transport-level timeout it needs internally; the scheduler
/// only bounds total wall time per iteration.
pub type CheckFn = Arc<dyn Fn() -> CheckFuture + Send + Sync>;

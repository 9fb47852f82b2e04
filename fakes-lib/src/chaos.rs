//! Chaos injection: turns a static failure rate
//! into a bounded, repeatable sequence of induced failures.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use rama::{
    error::{BoxError, ErrorExt as _},
    telemetry::tracing,
};
use rand::{RngExt as _, SeedableRng as _, rngs::StdRng};

use crate::{
    endpoint::{CallCounter, DEFAULT_MAX_FAILURE_COUNT},
    router::Handler,
};

/// Source of the random draws used to decide whether chaos triggers.
pub trait ChaosSource: fmt::Debug + Send + Sync + 'static {
    /// Draw a uniformly distributed integer in `[0, 100)`.
    fn draw_percent(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
/// [`ChaosSource`] backed by the thread local rng, used by default.
pub struct ThreadRngSource;

impl ThreadRngSource {
    pub fn new() -> Self {
        Self
    }
}

impl ChaosSource for ThreadRngSource {
    fn draw_percent(&self) -> u32 {
        rand::rng().random_range(0..100)
    }
}

#[derive(Debug)]
/// [`ChaosSource`] that produces the same draws for the same seed.
pub struct SeededSource(Mutex<StdRng>);

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl ChaosSource for SeededSource {
    fn draw_percent(&self) -> u32 {
        self.0.lock().random_range(0..100)
    }
}

#[derive(Debug)]
/// [`ChaosSource`] replaying a fixed sequence of draws, cycling once exhausted.
///
/// Draws are clamped to `99`. An empty sequence always draws `99`,
/// which only fails for rates of `100` or more.
pub struct SequenceSource {
    draws: Vec<u32>,
    next: AtomicUsize,
}

impl SequenceSource {
    pub fn new(draws: impl IntoIterator<Item = u32>) -> Self {
        Self {
            draws: draws.into_iter().map(|draw| draw.min(99)).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl ChaosSource for SequenceSource {
    fn draw_percent(&self) -> u32 {
        if self.draws.is_empty() {
            return 99;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.draws.len();
        self.draws[index]
    }
}

#[derive(Clone)]
/// Chaos configuration of a single endpoint, resolved at registration.
pub struct FailurePolicy {
    rate_percent: i32,
    max_failure_count: u32,
    handler: Handler,
}

impl FailurePolicy {
    /// Resolve the chaos configuration of an endpoint.
    ///
    /// Returns `None` in case the endpoint can never fail,
    /// and an error for a positive rate without a failure handler.
    pub(crate) fn try_new(
        rate_percent: i32,
        handler: Option<Handler>,
        max_failure_count: Option<u32>,
    ) -> Result<Option<Self>, BoxError> {
        if rate_percent <= 0 {
            return Ok(None);
        }

        let Some(handler) = handler else {
            return Err(
                BoxError::from("failure rate configured without a failure handler")
                    .context_debug_field("failure_rate_percent", rate_percent),
            );
        };

        Ok(Some(Self {
            rate_percent,
            max_failure_count: max_failure_count.unwrap_or(DEFAULT_MAX_FAILURE_COUNT),
            handler,
        }))
    }

    #[inline(always)]
    fn is_failure_draw(&self, draw: u32) -> bool {
        i64::from(draw) < i64::from(self.rate_percent)
    }

    pub fn rate_percent(&self) -> i32 {
        self.rate_percent
    }

    pub fn max_failure_count(&self) -> u32 {
        self.max_failure_count
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailurePolicy")
            .field("rate_percent", &self.rate_percent)
            .field("max_failure_count", &self.max_failure_count)
            .finish()
    }
}

#[derive(Debug, Clone)]
/// Decides, per matched request, whether chaos triggers.
///
/// A single controller (and thus draw source) is shared
/// by all endpoints of a fake service.
pub struct FailureController {
    source: Arc<dyn ChaosSource>,
}

impl Default for FailureController {
    fn default() -> Self {
        Self::new(ThreadRngSource)
    }
}

impl FailureController {
    pub fn new(source: impl ChaosSource) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Record the call on the given counter and decide whether it takes the failure path.
    ///
    /// The counter is incremented exactly once, regardless of the outcome.
    pub fn should_fail(&self, policy: Option<&FailurePolicy>, counter: &CallCounter) -> bool {
        let Some(policy) = policy else {
            counter.record_call();
            return false;
        };

        let draw = self.source.draw_percent();
        let drawn = policy.is_failure_draw(draw);
        let fail = counter.record_and_check_budget(drawn, policy.max_failure_count);

        tracing::trace!(
            chaos.draw = draw,
            chaos.rate_percent = policy.rate_percent,
            chaos.max_failure_count = policy.max_failure_count,
            chaos.drawn = drawn,
            chaos.fail = fail,
            "chaos decision made",
        );

        fail
    }
}

//! Programmable in-process fake HTTP services for automated tests.
//!
//! A [`FakeService`] is a set of declared [`Endpoint`]s served over a real
//! (loopback) TCP listener, so that the system under test can talk to it
//! like it would to any downstream dependency. Endpoints can optionally
//! inject failures at a configured rate, bounded by a failure budget,
//! which allows exercising retry logic without making tests flaky.
//!
//! ```no_run
//! use fakes::{Endpoint, FakeService};
//!
//! # async fn example() -> Result<(), rama::error::BoxError> {
//! let fake = FakeService::new()
//!     .with_endpoint(Endpoint::new("/hello").with_response(r#"{"message":"hello"}"#))
//!     .run()
//!     .await?;
//!
//! // point the system under test to `fake.base_url()` ...
//!
//! fake.tidy_up().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod chaos;
pub mod endpoint;
pub mod fixture;
pub mod router;
pub mod server;
pub mod utils;


pub use self::{
    chaos::{ChaosSource, FailureController, SeededSource, SequenceSource, ThreadRngSource},
    endpoint::{DEFAULT_MAX_FAILURE_COUNT, Endpoint},
    fixture::Fixture,
    router::FakeRequest,
    server::{FakeService, RunningFakeService, TidyUpReport, UncalledEndpoint},
};

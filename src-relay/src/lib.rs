// Relay core (shared between the daemon, the host bridge, and tests)
pub mod relay;

// Tracing subscriber setup for the binaries
pub mod logging;

// Async polling helpers for relay tests (only compiled for tests or with test-utils)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

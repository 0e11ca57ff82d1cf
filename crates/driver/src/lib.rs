//! Offline driver for `jetstream-core` executors.
//!
//! Plays the scheduler role in-process: builds the reference executor,
//! wraps it in the facade, warms it up and serves a synthetic workload
//! through the slot lifecycle.

pub mod config;
pub mod logging;
pub mod scheduler;
pub mod shutdown;

//! Slidegate - Sliding Window Admission Control
//!
//! This crate limits how many operations a partition (a user, a client, any
//! caller identity) may perform within a rolling time window. Limits are
//! enforced across stateless server processes that share one external
//! ordered-timestamp store, and the limiter fails open by default when that
//! store is unreachable.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Result, SlidegateError};

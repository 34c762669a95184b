//! Shared primitives, traits, and utilities for the Larynx acoustic modeling workspace.
//!
//! `larynx-core` provides the foundation that the other Larynx crates build on:
//!
//! - **Error types**: [`LarynxError`] and [`Result`] for structured error handling
//! - **Log-domain probabilities**: the zero-probability sentinel [`prob::LOG_ZERO`]
//!   and log-sum-exp combination
//! - **Traits**: Small cross-cutting abstractions like [`Summarizable`] and [`Annotated`]

pub mod error;
pub mod prob;
pub mod traits;

pub use error::{LarynxError, Result};
pub use prob::{is_log_zero, log_add, log_mul, log_sum, LOG_ZERO};
pub use traits::*;

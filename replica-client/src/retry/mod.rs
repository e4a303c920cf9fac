//! Retry state machine for topology changes and transient failures.
//!
//! [`RetryPolicy::decide`] takes the failure of the latest attempt and the
//! request's [`RetryContext`], and answers with a [`RetryDecision`]: retry
//! after a backoff with a set of cache [`Invalidation`]s, or fail with a
//! terminal error.

/// Per-request retry state.
pub mod context;

/// Retry decisions.
pub mod policy;

pub use context::RetryContext;
pub use policy::{Invalidation, RetryAction, RetryDecision, RetryPolicy};

//! Classification-driven retry decisions.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{FailureClass, ReplicaError};
use crate::retry::RetryContext;

/// Caches the client must invalidate before the next attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Bypass the address cache on the next resolution.
    pub force_address_refresh: bool,
    /// Reload the collection's partition routing map.
    pub force_routing_map_refresh: bool,
    /// Reload the collection metadata behind the collection name.
    pub force_collection_refresh: bool,
    /// Discard the resolved range and every LSN selected under it.
    pub clear_resolved_range: bool,
}

impl Invalidation {
    /// Invalidate nothing.
    pub const NONE: Self = Self {
        force_address_refresh: false,
        force_routing_map_refresh: false,
        force_collection_refresh: false,
        clear_resolved_range: false,
    };

    /// Whether no flag is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    /// Union with `other`.
    pub fn merge(&mut self, other: Invalidation) {
        self.force_address_refresh |= other.force_address_refresh;
        self.force_routing_map_refresh |= other.force_routing_map_refresh;
        self.force_collection_refresh |= other.force_collection_refresh;
        self.clear_resolved_range |= other.clear_resolved_range;
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone)]
pub enum RetryAction {
    /// Retry after waiting `backoff`.
    Retry {
        /// Wait before the next attempt.
        backoff: Duration,
    },
    /// Stop and surface the error.
    Fail(ReplicaError),
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Retry or fail.
    pub action: RetryAction,
    /// Cache invalidations requested. Empty when failing.
    pub invalidation: Invalidation,
}

impl RetryDecision {
    fn retry(backoff: Duration, invalidation: Invalidation) -> Self {
        Self {
            action: RetryAction::Retry { backoff },
            invalidation,
        }
    }

    fn fail(error: ReplicaError) -> Self {
        Self {
            action: RetryAction::Fail(error),
            invalidation: Invalidation::NONE,
        }
    }

    /// Whether the request should be retried.
    pub fn should_retry(&self) -> bool {
        matches!(self.action, RetryAction::Retry { .. })
    }

    /// Backoff before the retry, zero when failing.
    pub fn backoff(&self) -> Duration {
        match self.action {
            RetryAction::Retry { backoff } => backoff,
            RetryAction::Fail(_) => Duration::ZERO,
        }
    }

    /// The terminal error, when failing.
    pub fn into_error(self) -> Option<ReplicaError> {
        match self.action {
            RetryAction::Fail(err) => Some(err),
            RetryAction::Retry { .. } => None,
        }
    }
}

/// Gone / retry-with state machine.
///
/// Topology-change failures (Gone, splitting, migrating, invalid partition,
/// transient network failures) share one elapsed budget. Retry-with and
/// session-not-available share a separate, shorter one measured from their
/// first occurrence. Everything else fails immediately.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the `retry`-th Gone retry (1-based): immediate, then
    /// the initial backoff doubling each time.
    pub fn gone_backoff(&self, retry: u32) -> Duration {
        match retry {
            0 | 1 => Duration::ZERO,
            n => {
                let factor = 1u32.checked_shl(n - 2).unwrap_or(u32::MAX);
                self.config.gone_initial_backoff.saturating_mul(factor)
            }
        }
    }

    /// Backoff before the `retry`-th retry-with retry (1-based).
    pub fn retry_with_backoff(&self, retry: u32) -> Duration {
        let steps = retry.saturating_sub(1);
        let backoff = self
            .config
            .retry_with_initial_backoff
            .saturating_add(self.config.retry_with_backoff_step.saturating_mul(steps));
        backoff.min(self.config.retry_with_max_backoff)
    }

    /// Classify `error` and decide the next step, updating `ctx`.
    pub fn decide(&self, ctx: &mut RetryContext, error: ReplicaError) -> RetryDecision {
        ctx.record_error(&error);
        let class = error.class();

        let decision = match class {
            FailureClass::Permanent => return RetryDecision::fail(error),
            FailureClass::Gone | FailureClass::NetworkTransient => self.decide_gone(ctx, class),
            FailureClass::PartitionSplitting => self.within_gone_budget(
                ctx,
                class,
                Invalidation {
                    force_routing_map_refresh: true,
                    clear_resolved_range: true,
                    ..Invalidation::NONE
                },
            ),
            FailureClass::PartitionMigrating => self.within_gone_budget(
                ctx,
                class,
                Invalidation {
                    force_routing_map_refresh: true,
                    force_address_refresh: true,
                    ..Invalidation::NONE
                },
            ),
            FailureClass::InvalidPartition => {
                let failures = ctx.next_invalid_partition_failure();
                if failures >= self.config.invalid_partition_max_attempts {
                    self.exhausted(
                        ctx,
                        format!("invalid partition persisted after {failures} attempts"),
                    )
                } else {
                    self.within_gone_budget(
                        ctx,
                        class,
                        Invalidation {
                            force_collection_refresh: true,
                            clear_resolved_range: true,
                            ..Invalidation::NONE
                        },
                    )
                }
            }
            FailureClass::RetryWith | FailureClass::SessionNotAvailable => {
                self.decide_retry_with(ctx, class)
            }
        };

        match &decision.action {
            RetryAction::Retry { backoff } => {
                ctx.request_invalidation(decision.invalidation);
                warn!(
                    class = ?class,
                    attempt = ctx.attempts(),
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "retrying request"
                );
            }
            RetryAction::Fail(terminal) => {
                warn!(
                    class = ?class,
                    attempt = ctx.attempts(),
                    error = %terminal,
                    "giving up on request"
                );
            }
        }
        decision
    }

    fn decide_gone(&self, ctx: &mut RetryContext, class: FailureClass) -> RetryDecision {
        let elapsed = ctx.elapsed();
        if elapsed >= self.config.gone_budget {
            let reason = format!("retry budget of {:?} exhausted", self.config.gone_budget);
            return self.exhausted(ctx, reason);
        }

        let retry = ctx.next_gone_retry();
        if retry > self.config.gone_max_attempts {
            let reason = format!("gave up after {} gone retries", self.config.gone_max_attempts);
            return self.exhausted(ctx, reason);
        }

        let remaining = self.config.gone_budget - elapsed;
        let backoff = self.gone_backoff(retry).min(remaining);
        debug!(retry, backoff_ms = backoff.as_millis() as u64, "gone retry scheduled");

        // a transport failure says nothing about the cached addresses
        let invalidation = Invalidation {
            force_address_refresh: class == FailureClass::Gone,
            ..Invalidation::NONE
        };
        RetryDecision::retry(backoff, invalidation)
    }

    fn within_gone_budget(
        &self,
        ctx: &RetryContext,
        class: FailureClass,
        invalidation: Invalidation,
    ) -> RetryDecision {
        if ctx.elapsed() >= self.config.gone_budget {
            return self.exhausted(
                ctx,
                format!("{class:?} persisted past the {:?} retry budget", self.config.gone_budget),
            );
        }
        RetryDecision::retry(Duration::ZERO, invalidation)
    }

    fn decide_retry_with(&self, ctx: &mut RetryContext, class: FailureClass) -> RetryDecision {
        let (retry, first_seen) = ctx.next_retry_with();
        let spent = Instant::now().saturating_duration_since(first_seen);
        if spent >= self.config.retry_with_budget {
            return self.exhausted(
                ctx,
                format!("{class:?} persisted past the {:?} budget", self.config.retry_with_budget),
            );
        }
        let backoff = self
            .retry_with_backoff(retry)
            .min(self.config.retry_with_budget - spent);
        RetryDecision::retry(backoff, Invalidation::NONE)
    }

    fn exhausted(&self, ctx: &RetryContext, reason: String) -> RetryDecision {
        RetryDecision::fail(ReplicaError::service_unavailable(reason, ctx.diagnostics()))
    }
}

//! Per-request retry state.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ReplicaError, RequestDiagnostics};
use crate::retry::Invalidation;

/// Mutable state of one logical request's retry loop.
///
/// Counters only ever grow. Invalidation flags accumulate until the client
/// consumes them at the start of the next attempt.
#[derive(Debug)]
pub struct RetryContext {
    started_at: Instant,
    attempts: u32,
    gone_retries: u32,
    invalid_partition_failures: u32,
    retry_with_retries: u32,
    retry_with_started: Option<Instant>,
    pending: Invalidation,
    last_error: Option<ReplicaError>,
    addresses: Vec<String>,
    last_lsn: Option<i64>,
    last_global_committed_lsn: Option<i64>,
}

impl RetryContext {
    /// Start a retry loop now.
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Start a retry loop at `started_at`.
    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            attempts: 0,
            gone_retries: 0,
            invalid_partition_failures: 0,
            retry_with_retries: 0,
            retry_with_started: None,
            pending: Invalidation::default(),
            last_error: None,
            addresses: Vec::new(),
            last_lsn: None,
            last_global_committed_lsn: None,
        }
    }

    /// When the loop started.
    pub fn start(&self) -> Instant {
        self.started_at
    }

    /// Time spent in the loop so far.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record the start of an attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Gone-class retries granted so far.
    pub fn gone_retries(&self) -> u32 {
        self.gone_retries
    }

    pub(crate) fn next_gone_retry(&mut self) -> u32 {
        self.gone_retries += 1;
        self.gone_retries
    }

    /// Invalid-partition failures seen so far.
    pub fn invalid_partition_failures(&self) -> u32 {
        self.invalid_partition_failures
    }

    pub(crate) fn next_invalid_partition_failure(&mut self) -> u32 {
        self.invalid_partition_failures += 1;
        self.invalid_partition_failures
    }

    /// Retry-with retries granted so far.
    pub fn retry_with_retries(&self) -> u32 {
        self.retry_with_retries
    }

    /// Count a retry-with-class failure. Returns the count and the time the
    /// first one was seen.
    pub(crate) fn next_retry_with(&mut self) -> (u32, Instant) {
        self.retry_with_retries += 1;
        let started = *self.retry_with_started.get_or_insert_with(Instant::now);
        (self.retry_with_retries, started)
    }

    /// Merge invalidations requested by a retry decision.
    pub fn request_invalidation(&mut self, invalidation: Invalidation) {
        self.pending.merge(invalidation);
    }

    /// Invalidations not yet applied.
    pub fn pending_invalidation(&self) -> Invalidation {
        self.pending
    }

    /// Consume the pending invalidations.
    pub fn take_invalidation(&mut self) -> Invalidation {
        std::mem::take(&mut self.pending)
    }

    /// Record a physical address contacted by an attempt.
    pub fn record_address(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        if !self.addresses.contains(&uri) {
            self.addresses.push(uri);
        }
    }

    /// Fold observed sequence numbers into the diagnostics.
    pub fn record_lsn(&mut self, lsn: Option<i64>, global_committed_lsn: Option<i64>) {
        self.last_lsn = self.last_lsn.max(lsn);
        self.last_global_committed_lsn = self.last_global_committed_lsn.max(global_committed_lsn);
    }

    /// Record the most recent failure.
    pub fn record_error(&mut self, error: &ReplicaError) {
        if let ReplicaError::Gone { addresses, .. } = error {
            for uri in addresses {
                self.record_address(uri.clone());
            }
        }
        if let ReplicaError::NetworkTransient { uri, .. } = error {
            self.record_address(uri.clone());
        }
        self.last_error = Some(error.clone());
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<&ReplicaError> {
        self.last_error.as_ref()
    }

    /// Snapshot for terminal errors.
    pub fn diagnostics(&self) -> RequestDiagnostics {
        RequestDiagnostics {
            attempts: self.attempts,
            addresses: self.addresses.clone(),
            last_lsn: self.last_lsn,
            last_global_committed_lsn: self.last_global_committed_lsn,
            elapsed: self.elapsed(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

//! HTTP-equivalent status and sub-status codes carried by replica responses.
//!
//! Replicas answer with a status code plus an optional sub-status that
//! refines it. The pair drives failure classification: a `410` alone means
//! the replica is gone, `410/1007` means the partition key range is in the
//! middle of a split, and so on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// HTTP-equivalent status code of a replica response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// 200
    pub const OK: Self = Self(200);
    /// 201
    pub const CREATED: Self = Self(201);
    /// 204
    pub const NO_CONTENT: Self = Self(204);
    /// 304
    pub const NOT_MODIFIED: Self = Self(304);
    /// 400
    pub const BAD_REQUEST: Self = Self(400);
    /// 401
    pub const UNAUTHORIZED: Self = Self(401);
    /// 403
    pub const FORBIDDEN: Self = Self(403);
    /// 404
    pub const NOT_FOUND: Self = Self(404);
    /// 408
    pub const REQUEST_TIMEOUT: Self = Self(408);
    /// 409
    pub const CONFLICT: Self = Self(409);
    /// 410
    pub const GONE: Self = Self(410);
    /// 412
    pub const PRECONDITION_FAILED: Self = Self(412);
    /// 449: optimistic concurrency conflict, retry shortly.
    pub const RETRY_WITH: Self = Self(449);
    /// 503
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// Whether the status denotes success (2xx).
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-status refining a [`StatusCode`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SubStatus(pub u32);

impl SubStatus {
    /// No sub-status.
    pub const NONE: Self = Self(0);
    /// `410`: the collection was recreated under the same name.
    pub const NAME_CACHE_STALE: Self = Self(1000);
    /// `410`: the partition key range no longer exists (it was split).
    pub const PARTITION_KEY_RANGE_GONE: Self = Self(1002);
    /// `404`: no replica has caught up to the session token yet.
    pub const READ_SESSION_NOT_AVAILABLE: Self = Self(1002);
    /// `410`: the partition key range is being split.
    pub const COMPLETING_SPLIT: Self = Self(1007);
    /// `410`: the partition is being migrated.
    pub const COMPLETING_PARTITION_MIGRATION: Self = Self(1008);
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::NO_CONTENT.is_success());
        assert!(!StatusCode::NOT_MODIFIED.is_success());
        assert!(!StatusCode::GONE.is_success());
    }
}

//! Lock tokens.
//!
//! A token is `<unix-millis>-<owner>-<counter>`: the acquisition time, a
//! per-process owner id (simple-format UUID) and a per-process counter. The
//! timestamp gives the lock age; owner and counter keep two acquisitions in
//! the same millisecond distinct, on one host or across the fleet.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A lock token as stored under a session's lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a token read back from the store. No validation happens here;
    /// a malformed token simply has an unbounded age.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquisition time, if the token is well-formed.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        let mut parts = self.0.splitn(3, '-');
        let millis = parts.next()?.parse::<i64>().ok()?;
        let owner = parts.next()?;
        let counter = parts.next()?;
        if owner.len() != 32 || !owner.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        counter.parse::<u64>().ok()?;
        DateTime::from_timestamp_millis(millis)
    }

    /// Time since acquisition. `Duration::MAX` for malformed tokens; zero if
    /// the token is from the future (clock skew between hosts).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        match self.acquired_at() {
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    /// Whether the holder has kept the lock longer than `max_age`.
    pub fn is_abandoned(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints tokens for one process.
#[derive(Debug)]
pub struct TokenMinter {
    owner: Uuid,
    counter: AtomicU64,
}

impl TokenMinter {
    pub fn new() -> Self {
        Self::with_owner(Uuid::new_v4())
    }

    pub fn with_owner(owner: Uuid) -> Self {
        Self {
            owner,
            counter: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// A fresh token stamped with `at`.
    pub fn mint(&self, at: DateTime<Utc>) -> LockToken {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        LockToken(format!(
            "{}-{}-{n}",
            at.timestamp_millis(),
            self.owner.simple()
        ))
    }

    /// A fresh token stamped with the current time.
    pub fn mint_now(&self) -> LockToken {
        self.mint(Utc::now())
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}

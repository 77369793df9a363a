//! Per-principal replay protection.
//!
//! When a session moves to a newer token, older tokens for the same
//! client must stop working, including copies an attacker (or a confused
//! process) may still hold. A [`ForbiddenRecord`] says "reject any token
//! of this principal created at or before `forbidden_before_sec`".
//!
//! Records only need to outlive the tokens they cover, so each one is
//! released after `forbid_window`. Expired records are purged by a sweep
//! that runs at most once per `sweep_interval`.

use std::collections::HashMap;
use std::time::Duration;

use arclink_protocol::PeerId;
use tracing::debug;

/// Tokens with `created_at_sec <= forbidden_before_sec` are rejected until
/// `release_at_sec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForbiddenRecord {
    pub forbidden_before_sec: u64,
    pub release_at_sec: u64,
}

/// An expiring map of forbidden records.
#[derive(Debug)]
pub struct ForbiddenTable {
    records: HashMap<PeerId, ForbiddenRecord>,
    window: Duration,
    sweep_interval: Duration,
    next_sweep_sec: u64,
}

impl ForbiddenTable {
    pub fn new(window: Duration, sweep_interval: Duration) -> Self {
        Self {
            records: HashMap::new(),
            window,
            sweep_interval,
            next_sweep_sec: 0,
        }
    }

    /// Forbids every token of `principal` created at or before `cutoff_sec`.
    ///
    /// The cutoff never moves backwards; the release time is pushed out to
    /// `now + window`.
    pub fn forbid_through(&mut self, principal: PeerId, cutoff_sec: u64, now_sec: u64) {
        let release_at_sec = now_sec.saturating_add(self.window.as_secs());
        let record = self
            .records
            .entry(principal)
            .or_insert(ForbiddenRecord {
                forbidden_before_sec: cutoff_sec,
                release_at_sec,
            });
        record.forbidden_before_sec = record.forbidden_before_sec.max(cutoff_sec);
        record.release_at_sec = record.release_at_sec.max(release_at_sec);
        debug!(
            %principal,
            cutoff = record.forbidden_before_sec,
            release_at = record.release_at_sec,
            "tokens forbidden"
        );
    }

    /// Forbids every token of `principal` created strictly before
    /// `created_at_sec`.
    pub fn forbid_before(&mut self, principal: PeerId, created_at_sec: u64, now_sec: u64) {
        if let Some(cutoff) = created_at_sec.checked_sub(1) {
            self.forbid_through(principal, cutoff, now_sec);
        }
    }

    pub fn is_forbidden(&self, principal: PeerId, created_at_sec: u64, now_sec: u64) -> bool {
        self.records.get(&principal).is_some_and(|r| {
            now_sec < r.release_at_sec && created_at_sec <= r.forbidden_before_sec
        })
    }

    pub fn record(&self, principal: PeerId) -> Option<ForbiddenRecord> {
        self.records.get(&principal).copied()
    }

    /// Purges released records if the sweep interval has elapsed.
    /// Returns how many were removed.
    pub fn maybe_sweep(&mut self, now_sec: u64) -> usize {
        if now_sec < self.next_sweep_sec {
            return 0;
        }
        self.next_sweep_sec = now_sec + self.sweep_interval.as_secs().max(1);
        self.sweep(now_sec)
    }

    /// Purges released records unconditionally.
    pub fn sweep(&mut self, now_sec: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.release_at_sec > now_sec);
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "forbidden records swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

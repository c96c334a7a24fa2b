//!
//! Per-peer request and connection scoring
//!
//! Each peer carries two rolling counters: one fed by completed requests,
//! one by connection attempts. Scores decay over time, so a peer that
//! backs off recovers on its own; a peer that trips the injected limits
//! is banned and dropped by the data thread on its next sweep.

use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Points shed per second of silence.
const SCORE_DECAY: u64 = 1;

/// Default ban term: 24 hours.
const BAN_SECS: u64 = 86_400;

/// A magnitude that decays as time passes.
pub struct DdosScore {
    score: u64,
    last:  Instant,
}

impl DdosScore {
    pub fn new() -> DdosScore {
        DdosScore {
            score: 0,
            last:  Instant::now(),
        }
    }

    /// Current magnitude, after decay.
    pub fn score(&self) -> u64 {
        let elapsed = self.last.elapsed().as_secs();
        self.score.saturating_sub(elapsed * SCORE_DECAY)
    }

    /// Raise the score by `n`, collapsing any pending decay first.
    pub fn add(&mut self, n: u64) {
        self.score = self.score();
        self.last = Instant::now();
        self.score += n;
    }

    #[cfg(test)]
    fn rewind(&mut self, secs: u64) {
        self.last -= Duration::from_secs(secs);
    }
}

impl AddAssign<u64> for DdosScore {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

/// Scoring state for one peer.
pub struct DdosFilter {
    /// Requests per unit time.
    pub r_score: DdosScore,

    /// Connections per unit time.
    pub c_score: DdosScore,

    banned_until: Option<Instant>,
}

impl DdosFilter {
    pub fn new() -> DdosFilter {
        DdosFilter {
            r_score:      DdosScore::new(),
            c_score:      DdosScore::new(),
            banned_until: None,
        }
    }

    /// Ban for the default term.
    pub fn ban(&mut self) {
        self.ban_for(BAN_SECS);
    }

    /// Ban for `secs` seconds from now.
    pub fn ban_for(&mut self, secs: u64) {
        self.banned_until = Some(Instant::now() + Duration::from_secs(secs));
    }

    pub fn banned(&self) -> bool {
        match self.banned_until {
            Some(until) => Instant::now() < until,
            None        => false,
        }
    }
}

//! Heartbeat lease arithmetic.
//!
//! The generator hands out expiration timestamps for the state-table lease
//! and remembers when the next refresh is due. The refresh cadence is
//! jittered upward by up to 10% so a fleet of agents does not heartbeat in
//! lockstep; the expiry always trails the next refresh by
//! `offset - interval`, which keeps successive expiries non-decreasing for a
//! fixed configuration.

use crate::{Error, Result};
use rand::Rng;

#[derive(Debug)]
pub struct TtlExpirationGenerator {
    refresh_interval_sec: i64,
    expiration_offset_sec: i64,
    next_refresh_timestamp: i64,
    next_expiration_timestamp: i64,
}

impl TtlExpirationGenerator {
    /// Fails when the refresh interval does not leave room to extend the
    /// lease before it expires.
    pub fn new(refresh_interval_sec: i64, expiration_offset_sec: i64) -> Result<Self> {
        if refresh_interval_sec >= expiration_offset_sec {
            return Err(Error::msg(format!(
                "ttl refresh interval [{refresh_interval_sec}] must be smaller than the \
                 expiration offset [{expiration_offset_sec}], otherwise the lease always \
                 expires before it can be extended"
            )));
        }
        Ok(Self {
            refresh_interval_sec,
            expiration_offset_sec,
            next_refresh_timestamp: 0,
            next_expiration_timestamp: 0,
        })
    }

    /// Computes the next (refresh, expiration) pair from `now` (epoch secs)
    /// and returns the new expiration timestamp.
    pub fn generate_next(&mut self, now: i64) -> i64 {
        let jitter_ceiling = (self.refresh_interval_sec as f64 * 1.1) as i64;
        let jittered = rand::thread_rng().gen_range(self.refresh_interval_sec..=jitter_ceiling);
        self.next_refresh_timestamp = now + jittered;
        self.next_expiration_timestamp =
            self.next_refresh_timestamp + (self.expiration_offset_sec - self.refresh_interval_sec);
        self.next_expiration_timestamp
    }

    /// Whether the heartbeat activity, polling every `poll_interval_sec`,
    /// must refresh now to keep the lease alive until its next wakeup.
    pub fn refresh_due(&self, now: i64, poll_interval_sec: i64) -> bool {
        self.next_refresh_timestamp == 0 || self.next_refresh_timestamp < now + poll_interval_sec
    }

    pub fn next_expiration_timestamp(&self) -> i64 {
        self.next_expiration_timestamp
    }

    pub fn next_refresh_timestamp(&self) -> i64 {
        self.next_refresh_timestamp
    }
}

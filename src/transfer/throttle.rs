//! Upload bandwidth throttling.
//!
//! A token bucket (`governor`) where one token stands for one KiB of file
//! data.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

const CHUNK: u64 = 1024;

/// Bytes per second; zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthLimit {
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.bytes_per_second;
        if bps == 0 {
            write!(f, "unlimited")
        } else if bps >= 1_000_000_000 {
            write!(f, "{:.1} GB/s", bps as f64 / 1_000_000_000.0)
        } else if bps >= 1_000_000 {
            write!(f, "{:.1} MB/s", bps as f64 / 1_000_000.0)
        } else if bps >= 1_000 {
            write!(f, "{:.1} KB/s", bps as f64 / 1_000.0)
        } else {
            write!(f, "{} B/s", bps)
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared between every upload of one engine, so the limit is global.
#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    limit: BandwidthLimit,
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("limit", &self.limit)
            .finish()
    }
}

impl BandwidthLimiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        let limiter = limit
            .is_limited()
            .then(|| u32::try_from((limit.bytes_per_second / CHUNK).max(1)).unwrap_or(u32::MAX))
            .and_then(NonZeroU32::new)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        Self { limiter, limit }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limit(&self) -> BandwidthLimit {
        self.limit
    }

    /// Wait until `bytes` may be sent. Returns at once when unlimited.
    pub async fn acquire(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let chunks = (bytes as u64).div_ceil(CHUNK).max(1);
        for _ in 0..chunks {
            limiter.until_ready().await;
        }
    }
}

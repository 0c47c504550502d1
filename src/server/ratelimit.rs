//! Fixed-window request limiter keyed by `(ip, endpoint)`.
//!
//! Every client gets an independent budget per endpoint per minute.
//! A limit of zero (or less, at the CLI layer) disables limiting
//! entirely, in which case no limiter is constructed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per key per window unless configured otherwise.
pub const DEFAULT_LIMIT: u32 = 512;

struct Bucket {
    window_start: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    buckets: Mutex<HashMap<(IpAddr, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request and report whether it is within budget.
    pub fn allow(&self, ip: IpAddr, endpoint: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let bucket = buckets
            .entry((ip, endpoint.to_string()))
            .or_insert(Bucket {
                window_start: now,
                count: 0,
            });
        if now.duration_since(bucket.window_start) >= WINDOW {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count += 1;
        bucket.count <= self.limit
    }
}

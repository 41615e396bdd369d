// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket shared by every worker, capping the combined write rate.
#[derive(Debug, Clone)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; also the burst size.
    rate: u64,
    /// Bytes that may be taken right now.
    available: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.rate as f64).min(self.rate as f64);
        self.refilled_at = now;
    }
}

impl SpeedLimiter {
    /// Returns `None` for a zero rate, which means unlimited.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        Some(Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec as f64,
                refilled_at: Instant::now(),
            })),
        })
    }

    /// Waits until `amount` bytes fit under the cap, then takes them.
    ///
    /// Requests larger than one second's worth are let through once the
    /// bucket is full, leaving it in debt.
    pub async fn take(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now());
                let wanted = (amount as f64).min(bucket.rate as f64);
                if bucket.available >= wanted {
                    bucket.available -= amount as f64;
                    return;
                }
                Duration::from_secs_f64((wanted - bucket.available) / bucket.rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

//! Gateway-wide bandwidth accounting and rate limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic byte counters shared by every connection's codec.
#[derive(Debug, Default)]
pub struct BandwidthCounters {
    download: AtomicU64,
    upload: AtomicU64,
}

impl BandwidthCounters {
    pub fn add_download(&self, n: usize) {
        self.download.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_upload(&self, n: usize) {
        self.upload.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// (download, upload) totals since startup.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.download.load(Ordering::Relaxed),
            self.upload.load(Ordering::Relaxed),
        )
    }
}

/// Runtime-mutable transfer caps. Zero means unlimited.
#[derive(Debug, Default)]
pub struct RateLimits {
    download_bytes_per_sec: AtomicU64,
    upload_bytes_per_sec: AtomicU64,
}

impl RateLimits {
    pub fn set(&self, down: u64, up: u64) {
        self.download_bytes_per_sec.store(down, Ordering::Relaxed);
        self.upload_bytes_per_sec.store(up, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.download_bytes_per_sec.load(Ordering::Relaxed),
            self.upload_bytes_per_sec.load(Ordering::Relaxed),
        )
    }

    /// How long a transfer of `n` bytes must be stretched to respect the
    /// upload cap.
    pub fn upload_delay(&self, n: usize) -> Option<Duration> {
        delay(self.upload_bytes_per_sec.load(Ordering::Relaxed), n)
    }

    pub fn download_delay(&self, n: usize) -> Option<Duration> {
        delay(self.download_bytes_per_sec.load(Ordering::Relaxed), n)
    }
}

fn delay(rate: u64, n: usize) -> Option<Duration> {
    if rate == 0 || n == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(n as f64 / rate as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = BandwidthCounters::default();
        counters.add_download(10);
        counters.add_download(5);
        counters.add_upload(7);
        assert_eq!(counters.totals(), (15, 7));
    }

    #[test]
    fn unlimited_rate_never_delays() {
        let limits = RateLimits::default();
        assert!(limits.upload_delay(1 << 20).is_none());
        assert!(limits.download_delay(1 << 20).is_none());
    }

    #[test]
    fn limited_rate_scales_with_size() {
        let limits = RateLimits::default();
        limits.set(1000, 1000);
        let short = limits.upload_delay(100).expect("delay");
        let long = limits.upload_delay(1000).expect("delay");
        assert!(long > short);
        assert_eq!(long, Duration::from_secs(1));
    }
}

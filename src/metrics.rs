//! Logical vs. physical byte accounting.
//!
//! A [`MetricsContext`] is created per measured phase and shared (via `Arc`) by
//! every engine under test in that phase. Both counters are plain atomics: the
//! engines' own locks never cover them, so instrumentation does not change the
//! contention being measured.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsContext {
    logical_bytes: AtomicU64,
    physical_bytes: AtomicU64,
}

impl MetricsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds user-data bytes (e.g. 16 per key/value pair).
    pub fn record_logical(&self, bytes: u64) {
        self.logical_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds bytes actually issued to storage, padding included.
    pub fn record_physical(&self, bytes: u64) {
        self.physical_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn logical_bytes(&self) -> u64 {
        self.logical_bytes.load(Ordering::Relaxed)
    }

    pub fn physical_bytes(&self) -> u64 {
        self.physical_bytes.load(Ordering::Relaxed)
    }

    /// Zeroes both counters. Call between the pre-load and the measured run.
    pub fn reset(&self) {
        self.logical_bytes.store(0, Ordering::SeqCst);
        self.physical_bytes.store(0, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            logical_bytes: self.logical_bytes(),
            physical_bytes: self.physical_bytes(),
        }
    }
}

/// Point-in-time copy of the counters, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub logical_bytes: u64,
    pub physical_bytes: u64,
}

impl MetricsSnapshot {
    /// Physical over logical bytes. `None` until some logical data was written.
    pub fn write_amplification(&self) -> Option<f64> {
        if self.logical_bytes == 0 {
            return None;
        }
        Some(self.physical_bytes as f64 / self.logical_bytes as f64)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.write_amplification() {
            Some(waf) => write!(
                f,
                "WAF {:.2} (physical {} B / logical {} B)",
                waf, self.physical_bytes, self.logical_bytes
            ),
            None => write!(
                f,
                "WAF n/a (physical {} B / logical {} B)",
                self.physical_bytes, self.logical_bytes
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_and_reset() {
        let metrics = MetricsContext::new();
        metrics.record_logical(16);
        metrics.record_logical(16);
        metrics.record_physical(4096);

        assert_eq!(metrics.logical_bytes(), 32);
        assert_eq!(metrics.physical_bytes(), 4096);
        assert_eq!(metrics.snapshot().write_amplification(), Some(128.0));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.snapshot().write_amplification(), None);
    }

    #[test]
    fn test_no_lost_updates_across_threads() {
        let metrics = Arc::new(MetricsContext::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        metrics.record_logical(16);
                        metrics.record_physical(4096);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.logical_bytes(), 8 * 10_000 * 16);
        assert_eq!(metrics.physical_bytes(), 8 * 10_000 * 4096);
    }

    #[test]
    fn test_display() {
        let snapshot = MetricsSnapshot {
            logical_bytes: 16,
            physical_bytes: 4096,
        };
        assert_eq!(
            snapshot.to_string(),
            "WAF 256.00 (physical 4096 B / logical 16 B)"
        );
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond time source
///
/// Every component reads time through this trait so cadences can be driven
/// deterministically in tests.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds
    fn now_ms(&self) -> f64;
}

/// Wall clock, milliseconds since the UNIX epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`
    pub fn new(start_ms: f64) -> Self {
        ManualClock {
            bits: Arc::new(AtomicU64::new(start_ms.to_bits())),
        }
    }

    /// Sets the absolute time
    pub fn set(&self, ms: f64) {
        self.bits.store(ms.to_bits(), Ordering::SeqCst);
    }

    /// Moves time forward by `ms`
    pub fn advance(&self, ms: f64) {
        let now = self.now_ms();
        self.set(now + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(1000.0);
        let other = clock.clone();
        clock.advance(250.0);
        assert_eq!(other.now_ms(), 1250.0);
        other.set(10.0);
        assert_eq!(clock.now_ms(), 10.0);
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(a > 0.0);
        assert!(b >= a);
    }
}

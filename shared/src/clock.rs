//! Monotonic session time shared by the room loop and the snapshot receiver.
//!
//! Both ends express time as `f64` milliseconds since an arbitrary epoch.
//! The server stamps snapshots in its own domain; the client keeps a single
//! offset between its local clock and the server's and never recalibrates,
//! since drift is absorbed by the render clock correctors.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic millisecond clock anchored at creation time.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.at(Instant::now())
    }

    /// Milliseconds between the clock epoch and `instant` (zero if earlier).
    pub fn at(&self, instant: Instant) -> f64 {
        instant
            .checked_duration_since(self.epoch)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
            * 1000.0
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

/// One-shot offset between a local monotonic clock and the server's.
///
/// `server = local + offset`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoOffset {
    offset: Option<f64>,
}

impl MonoOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchors the offset. Only the first call has an effect; returns true
    /// when this call performed the calibration.
    pub fn calibrate(&mut self, server_mono: f64, local_mono: f64) -> bool {
        if self.offset.is_some() {
            return false;
        }
        self.offset = Some(server_mono - local_mono);
        true
    }

    pub fn is_calibrated(&self) -> bool {
        self.offset.is_some()
    }

    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn to_server(&self, local_mono: f64) -> Option<f64> {
        self.offset.map(|offset| local_mono + offset)
    }

    pub fn to_local(&self, server_mono: f64) -> Option<f64> {
        self.offset.map(|offset| server_mono - offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_session_clock_is_monotonic() {
        let clock = SessionClock::start();
        let a = clock.now_ms();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ms();
        assert!(b > a);
        assert!(a >= 0.0);
    }

    #[test]
    fn test_session_clock_before_epoch_is_zero() {
        let earlier = Instant::now();
        std::thread::sleep(Duration::from_millis(1));
        let clock = SessionClock::start();
        assert_eq!(clock.at(earlier), 0.0);
    }

    #[test]
    fn test_offset_calibrates_once() {
        let mut offset = MonoOffset::new();
        assert!(!offset.is_calibrated());
        assert_eq!(offset.to_server(10.0), None);

        assert!(offset.calibrate(5000.0, 1000.0));
        assert!(!offset.calibrate(9000.0, 1000.0));

        assert_approx_eq!(offset.offset().unwrap(), 4000.0, 1e-9);
        assert_approx_eq!(offset.to_server(1500.0).unwrap(), 5500.0, 1e-9);
        assert_approx_eq!(offset.to_local(5500.0).unwrap(), 1500.0, 1e-9);
    }

    #[test]
    fn test_wall_clock_advances() {
        let t1 = wall_clock_ms();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = wall_clock_ms();
        assert!(t2 > t1);
    }
}

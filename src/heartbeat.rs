use std::time::Duration;

/// Liveness tracking for the upload link.
///
/// Every tick counts as one unanswered probe, every pong clears the count.
/// The link is alive while fewer than `miss_threshold` probes are
/// outstanding and the transport reports itself connected. Changes are
/// edge-triggered: each setter returns `Some(alive)` only when the derived
/// flag flips.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    baseline: Duration,
    interval: Duration,
    miss_threshold: u32,
    missed: u32,
    connected: bool,
    alive: bool,
}

impl HeartbeatMonitor {
    pub fn new(baseline: Duration, miss_threshold: u32) -> Self {
        Self {
            baseline,
            interval: baseline,
            miss_threshold,
            // Not alive until the first pong.
            missed: miss_threshold,
            connected: false,
            alive: false,
        }
    }

    /// One probe was sent.
    pub fn tick(&mut self) -> Option<bool> {
        self.missed = self.missed.saturating_add(1);
        self.evaluate()
    }

    pub fn on_pong(&mut self) -> Option<bool> {
        self.missed = 0;
        self.evaluate()
    }

    pub fn set_connected(&mut self, connected: bool) -> Option<bool> {
        self.connected = connected;
        self.evaluate()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn restore_baseline(&mut self) {
        self.interval = self.baseline;
    }

    /// Back to the initial, not-alive state at baseline cadence.
    pub fn reset(&mut self) {
        self.interval = self.baseline;
        self.missed = self.miss_threshold;
        self.connected = false;
        self.alive = false;
    }

    fn evaluate(&mut self) -> Option<bool> {
        let alive = self.missed < self.miss_threshold && self.connected;
        if alive == self.alive {
            return None;
        }
        self.alive = alive;
        Some(alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_millis(500), 8)
    }

    #[test]
    fn test_starts_not_alive() {
        let mut heartbeat = monitor();
        assert!(!heartbeat.is_alive());
        assert_eq!(heartbeat.set_connected(true), None);
        assert_eq!(heartbeat.on_pong(), Some(true));
        assert!(heartbeat.is_alive());
    }

    #[test]
    fn test_dies_after_threshold_misses() {
        let mut heartbeat = monitor();
        heartbeat.set_connected(true);
        heartbeat.on_pong();

        for _ in 0..7 {
            assert_eq!(heartbeat.tick(), None);
        }
        assert!(heartbeat.is_alive());
        assert_eq!(heartbeat.tick(), Some(false));
        assert_eq!(heartbeat.tick(), None);
        assert_eq!(heartbeat.missed(), 9);
    }

    #[test]
    fn test_pong_revives_once() {
        let mut heartbeat = monitor();
        heartbeat.set_connected(true);
        for _ in 0..3 {
            heartbeat.tick();
        }
        assert_eq!(heartbeat.on_pong(), Some(true));
        assert_eq!(heartbeat.on_pong(), None);
    }

    #[test]
    fn test_disconnect_forces_not_alive() {
        let mut heartbeat = monitor();
        heartbeat.set_connected(true);
        heartbeat.on_pong();
        assert_eq!(heartbeat.set_connected(false), Some(false));
        assert_eq!(heartbeat.on_pong(), None);
        assert!(!heartbeat.is_alive());
    }

    #[test]
    fn test_cadence_switch_and_restore() {
        let mut heartbeat = monitor();
        heartbeat.set_interval(Duration::from_secs(60));
        assert_eq!(heartbeat.interval(), Duration::from_secs(60));
        heartbeat.restore_baseline();
        assert_eq!(heartbeat.interval(), Duration::from_millis(500));

        heartbeat.set_connected(true);
        heartbeat.on_pong();
        heartbeat.set_interval(Duration::from_secs(60));
        heartbeat.reset();
        assert!(!heartbeat.is_alive());
        assert_eq!(heartbeat.interval(), Duration::from_millis(500));
    }
}

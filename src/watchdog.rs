/// Result of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// Watchdog is not armed.
    Idle,
    Progressing,
    /// The marker has not moved for this many ticks.
    Waiting(u32),
    /// Threshold exceeded; the caller should recycle the transport.
    Stalled,
}

/// Detects an upload whose last requested offset stopped moving.
///
/// The marker is sampled once per tick. A tick that sees the same marker as
/// the previous one counts towards the threshold, any movement resets it.
/// Exceeding the threshold yields one [`StallCheck::Stalled`] and restarts
/// the count, so a lasting stall recovers at most once per episode.
#[derive(Debug, Clone)]
pub struct StallWatchdog {
    threshold: u32,
    unchanged_ticks: u32,
    last_marker: Option<u64>,
    armed: bool,
    recoveries: u32,
}

impl StallWatchdog {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, unchanged_ticks: 0, last_marker: None, armed: false, recoveries: 0 }
    }

    pub fn start(&mut self) {
        self.armed = true;
        self.unchanged_ticks = 0;
        self.last_marker = None;
        self.recoveries = 0;
    }

    pub fn stop(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn tick(&mut self, marker: Option<u64>) -> StallCheck {
        if !self.armed {
            return StallCheck::Idle;
        }

        if marker == self.last_marker {
            self.unchanged_ticks += 1;
        } else {
            self.unchanged_ticks = 0;
        }
        self.last_marker = marker;

        if self.unchanged_ticks > self.threshold {
            self.unchanged_ticks = 0;
            self.recoveries += 1;
            StallCheck::Stalled
        } else if self.unchanged_ticks > 0 {
            StallCheck::Waiting(self.unchanged_ticks)
        } else {
            StallCheck::Progressing
        }
    }

    /// Stall episodes detected since `start`.
    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }
}

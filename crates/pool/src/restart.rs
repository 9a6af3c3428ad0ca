use std::collections::VecDeque;

/// Sliding window of recent exit timestamps for one worker slot. The window
/// is trimmed on every recorded exit; a slot latches `Crashed` once the
/// number of in-window exits goes beyond the configured attempt limit.
#[derive(Debug, Clone, Default)]
pub struct RestartWindow {
    times: VecDeque<u64>,
}

impl RestartWindow {
    /// Record an exit at `now_ms` and drop entries older than `window_ms`.
    pub fn record(&mut self, now_ms: u64, window_ms: u64) {
        self.times.push_back(now_ms);
        let cutoff = now_ms.saturating_sub(window_ms);
        while self.times.front().is_some_and(|oldest| *oldest < cutoff) {
            self.times.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// True when the in-window exit count exceeds `max_attempts`: the first
    /// `max_attempts` exits restart, the next one latches the slot.
    pub fn exceeds(&self, max_attempts: usize) -> bool {
        self.times.len() > max_attempts
    }
}

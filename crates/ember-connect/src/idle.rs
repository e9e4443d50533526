// Sliding window of connected-client samples driving idle shutdown.
use std::collections::VecDeque;

pub const IDLE_WINDOW_LEN: usize = 6;

/// Last [`IDLE_WINDOW_LEN`] connected-client samples.
///
/// Seeded with a single non-zero sample so a fresh manager can never look
/// idle before it has taken a full window of real samples.
///
/// ```
/// use ember_connect::idle::IdleWindow;
///
/// let mut window = IdleWindow::new();
/// for _ in 0..5 {
///     assert!(!window.record(0));
/// }
/// assert!(window.record(0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleWindow {
    samples: VecDeque<usize>,
}

impl Default for IdleWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleWindow {
    pub fn new() -> Self {
        let mut samples = VecDeque::with_capacity(IDLE_WINDOW_LEN);
        samples.push_back(1);
        Self { samples }
    }

    /// Appends a sample, dropping the oldest once full. Returns true when the
    /// window holds six consecutive zero samples.
    pub fn record(&mut self, connected: usize) -> bool {
        if self.samples.len() == IDLE_WINDOW_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(connected);
        self.is_idle()
    }

    pub fn is_idle(&self) -> bool {
        self.samples.len() == IDLE_WINDOW_LEN && self.samples.iter().all(|count| *count == 0)
    }

    pub fn samples(&self) -> impl Iterator<Item = usize> + '_ {
        self.samples.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_holds_sentinel() {
        let window = IdleWindow::new();
        assert_eq!(window.samples().collect::<Vec<_>>(), vec![1]);
        assert!(!window.is_idle());
    }

    #[test]
    fn six_zero_samples_trigger() {
        let mut window = IdleWindow::new();
        let fired: Vec<bool> = (0..6).map(|_| window.record(0)).collect();
        assert_eq!(fired, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn non_zero_sample_restarts_streak() {
        let mut window = IdleWindow::new();
        for _ in 0..5 {
            assert!(!window.record(0));
        }
        assert!(!window.record(3));
        // The non-zero sample stays in the window for five more samples.
        for _ in 0..5 {
            assert!(!window.record(0));
        }
        assert!(window.record(0));
    }

    #[test]
    fn window_never_grows_past_six() {
        let mut window = IdleWindow::new();
        for count in 0..20 {
            window.record(count);
        }
        assert_eq!(window.samples().count(), IDLE_WINDOW_LEN);
        assert_eq!(window.samples().next(), Some(14));
    }
}

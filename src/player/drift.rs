//! Audio/master clock drift estimation
//!
//! The audio clock (derived from the play cursor) and the master clock
//! slowly diverge. The filter keeps an exponentially weighted average of
//! the difference and, once it has settled, hands the average to source
//! refills as an advisory compensation.

/// Measurements averaged before the filter reports a compensation.
const AVG_WINDOW: u32 = 20;

/// Differences at or beyond this are treated as a desync (seek, stall)
/// and reset the filter instead of polluting the average.
const NOSYNC_THRESHOLD: f64 = 10.0;

/// Averages below this magnitude are noise and reported as zero.
const COMPENSATION_THRESHOLD: f64 = 0.1;

/// Exponentially weighted drift filter.
#[derive(Debug)]
pub struct DriftFilter {
    cum: f64,
    count: u32,
    coef: f64,
}

impl DriftFilter {
    pub fn new() -> Self {
        Self {
            cum: 0.0,
            count: 0,
            coef: (0.01f64.ln() / AVG_WINDOW as f64).exp(),
        }
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }

    /// Feed one measurement and get the compensation to pass to the
    /// source, in seconds. Returns 0.0 while settling, after a desync
    /// reset, and while the average is below the reporting threshold.
    pub fn sample(&mut self, audio_time: Option<f64>, master_time: f64) -> f64 {
        let diff = audio_time.unwrap_or(0.0) - master_time;
        if diff.abs() >= NOSYNC_THRESHOLD {
            self.reset();
            return 0.0;
        }
        self.cum = diff + self.cum * self.coef;
        if self.count < AVG_WINDOW {
            self.count += 1;
            return 0.0;
        }
        let avg = self.cum * (1.0 - self.coef);
        if avg.abs() > COMPENSATION_THRESHOLD {
            avg
        } else {
            0.0
        }
    }
}

impl Default for DriftFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_before_reporting() {
        let mut filter = DriftFilter::new();
        for _ in 0..AVG_WINDOW {
            assert_eq!(filter.sample(Some(1.0), 0.0), 0.0);
        }
        // Window full: a steady 1 s lag is now reported
        let comp = filter.sample(Some(1.0), 0.0);
        assert!(comp > COMPENSATION_THRESHOLD);
    }

    #[test]
    fn converges_to_steady_drift() {
        let mut filter = DriftFilter::new();
        let mut comp = 0.0;
        for _ in 0..200 {
            comp = filter.sample(Some(0.5), 0.0);
        }
        assert!((comp - 0.5).abs() < 0.05);
    }

    #[test]
    fn small_drift_reports_zero() {
        let mut filter = DriftFilter::new();
        for _ in 0..100 {
            assert_eq!(filter.sample(Some(0.01), 0.0), 0.0);
        }
    }

    #[test]
    fn desync_resets_the_window() {
        let mut filter = DriftFilter::new();
        for _ in 0..100 {
            filter.sample(Some(0.5), 0.0);
        }
        assert_eq!(filter.sample(Some(100.0), 0.0), 0.0);
        // Window restarts: nothing reported until it fills again
        for _ in 0..AVG_WINDOW {
            assert_eq!(filter.sample(Some(0.5), 0.0), 0.0);
        }
    }

    #[test]
    fn unknown_audio_time_counts_as_zero() {
        let mut filter = DriftFilter::new();
        for _ in 0..100 {
            filter.sample(None, 0.3);
        }
        let comp = filter.sample(None, 0.3);
        assert!(comp < -COMPENSATION_THRESHOLD);
    }
}

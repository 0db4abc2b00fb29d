use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of poses processed by the running calibration.
///
/// Shared with the worker threads of the finder fan-out, readable from any
/// thread while a calibration runs.
#[derive(Debug, Default)]
pub struct Progress {
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl Progress {
    /// Restart counting for `total` poses.
    pub fn reset(&self, total: usize) {
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Record one processed pose and return the updated count.
    pub fn increment(&self) -> usize {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("processed pose {}/{}", processed, self.total());
        processed
    }

    /// Poses processed so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Poses to process.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Processed fraction in `[0, 1]`, 1 when there is nothing to process.
    pub fn fraction(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => (self.processed() as f64 / total as f64).min(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_progress_parallel_increments() {
        let progress = Progress::default();
        progress.reset(1000);
        (0..1000).into_par_iter().for_each(|_| {
            progress.increment();
        });
        assert_eq!(progress.processed(), 1000);
        assert_eq!(progress.fraction(), 1.0);

        progress.reset(4);
        assert_eq!(progress.processed(), 0);
        progress.increment();
        assert_eq!(progress.fraction(), 0.25);
        progress.reset(0);
        assert_eq!(progress.fraction(), 1.0);
    }
}

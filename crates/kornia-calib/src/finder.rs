//! Pattern correspondence finders.
//!
//! A [`Finder`] fills the 2D detections of a [`Pose`] together with the
//! matching pattern points. Pixel level detectors live outside of this
//! crate, the finders here adapt their output.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FinderError;
use crate::pose::Pose;

/// Detects calibration pattern correspondences in a pose.
pub trait Finder: Send + Sync {
    /// Fill `points2d`, `points3d` and `point_indices` of the pose.
    ///
    /// A pose where the pattern is not found is left with empty
    /// correspondences, that is not an error.
    fn find(&self, pose: &mut Pose) -> Result<(), FinderError>;

    /// Returns true if [`Finder::find`] may run on several poses concurrently.
    fn supports_parallel(&self) -> bool {
        false
    }
}

/// Known geometry of a calibration target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    points: Vec<[f64; 3]>,
}

impl Pattern {
    /// Inner corners of a chessboard on `z = 0`, row major.
    ///
    /// # Arguments
    ///
    /// * `cols` - Number of inner corners per row.
    /// * `rows` - Number of inner corners per column.
    /// * `square_size` - Side of a square in world units.
    pub fn chessboard(cols: usize, rows: usize, square_size: f64) -> Self {
        let points = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| [c as f64 * square_size, r as f64 * square_size, 0.0]))
            .collect();
        Self { points }
    }

    /// Pattern from arbitrary target points.
    pub fn from_points(points: Vec<[f64; 3]>) -> Self {
        Self { points }
    }

    /// Target points.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Number of target points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if the pattern has no point.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Target points at the given indices.
    pub fn select(&self, indices: &[usize]) -> Result<Vec<[f64; 3]>, FinderError> {
        indices
            .iter()
            .map(|&index| {
                self.points.get(index).copied().ok_or(FinderError::IndexOutOfRange {
                    index,
                    len: self.points.len(),
                })
            })
            .collect()
    }
}

/// Detections of one pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Pixel coordinates.
    pub points2d: Vec<[f64; 2]>,
    /// Pattern indices of `points2d`.
    pub indices: Vec<usize>,
}

/// Finder serving detections computed ahead of time, keyed by pose id.
#[derive(Debug, Clone)]
pub struct PrecomputedFinder {
    pattern: Pattern,
    detections: HashMap<usize, Detection>,
}

impl PrecomputedFinder {
    /// Create a finder without detections.
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            detections: HashMap::new(),
        }
    }

    /// The target pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Register the detections of a pose.
    pub fn insert(
        &mut self,
        pose_id: usize,
        points2d: Vec<[f64; 2]>,
        indices: Vec<usize>,
    ) -> Result<(), FinderError> {
        if points2d.len() != indices.len() {
            return Err(FinderError::MismatchedDetection {
                points: points2d.len(),
                indices: indices.len(),
            });
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= self.pattern.len()) {
            return Err(FinderError::IndexOutOfRange {
                index,
                len: self.pattern.len(),
            });
        }
        self.detections
            .insert(pose_id, Detection { points2d, indices });
        Ok(())
    }

    /// Same as [`PrecomputedFinder::insert`] in builder form.
    pub fn with_detection(
        mut self,
        pose_id: usize,
        points2d: Vec<[f64; 2]>,
        indices: Vec<usize>,
    ) -> Result<Self, FinderError> {
        self.insert(pose_id, points2d, indices)?;
        Ok(self)
    }
}

impl Finder for PrecomputedFinder {
    fn find(&self, pose: &mut Pose) -> Result<(), FinderError> {
        match self.detections.get(&pose.id) {
            Some(det) => {
                pose.points3d = self.pattern.select(&det.indices)?;
                pose.points2d = det.points2d.clone();
                pose.point_indices = det.indices.clone();
            }
            None => {
                log::debug!("no detection registered for pose {}", pose.id);
                pose.points2d.clear();
                pose.points3d.clear();
                pose.point_indices.clear();
            }
        }
        Ok(())
    }

    fn supports_parallel(&self) -> bool {
        true
    }
}

/// Finder backed by a closure.
pub struct FnFinder<F> {
    find: F,
    parallel: bool,
}

impl<F> FnFinder<F>
where
    F: Fn(&mut Pose) -> Result<(), FinderError> + Send + Sync,
{
    /// Wrap a closure, sequential by default.
    pub fn new(find: F) -> Self {
        Self {
            find,
            parallel: false,
        }
    }

    /// Allow the closure to run on several poses concurrently.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

impl<F> Finder for FnFinder<F>
where
    F: Fn(&mut Pose) -> Result<(), FinderError> + Send + Sync,
{
    fn find(&self, pose: &mut Pose) -> Result<(), FinderError> {
        (self.find)(pose)
    }

    fn supports_parallel(&self) -> bool {
        self.parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chessboard() {
        let pattern = Pattern::chessboard(3, 2, 0.5);
        assert_eq!(pattern.len(), 6);
        assert_eq!(pattern.points()[0], [0.0, 0.0, 0.0]);
        assert_eq!(pattern.points()[2], [1.0, 0.0, 0.0]);
        assert_eq!(pattern.points()[4], [0.5, 0.5, 0.0]);
        assert!(pattern.select(&[6]).is_err());
    }

    #[test]
    fn test_precomputed_finder() -> Result<(), FinderError> {
        let finder = PrecomputedFinder::new(Pattern::chessboard(2, 2, 1.0)).with_detection(
            5,
            vec![[10.0, 10.0], [20.0, 10.0]],
            vec![0, 3],
        )?;

        let mut pose = Pose::new(5, None);
        finder.find(&mut pose)?;
        assert_eq!(pose.point_indices, vec![0, 3]);
        assert_eq!(pose.points3d, vec![[0.0, 0.0, 0.0], [1.0, 1.0, 0.0]]);
        assert_eq!(pose.points2d.len(), 2);
        assert!(finder.supports_parallel());

        let mut missing = Pose::new(6, None);
        missing.point_indices = vec![1];
        finder.find(&mut missing)?;
        assert!(missing.point_indices.is_empty());
        Ok(())
    }

    #[test]
    fn test_precomputed_finder_rejects_bad_detections() {
        let mut finder = PrecomputedFinder::new(Pattern::chessboard(2, 2, 1.0));
        assert_eq!(
            finder.insert(0, vec![[0.0, 0.0]], vec![0, 1]),
            Err(FinderError::MismatchedDetection {
                points: 1,
                indices: 2
            })
        );
        assert_eq!(
            finder.insert(0, vec![[0.0, 0.0]], vec![4]),
            Err(FinderError::IndexOutOfRange { index: 4, len: 4 })
        );
    }

    #[test]
    fn test_fn_finder() -> Result<(), FinderError> {
        let finder = FnFinder::new(|pose: &mut Pose| {
            pose.point_indices = vec![pose.id];
            Ok(())
        });
        assert!(!finder.supports_parallel());
        let finder = finder.with_parallel(true);
        assert!(finder.supports_parallel());

        let mut pose = Pose::new(2, None);
        finder.find(&mut pose)?;
        assert_eq!(pose.point_indices, vec![2]);
        Ok(())
    }
}

use std::sync::Arc;

use kornia_3d::calib::TermCriteria;
use rayon::prelude::*;

use crate::camera::{Camera, CameraSet};
use crate::error::CalibrationError;
use crate::finder::Finder;
use crate::pose::{Pose, PoseImage};
use crate::progress::Progress;
use crate::solver::{CalibrationSolver, NativeSolver};

/// Default minimum number of correspondences a pose must exceed.
pub const DEFAULT_MIN_POSE_CORRESPONDENCES: usize = 3;

/// State shared by the calibrators.
///
/// Accumulates the images of every camera, holds the correspondence finder
/// and the numerical solver, and keeps the filtered working copy of the
/// last calibration run.
pub struct CameraCalibration {
    pub(crate) cameras: CameraSet,
    pub(crate) filtered: CameraSet,
    finder: Option<Arc<dyn Finder>>,
    pub(crate) solver: Arc<dyn CalibrationSolver>,
    pose_count: usize,
    min_pose_correspondences: usize,
    pub(crate) criteria: TermCriteria,
    progress: Arc<Progress>,
}

impl Default for CameraCalibration {
    fn default() -> Self {
        Self {
            cameras: CameraSet::new(),
            filtered: CameraSet::new(),
            finder: None,
            solver: Arc::new(NativeSolver),
            pose_count: 0,
            min_pose_correspondences: DEFAULT_MIN_POSE_CORRESPONDENCES,
            criteria: TermCriteria::default(),
            progress: Arc::new(Progress::default()),
        }
    }
}

impl std::fmt::Debug for CameraCalibration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraCalibration")
            .field("cameras", &self.cameras.ids())
            .field("filtered", &self.filtered.ids())
            .field("finder_set", &self.finder.is_some())
            .field("pose_count", &self.pose_count)
            .field("min_pose_correspondences", &self.min_pose_correspondences)
            .field("criteria", &self.criteria)
            .finish()
    }
}

impl CameraCalibration {
    /// Create a calibration with the native solver and no finder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image to a camera, creating the camera on its first image.
    ///
    /// # Returns
    ///
    /// The id of the new pose.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::FinderNotSet`] without a finder and
    /// [`CalibrationError::DimensionMismatch`] if the image size differs from
    /// the previous images of the camera.
    pub fn add_image(
        &mut self,
        image: Arc<PoseImage>,
        camera_id: usize,
    ) -> Result<usize, CalibrationError> {
        self.check()?;

        let size = image.size();
        let camera = self.cameras.entry(camera_id);
        if camera.poses.is_empty() {
            camera.image_size = size;
        } else if camera.image_size != size {
            return Err(CalibrationError::DimensionMismatch {
                camera_id,
                expected: camera.image_size,
                actual: size,
            });
        }

        let id = self.pose_count;
        camera.poses.push(Pose::new(id, Some(image)));
        self.pose_count += 1;

        log::debug!("added pose {id} to camera {camera_id}");
        Ok(id)
    }

    /// Remove every camera and pose and restart the pose ids.
    pub fn clear(&mut self) {
        self.pose_count = 0;
        self.cameras.clear();
        self.filtered.clear();
    }

    /// Install the correspondence finder.
    pub fn set_finder(&mut self, finder: Arc<dyn Finder>) {
        self.finder = Some(finder);
    }

    /// The installed correspondence finder.
    pub fn finder(&self) -> Result<&Arc<dyn Finder>, CalibrationError> {
        self.finder.as_ref().ok_or(CalibrationError::FinderNotSet)
    }

    /// Replace the numerical solver.
    pub fn set_solver(&mut self, solver: Arc<dyn CalibrationSolver>) {
        self.solver = solver;
    }

    /// The numerical solver.
    pub fn solver(&self) -> &Arc<dyn CalibrationSolver> {
        &self.solver
    }

    /// Camera with the given id.
    pub fn camera(&self, id: usize) -> Result<&Camera, CalibrationError> {
        self.cameras.camera(id)
    }

    /// Pose with the given id.
    pub fn pose(&self, id: usize) -> Result<&Pose, CalibrationError> {
        self.cameras.pose(id)
    }

    /// Cameras accumulated with [`CameraCalibration::add_image`].
    pub fn cameras(&self) -> &CameraSet {
        &self.cameras
    }

    /// Mutable access to the accumulated cameras.
    pub fn cameras_mut(&mut self) -> &mut CameraSet {
        &mut self.cameras
    }

    /// Filtered working copy of the last calibration run.
    pub fn filtered_cameras(&self) -> &CameraSet {
        &self.filtered
    }

    /// Fail with [`CalibrationError::FinderNotSet`] if no finder is installed.
    pub fn check(&self) -> Result<(), CalibrationError> {
        self.finder().map(|_| ())
    }

    /// Poses need strictly more correspondences than `n` to be calibrated.
    pub fn set_min_pose_correspondences(&mut self, n: usize) {
        self.min_pose_correspondences = n;
    }

    /// The correspondence threshold.
    pub fn min_pose_correspondences(&self) -> usize {
        self.min_pose_correspondences
    }

    /// Termination criteria handed to the solver.
    pub fn set_term_criteria(&mut self, criteria: TermCriteria) {
        self.criteria = criteria;
    }

    /// The termination criteria.
    pub fn term_criteria(&self) -> TermCriteria {
        self.criteria
    }

    /// Progress of the running calibration.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Write the filtered results back into `cs`.
    ///
    /// Cameras get their intrinsics, distortion and error. Poses are matched
    /// by id, get their transformation and reprojected points and are
    /// marked as accepted.
    pub fn commit(&self, cs: &mut CameraSet) {
        for filtered in self.filtered.iter() {
            let Ok(camera) = cs.camera_mut(filtered.id) else {
                log::warn!("camera {} vanished before commit", filtered.id);
                continue;
            };
            camera.intrinsic = filtered.intrinsic;
            camera.distortion = filtered.distortion.clone();
            camera.error = filtered.error;

            for result in &filtered.poses {
                if let Some(pose) = camera.pose_mut(result.id) {
                    pose.transformation = result.transformation;
                    pose.projected2d = result.projected2d.clone();
                    pose.rejected = false;
                }
            }
        }
    }

    /// Run the finder over every pose of a camera.
    pub(crate) fn find_correspondences(&self, camera: &mut Camera) -> Result<(), CalibrationError> {
        let finder = self.finder()?;
        let progress = &self.progress;
        let find = |pose: &mut Pose| -> Result<(), CalibrationError> {
            finder.find(pose)?;
            progress.increment();
            Ok(())
        };

        if finder.supports_parallel() {
            camera.poses.par_iter_mut().try_for_each(find)
        } else {
            camera.poses.iter_mut().try_for_each(find)
        }
    }

    /// Run the finder over the poses of two cameras, paired by position.
    pub(crate) fn find_pair_correspondences(
        &self,
        camera1: &mut Camera,
        camera2: &mut Camera,
    ) -> Result<(), CalibrationError> {
        let finder = self.finder()?;
        let progress = &self.progress;
        let find = |(pose1, pose2): (&mut Pose, &mut Pose)| -> Result<(), CalibrationError> {
            finder.find(pose1)?;
            progress.increment();
            finder.find(pose2)?;
            progress.increment();
            Ok(())
        };

        if finder.supports_parallel() {
            camera1
                .poses
                .par_iter_mut()
                .zip(camera2.poses.par_iter_mut())
                .try_for_each(find)
        } else {
            camera1
                .poses
                .iter_mut()
                .zip(camera2.poses.iter_mut())
                .try_for_each(find)
        }
    }

    pub(crate) fn start_progress(&self, cs: &CameraSet) {
        self.progress.reset(cs.pose_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::{FnFinder, Pattern, PrecomputedFinder};
    use kornia_image::{Image, ImageSize};

    fn image(width: usize, height: usize) -> Arc<PoseImage> {
        Arc::new(Image::from_size_val(ImageSize { width, height }, 0u8).expect("valid image"))
    }

    fn calibration() -> CameraCalibration {
        let mut calib = CameraCalibration::new();
        calib.set_finder(Arc::new(PrecomputedFinder::new(Pattern::chessboard(3, 3, 1.0))));
        calib
    }

    #[test]
    fn test_add_image_requires_finder() {
        let mut calib = CameraCalibration::new();
        assert!(matches!(
            calib.add_image(image(4, 4), 0),
            Err(CalibrationError::FinderNotSet)
        ));
        assert!(matches!(calib.check(), Err(CalibrationError::FinderNotSet)));
    }

    #[test]
    fn test_add_image_ids_and_sizes() -> Result<(), CalibrationError> {
        let mut calib = calibration();
        assert_eq!(calib.add_image(image(8, 6), 0)?, 0);
        assert_eq!(calib.add_image(image(4, 4), 1)?, 1);
        assert_eq!(calib.add_image(image(8, 6), 0)?, 2);

        assert_eq!(calib.camera(0)?.image_size, ImageSize { width: 8, height: 6 });
        assert_eq!(calib.camera(0)?.poses.len(), 2);
        assert_eq!(calib.pose(1)?.id, 1);

        let res = calib.add_image(image(6, 8), 0);
        assert!(matches!(
            res,
            Err(CalibrationError::DimensionMismatch { camera_id: 0, .. })
        ));
        // the failed image neither consumed an id nor added a pose
        assert_eq!(calib.camera(0)?.poses.len(), 2);
        assert_eq!(calib.add_image(image(4, 4), 1)?, 3);
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<(), CalibrationError> {
        let mut calib = calibration();
        calib.add_image(image(8, 6), 0)?;
        calib.clear();
        assert!(matches!(calib.camera(0), Err(CalibrationError::CameraNotFound(0))));
        assert!(matches!(calib.pose(0), Err(CalibrationError::PoseNotFound(0))));
        assert_eq!(calib.add_image(image(8, 6), 0)?, 0);
        Ok(())
    }

    #[test]
    fn test_find_correspondences_progress() -> Result<(), CalibrationError> {
        let mut calib = CameraCalibration::new();
        calib.set_finder(Arc::new(
            FnFinder::new(|pose: &mut Pose| {
                pose.point_indices = vec![0; pose.id + 1];
                Ok(())
            })
            .with_parallel(true),
        ));
        for _ in 0..8 {
            calib.add_image(image(2, 2), 0)?;
        }

        let mut cs = calib.cameras().clone();
        calib.start_progress(&cs);
        calib.find_correspondences(cs.camera_mut(0)?)?;

        let progress = calib.progress();
        assert_eq!(progress.processed(), 8);
        assert_eq!(progress.total(), 8);
        for (i, pose) in cs.camera(0)?.poses.iter().enumerate() {
            assert_eq!(pose.point_indices.len(), i + 1);
        }
        Ok(())
    }

    #[test]
    fn test_commit() -> Result<(), CalibrationError> {
        let mut calib = calibration();
        calib.add_image(image(8, 6), 0)?;
        calib.add_image(image(8, 6), 0)?;
        let mut cs = calib.cameras().clone();
        for pose in cs.camera_mut(0)?.poses.iter_mut() {
            pose.rejected = true;
        }

        let mut filtered = cs.camera(0)?.empty_copy();
        filtered.intrinsic[(0, 0)] = 100.0;
        filtered.distortion = vec![0.0; 5];
        filtered.error = 0.5;
        let mut pose = Pose::new(1, None);
        pose.transformation[(0, 3)] = 2.0;
        pose.projected2d = vec![[1.0, 1.0]];
        filtered.poses.push(pose);
        calib.filtered.insert(filtered);

        calib.commit(&mut cs);
        let cam = cs.camera(0)?;
        assert_eq!(cam.intrinsic[(0, 0)], 100.0);
        assert_eq!(cam.error, 0.5);
        assert!(cam.poses[0].rejected);
        assert!(!cam.poses[1].rejected);
        assert_eq!(cam.poses[1].transformation[(0, 3)], 2.0);
        assert_eq!(cam.poses[1].projected2d, vec![[1.0, 1.0]]);
        Ok(())
    }
}

use std::ops::{Deref, DerefMut};

use kornia_3d::calib::{CalibFlags, CameraObservations, TermCriteria};
use kornia_3d::linalg::rvec_to_rotation;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::CameraCalibration;
use crate::camera::{Camera, CameraSet};
use crate::error::CalibrationError;
use crate::solver::CalibrationSolver;

/// Options of the single camera calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleCalibrationConfig {
    /// Hold the principal point at its initial value.
    pub fix_principal_point: bool,
    /// Hold the ratio fx/fy at its initial value.
    pub fix_aspect_ratio: bool,
    /// Estimate the tangential distortion coefficients.
    pub tangential_distortion: bool,
    /// Seed the refinement with the camera intrinsics.
    pub use_intrinsic_guess: bool,
}

impl Default for SingleCalibrationConfig {
    fn default() -> Self {
        Self {
            fix_principal_point: false,
            fix_aspect_ratio: false,
            tangential_distortion: true,
            use_intrinsic_guess: false,
        }
    }
}

impl SingleCalibrationConfig {
    /// Set whether the principal point is fixed.
    pub fn with_fix_principal_point(mut self, value: bool) -> Self {
        self.fix_principal_point = value;
        self
    }

    /// Set whether the aspect ratio is fixed.
    pub fn with_fix_aspect_ratio(mut self, value: bool) -> Self {
        self.fix_aspect_ratio = value;
        self
    }

    /// Set whether tangential distortion is estimated.
    pub fn with_tangential_distortion(mut self, value: bool) -> Self {
        self.tangential_distortion = value;
        self
    }

    /// Set whether the camera intrinsics seed the refinement.
    pub fn with_use_intrinsic_guess(mut self, value: bool) -> Self {
        self.use_intrinsic_guess = value;
        self
    }

    /// Solver option bits.
    pub fn flags(&self) -> CalibFlags {
        let mut flags = CalibFlags::NONE;
        flags.set(CalibFlags::FIX_PRINCIPAL_POINT, self.fix_principal_point);
        flags.set(CalibFlags::FIX_ASPECT_RATIO, self.fix_aspect_ratio);
        flags.set(CalibFlags::ZERO_TANGENT_DIST, !self.tangential_distortion);
        flags.set(CalibFlags::USE_INTRINSIC_GUESS, self.use_intrinsic_guess);
        flags
    }
}

/// Calibrates every camera of a set on its own.
#[derive(Debug, Default)]
pub struct SingleCalibration {
    base: CameraCalibration,
    config: SingleCalibrationConfig,
}

impl Deref for SingleCalibration {
    type Target = CameraCalibration;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl DerefMut for SingleCalibration {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl SingleCalibration {
    /// Create a calibrator with the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a calibrator with the given options.
    pub fn with_config(config: SingleCalibrationConfig) -> Self {
        Self {
            base: CameraCalibration::default(),
            config,
        }
    }

    /// Set the solver options.
    pub fn configure(
        &mut self,
        fix_principal_point: bool,
        fix_aspect_ratio: bool,
        tangential_distortion: bool,
        use_intrinsic_guess: bool,
    ) {
        self.config = SingleCalibrationConfig {
            fix_principal_point,
            fix_aspect_ratio,
            tangential_distortion,
            use_intrinsic_guess,
        };
    }

    /// The solver options.
    pub fn config(&self) -> &SingleCalibrationConfig {
        &self.config
    }

    /// Solver option bits.
    pub fn flags(&self) -> CalibFlags {
        self.config.flags()
    }

    /// Calibrate every camera of `cs`.
    ///
    /// Runs the finder over all poses, drops the poses with too few
    /// correspondences, calibrates every camera with at least one remaining
    /// pose and writes the results back into `cs`. Cameras without a
    /// remaining pose are left untouched.
    pub fn calibrate(&mut self, cs: &mut CameraSet) -> Result<(), CalibrationError> {
        self.base.check()?;
        self.base.start_progress(cs);

        for camera in cs.iter_mut() {
            self.base.find_correspondences(camera)?;
        }

        self.filter(cs);

        let flags = self.flags();
        let solver = self.base.solver.clone();
        let criteria = self.base.criteria;
        for id in self.base.filtered.ids() {
            let camera = self.base.filtered.camera_mut(id)?;
            calibrate_filtered(camera, solver.as_ref(), flags, &criteria)?;
        }

        self.base.commit(cs);
        Ok(())
    }

    /// Calibrate the cameras accumulated with `add_image`.
    pub fn calibrate_accumulated(&mut self) -> Result<(), CalibrationError> {
        let mut cs = std::mem::take(&mut self.base.cameras);
        let res = self.calibrate(&mut cs);
        self.base.cameras = cs;
        res
    }

    /// Rebuild the filtered working set from `cs`.
    ///
    /// Every pose is marked rejected, the poses with more correspondences
    /// than the threshold are copied into the working set.
    pub fn filter(&mut self, cs: &mut CameraSet) {
        self.base.filtered.clear();
        let min = self.base.min_pose_correspondences();

        for camera in cs.iter_mut() {
            let mut filtered = camera.empty_copy();
            for pose in camera.poses.iter_mut() {
                pose.rejected = true;
                if pose.num_correspondences() <= min {
                    log::debug!(
                        "camera {}: pose {} has {} correspondences, need more than {}",
                        camera.id,
                        pose.id,
                        pose.num_correspondences(),
                        min
                    );
                    continue;
                }
                if pose.points2d.len() != pose.points3d.len() {
                    log::warn!(
                        "camera {}: pose {} has {} image points but {} pattern points",
                        camera.id,
                        pose.id,
                        pose.points2d.len(),
                        pose.points3d.len()
                    );
                    continue;
                }
                filtered.poses.push(pose.clone());
            }

            if filtered.poses.is_empty() {
                log::warn!("camera {}: no usable pose, skipping", camera.id);
                continue;
            }
            self.base.filtered.insert(filtered);
        }
    }
}

fn calibrate_filtered(
    camera: &mut Camera,
    solver: &dyn CalibrationSolver,
    flags: CalibFlags,
    criteria: &TermCriteria,
) -> Result<(), CalibrationError> {
    let object_points: Vec<Vec<[f64; 3]>> = camera.poses.iter().map(|p| p.points3d.clone()).collect();
    let image_points: Vec<Vec<[f64; 2]>> = camera.poses.iter().map(|p| p.points2d.clone()).collect();

    let observations = CameraObservations {
        image_points: &image_points,
        image_size: camera.image_size,
        camera_matrix: camera.intrinsic,
        dist_coeffs: &camera.distortion,
    };
    let res = solver.calibrate_camera(&object_points, &observations, flags, criteria)?;

    camera.intrinsic = res.camera_matrix;
    camera.distortion = res.dist_coeffs;
    camera.error = res.rms;

    for ((pose, rvec), tvec) in camera
        .poses
        .iter_mut()
        .zip(res.rvecs.iter())
        .zip(res.tvecs.iter())
    {
        let rotation = rvec_to_rotation(rvec);
        let translation = Vector3::from(*tvec);
        pose.set_rigid(&rotation, &translation);
        pose.projected2d = solver.project_points(
            &pose.points3d,
            &rotation,
            &translation,
            &camera.intrinsic,
            &camera.distortion,
        );
    }

    log::info!(
        "camera {}: fx {:.3} fy {:.3} cx {:.3} cy {:.3}, rms {:.4} px over {} poses",
        camera.id,
        camera.intrinsic[(0, 0)],
        camera.intrinsic[(1, 1)],
        camera.intrinsic[(0, 2)],
        camera.intrinsic[(1, 2)],
        camera.error,
        camera.poses.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Pose;

    #[test]
    fn test_single_flags() {
        let mut calib = SingleCalibration::new();
        assert_eq!(calib.flags(), CalibFlags::NONE);

        calib.configure(true, true, false, true);
        let flags = calib.flags();
        assert!(flags.contains(CalibFlags::FIX_PRINCIPAL_POINT));
        assert!(flags.contains(CalibFlags::FIX_ASPECT_RATIO));
        assert!(flags.contains(CalibFlags::ZERO_TANGENT_DIST));
        assert!(flags.contains(CalibFlags::USE_INTRINSIC_GUESS));

        let config = SingleCalibrationConfig::default().with_fix_aspect_ratio(true);
        assert_eq!(config.flags(), CalibFlags::FIX_ASPECT_RATIO);
    }

    #[test]
    fn test_single_filter() -> Result<(), CalibrationError> {
        let mut cs = CameraSet::new();
        let mut cam = Camera::new(0);
        for (id, n) in [(0, 3), (1, 4), (2, 10)] {
            let mut pose = Pose::new(id, None);
            pose.point_indices = (0..n).collect();
            pose.points2d = vec![[0.0; 2]; n];
            pose.points3d = vec![[0.0; 3]; n];
            cam.poses.push(pose);
        }
        cs.insert(cam);

        let mut weak = Camera::new(1);
        let mut pose = Pose::new(3, None);
        pose.point_indices = vec![0, 1];
        weak.poses.push(pose);
        cs.insert(weak);

        let mut calib = SingleCalibration::new();
        calib.filter(&mut cs);

        let filtered = calib.filtered_cameras();
        assert_eq!(filtered.len(), 1);
        let ids: Vec<usize> = filtered.camera(0)?.poses.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(cs.camera(1)?.poses[0].rejected);
        assert!(cs.camera(0)?.poses.iter().all(|p| p.rejected));
        Ok(())
    }
}

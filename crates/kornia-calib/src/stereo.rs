use std::ops::{Deref, DerefMut};

use kornia_3d::calib::{CalibFlags, CameraObservations, StereoCalibrationResult};
use kornia_3d::linalg::rigid_to_matrix4;
use nalgebra::{Matrix3, Matrix4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::CameraCalibration;
use crate::camera::{Camera, CameraSet};
use crate::error::{CalibrationError, ValidationError};
use crate::pose::Pose;
use crate::solver::CalibrationSolver;

/// Options of the stereo calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StereoCalibrationConfig {
    /// Express the poses relative to the pattern instead of the first camera.
    pub relative_to_pattern: bool,
    /// Hold the principal points at their initial values.
    pub fix_principal_point: bool,
    /// Hold the ratios fx/fy at their initial values.
    pub fix_aspect_ratio: bool,
    /// Both cameras share one focal length.
    pub same_focal_length: bool,
    /// Estimate the tangential distortion coefficients.
    pub tangential_distortion: bool,
    /// Keep the camera intrinsics fixed, only the relative pose is solved.
    pub fix_intrinsic: bool,
    /// Seed the refinement with the camera intrinsics.
    pub use_intrinsic_guess: bool,
}

impl Default for StereoCalibrationConfig {
    fn default() -> Self {
        Self {
            relative_to_pattern: true,
            fix_principal_point: false,
            fix_aspect_ratio: false,
            same_focal_length: false,
            tangential_distortion: true,
            fix_intrinsic: false,
            use_intrinsic_guess: false,
        }
    }
}

impl StereoCalibrationConfig {
    /// Solver option bits.
    pub fn flags(&self) -> CalibFlags {
        let mut flags = CalibFlags::NONE;
        flags.set(CalibFlags::FIX_PRINCIPAL_POINT, self.fix_principal_point);
        flags.set(CalibFlags::FIX_ASPECT_RATIO, self.fix_aspect_ratio);
        flags.set(CalibFlags::SAME_FOCAL_LENGTH, self.same_focal_length);
        flags.set(CalibFlags::ZERO_TANGENT_DIST, !self.tangential_distortion);
        flags.set(CalibFlags::FIX_INTRINSIC, self.fix_intrinsic);
        flags.set(CalibFlags::USE_INTRINSIC_GUESS, self.use_intrinsic_guess);
        flags
    }
}

/// Calibrates a pair of cameras observing the same pattern.
///
/// Poses are paired by position: the `p`-th pose of the first camera and
/// the `p`-th pose of the second camera form frame `p`.
#[derive(Debug, Default)]
pub struct StereoCalibration {
    base: CameraCalibration,
    config: StereoCalibrationConfig,
    result: Option<StereoCalibrationResult>,
}

impl Deref for StereoCalibration {
    type Target = CameraCalibration;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl DerefMut for StereoCalibration {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl StereoCalibration {
    /// Create a calibrator with the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a calibrator with the given options.
    pub fn with_config(config: StereoCalibrationConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Set the solver options.
    pub fn configure(
        &mut self,
        relative_to_pattern: bool,
        fix_principal_point: bool,
        fix_aspect_ratio: bool,
        same_focal_length: bool,
        tangential_distortion: bool,
    ) {
        self.config.relative_to_pattern = relative_to_pattern;
        self.config.fix_principal_point = fix_principal_point;
        self.config.fix_aspect_ratio = fix_aspect_ratio;
        self.config.same_focal_length = same_focal_length;
        self.config.tangential_distortion = tangential_distortion;
    }

    /// Express the poses relative to the pattern or to the first camera.
    pub fn set_relative_to_pattern(&mut self, value: bool) {
        self.config.relative_to_pattern = value;
    }

    /// Share one focal length between both cameras.
    pub fn set_same_focal_length(&mut self, value: bool) {
        self.config.same_focal_length = value;
    }

    /// Keep the camera intrinsics fixed.
    pub fn set_fix_intrinsic(&mut self, value: bool) {
        self.config.fix_intrinsic = value;
    }

    /// Seed the refinement with the camera intrinsics.
    pub fn set_use_intrinsic_guess(&mut self, value: bool) {
        self.config.use_intrinsic_guess = value;
    }

    /// The solver options.
    pub fn config(&self) -> &StereoCalibrationConfig {
        &self.config
    }

    /// Solver option bits.
    pub fn flags(&self) -> CalibFlags {
        self.config.flags()
    }

    /// Solver output of the last run, `None` until a run produced one.
    pub fn result(&self) -> Option<&StereoCalibrationResult> {
        self.result.as_ref()
    }

    /// Essential matrix of the last run.
    pub fn essential(&self) -> Option<Matrix3<f64>> {
        self.result.as_ref().map(|r| r.essential)
    }

    /// Fundamental matrix of the last run.
    pub fn fundamental(&self) -> Option<Matrix3<f64>> {
        self.result.as_ref().map(|r| r.fundamental)
    }

    /// Transformation from the first to the second camera of the last run.
    pub fn relative_transform(&self) -> Option<Matrix4<f64>> {
        self.result
            .as_ref()
            .map(|r| rigid_to_matrix4(&r.rotation, &r.translation))
    }

    /// Calibrate the two cameras of `cs`.
    ///
    /// # Errors
    ///
    /// [`ValidationError::CameraCount`] unless `cs` holds exactly two cameras,
    /// [`ValidationError::PoseCountMismatch`] if they hold a different number
    /// of poses and [`ValidationError::ImageSizeMismatch`] if their image
    /// sizes differ while the intrinsics are neither fixed nor guessed.
    pub fn calibrate(&mut self, cs: &mut CameraSet) -> Result<(), CalibrationError> {
        self.result = None;
        self.base.check()?;
        validate_pair(cs)?;
        self.base.start_progress(cs);

        let count = cs.len();
        let (camera1, camera2) = cs.pair_mut().ok_or(ValidationError::CameraCount(count))?;
        self.base.find_pair_correspondences(camera1, camera2)?;

        self.filter(cs)?;
        if self.base.filtered.len() != 2 {
            log::warn!("no stereo frame left after filtering, nothing to calibrate");
            return Ok(());
        }

        self.stereo_calibrate()?;
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

    /// Rebuild the filtered working set from the frames of `cs`.
    ///
    /// Both poses of every frame are marked rejected, the frames accepted by
    /// [`StereoCalibration::check_frame`] are copied into the working set.
    /// The result of a previous run is dropped.
    pub fn filter(&mut self, cs: &mut CameraSet) -> Result<(), CalibrationError> {
        self.base.filtered.clear();
        self.result = None;
        validate_pair(cs)?;

        let count = cs.len();
        let (camera1, camera2) = cs.pair_mut().ok_or(ValidationError::CameraCount(count))?;

        let intrinsics_given = self.config.use_intrinsic_guess || self.config.fix_intrinsic;
        if !intrinsics_given && camera1.image_size != camera2.image_size {
            return Err(ValidationError::ImageSizeMismatch {
                first: camera1.id,
                second: camera2.id,
                first_size: camera1.image_size,
                second_size: camera2.image_size,
            }
            .into());
        }

        let mut filtered1 = camera1.empty_copy();
        let mut filtered2 = camera2.empty_copy();
        for (frame, (pose1, pose2)) in camera1
            .poses
            .iter_mut()
            .zip(camera2.poses.iter_mut())
            .enumerate()
        {
            pose1.rejected = true;
            pose2.rejected = true;

            if Self::check_frame(pose1, pose2) {
                filtered1.poses.push(pose1.clone());
                filtered2.poses.push(pose2.clone());
            } else {
                log::warn!(
                    "frame {frame} rejected: poses {} and {} do not share their correspondences",
                    pose1.id,
                    pose2.id
                );
            }
        }

        if !filtered1.poses.is_empty() {
            self.base.filtered.insert(filtered1);
            self.base.filtered.insert(filtered2);
        }
        Ok(())
    }

    /// Returns true if both poses detected the same pattern points in the same order.
    pub fn check_frame(pose1: &Pose, pose2: &Pose) -> bool {
        if pose1.points2d.is_empty()
            || pose1.point_indices.is_empty()
            || pose1.points2d.len() != pose2.points2d.len()
            || pose1.point_indices.len() != pose2.point_indices.len()
        {
            return false;
        }
        pose1.point_indices == pose2.point_indices
    }

    fn stereo_calibrate(&mut self) -> Result<(), CalibrationError> {
        let flags = self.flags();
        let criteria = self.base.criteria;
        let relative_to_pattern = self.config.relative_to_pattern;
        let solver = self.base.solver.clone();
        let (camera1, camera2) = self
            .base
            .filtered
            .pair_mut()
            .ok_or(ValidationError::CameraCount(0))?;

        let object_points: Vec<Vec<[f64; 3]>> =
            camera1.poses.iter().map(|p| p.points3d.clone()).collect();
        let image_points1: Vec<Vec<[f64; 2]>> =
            camera1.poses.iter().map(|p| p.points2d.clone()).collect();
        let image_points2: Vec<Vec<[f64; 2]>> =
            camera2.poses.iter().map(|p| p.points2d.clone()).collect();

        let res = solver.stereo_calibrate(
            &object_points,
            &CameraObservations {
                image_points: &image_points1,
                image_size: camera1.image_size,
                camera_matrix: camera1.intrinsic,
                dist_coeffs: &camera1.distortion,
            },
            &CameraObservations {
                image_points: &image_points2,
                image_size: camera2.image_size,
                camera_matrix: camera2.intrinsic,
                dist_coeffs: &camera2.distortion,
            },
            flags,
            &criteria,
        )?;

        camera1.intrinsic = res.camera_matrix1;
        camera1.distortion = res.dist_coeffs1.clone();
        camera1.error = res.rms;
        camera2.intrinsic = res.camera_matrix2;
        camera2.distortion = res.dist_coeffs2.clone();
        camera2.error = res.rms;

        solve_frame_poses(camera1, camera2, solver.as_ref())?;

        if !relative_to_pattern {
            let relative = rigid_to_matrix4(&res.rotation, &res.translation);
            for (pose1, pose2) in camera1.poses.iter_mut().zip(camera2.poses.iter_mut()) {
                pose1.transformation = Matrix4::identity();
                pose2.transformation = relative;
            }
        }

        log::info!(
            "stereo cameras {} and {}: rms {:.4} px over {} frames, baseline {:.4}",
            camera1.id,
            camera2.id,
            res.rms,
            camera1.poses.len(),
            res.translation.norm()
        );

        self.result = Some(res);
        Ok(())
    }
}

fn validate_pair(cs: &CameraSet) -> Result<(), ValidationError> {
    if cs.len() != 2 {
        return Err(ValidationError::CameraCount(cs.len()));
    }
    let counts: Vec<usize> = cs.iter().map(|c| c.poses.len()).collect();
    if counts[0] != counts[1] {
        return Err(ValidationError::PoseCountMismatch(counts[0], counts[1]));
    }
    Ok(())
}

/// Pattern pose of every frame in each camera, reprojecting the pattern through it.
fn solve_frame_poses(
    camera1: &mut Camera,
    camera2: &mut Camera,
    solver: &dyn CalibrationSolver,
) -> Result<(), CalibrationError> {
    let (k1, d1) = (camera1.intrinsic, camera1.distortion.clone());
    let (k2, d2) = (camera2.intrinsic, camera2.distortion.clone());

    camera1
        .poses
        .par_iter_mut()
        .zip(camera2.poses.par_iter_mut())
        .try_for_each(|(pose1, pose2)| -> Result<(), CalibrationError> {
            for (pose, k, d) in [(pose1, &k1, &d1), (pose2, &k2, &d2)] {
                let (rotation, translation) = solver.solve_pnp(&pose.points3d, &pose.points2d, k, d)?;
                pose.set_rigid(&rotation, &translation);
                pose.projected2d = solver.project_points(&pose.points3d, &rotation, &translation, k, d);
            }
            Ok(())
        })
}

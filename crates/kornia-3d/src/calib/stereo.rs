use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::mono::{calibrate_camera, initial_intrinsics, initial_poses};
use super::params::{pose_from_slice, view_residuals, IntrinsicMask, Intrinsics};
use super::{validate_views, CalibError, CalibFlags, CameraObservations, TermCriteria};
use crate::linalg::{rotation_to_rvec, skew};
use crate::optim::{jacobian_step, LeastSquaresProblem, OptimizerError};

/// Result of a stereo calibration.
///
/// `rotation` and `translation` map points from the first camera frame to
/// the second: `p2 = R * p1 + T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibrationResult {
    /// Camera matrix of the first camera.
    pub camera_matrix1: Matrix3<f64>,
    /// Distortion coefficients of the first camera.
    pub dist_coeffs1: Vec<f64>,
    /// Camera matrix of the second camera.
    pub camera_matrix2: Matrix3<f64>,
    /// Distortion coefficients of the second camera.
    pub dist_coeffs2: Vec<f64>,
    /// Rotation from the first to the second camera.
    pub rotation: Matrix3<f64>,
    /// Translation from the first to the second camera.
    pub translation: Vector3<f64>,
    /// Essential matrix `[T]x R`.
    pub essential: Matrix3<f64>,
    /// Fundamental matrix `K2^-T E K1^-1`, scaled so that `F[2][2] == 1` when possible.
    pub fundamental: Matrix3<f64>,
    /// Reprojection RMS over the points of both cameras in pixels.
    pub rms: f64,
    /// Number of refinement iterations.
    pub iterations: usize,
}

/// Calibrate a camera pair observing the same target.
///
/// Unless [`CalibFlags::FIX_INTRINSIC`] is set each camera is first calibrated
/// on its own. The relative pose is initialized with the per-component
/// median over the views and everything is then refined together.
///
/// # Arguments
///
/// * `object_points` - Target points per view, shared by both cameras.
/// * `camera1` - Observations of the first camera.
/// * `camera2` - Observations of the second camera.
/// * `flags` - Calibration options.
/// * `criteria` - Termination criteria of the refinement.
pub fn stereo_calibrate(
    object_points: &[Vec<[f64; 3]>],
    camera1: &CameraObservations,
    camera2: &CameraObservations,
    flags: CalibFlags,
    criteria: &TermCriteria,
) -> Result<StereoCalibrationResult, CalibError> {
    let total_points = validate_views(object_points, camera1.image_points)?;
    validate_views(object_points, camera2.image_points)?;
    for camera in [camera1, camera2] {
        if camera.image_size.is_empty() {
            return Err(CalibError::InvalidImageSize(camera.image_size));
        }
    }

    let fix_intrinsic = flags.contains(CalibFlags::FIX_INTRINSIC);
    let same_focal = flags.contains(CalibFlags::SAME_FOCAL_LENGTH) && !fix_intrinsic;

    let (mut intr1, mut intr2, poses1, poses2) = if fix_intrinsic {
        let intr1 = initial_intrinsics(object_points, camera1, flags)?;
        let intr2 = initial_intrinsics(object_points, camera2, flags)?;
        let poses1 = initial_poses(object_points, camera1.image_points, &intr1)?;
        let poses2 = initial_poses(object_points, camera2.image_points, &intr2)?;
        (intr1, intr2, poses1, poses2)
    } else {
        let mono_flags = flags
            & (CalibFlags::USE_INTRINSIC_GUESS
                | CalibFlags::FIX_ASPECT_RATIO
                | CalibFlags::FIX_PRINCIPAL_POINT
                | CalibFlags::ZERO_TANGENT_DIST);
        let mono1 = calibrate_camera(object_points, camera1, mono_flags, criteria)?;
        let mono2 = calibrate_camera(object_points, camera2, mono_flags, criteria)?;
        log::debug!(
            "stereo init: camera rms {:.4} px and {:.4} px",
            mono1.rms,
            mono2.rms
        );

        let to_poses = |rvecs: &[[f64; 3]], tvecs: &[[f64; 3]]| -> Vec<[f64; 6]> {
            rvecs
                .iter()
                .zip(tvecs.iter())
                .map(|(r, t)| [r[0], r[1], r[2], t[0], t[1], t[2]])
                .collect()
        };
        (
            Intrinsics::new(&mono1.camera_matrix, &mono1.dist_coeffs),
            Intrinsics::new(&mono2.camera_matrix, &mono2.dist_coeffs),
            to_poses(&mono1.rvecs, &mono1.tvecs),
            to_poses(&mono2.rvecs, &mono2.tvecs),
        )
    };

    if same_focal {
        let fx = 0.5 * (intr1.fx() + intr2.fx());
        let fy = 0.5 * (intr1.fy() + intr2.fy());
        intr1.set_focal(fx, fy);
        intr2.set_focal(fx, fy);
    }

    let relative = median_relative_pose(&poses1, &poses2);

    let mask1 = IntrinsicMask::from_flags(flags, &intr1);
    let mut mask2 = IntrinsicMask::from_flags(flags, &intr2);
    if same_focal {
        mask2.tie_focal();
    }

    let problem = StereoProblem::new(
        object_points,
        camera1.image_points,
        camera2.image_points,
        [mask1, mask2],
        [intr1, intr2],
        same_focal,
    );

    let mut x0 = Vec::with_capacity(problem.num_params());
    mask1.pack(&intr1, &mut x0);
    mask2.pack(&intr2, &mut x0);
    x0.extend_from_slice(&relative);
    for pose in &poses1 {
        x0.extend_from_slice(pose);
    }

    let result = criteria.optimizer().optimize(&problem, DVector::from_vec(x0))?;
    let (intr1, intr2) = problem.intrinsics(&result.params);
    let (rotation, translation) = pose_from_slice(problem.relative(&result.params));

    let essential = skew(&translation) * rotation;
    let fundamental = fundamental_from_essential(&essential, &intr1.matrix(), &intr2.matrix());

    let rms = (result.final_cost / (2 * total_points) as f64).sqrt();
    log::debug!(
        "stereo calibrated from {} views: rms {:.4} px, {} iterations, baseline {:.4}",
        object_points.len(),
        rms,
        result.iterations,
        translation.norm()
    );

    Ok(StereoCalibrationResult {
        camera_matrix1: intr1.matrix(),
        dist_coeffs1: intr1.dist_coeffs(),
        camera_matrix2: intr2.matrix(),
        dist_coeffs2: intr2.dist_coeffs(),
        rotation,
        translation,
        essential,
        fundamental,
        rms,
        iterations: result.iterations,
    })
}

/// Per-component median of the view-wise relative poses `R2 * R1^T`, `t2 - R * t1`.
fn median_relative_pose(poses1: &[[f64; 6]], poses2: &[[f64; 6]]) -> [f64; 6] {
    let mut components: [Vec<f64>; 6] = Default::default();
    for (p1, p2) in poses1.iter().zip(poses2.iter()) {
        let (r1, t1) = pose_from_slice(p1);
        let (r2, t2) = pose_from_slice(p2);
        let r = r2 * r1.transpose();
        let t = t2 - r * t1;
        let rvec = rotation_to_rvec(&r);
        for (i, v) in rvec.iter().chain(t.iter()).enumerate() {
            components[i].push(*v);
        }
    }

    let mut out = [0.0; 6];
    for (o, values) in out.iter_mut().zip(components.iter_mut()) {
        *o = median(values);
    }
    out
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

fn fundamental_from_essential(
    essential: &Matrix3<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Matrix3<f64> {
    let (Some(k1_inv), Some(k2_inv)) = (k1.try_inverse(), k2.try_inverse()) else {
        return Matrix3::zeros();
    };
    let mut f = k2_inv.transpose() * essential * k1_inv;
    let scale = f[(2, 2)];
    if scale.abs() > f64::EPSILON {
        f /= scale;
    }
    f
}

/// Joint reprojection problem of a camera pair.
///
/// Parameter layout: `[free intrinsics 1, free intrinsics 2, rvec, tvec,
/// rvec1_0, tvec1_0, ...]` where the view poses are relative to the first camera.
/// The residuals of a view hold the first camera points followed by the second.
struct StereoProblem<'a> {
    object_points: &'a [Vec<[f64; 3]>],
    image_points: [&'a [Vec<[f64; 2]>]; 2],
    masks: [IntrinsicMask; 2],
    bases: [Intrinsics; 2],
    same_focal: bool,
    num_free: [usize; 2],
    offsets: Vec<usize>,
    num_residuals: usize,
}

impl<'a> StereoProblem<'a> {
    fn new(
        object_points: &'a [Vec<[f64; 3]>],
        image_points1: &'a [Vec<[f64; 2]>],
        image_points2: &'a [Vec<[f64; 2]>],
        masks: [IntrinsicMask; 2],
        bases: [Intrinsics; 2],
        same_focal: bool,
    ) -> Self {
        let mut offsets = Vec::with_capacity(object_points.len());
        let mut num_residuals = 0;
        for obj in object_points {
            offsets.push(num_residuals);
            num_residuals += 4 * obj.len();
        }
        Self {
            object_points,
            image_points: [image_points1, image_points2],
            masks,
            bases,
            same_focal,
            num_free: [masks[0].num_free(), masks[1].num_free()],
            offsets,
            num_residuals,
        }
    }

    /// Number of parameters shared by every view.
    fn num_global(&self) -> usize {
        self.num_free[0] + self.num_free[1] + 6
    }

    fn intrinsics(&self, params: &DVector<f64>) -> (Intrinsics, Intrinsics) {
        let p = params.as_slice();
        let [n1, n2] = self.num_free;
        let intr1 = self.masks[0].unpack(&p[..n1], &self.bases[0]);
        let mut intr2 = self.masks[1].unpack(&p[n1..n1 + n2], &self.bases[1]);
        if self.same_focal {
            intr2.set_focal(intr1.fx(), intr1.fy());
        }
        (intr1, intr2)
    }

    fn relative<'p>(&self, params: &'p DVector<f64>) -> &'p [f64] {
        let start = self.num_free[0] + self.num_free[1];
        &params.as_slice()[start..start + 6]
    }

    fn pose<'p>(&self, params: &'p DVector<f64>, view: usize) -> &'p [f64] {
        let start = self.num_global() + 6 * view;
        &params.as_slice()[start..start + 6]
    }

    fn view_range(&self, view: usize) -> std::ops::Range<usize> {
        let start = self.offsets[view];
        start..start + 4 * self.object_points[view].len()
    }

    fn eval_view(
        &self,
        view: usize,
        intrinsics: &(Intrinsics, Intrinsics),
        relative: &[f64],
        pose: &[f64],
        out: &mut [f64],
    ) {
        let object = &self.object_points[view];
        let n = 2 * object.len();
        let (r1, t1) = pose_from_slice(pose);
        let (r, t) = pose_from_slice(relative);
        let r2 = r * r1;
        let t2 = r * t1 + t;

        let (intr1, intr2) = intrinsics;
        let (out1, out2) = out.split_at_mut(n);
        view_residuals(
            object,
            &self.image_points[0][view],
            &r1,
            &t1,
            &intr1.camera(),
            &intr1.distortion(),
            out1,
        );
        view_residuals(
            object,
            &self.image_points[1][view],
            &r2,
            &t2,
            &intr2.camera(),
            &intr2.distortion(),
            out2,
        );
    }
}

impl LeastSquaresProblem for StereoProblem<'_> {
    fn num_params(&self) -> usize {
        self.num_global() + 6 * self.object_points.len()
    }

    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn residuals(&self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), OptimizerError> {
        let intrinsics = self.intrinsics(params);
        let relative = self.relative(params);
        for view in 0..self.object_points.len() {
            let range = self.view_range(view);
            self.eval_view(
                view,
                &intrinsics,
                relative,
                self.pose(params, view),
                &mut out.as_mut_slice()[range],
            );
        }
        Ok(())
    }

    fn jacobian(&self, params: &DVector<f64>, jac: &mut DMatrix<f64>) -> Result<(), OptimizerError> {
        jac.fill(0.0);
        let m = self.num_residuals;

        // intrinsics of both cameras and the relative pose touch every view
        let mut x = params.clone();
        let mut r_plus = DVector::<f64>::zeros(m);
        let mut r_minus = DVector::<f64>::zeros(m);
        for j in 0..self.num_global() {
            let h = jacobian_step(params[j]);
            x[j] = params[j] + h;
            self.residuals(&x, &mut r_plus)?;
            x[j] = params[j] - h;
            self.residuals(&x, &mut r_minus)?;
            x[j] = params[j];

            let inv_2h = 1.0 / (2.0 * h);
            for i in 0..m {
                jac[(i, j)] = (r_plus[i] - r_minus[i]) * inv_2h;
            }
        }

        let intrinsics = self.intrinsics(params);
        let relative = self.relative(params);
        for view in 0..self.object_points.len() {
            let range = self.view_range(view);
            let col0 = self.num_global() + 6 * view;
            let mut pose = [0.0; 6];
            pose.copy_from_slice(self.pose(params, view));

            let mut plus = vec![0.0; range.len()];
            let mut minus = vec![0.0; range.len()];
            for k in 0..6 {
                let orig = pose[k];
                let h = jacobian_step(orig);
                pose[k] = orig + h;
                self.eval_view(view, &intrinsics, relative, &pose, &mut plus);
                pose[k] = orig - h;
                self.eval_view(view, &intrinsics, relative, &pose, &mut minus);
                pose[k] = orig;

                let inv_2h = 1.0 / (2.0 * h);
                for (i, row) in range.clone().enumerate() {
                    jac[(row, col0 + k)] = (plus[i] - minus[i]) * inv_2h;
                }
            }
        }

        Ok(())
    }
}

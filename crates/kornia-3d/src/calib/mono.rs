use kornia_image::ImageSize;
use nalgebra::{DMatrix, DVector, Matrix3};
use serde::{Deserialize, Serialize};

use super::init::init_intrinsics_planar;
use super::params::{pixel_rms, pose_from_slice, view_residuals, IntrinsicMask, Intrinsics};
use super::{validate_views, CalibError, CalibFlags, CameraObservations, TermCriteria};
use crate::optim::{jacobian_step, LeastSquaresProblem, OptimizerError};
use crate::pnp::{solve_pnp, LMRefineParams, PnPMethod};

/// Result of a single camera calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibrationResult {
    /// Refined 3x3 camera matrix.
    pub camera_matrix: Matrix3<f64>,
    /// Refined distortion coefficients `k1, k2, p1, p2, k3`.
    pub dist_coeffs: Vec<f64>,
    /// Target to camera rotation of every view, as Rodrigues vectors.
    pub rvecs: Vec<[f64; 3]>,
    /// Target to camera translation of every view.
    pub tvecs: Vec<[f64; 3]>,
    /// Reprojection RMS of every view in pixels.
    pub per_view_errors: Vec<f64>,
    /// Overall reprojection RMS in pixels.
    pub rms: f64,
    /// Number of refinement iterations.
    pub iterations: usize,
}

/// Calibrate a single camera from views of a calibration target.
///
/// Without [`CalibFlags::USE_INTRINSIC_GUESS`] the camera matrix is
/// initialized in closed form, which needs every view to be planar. The
/// pose of each view is then estimated and intrinsics, distortion and poses
/// are refined together by minimizing the reprojection error.
///
/// # Arguments
///
/// * `object_points` - Target points per view.
/// * `camera` - Observations and initial parameters of the camera.
/// * `flags` - Calibration options.
/// * `criteria` - Termination criteria of the refinement.
///
/// # Example
///
/// ```no_run
/// use kornia_3d::calib::{calibrate_camera, CalibFlags, CameraObservations, TermCriteria};
/// use kornia_image::ImageSize;
/// use nalgebra::Matrix3;
///
/// let object_points: Vec<Vec<[f64; 3]>> = vec![];
/// let image_points: Vec<Vec<[f64; 2]>> = vec![];
/// let camera = CameraObservations {
///     image_points: &image_points,
///     image_size: ImageSize { width: 640, height: 480 },
///     camera_matrix: Matrix3::identity(),
///     dist_coeffs: &[],
/// };
/// let res = calibrate_camera(&object_points, &camera, CalibFlags::NONE, &TermCriteria::default());
/// ```
pub fn calibrate_camera(
    object_points: &[Vec<[f64; 3]>],
    camera: &CameraObservations,
    flags: CalibFlags,
    criteria: &TermCriteria,
) -> Result<CameraCalibrationResult, CalibError> {
    let total_points = validate_views(object_points, camera.image_points)?;
    if camera.image_size.is_empty() {
        return Err(CalibError::InvalidImageSize(camera.image_size));
    }

    let mut intr = initial_intrinsics(object_points, camera, flags)?;
    if flags.contains(CalibFlags::ZERO_TANGENT_DIST) {
        intr.zero_tangential();
    }

    let poses = initial_poses(object_points, camera.image_points, &intr)?;
    let mask = IntrinsicMask::from_flags(flags, &intr);
    let problem = MonoProblem::new(object_points, camera.image_points, mask, intr);

    let mut x0 = Vec::with_capacity(problem.num_params());
    mask.pack(&intr, &mut x0);
    for pose in &poses {
        x0.extend_from_slice(pose);
    }

    let result = criteria.optimizer().optimize(&problem, DVector::from_vec(x0))?;
    let intr = problem.intrinsics(&result.params);

    let mut residuals = DVector::<f64>::zeros(problem.num_residuals());
    problem.residuals(&result.params, &mut residuals)?;

    let mut rvecs = Vec::with_capacity(poses.len());
    let mut tvecs = Vec::with_capacity(poses.len());
    let mut per_view_errors = Vec::with_capacity(poses.len());
    for v in 0..poses.len() {
        let pose = problem.pose(&result.params, v);
        rvecs.push([pose[0], pose[1], pose[2]]);
        tvecs.push([pose[3], pose[4], pose[5]]);
        per_view_errors.push(pixel_rms(&residuals.as_slice()[problem.view_range(v)]));
    }

    let rms = (result.final_cost / total_points as f64).sqrt();
    log::debug!(
        "camera calibrated from {} views: rms {:.4} px, {} iterations",
        poses.len(),
        rms,
        result.iterations
    );

    Ok(CameraCalibrationResult {
        camera_matrix: intr.matrix(),
        dist_coeffs: intr.dist_coeffs(),
        rvecs,
        tvecs,
        per_view_errors,
        rms,
        iterations: result.iterations,
    })
}

fn check_camera_matrix(k: &Matrix3<f64>, image_size: ImageSize) -> Result<(), CalibError> {
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    if !(fx > 0.0 && fy > 0.0) {
        return Err(CalibError::InvalidCameraMatrix(format!(
            "focal lengths must be positive, got ({fx}, {fy})"
        )));
    }
    if !(0.0..image_size.width as f64).contains(&cx) || !(0.0..image_size.height as f64).contains(&cy) {
        return Err(CalibError::InvalidCameraMatrix(format!(
            "principal point ({cx}, {cy}) outside of the image {image_size}"
        )));
    }
    Ok(())
}

pub(super) fn initial_intrinsics(
    object_points: &[Vec<[f64; 3]>],
    camera: &CameraObservations,
    flags: CalibFlags,
) -> Result<Intrinsics, CalibError> {
    let k = &camera.camera_matrix;
    if flags.contains(CalibFlags::USE_INTRINSIC_GUESS) || flags.contains(CalibFlags::FIX_INTRINSIC) {
        check_camera_matrix(k, camera.image_size)?;
        return Ok(Intrinsics::new(k, camera.dist_coeffs));
    }

    let aspect_ratio = if flags.contains(CalibFlags::FIX_ASPECT_RATIO) {
        let ratio = k[(0, 0)] / k[(1, 1)];
        if ratio.is_finite() && ratio > 0.0 {
            Some(ratio)
        } else {
            log::warn!("no usable aspect ratio in the camera matrix, fixing fx/fy to 1");
            Some(1.0)
        }
    } else {
        None
    };

    let k0 = init_intrinsics_planar(
        object_points,
        camera.image_points,
        camera.image_size,
        aspect_ratio,
    )?;

    Ok(Intrinsics::new(&k0, &[]))
}

/// Target pose of every view as `[rvec, tvec]`.
pub(super) fn initial_poses(
    object_points: &[Vec<[f64; 3]>],
    image_points: &[Vec<[f64; 2]>],
    intr: &Intrinsics,
) -> Result<Vec<[f64; 6]>, CalibError> {
    let k = intr.matrix();
    let distortion = intr.distortion();

    object_points
        .iter()
        .zip(image_points.iter())
        .map(|(obj, img)| {
            let res = solve_pnp(
                obj,
                img,
                &k,
                Some(&distortion),
                PnPMethod::Iterative(LMRefineParams::default()),
            )?;
            let t = res.translation;
            Ok([res.rvec.x, res.rvec.y, res.rvec.z, t.x, t.y, t.z])
        })
        .collect()
}

/// Joint reprojection problem over the free intrinsics and every view pose.
///
/// Parameter layout: `[free intrinsics, rvec_0, tvec_0, rvec_1, tvec_1, ...]`.
struct MonoProblem<'a> {
    object_points: &'a [Vec<[f64; 3]>],
    image_points: &'a [Vec<[f64; 2]>],
    mask: IntrinsicMask,
    base: Intrinsics,
    num_intrinsics: usize,
    offsets: Vec<usize>,
    num_residuals: usize,
}

impl<'a> MonoProblem<'a> {
    fn new(
        object_points: &'a [Vec<[f64; 3]>],
        image_points: &'a [Vec<[f64; 2]>],
        mask: IntrinsicMask,
        base: Intrinsics,
    ) -> Self {
        let mut offsets = Vec::with_capacity(object_points.len());
        let mut num_residuals = 0;
        for obj in object_points {
            offsets.push(num_residuals);
            num_residuals += 2 * obj.len();
        }
        Self {
            object_points,
            image_points,
            mask,
            base,
            num_intrinsics: mask.num_free(),
            offsets,
            num_residuals,
        }
    }

    fn intrinsics(&self, params: &DVector<f64>) -> Intrinsics {
        self.mask
            .unpack(&params.as_slice()[..self.num_intrinsics], &self.base)
    }

    fn pose<'p>(&self, params: &'p DVector<f64>, view: usize) -> &'p [f64] {
        let start = self.num_intrinsics + 6 * view;
        &params.as_slice()[start..start + 6]
    }

    fn view_range(&self, view: usize) -> std::ops::Range<usize> {
        let start = self.offsets[view];
        start..start + 2 * self.object_points[view].len()
    }

    fn eval_view(&self, view: usize, intr: &Intrinsics, pose: &[f64], out: &mut [f64]) {
        let (rotation, translation) = pose_from_slice(pose);
        view_residuals(
            &self.object_points[view],
            &self.image_points[view],
            &rotation,
            &translation,
            &intr.camera(),
            &intr.distortion(),
            out,
        );
    }
}

impl LeastSquaresProblem for MonoProblem<'_> {
    fn num_params(&self) -> usize {
        self.num_intrinsics + 6 * self.object_points.len()
    }

    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn residuals(&self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), OptimizerError> {
        let intr = self.intrinsics(params);
        for view in 0..self.object_points.len() {
            let range = self.view_range(view);
            self.eval_view(view, &intr, self.pose(params, view), &mut out.as_mut_slice()[range]);
        }
        Ok(())
    }

    /// The intrinsics move every residual, a view pose only moves the residuals of its view.
    fn jacobian(&self, params: &DVector<f64>, jac: &mut DMatrix<f64>) -> Result<(), OptimizerError> {
        jac.fill(0.0);
        let m = self.num_residuals;

        let mut x = params.clone();
        let mut r_plus = DVector::<f64>::zeros(m);
        let mut r_minus = DVector::<f64>::zeros(m);
        for j in 0..self.num_intrinsics {
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

        let intr = self.intrinsics(params);
        for view in 0..self.object_points.len() {
            let range = self.view_range(view);
            let col0 = self.num_intrinsics + 6 * view;
            let mut pose = [0.0; 6];
            pose.copy_from_slice(self.pose(params, view));

            let mut plus = vec![0.0; range.len()];
            let mut minus = vec![0.0; range.len()];
            for k in 0..6 {
                let orig = pose[k];
                let h = jacobian_step(orig);
                pose[k] = orig + h;
                self.eval_view(view, &intr, &pose, &mut plus);
                pose[k] = orig - h;
                self.eval_view(view, &intr, &pose, &mut minus);
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

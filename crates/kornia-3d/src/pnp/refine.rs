//! Levenberg-Marquardt pose refinement for PnP solutions.
//!
//! This module provides LM-based nonlinear refinement for camera pose estimates,
//! leveraging the dense optimizer in [`crate::optim`].

use nalgebra::{DVector, Matrix3, Vector3};

use crate::camera::{project_camera_point, CameraIntrinsic, PolynomialDistortion};
use crate::linalg::{rotation_to_rvec, rvec_to_rotation};
use crate::optim::{LeastSquaresProblem, LevenbergMarquardt, OptimizerError};

use super::ops::reprojection_rmse;
use super::{check_correspondences, PnPError, PnPResult};

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone)]
pub struct LMRefineParams {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on cost function change.
    pub cost_tolerance: f64,
    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
    /// Initial damping factor (lambda).
    pub initial_lambda: f64,
}

impl Default for LMRefineParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
            initial_lambda: 1e-3,
        }
    }
}

impl LMRefineParams {
    /// Create default refinement parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iters: usize) -> Self {
        self.max_iterations = max_iters;
        self
    }

    /// Set cost tolerance.
    pub fn with_cost_tolerance(mut self, tol: f64) -> Self {
        self.cost_tolerance = tol;
        self
    }

    /// Set gradient tolerance.
    pub fn with_gradient_tolerance(mut self, tol: f64) -> Self {
        self.gradient_tolerance = tol;
        self
    }

    /// Set initial lambda.
    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }
}

/// Reprojection residuals of a single pose parameterized as `[rvec, tvec]`.
///
/// Residual: `r = [u_hat - u, v_hat - v]` for every correspondence
/// where `(u_hat, v_hat) = project(R * P_world + t)`.
struct PoseReprojection<'a> {
    points_world: &'a [[f64; 3]],
    points_image: &'a [[f64; 2]],
    intrinsic: CameraIntrinsic,
    distortion: Option<&'a PolynomialDistortion>,
}

impl LeastSquaresProblem for PoseReprojection<'_> {
    fn num_params(&self) -> usize {
        6
    }

    fn num_residuals(&self) -> usize {
        2 * self.points_world.len()
    }

    fn residuals(&self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), OptimizerError> {
        let r = rvec_to_rotation(&[params[0], params[1], params[2]]);
        let t = Vector3::new(params[3], params[4], params[5]);

        for (i, (pw, uv)) in self.points_world.iter().zip(self.points_image.iter()).enumerate() {
            let pc = r * Vector3::from(*pw) + t;
            let [u_hat, v_hat] = project_camera_point(&pc, &self.intrinsic, self.distortion);
            out[2 * i] = u_hat - uv[0];
            out[2 * i + 1] = v_hat - uv[1];
        }
        Ok(())
    }
}

/// Refine a PnP pose estimate using Levenberg-Marquardt optimization.
///
/// This function takes an initial pose estimate (typically from EPnP or similar)
/// and refines it by minimizing the reprojection error across all correspondences.
///
/// # Arguments
///
/// * `points_world` - 3D points in world coordinates
/// * `points_image` - Corresponding 2D points in image coordinates
/// * `k` - Camera intrinsic matrix
/// * `initial_rotation` - Initial rotation estimate
/// * `initial_translation` - Initial translation estimate
/// * `distortion` - Optional camera distortion model
/// * `params` - LM refinement parameters
///
/// # Returns
///
/// Refined `PnPResult` with updated rotation, translation, and convergence info.
pub fn refine_pose_lm(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &Matrix3<f64>,
    initial_rotation: &Matrix3<f64>,
    initial_translation: &Vector3<f64>,
    distortion: Option<&PolynomialDistortion>,
    params: &LMRefineParams,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 3)?;

    let problem = PoseReprojection {
        points_world,
        points_image,
        intrinsic: CameraIntrinsic::from_matrix(k),
        distortion,
    };

    let rvec = rotation_to_rvec(initial_rotation);
    let x0 = DVector::from_vec(vec![
        rvec[0],
        rvec[1],
        rvec[2],
        initial_translation.x,
        initial_translation.y,
        initial_translation.z,
    ]);

    // Configure and run LM optimizer
    let optimizer = LevenbergMarquardt {
        lambda_init: params.initial_lambda,
        max_iterations: params.max_iterations,
        cost_tolerance: params.cost_tolerance,
        gradient_tolerance: params.gradient_tolerance,
        ..Default::default()
    };

    let result = optimizer.optimize(&problem, x0)?;
    let x = &result.params;

    let refined_rvec = Vector3::new(x[0], x[1], x[2]);
    let refined_rotation = rvec_to_rotation(&[x[0], x[1], x[2]]);
    let refined_translation = Vector3::new(x[3], x[4], x[5]);

    let rmse = reprojection_rmse(
        points_world,
        points_image,
        &refined_rotation,
        &refined_translation,
        k,
        distortion,
    );

    Ok(PnPResult {
        rotation: refined_rotation,
        translation: refined_translation,
        rvec: refined_rvec,
        reproj_rmse: Some(rmse),
        num_iterations: Some(result.iterations),
        converged: Some(result.converged()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::project_points;
    use approx::assert_relative_eq;

    #[test]
    fn test_refine_recovers_perturbed_pose() -> Result<(), PnPError> {
        let intr = CameraIntrinsic {
            fx: 700.0,
            fy: 700.0,
            cx: 320.0,
            cy: 240.0,
        };
        let distortion = PolynomialDistortion::from_coeffs(&[-0.1, 0.01, 0.0, 0.0, 0.0]);
        let world: Vec<[f64; 3]> = (0..20)
            .map(|i| [0.05 * (i % 5) as f64, 0.05 * (i / 5) as f64, 0.02 * (i % 3) as f64])
            .collect();
        let r = rvec_to_rotation(&[0.2, 0.1, -0.3]);
        let t = Vector3::new(-0.1, -0.05, 0.8);
        let image = project_points(&world, &r, &t, &intr, Some(&distortion));

        let r0 = rvec_to_rotation(&[0.25, 0.05, -0.28]);
        let t0 = t + Vector3::new(0.02, -0.01, 0.05);

        let res = refine_pose_lm(
            &world,
            &image,
            &intr.matrix(),
            &r0,
            &t0,
            Some(&distortion),
            &LMRefineParams::default().with_max_iterations(50),
        )?;

        assert_relative_eq!(res.rotation, r, epsilon = 1e-7);
        assert_relative_eq!(res.translation, t, epsilon = 1e-7);
        assert!(res.reproj_rmse.unwrap_or(f64::MAX) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_refine_requires_three_points() {
        let res = refine_pose_lm(
            &[[0.0; 3]; 2],
            &[[0.0; 2]; 2],
            &Matrix3::identity(),
            &Matrix3::identity(),
            &Vector3::zeros(),
            None,
            &LMRefineParams::default(),
        );
        assert!(matches!(
            res,
            Err(PnPError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            })
        ));
    }
}

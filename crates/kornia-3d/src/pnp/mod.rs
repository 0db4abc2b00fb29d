//! Perspective-n-Point (PnP) solvers.

/// EPnP solver implementation.
pub mod epnp;

/// Homography based solver for planar targets.
pub mod planar;

/// LM-based pose refinement.
pub mod refine;

mod ops;

pub use epnp::{EPnP, EPnPParams};
pub use planar::{PlanarPnP, PlanarPnPParams};
pub use refine::{refine_pose_lm, LMRefineParams};

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::camera::PolynomialDistortion;
use crate::pose::PlaneFrame;

/// Error types for PnP solvers.
#[derive(Debug, Error)]
pub enum PnPError {
    /// Invalid input data - insufficient correspondences for the specific solver.
    #[error("PnP solver requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required by the solver.
        required: usize,
        /// Actual number of correspondences provided.
        actual: usize,
    },

    /// Invalid input data - mismatched array lengths with descriptive labels.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice.
        left_name: &'static str,
        /// Length of the left-hand slice.
        left_len: usize,
        /// Label for the right-hand slice.
        right_name: &'static str,
        /// Length of the right-hand slice.
        right_len: usize,
    },

    /// The world points are not coplanar but a planar solver was requested.
    #[error("World points are not coplanar")]
    NonPlanarPoints,

    /// Singular value decomposition failed.
    #[error("SVD computation failed: {0}")]
    SvdFailed(String),

    /// Homography estimation failed.
    #[error(transparent)]
    Homography(#[from] crate::pose::HomographyError),

    /// Non-linear refinement failed.
    #[error(transparent)]
    Optimizer(#[from] crate::optim::OptimizerError),
}

/// Numeric tolerances used by linear algebra routines throughout the PnP pipeline.
#[derive(Debug, Clone)]
pub struct NumericTol {
    /// Tolerance for singular-value decomposition.
    pub svd: f64,
    /// Epsilon threshold for determinant / singular-value checks when deciding whether to fall back to a pseudo-inverse.
    pub eps: f64,
}

impl Default for NumericTol {
    fn default() -> Self {
        Self {
            svd: 1e-12,
            eps: 1e-12,
        }
    }
}

/// Result returned by any PnP solver.
///
/// The rotation matrix maps coordinates from the **world** frame to the
/// **camera** frame.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated rotation matrix.
    pub rotation: Matrix3<f64>,
    /// Estimated translation vector.
    pub translation: Vector3<f64>,
    /// Rodrigues axis-angle representation of the rotation.
    pub rvec: Vector3<f64>,
    /// Root-mean-square reprojection error in pixels (if computed).
    pub reproj_rmse: Option<f64>,
    /// Number of iterations taken (if applicable).
    pub num_iterations: Option<usize>,
    /// Whether the solver converged (if applicable).
    pub converged: Option<bool>,
}

/// Trait for PnP solvers.
pub trait PnPSolver {
    /// Solver-specific parameters.
    type Param;

    /// Solve for camera pose given 2D-3D correspondences.
    ///
    /// # Arguments
    /// - `world` – 3-D coordinates in the world frame.
    /// - `image` – Corresponding pixel coordinates.
    /// - `k` – Camera intrinsics matrix.
    /// - `distortion` – Optional camera distortion model (image-space).
    /// - `params` – Solver-specific parameters.
    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &Matrix3<f64>,
        distortion: Option<&PolynomialDistortion>,
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError>;
}

/// Enumeration of the Perspective-n-Point algorithms available in this module.
#[derive(Debug, Clone)]
pub enum PnPMethod {
    /// Efficient PnP solver with a user-supplied parameter object.
    EPnP(EPnPParams),
    /// Efficient PnP solver with the module's default parameters.
    EPnPDefault,
    /// Homography decomposition, coplanar world points only.
    Planar(PlanarPnPParams),
    /// Planar solver for coplanar points, EPnP otherwise, followed by LM refinement.
    Iterative(LMRefineParams),
}

/// Dispatch function that routes to the chosen PnP solver.
pub fn solve_pnp(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &Matrix3<f64>,
    distortion: Option<&PolynomialDistortion>,
    method: PnPMethod,
) -> Result<PnPResult, PnPError> {
    match method {
        PnPMethod::EPnP(params) => EPnP::solve(world, image, k, distortion, &params),
        PnPMethod::EPnPDefault => EPnP::solve(world, image, k, distortion, &EPnPParams::default()),
        PnPMethod::Planar(params) => PlanarPnP::solve(world, image, k, distortion, &params),
        PnPMethod::Iterative(refine) => {
            let init = if PlaneFrame::fit(world).is_some() {
                PlanarPnP::solve(world, image, k, distortion, &PlanarPnPParams::default())?
            } else {
                EPnP::solve(world, image, k, distortion, &EPnPParams::default())?
            };
            refine_pose_lm(
                world,
                image,
                k,
                &init.rotation,
                &init.translation,
                distortion,
                &refine,
            )
        }
    }
}

pub(crate) fn check_correspondences(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    required: usize,
) -> Result<(), PnPError> {
    if world.len() != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world.len(),
            right_name: "image points",
            right_len: image.len(),
        });
    }
    if world.len() < required {
        return Err(PnPError::InsufficientCorrespondences {
            required,
            actual: world.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{project_points, CameraIntrinsic};
    use crate::linalg::rvec_to_rotation;
    use approx::assert_relative_eq;

    fn scene(planar: bool) -> (Vec<[f64; 3]>, Vec<[f64; 2]>, Matrix3<f64>, Matrix3<f64>, Vector3<f64>) {
        let mut world = Vec::new();
        for i in 0..4 {
            for j in 0..3 {
                let z = if planar { 0.0 } else { 0.05 * ((i + j) % 3) as f64 };
                world.push([0.1 * i as f64, 0.1 * j as f64, z]);
            }
        }
        let intr = CameraIntrinsic {
            fx: 800.0,
            fy: 790.0,
            cx: 320.0,
            cy: 240.0,
        };
        let r = rvec_to_rotation(&[0.1, -0.2, 0.05]);
        let t = Vector3::new(-0.15, -0.1, 1.2);
        let image = project_points(&world, &r, &t, &intr, None);
        (world, image, intr.matrix(), r, t)
    }

    #[test]
    fn test_solve_pnp_iterative_planar() -> Result<(), PnPError> {
        let (world, image, k, r, t) = scene(true);
        let res = solve_pnp(&world, &image, &k, None, PnPMethod::Iterative(LMRefineParams::default()))?;
        assert_relative_eq!(res.rotation, r, epsilon = 1e-6);
        assert_relative_eq!(res.translation, t, epsilon = 1e-6);
        assert!(res.reproj_rmse.unwrap_or(f64::MAX) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_solve_pnp_iterative_general() -> Result<(), PnPError> {
        let (world, image, k, r, t) = scene(false);
        let res = solve_pnp(&world, &image, &k, None, PnPMethod::Iterative(LMRefineParams::default()))?;
        assert_relative_eq!(res.rotation, r, epsilon = 1e-6);
        assert_relative_eq!(res.translation, t, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_solve_pnp_errors() {
        let (world, image, k, _, _) = scene(true);
        let res = solve_pnp(&world[..3], &image[..3], &k, None, PnPMethod::EPnPDefault);
        assert!(matches!(
            res,
            Err(PnPError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            })
        ));
        let res = solve_pnp(&world, &image[..5], &k, None, PnPMethod::EPnPDefault);
        assert!(matches!(res, Err(PnPError::MismatchedArrayLengths { .. })));
    }
}

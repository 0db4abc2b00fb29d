//! Pose from a homography between a planar target and the image.

use nalgebra::{Matrix3, Vector3};

use super::ops::{reprojection_rmse, undistort_image_points};
use super::{check_correspondences, PnPError, PnPResult, PnPSolver};
use crate::camera::PolynomialDistortion;
use crate::linalg::rotation_to_rvec;
use crate::pose::{decompose_planar_homography, find_homography_dlt, PlaneFrame};

/// Marker type for the planar homography solver.
pub struct PlanarPnP;

/// Parameters controlling the planar solver.
#[derive(Debug, Clone, Default)]
pub struct PlanarPnPParams {
    /// Optional LM refinement after the homography decomposition.
    pub refine_lm: Option<super::LMRefineParams>,
}

impl PnPSolver for PlanarPnP {
    type Param = PlanarPnPParams;

    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &Matrix3<f64>,
        distortion: Option<&PolynomialDistortion>,
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_planar(world, image, k, distortion, params)
    }
}

/// Solve the pose of a planar target.
///
/// The world points are mapped into their own plane frame, the homography
/// between the plane and the normalized image is decomposed and the result
/// is composed back with the plane frame.
pub fn solve_planar(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &Matrix3<f64>,
    distortion: Option<&PolynomialDistortion>,
    params: &PlanarPnPParams,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 4)?;

    let frame = PlaneFrame::fit(points_world).ok_or(PnPError::NonPlanarPoints)?;
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| PnPError::SvdFailed("camera matrix is singular".to_string()))?;

    let plane: Vec<[f64; 2]> = points_world.iter().map(|p| frame.to_plane(p)).collect();
    let normalized: Vec<[f64; 2]> = undistort_image_points(points_image, k, distortion)
        .iter()
        .map(|p| {
            let v = k_inv * Vector3::new(p[0], p[1], 1.0);
            [v.x / v.z, v.y / v.z]
        })
        .collect();

    let h = find_homography_dlt(&plane, &normalized)?;
    let (r_plane, t_plane) = decompose_planar_homography(&h)?;
    let (rotation, translation) = frame.to_world_pose(&r_plane, &t_plane);

    if let Some(ref lm_params) = params.refine_lm {
        return super::refine_pose_lm(
            points_world,
            points_image,
            k,
            &rotation,
            &translation,
            distortion,
            lm_params,
        );
    }

    let rmse = reprojection_rmse(points_world, points_image, &rotation, &translation, k, distortion);

    Ok(PnPResult {
        rotation,
        translation,
        rvec: Vector3::from(rotation_to_rvec(&rotation)),
        reproj_rmse: Some(rmse),
        num_iterations: None,
        converged: Some(true),
    })
}

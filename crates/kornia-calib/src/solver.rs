use kornia_3d::calib::{
    calibrate_camera, stereo_calibrate, CalibError, CalibFlags, CameraCalibrationResult,
    CameraObservations, StereoCalibrationResult, TermCriteria,
};
use kornia_3d::camera::{project_points, CameraIntrinsic, PolynomialDistortion};
use kornia_3d::pnp::{solve_pnp, LMRefineParams, PnPMethod};
use nalgebra::{Matrix3, Vector3};

/// Numerical backend of the calibrators.
pub trait CalibrationSolver: Send + Sync {
    /// Calibrate a single camera from the views of a target.
    fn calibrate_camera(
        &self,
        object_points: &[Vec<[f64; 3]>],
        camera: &CameraObservations,
        flags: CalibFlags,
        criteria: &TermCriteria,
    ) -> Result<CameraCalibrationResult, CalibError>;

    /// Calibrate a camera pair from the views of a target.
    fn stereo_calibrate(
        &self,
        object_points: &[Vec<[f64; 3]>],
        camera1: &CameraObservations,
        camera2: &CameraObservations,
        flags: CalibFlags,
        criteria: &TermCriteria,
    ) -> Result<StereoCalibrationResult, CalibError>;

    /// Target to camera pose from 3D-2D correspondences.
    fn solve_pnp(
        &self,
        object_points: &[[f64; 3]],
        image_points: &[[f64; 2]],
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
    ) -> Result<(Matrix3<f64>, Vector3<f64>), CalibError>;

    /// Project target points through a pose and a camera.
    fn project_points(
        &self,
        object_points: &[[f64; 3]],
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
    ) -> Vec<[f64; 2]>;
}

/// Pure Rust solver backed by [`kornia_3d`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSolver;

impl CalibrationSolver for NativeSolver {
    fn calibrate_camera(
        &self,
        object_points: &[Vec<[f64; 3]>],
        camera: &CameraObservations,
        flags: CalibFlags,
        criteria: &TermCriteria,
    ) -> Result<CameraCalibrationResult, CalibError> {
        calibrate_camera(object_points, camera, flags, criteria)
    }

    fn stereo_calibrate(
        &self,
        object_points: &[Vec<[f64; 3]>],
        camera1: &CameraObservations,
        camera2: &CameraObservations,
        flags: CalibFlags,
        criteria: &TermCriteria,
    ) -> Result<StereoCalibrationResult, CalibError> {
        stereo_calibrate(object_points, camera1, camera2, flags, criteria)
    }

    fn solve_pnp(
        &self,
        object_points: &[[f64; 3]],
        image_points: &[[f64; 2]],
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
    ) -> Result<(Matrix3<f64>, Vector3<f64>), CalibError> {
        let distortion = PolynomialDistortion::from_coeffs(dist_coeffs);
        let res = solve_pnp(
            object_points,
            image_points,
            camera_matrix,
            Some(&distortion),
            PnPMethod::Iterative(LMRefineParams::default()),
        )?;
        Ok((res.rotation, res.translation))
    }

    fn project_points(
        &self,
        object_points: &[[f64; 3]],
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
    ) -> Vec<[f64; 2]> {
        let distortion = PolynomialDistortion::from_coeffs(dist_coeffs);
        project_points(
            object_points,
            rotation,
            translation,
            &CameraIntrinsic::from_matrix(camera_matrix),
            Some(&distortion),
        )
    }
}

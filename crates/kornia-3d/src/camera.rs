use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::linalg::rvec_to_rotation;

/// Number of fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 20;

/// Represents the intrinsic parameters of a pinhole camera
///
/// # Fields
///
/// * `fx` - The focal length in the x direction
/// * `fy` - The focal length in the y direction
/// * `cx` - The x coordinate of the principal point
/// * `cy` - The y coordinate of the principal point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsic {
    /// The focal length in the x direction
    pub fx: f64,
    /// The focal length in the y direction
    pub fy: f64,
    /// The x coordinate of the principal point
    pub cx: f64,
    /// The y coordinate of the principal point
    pub cy: f64,
}

impl CameraIntrinsic {
    /// Read the pinhole parameters from a 3x3 camera matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    /// The 3x3 camera matrix `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }
}

/// Represents the polynomial distortion parameters of a camera
///
/// The coefficients follow the rational model. The serialized order used by
/// [`PolynomialDistortion::from_coeffs`] and [`PolynomialDistortion::coeffs`]
/// is `k1, k2, p1, p2, k3, k4, k5, k6`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolynomialDistortion {
    /// The first radial distortion coefficient
    pub k1: f64,
    /// The second radial distortion coefficient
    pub k2: f64,
    /// The third radial distortion coefficient
    pub k3: f64,
    /// The fourth radial distortion coefficient
    pub k4: f64,
    /// The fifth radial distortion coefficient
    pub k5: f64,
    /// The sixth radial distortion coefficient
    pub k6: f64,
    /// The first tangential distortion coefficient
    pub p1: f64,
    /// The second tangential distortion coefficient
    pub p2: f64,
}

impl PolynomialDistortion {
    /// Build the model from a coefficient list in `k1, k2, p1, p2, k3, k4, k5, k6` order.
    ///
    /// Missing trailing coefficients are zero, extra ones are ignored.
    pub fn from_coeffs(coeffs: &[f64]) -> Self {
        let c = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: c(0),
            k2: c(1),
            p1: c(2),
            p2: c(3),
            k3: c(4),
            k4: c(5),
            k5: c(6),
            k6: c(7),
        }
    }

    /// The five-coefficient list `k1, k2, p1, p2, k3`.
    pub fn coeffs(&self) -> Vec<f64> {
        vec![self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Returns true if every coefficient is zero.
    pub fn is_identity(&self) -> bool {
        [
            self.k1, self.k2, self.k3, self.k4, self.k5, self.k6, self.p1, self.p2,
        ]
        .iter()
        .all(|c| *c == 0.0)
    }

    /// Apply the distortion model to a point in normalized camera coordinates.
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let kr = self.radial(r2);
        let xd = x * kr + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * kr + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Invert [`PolynomialDistortion::distort_normalized`] by fixed-point iteration.
    pub fn undistort_normalized(&self, xd: f64, yd: f64) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let kr = self.radial(r2);
            if kr.abs() < f64::EPSILON {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / kr;
            y = (yd - dy) / kr;
        }
        (x, y)
    }

    fn radial(&self, r2: f64) -> f64 {
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6)
    }
}

/// Distort a point using polynomial distortion
///
/// # Arguments
///
/// * `x` - The x coordinate of the point
/// * `y` - The y coordinate of the point
/// * `intrinsic` - The intrinsic parameters of the camera
/// * `distortion` - The distortion parameters of the camera
///
/// # Returns
///
/// * `x` - The x coordinate of the distorted point
/// * `y` - The y coordinate of the distorted point
pub fn distort_point_polynomial(
    x: f64,
    y: f64,
    intrinsic: &CameraIntrinsic,
    distortion: &PolynomialDistortion,
) -> (f64, f64) {
    let (fx, fy, cx, cy) = (intrinsic.fx, intrinsic.fy, intrinsic.cx, intrinsic.cy);

    // normalize the coordinates
    let xn = (x - cx) / fx;
    let yn = (y - cy) / fy;

    let (xd, yd) = distortion.distort_normalized(xn, yn);

    // denormalize the coordinates
    (fx * xd + cx, fy * yd + cy)
}

/// Undistort a pixel using polynomial distortion.
///
/// Inverse of [`distort_point_polynomial`], computed iteratively.
pub fn undistort_point_polynomial(
    x: f64,
    y: f64,
    intrinsic: &CameraIntrinsic,
    distortion: &PolynomialDistortion,
) -> (f64, f64) {
    let (xn, yn) = undistort_point_normalized(x, y, intrinsic, distortion);
    (intrinsic.fx * xn + intrinsic.cx, intrinsic.fy * yn + intrinsic.cy)
}

/// Map a distorted pixel to undistorted normalized camera coordinates.
pub fn undistort_point_normalized(
    x: f64,
    y: f64,
    intrinsic: &CameraIntrinsic,
    distortion: &PolynomialDistortion,
) -> (f64, f64) {
    let xd = (x - intrinsic.cx) / intrinsic.fx;
    let yd = (y - intrinsic.cy) / intrinsic.fy;
    distortion.undistort_normalized(xd, yd)
}

/// Project a camera-frame point to pixel coordinates.
#[inline]
pub fn project_camera_point(
    pc: &Vector3<f64>,
    intrinsic: &CameraIntrinsic,
    distortion: Option<&PolynomialDistortion>,
) -> [f64; 2] {
    let inv_z = 1.0 / pc.z;
    let (x, y) = (pc.x * inv_z, pc.y * inv_z);
    let (xd, yd) = match distortion {
        Some(d) => d.distort_normalized(x, y),
        None => (x, y),
    };
    [intrinsic.fx * xd + intrinsic.cx, intrinsic.fy * yd + intrinsic.cy]
}

/// Project world points through a camera pose, intrinsics and distortion.
///
/// The pose maps world coordinates to the camera frame: `pc = R * pw + t`.
///
/// # Arguments
///
/// * `points_world` - 3-D coordinates in the world frame.
/// * `rotation` - World to camera rotation.
/// * `translation` - World to camera translation.
/// * `intrinsic` - The intrinsic parameters of the camera.
/// * `distortion` - Optional lens distortion.
pub fn project_points(
    points_world: &[[f64; 3]],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    intrinsic: &CameraIntrinsic,
    distortion: Option<&PolynomialDistortion>,
) -> Vec<[f64; 2]> {
    points_world
        .iter()
        .map(|pw| {
            let pc = rotation * Vector3::from(*pw) + translation;
            project_camera_point(&pc, intrinsic, distortion)
        })
        .collect()
}

/// Same as [`project_points`] with the rotation given as a Rodrigues vector.
pub fn project_points_rvec(
    points_world: &[[f64; 3]],
    rvec: &[f64; 3],
    tvec: &[f64; 3],
    intrinsic: &CameraIntrinsic,
    distortion: Option<&PolynomialDistortion>,
) -> Vec<[f64; 2]> {
    let rotation = rvec_to_rotation(rvec);
    project_points(
        points_world,
        &rotation,
        &Vector3::from(*tvec),
        intrinsic,
        distortion,
    )
}

use nalgebra::{Matrix3, Vector3};

use super::CalibFlags;
use crate::camera::{project_camera_point, CameraIntrinsic, PolynomialDistortion};
use crate::linalg::rvec_to_rotation;

/// Number of intrinsic parameters: `fx, fy, cx, cy, k1, k2, p1, p2, k3`.
pub(crate) const NUM_INTRINSICS: usize = 9;

const FX: usize = 0;
const FY: usize = 1;
const CX: usize = 2;
const CY: usize = 3;
const P1: usize = 6;
const P2: usize = 7;

/// Flat intrinsic parameter vector of a pinhole camera with polynomial distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Intrinsics(pub [f64; NUM_INTRINSICS]);

impl Intrinsics {
    pub fn new(camera_matrix: &Matrix3<f64>, dist_coeffs: &[f64]) -> Self {
        let mut values = [0.0; NUM_INTRINSICS];
        values[FX] = camera_matrix[(0, 0)];
        values[FY] = camera_matrix[(1, 1)];
        values[CX] = camera_matrix[(0, 2)];
        values[CY] = camera_matrix[(1, 2)];
        for (dst, src) in values[4..].iter_mut().zip(dist_coeffs.iter()) {
            *dst = *src;
        }
        Self(values)
    }

    pub fn camera(&self) -> CameraIntrinsic {
        CameraIntrinsic {
            fx: self.0[FX],
            fy: self.0[FY],
            cx: self.0[CX],
            cy: self.0[CY],
        }
    }

    pub fn distortion(&self) -> PolynomialDistortion {
        PolynomialDistortion::from_coeffs(&self.0[4..])
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        self.camera().matrix()
    }

    pub fn dist_coeffs(&self) -> Vec<f64> {
        self.0[4..].to_vec()
    }

    pub fn zero_tangential(&mut self) {
        self.0[P1] = 0.0;
        self.0[P2] = 0.0;
    }

    pub fn set_focal(&mut self, fx: f64, fy: f64) {
        self.0[FX] = fx;
        self.0[FY] = fy;
    }

    pub fn fx(&self) -> f64 {
        self.0[FX]
    }

    pub fn fy(&self) -> f64 {
        self.0[FY]
    }
}

/// Which intrinsic parameters are refined.
///
/// With a fixed aspect ratio `fx` is not a free parameter but follows `fy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct IntrinsicMask {
    free: [bool; NUM_INTRINSICS],
    fx_over_fy: Option<f64>,
}

impl IntrinsicMask {
    pub fn from_flags(flags: CalibFlags, init: &Intrinsics) -> Self {
        if flags.contains(CalibFlags::FIX_INTRINSIC) {
            return Self::fixed();
        }

        let mut free = [true; NUM_INTRINSICS];
        let mut fx_over_fy = None;

        if flags.contains(CalibFlags::FIX_ASPECT_RATIO) {
            free[FX] = false;
            fx_over_fy = Some(init.fx() / init.fy());
        }
        if flags.contains(CalibFlags::FIX_PRINCIPAL_POINT) {
            free[CX] = false;
            free[CY] = false;
        }
        if flags.contains(CalibFlags::ZERO_TANGENT_DIST) {
            free[P1] = false;
            free[P2] = false;
        }

        Self { free, fx_over_fy }
    }

    pub fn fixed() -> Self {
        Self {
            free: [false; NUM_INTRINSICS],
            fx_over_fy: None,
        }
    }

    /// Take the focal lengths out of the free set, they are copied from another camera.
    pub fn tie_focal(&mut self) {
        self.free[FX] = false;
        self.free[FY] = false;
        self.fx_over_fy = None;
    }

    pub fn num_free(&self) -> usize {
        self.free.iter().filter(|f| **f).count()
    }

    pub fn pack(&self, values: &Intrinsics, out: &mut Vec<f64>) {
        for (v, free) in values.0.iter().zip(self.free.iter()) {
            if *free {
                out.push(*v);
            }
        }
    }

    /// Rebuild the full vector from the free `params`, taking fixed values from `base`.
    pub fn unpack(&self, params: &[f64], base: &Intrinsics) -> Intrinsics {
        let mut values = base.0;
        let mut it = params.iter();
        for (v, free) in values.iter_mut().zip(self.free.iter()) {
            if *free {
                if let Some(p) = it.next() {
                    *v = *p;
                }
            }
        }
        if let Some(ratio) = self.fx_over_fy {
            values[FX] = ratio * values[FY];
        }
        Intrinsics(values)
    }
}

/// Rotation and translation of a pose stored as `[rvec, tvec]`.
pub(crate) fn pose_from_slice(pose: &[f64]) -> (Matrix3<f64>, Vector3<f64>) {
    (
        rvec_to_rotation(&[pose[0], pose[1], pose[2]]),
        Vector3::new(pose[3], pose[4], pose[5]),
    )
}

/// Reprojection residuals `[u_hat - u, v_hat - v]` of one view written into `out`.
pub(crate) fn view_residuals(
    object: &[[f64; 3]],
    image: &[[f64; 2]],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    camera: &CameraIntrinsic,
    distortion: &PolynomialDistortion,
    out: &mut [f64],
) {
    for (i, (pw, uv)) in object.iter().zip(image.iter()).enumerate() {
        let pc = rotation * Vector3::from(*pw) + translation;
        let [u, v] = project_camera_point(&pc, camera, Some(distortion));
        out[2 * i] = u - uv[0];
        out[2 * i + 1] = v - uv[1];
    }
}

/// Root-mean-square of a residual slice grouped in pixel pairs.
pub(crate) fn pixel_rms(residuals: &[f64]) -> f64 {
    let n = (residuals.len() / 2).max(1) as f64;
    (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt()
}

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3, SVD};
use thiserror::Error;

/// Error type for the linear algebra helpers.
#[derive(Debug, Error, PartialEq)]
pub enum LinalgError {
    /// Source and destination arrays must have the same length
    #[error("Source and destination arrays must have the same length ({0} != {1})")]
    MismatchedInputLengths(usize, usize),

    /// Not enough points to estimate a rigid transform
    #[error("At least {required} points are required, got {actual}")]
    InsufficientPoints {
        /// Minimum number of points.
        required: usize,
        /// Number of points provided.
        actual: usize,
    },

    /// Failed to compute the SVD
    #[error("Failed to compute the SVD")]
    SvdFailed,
}

/// Transform a set of points using a rotation and translation.
///
/// # Arguments
///
/// * `src_points` - A set of points to be transformed.
/// * `dst_r_src` - A rotation matrix.
/// * `dst_t_src` - A translation vector.
/// * `dst_points` - A pre-allocated vector to store the transformed points.
///
/// PRECONDITION: dst_points is a pre-allocated vector of the same size as source.
///
/// Example:
///
/// ```
/// use kornia_3d::linalg::transform_points;
/// use nalgebra::{Matrix3, Vector3};
///
/// let src_points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
/// let mut dst_points = vec![[0.0; 3]; src_points.len()];
/// transform_points(&src_points, &Matrix3::identity(), &Vector3::zeros(), &mut dst_points);
/// assert_eq!(dst_points, src_points);
/// ```
pub fn transform_points(
    src_points: &[[f64; 3]],
    dst_r_src: &Matrix3<f64>,
    dst_t_src: &Vector3<f64>,
    dst_points: &mut [[f64; 3]],
) {
    assert_eq!(src_points.len(), dst_points.len());

    for (point_dst, point_src) in dst_points.iter_mut().zip(src_points.iter()) {
        let p = dst_r_src * Vector3::from(*point_src) + dst_t_src;
        *point_dst = [p.x, p.y, p.z];
    }
}

/// Rotation matrix from a Rodrigues (axis-angle) vector.
pub fn rvec_to_rotation(rvec: &[f64; 3]) -> Matrix3<f64> {
    Rotation3::new(Vector3::from(*rvec)).into_inner()
}

/// Rodrigues (axis-angle) vector from a rotation matrix.
///
/// The input is assumed orthonormal; use [`orthonormalize`] first otherwise.
pub fn rotation_to_rvec(rotation: &Matrix3<f64>) -> [f64; 3] {
    let v = Rotation3::from_matrix_unchecked(*rotation).scaled_axis();
    [v.x, v.y, v.z]
}

/// Closest rotation matrix (in the Frobenius sense) to `m`.
pub fn orthonormalize(m: &Matrix3<f64>) -> Result<Matrix3<f64>, LinalgError> {
    let svd = SVD::new(*m, true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(LinalgError::SvdFailed);
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        for i in 0..3 {
            u_fix[(i, 2)] = -u_fix[(i, 2)];
        }
        r = u_fix * v_t;
    }
    Ok(r)
}

/// Skew-symmetric cross-product matrix `[v]x`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Compose a 4x4 rigid transform from a rotation and a translation.
pub fn rigid_to_matrix4(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// Split a 4x4 rigid transform into rotation and translation.
pub fn matrix4_to_rigid(m: &Matrix4<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    (
        m.fixed_view::<3, 3>(0, 0).into_owned(),
        m.fixed_view::<3, 1>(0, 3).into_owned(),
    )
}

/// Compute the centroid of a set of points.
pub fn compute_centroid(points: &[[f64; 3]]) -> Vector3<f64> {
    let n = points.len().max(1) as f64;
    points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + Vector3::from(*p))
        / n
}

/// Umeyama/Kabsch algorithm without scale.
///
/// Returns `(R, t)` such that `dst ≈ R * src + t` in the least squares sense.
pub fn umeyama(
    src: &[[f64; 3]],
    dst: &[[f64; 3]],
) -> Result<(Matrix3<f64>, Vector3<f64>), LinalgError> {
    if src.len() != dst.len() {
        return Err(LinalgError::MismatchedInputLengths(src.len(), dst.len()));
    }
    if src.len() < 3 {
        return Err(LinalgError::InsufficientPoints {
            required: 3,
            actual: src.len(),
        });
    }

    let mu_s = compute_centroid(src);
    let mu_d = compute_centroid(dst);

    // covariance H = sum (dst_c) * (src_c)^T
    let mut h = Matrix3::<f64>::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        let sc = Vector3::from(*s) - mu_s;
        let dc = Vector3::from(*d) - mu_d;
        h += dc * sc.transpose();
    }
    h /= src.len() as f64;

    let svd = SVD::new(h, true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(LinalgError::SvdFailed);
    };

    let mut s = Matrix3::<f64>::identity();
    if (u * v_t).determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }

    let r = u * s * v_t;
    let t = mu_d - r * mu_s;
    Ok((r, t))
}

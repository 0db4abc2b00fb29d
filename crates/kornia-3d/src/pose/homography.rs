use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::linalg::{compute_centroid, orthonormalize};

/// Error types for homography estimation.
#[derive(Debug, Error, PartialEq)]
pub enum HomographyError {
    /// Not enough correspondences.
    #[error("Homography requires at least {required} correspondences, got {actual}")]
    InsufficientPoints {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences provided.
        actual: usize,
    },

    /// Source and destination have different lengths.
    #[error("Mismatched correspondence lengths: {0} != {1}")]
    MismatchedLengths(usize, usize),

    /// The points are degenerate (collinear or coincident).
    #[error("Degenerate point configuration")]
    Degenerate,
}

/// Similarity transform that moves the centroid to the origin and scales the
/// mean distance to sqrt(2).
fn normalization_transform(points: &[[f64; 2]]) -> Result<Matrix3<f64>, HomographyError> {
    let n = points.len() as f64;
    let (mut mx, mut my) = (0.0, 0.0);
    for p in points {
        mx += p[0];
        my += p[1];
    }
    mx /= n;
    my /= n;

    let mean_dist = points
        .iter()
        .map(|p| ((p[0] - mx).powi(2) + (p[1] - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    if mean_dist < f64::EPSILON {
        return Err(HomographyError::Degenerate);
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0))
}

fn apply(t: &Matrix3<f64>, p: &[f64; 2]) -> [f64; 2] {
    [
        t[(0, 0)] * p[0] + t[(0, 1)] * p[1] + t[(0, 2)],
        t[(1, 0)] * p[0] + t[(1, 1)] * p[1] + t[(1, 2)],
    ]
}

/// Compute the homography matrix from N >= 4 2d point correspondences.
///
/// Normalized direct linear transform: both point sets are conditioned, the
/// 2N x 9 system is solved by SVD and the result is de-normalized so that
/// `x2 ~ H * x1`. The returned matrix is scaled so that `H[2][2] == 1` when
/// possible.
///
/// * `x1` - The source 2d points with shape (N, 2).
/// * `x2` - The destination 2d points with shape (N, 2).
pub fn find_homography_dlt(
    x1: &[[f64; 2]],
    x2: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    if x1.len() != x2.len() {
        return Err(HomographyError::MismatchedLengths(x1.len(), x2.len()));
    }
    if x1.len() < 4 {
        return Err(HomographyError::InsufficientPoints {
            required: 4,
            actual: x1.len(),
        });
    }

    let t1 = normalization_transform(x1)?;
    let t2 = normalization_transform(x2)?;

    // construct matrix A
    let mut rows = Vec::with_capacity(2 * x1.len());
    for (p1, p2) in x1.iter().zip(x2.iter()) {
        let [u1, v1] = apply(&t1, p1);
        let [u2, v2] = apply(&t2, p2);
        rows.push([u1, v1, 1.0, 0.0, 0.0, 0.0, -u2 * u1, -u2 * v1, -u2]);
        rows.push([0.0, 0.0, 0.0, u1, v1, 1.0, -v2 * u1, -v2 * v1, -v2]);
    }
    let mat_a = faer::Mat::<f64>::from_fn(rows.len(), 9, |i, j| rows[i][j]);

    // solve -> take the right singular vector of the smallest singular value
    let svd = mat_a.svd();
    let h = svd.v().col(8);

    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t2_inv = t2.try_inverse().ok_or(HomographyError::Degenerate)?;
    let mut homo = t2_inv * h_norm * t1;

    if homo.determinant().abs() < 1e-12 {
        return Err(HomographyError::Degenerate);
    }

    let scale = if homo[(2, 2)].abs() > f64::EPSILON {
        homo[(2, 2)]
    } else {
        homo.norm()
    };
    homo /= scale;

    Ok(homo)
}

/// Recover the pose of a plane from a homography.
///
/// `h` maps plane coordinates `(X, Y, 1)` to normalized image coordinates.
/// Returns `(R, t)` such that a plane point `(X, Y, 0)` lands in the camera
/// frame at `R * [X, Y, 0]^T + t`, with the plane in front of the camera.
pub fn decompose_planar_homography(
    h: &Matrix3<f64>,
) -> Result<(Matrix3<f64>, Vector3<f64>), HomographyError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = (h1.norm() + h2.norm()) * 0.5;
    if norm < f64::EPSILON {
        return Err(HomographyError::Degenerate);
    }

    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let t = h3 * lambda;

    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let r = orthonormalize(&r).map_err(|_| HomographyError::Degenerate)?;

    Ok((r, t))
}

/// Rigid frame attached to a planar point set.
///
/// Maps world points onto the plane so that `R * (p - origin)` has a zero
/// z component for every point on the plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneFrame {
    /// World to plane rotation.
    pub rotation: Matrix3<f64>,
    /// Plane origin in world coordinates.
    pub origin: Vector3<f64>,
}

impl PlaneFrame {
    /// Relative tolerance on the out-of-plane spread.
    const PLANARITY_TOL: f64 = 1e-6;

    /// Fit a frame to the points, or `None` if they are not coplanar.
    ///
    /// Points already lying on `z = 0` get the identity frame.
    pub fn fit(points: &[[f64; 3]]) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }

        if points.iter().all(|p| p[2].abs() < f64::EPSILON) {
            return Some(Self {
                rotation: Matrix3::identity(),
                origin: Vector3::zeros(),
            });
        }

        let c = compute_centroid(points);
        let mut cov = Matrix3::<f64>::zeros();
        for p in points {
            let d = Vector3::from(*p) - c;
            cov += d * d.transpose();
        }

        let eig = cov.symmetric_eigen();
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        let largest = eig.eigenvalues[order[0]].abs();
        let smallest = eig.eigenvalues[order[2]].abs();
        if largest < f64::EPSILON || smallest.sqrt() > Self::PLANARITY_TOL * largest.sqrt() {
            return None;
        }

        let e0 = eig.eigenvectors.column(order[0]).into_owned();
        let e1 = eig.eigenvectors.column(order[1]).into_owned();
        let normal = e0.cross(&e1);

        let rotation = Matrix3::from_rows(&[e0.transpose(), e1.transpose(), normal.transpose()]);

        Some(Self {
            rotation,
            origin: c,
        })
    }

    /// Coordinates of a world point inside the plane.
    pub fn to_plane(&self, p: &[f64; 3]) -> [f64; 2] {
        let q = self.rotation * (Vector3::from(*p) - self.origin);
        [q.x, q.y]
    }

    /// Compose a plane pose `(R_p, t_p)` with this frame, giving the world pose.
    pub fn to_world_pose(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> (Matrix3<f64>, Vector3<f64>) {
        let r = rotation * self.rotation;
        let t = translation - r * self.origin;
        (r, t)
    }
}

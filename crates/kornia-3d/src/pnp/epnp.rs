//! Efficient Perspective-n-Point (EPnP) solver
//! Paper: [Lepetit et al., IJCV 2009](https://www.tugraz.at/fileadmin/user_upload/Institute/ICG/Images/team_lepetit/publications/lepetit_ijcv08.pdf)
//! Reference: [OpenCV EPnP implementation](https://github.com/opencv/opencv/blob/4.x/modules/calib3d/src/epnp.cpp)

use super::ops::{gauss_newton, reprojection_rmse, undistort_image_points};
use super::refine::{refine_pose_lm, LMRefineParams};
use super::{check_correspondences, NumericTol, PnPError, PnPResult, PnPSolver};
use crate::camera::PolynomialDistortion;
use crate::linalg::{compute_centroid, rotation_to_rvec, umeyama};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3, Vector4};

/// Marker type representing the Efficient PnP algorithm.
pub struct EPnP;

impl PnPSolver for EPnP {
    type Param = EPnPParams;

    fn solve(
        points_world: &[[f64; 3]],
        points_image: &[[f64; 2]],
        k: &Matrix3<f64>,
        distortion: Option<&PolynomialDistortion>,
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_epnp(points_world, points_image, k, distortion, params)
    }
}

/// Parameters controlling the EPnP solver.
#[derive(Debug, Clone, Default)]
pub struct EPnPParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
    /// Optional LM refinement parameters. If `Some`, the pose will be refined
    /// after the initial EPnP solution.
    pub refine_lm: Option<LMRefineParams>,
}

/// Solve Perspective-n-Point (EPnP).
///
/// # Arguments
/// * `points_world` – 3-D coordinates in the world frame, shape *(N,3)* with `N≥4`.
/// * `points_image` – Corresponding pixel coordinates, shape *(N,2)*.
/// * `k` – Camera intrinsics matrix.
/// * `distortion` – Optional lens distortion; image points are undistorted first.
///
/// # Returns
/// A [`PnPResult`] with
/// - `R`: 3×3 rotation, mapping from world → camera
/// - `t`: 3-vector translation
/// - `rvec`: Rodrigues axis-angle representation of `R`
pub fn solve_epnp(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &Matrix3<f64>,
    distortion: Option<&PolynomialDistortion>,
    params: &EPnPParams,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 4)?;
    let n = points_world.len();

    let undistorted = undistort_image_points(points_image, k, distortion);

    let cw = select_control_points(points_world);

    let alphas = compute_barycentric(points_world, &cw, params.tol.eps);

    // Build the 2N×12 design matrix M
    let m_rows = build_m(&alphas, &undistorted, k)?;

    let m_flat: Vec<f64> = m_rows.iter().flat_map(|row| row.iter()).cloned().collect();
    let m_mat = DMatrix::<f64>::from_row_slice(2 * n, 12, &m_flat);

    // Null-space of M via eigen decomposition of MtM (12×12)
    let mtm = m_mat.tr_mul(&m_mat);
    let eig = mtm.symmetric_eigen();

    let eigenvalues = eig.eigenvalues;
    let eigenvectors = eig.eigenvectors;

    let mut value_index_pairs: Vec<(f64, usize)> = eigenvalues
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, value)| (value.abs(), index))
        .collect();

    value_index_pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // column k holds the eigenvector of the k-th smallest eigenvalue
    let null4 = DMatrix::from_columns(&[
        eigenvectors.column(value_index_pairs[0].1),
        eigenvectors.column(value_index_pairs[1].1),
        eigenvectors.column(value_index_pairs[2].1),
        eigenvectors.column(value_index_pairs[3].1),
    ]);

    // Build helper matrices for beta initialisation
    let l = build_l6x10(&null4);
    let rho = rho_ctrlpts(&cw);

    let rho_vec = DVector::<f64>::from_column_slice(&rho);

    let betas: Vec<[f64; 4]> = [
        estimate_beta([0, 1, 3, 6], &l, &rho_vec, params.tol.svd),
        estimate_beta([0, 1, 2], &l, &rho_vec, params.tol.svd),
        estimate_beta([0, 1, 2, 3, 4], &l, &rho_vec, params.tol.svd),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut best_err = f64::INFINITY;
    let mut best_r = Matrix3::identity();
    let mut best_t = Vector3::zeros();

    for bet in betas.iter().map(|&b| gauss_newton(b, &null4, &rho)) {
        let Ok((r_c, t_c)) = pose_from_betas(&bet, &null4, &cw, &alphas) else {
            continue;
        };
        let err = reprojection_rmse(points_world, points_image, &r_c, &t_c, k, distortion);
        if err < best_err {
            best_err = err;
            best_r = r_c;
            best_t = t_c;
        }
    }

    if !best_err.is_finite() {
        return Err(PnPError::SvdFailed(
            "no valid EPnP beta solution".to_string(),
        ));
    }

    // Optionally refine pose using LM optimization
    if let Some(ref lm_params) = params.refine_lm {
        return refine_pose_lm(
            points_world,
            points_image,
            k,
            &best_r,
            &best_t,
            distortion,
            lm_params,
        );
    }

    Ok(PnPResult {
        rotation: best_r,
        translation: best_t,
        rvec: Vector3::from(rotation_to_rvec(&best_r)),
        reproj_rmse: Some(best_err),
        num_iterations: None,
        converged: Some(true),
    })
}

/// Compute pose (R, t) from a set of betas using the null-space vectors.
fn pose_from_betas(
    betas: &[f64; 4],
    null4: &DMatrix<f64>, // 12×4 matrix (V)
    cw: &[[f64; 3]; 4],   // control points in world frame
    alphas: &[[f64; 4]],  // barycentric coordinates for each world point
) -> Result<(Matrix3<f64>, Vector3<f64>), PnPError> {
    let beta_vec = Vector4::from_column_slice(betas);
    let cc_flat = null4 * beta_vec; // 12×1 vector

    let mut cc = [[0.0; 3]; 4];
    for (i, c) in cc.iter_mut().enumerate() {
        *c = [cc_flat[3 * i], cc_flat[3 * i + 1], cc_flat[3 * i + 2]];
    }

    let a0 = alphas[0];
    let pc0_z: f64 = (0..4).map(|j| cc[j][2] * a0[j]).sum();

    if pc0_z < 0.0 {
        for pt in &mut cc {
            for v in pt.iter_mut() {
                *v = -*v;
            }
        }
    }

    umeyama(cw, &cc).map_err(|e| PnPError::SvdFailed(e.to_string()))
}

fn select_control_points(points_world: &[[f64; 3]]) -> [[f64; 3]; 4] {
    let n = points_world.len();
    let c = compute_centroid(points_world);

    let mut cov_mat = Matrix3::<f64>::zeros();
    for p in points_world {
        let diff = Vector3::from(*p) - c;
        cov_mat += diff * diff.transpose();
    }
    cov_mat /= n as f64;

    let eig = cov_mat.symmetric_eigen();
    let mut axes_sig: Vec<(f64, Vector3<f64>)> = (0..3)
        .map(|i| {
            (
                eig.eigenvalues[i].max(0.0).sqrt(),
                eig.eigenvectors.column(i).into_owned(),
            )
        })
        .collect();
    axes_sig.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut cw = [[c.x, c.y, c.z]; 4];
    for (i, (sigma, axis)) in axes_sig.iter().enumerate() {
        let cp = c + axis * *sigma;
        cw[i + 1] = [cp.x, cp.y, cp.z];
    }

    cw
}

/// Compute barycentric coordinates of world-space points with respect to the
/// 4 control points returned by `select_control_points`.
///
/// # Arguments
/// - `points_world`: World points, shape `(N, 3)`.
/// - `cw`: Control points, shape `(4, 3)`.
/// - `eps`: Degeneracy threshold for the control-point tetrahedron. If `det(B) < eps`,
///   a Moore–Penrose pseudo-inverse is used instead of the exact inverse.
///
/// # Returns
/// `Vec<[f64; 4]>` of length `N`. For each point, the weights `[a0, a1, a2, a3]` satisfy
/// `a0 + a1 + a2 + a3 = 1` and `pw_i = sum_j(a_j * Cw_j)`.
fn compute_barycentric(points_world: &[[f64; 3]], cw: &[[f64; 3]; 4], eps: f64) -> Vec<[f64; 4]> {
    // Build B = [C1 - C0, C2 - C0, C3 - C0].
    let c0 = Vector3::from(cw[0]);
    let b = Matrix3::from_columns(&[
        Vector3::from(cw[1]) - c0,
        Vector3::from(cw[2]) - c0,
        Vector3::from(cw[3]) - c0,
    ]);

    // Invert or pseudo-invert B.
    let b_inv = match b.try_inverse() {
        Some(inv) if b.determinant().abs() > eps => inv,
        // Moore–Penrose pseudo-inverse: B⁺ = V Σ⁺ Uᵀ
        _ => b.pseudo_inverse(eps).unwrap_or_else(|_| Matrix3::zeros()),
    };

    points_world
        .iter()
        .map(|p| {
            let lamb = b_inv * (Vector3::from(*p) - c0);
            [1.0 - (lamb.x + lamb.y + lamb.z), lamb.x, lamb.y, lamb.z]
        })
        .collect()
}

/// Construct the 2N x 12 design matrix `M` used by EPnP.
///
/// # Arguments
/// - `alphas`: Barycentric coordinates for each world point, produced by [`compute_barycentric`]; shape `(N, 4)`.
/// - `points_image`: Pixel coordinates for each correspondence; shape `(N, 2)`.
/// - `k`: Camera intrinsics 3 x 3 matrix.
///
/// # Returns
/// A vector of length `2*N` where each element is the 12-vector corresponding
/// to a row of `M` (two rows per correspondence).
fn build_m(
    alphas: &[[f64; 4]],
    points_image: &[[f64; 2]],
    k: &Matrix3<f64>,
) -> Result<Vec<[f64; 12]>, PnPError> {
    if alphas.len() != points_image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "barycentric alphas",
            left_len: alphas.len(),
            right_name: "image points",
            right_len: points_image.len(),
        });
    }
    let n = alphas.len();

    let fu = k[(0, 0)];
    let fv = k[(1, 1)];
    let uc = k[(0, 2)];
    let vc = k[(1, 2)];

    // Pre-allocate 2N rows of zeros.
    let mut m = vec![[0.0f64; 12]; 2 * n];

    for (i, (a, points_image_i)) in alphas.iter().zip(points_image.iter()).enumerate() {
        let u = points_image_i[0];
        let v = points_image_i[1];

        let row_x = 2 * i;
        let row_y = row_x + 1;

        for (j, &alpha) in a.iter().enumerate() {
            let base = 3 * j;
            m[row_x][base] = alpha * fu;
            m[row_x][base + 2] = alpha * (uc - u);
            m[row_y][base + 1] = alpha * fv;
            m[row_y][base + 2] = alpha * (vc - v);
        }
    }

    Ok(m)
}

/// Build the 6×10 matrix **L** used in EPnP from the 4-dimensional null-space matrix `V` (shape 12×4).
fn build_l6x10(null4: &DMatrix<f64>) -> [[f64; 10]; 6] {
    let mut l = [[0.0f64; 10]; 6];

    let cols: Vec<DVector<f64>> = (0..4).map(|c| null4.column(c).into_owned()).collect();

    for (j, &(a, b)) in CP_PAIRS.iter().enumerate() {
        let mut d = [[0.0; 3]; 4];

        for (k, col) in cols.iter().enumerate() {
            let base_a = 3 * a;
            let base_b = 3 * b;
            d[k][0] = col[base_a] - col[base_b];
            d[k][1] = col[base_a + 1] - col[base_b + 1];
            d[k][2] = col[base_a + 2] - col[base_b + 2];
        }

        #[inline(always)]
        fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
            a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
        }

        l[j] = [
            dot(&d[0], &d[0]),
            2.0 * dot(&d[0], &d[1]),
            dot(&d[1], &d[1]),
            2.0 * dot(&d[0], &d[2]),
            2.0 * dot(&d[1], &d[2]),
            dot(&d[2], &d[2]),
            2.0 * dot(&d[0], &d[3]),
            2.0 * dot(&d[1], &d[3]),
            2.0 * dot(&d[2], &d[3]),
            dot(&d[3], &d[3]),
        ];
    }
    l
}

/// Extracts a 6×k `DMatrix` by picking the specified columns from the 6×10 `L` matrix.
fn l_submatrix(l: &[[f64; 10]; 6], cols: &[usize]) -> DMatrix<f64> {
    let data: Vec<f64> = cols
        .iter()
        .flat_map(|&c| (0..6).map(move |r| l[r][c]))
        .collect();
    DMatrix::<f64>::from_column_slice(6, cols.len(), &data)
}

/// Solve for a beta vector given a column subset of the 6×10 L matrix.
/// Returns `None` if the least-squares solve fails.
fn estimate_beta<const K: usize>(
    cols: [usize; K],
    l: &[[f64; 10]; 6],
    rho: &DVector<f64>,
    tol_svd: f64,
) -> Option<[f64; 4]> {
    let l_sub = l_submatrix(l, &cols);
    let sol = l_sub.svd(true, true).solve(rho, tol_svd).ok()?;
    let x = sol.column(0);

    match K {
        4 => {
            let s = x[0].abs().sqrt();
            if s < f64::EPSILON {
                return None;
            }
            let mut b = [s, x[1] / s, x[2] / s, x[3] / s];
            if x[0] < 0.0 {
                for v in &mut b {
                    *v = -*v;
                }
            }
            Some(b)
        }
        3 => {
            let mut beta = [0.0; 4];
            if x[0] < 0.0 {
                beta[0] = (-x[0]).sqrt();
                beta[1] = if x[2] > 0.0 { 0.0 } else { (-x[2]).sqrt() };
            } else {
                beta[0] = x[0].sqrt();
                beta[1] = if x[2] < 0.0 { 0.0 } else { x[2].sqrt() };
            }
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
            Some(beta)
        }
        5 => {
            let mut beta = [0.0; 4];
            if x[0] < 0.0 {
                beta[0] = (-x[0]).sqrt();
                beta[1] = if x[2] > 0.0 { 0.0 } else { (-x[2]).sqrt() };
            } else {
                beta[0] = x[0].sqrt();
                beta[1] = if x[2] < 0.0 { 0.0 } else { x[2].sqrt() };
            }
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
            if beta[0].abs() < f64::EPSILON {
                return None;
            }
            beta[2] = x[3] / beta[0];
            Some(beta)
        }
        _ => None,
    }
}

const CP_PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Compute the six squared distances (ρ vector) between the 4 control points.
fn rho_ctrlpts(cw: &[[f64; 3]; 4]) -> [f64; 6] {
    CP_PAIRS.map(|(i, j)| {
        let dx = cw[i][0] - cw[j][0];
        let dy = cw[i][1] - cw[j][1];
        let dz = cw[i][2] - cw[j][2];
        dx.mul_add(dx, dy.mul_add(dy, dz * dz))
    })
}

#[cfg(test)]
mod solve_epnp_tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_epnp() -> Result<(), PnPError> {
        // Non-coplanar target seen by an 800 px camera
        let points_world: [[f64; 3]; 6] = [
            [0.0315, 0.03333, -0.10409],
            [-0.0315, 0.03333, -0.10409],
            [0.0, -0.00102, -0.12977],
            [0.02646, -0.03167, -0.1053],
            [-0.02646, -0.031667, -0.1053],
            [0.0, 0.04515, -0.11033],
        ];

        // Image points (uv)
        let points_image: [[f64; 2]; 6] = [
            [722.96466, 502.0828],
            [669.88837, 498.61877],
            [707.0025, 478.48975],
            [728.05634, 447.56918],
            [682.6069, 443.91776],
            [696.4414, 511.96442],
        ];

        let k = Matrix3::new(800.0, 0.0, 640.0, 0.0, 800.0, 480.0, 0.0, 0.0, 1.0);

        let cw = select_control_points(&points_world);

        let alphas = compute_barycentric(&points_world, &cw, EPnPParams::default().tol.eps);

        for (p, alpha) in points_world.iter().zip(alphas.iter()) {
            let mut recon = [0.0; 3];
            for j in 0..4 {
                for k in 0..3 {
                    recon[k] += cw[j][k] * alpha[j];
                }
            }
            for k in 0..3 {
                assert_relative_eq!(recon[k], p[k], epsilon = 1e-9);
            }

            assert_relative_eq!(alpha.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }

        let m = build_m(&alphas, &points_image, &k)?;
        assert_eq!(m.len(), 2 * points_world.len());

        let fu = k[(0, 0)];
        let fv = k[(1, 1)];
        let uc = k[(0, 2)];
        let vc = k[(1, 2)];

        let u0 = points_image[0][0];
        let v0 = points_image[0][1];

        let mut expected_x = [0.0; 12];
        let mut expected_y = [0.0; 12];

        #[allow(clippy::needless_range_loop)]
        for j in 0..4 {
            let base = 3 * j;
            expected_x[base] = alphas[0][j] * fu;
            expected_x[base + 2] = alphas[0][j] * (uc - u0);
            expected_y[base + 1] = alphas[0][j] * fv;
            expected_y[base + 2] = alphas[0][j] * (vc - v0);
        }

        for k in 0..12 {
            assert_relative_eq!(m[0][k], expected_x[k], epsilon = 1e-9);
            assert_relative_eq!(m[1][k], expected_y[k], epsilon = 1e-9);
        }

        let result = EPnP::solve(
            &points_world,
            &points_image,
            &k,
            None,
            &EPnPParams::default(),
        )?;
        let r = result.rotation;
        let t = result.translation;
        let rvec = result.rvec;

        // the image points were rendered from rvec (0.3, -0.2, 0.1), t (0.05, -0.04, 1.0)
        assert!(result.reproj_rmse.is_some_and(|e| e < 1e-3));

        // Row 0
        assert_relative_eq!(r[(0, 0)], 0.975290, epsilon = 1e-4);
        assert_relative_eq!(r[(0, 1)], -0.127335, epsilon = 1e-4);
        assert_relative_eq!(r[(0, 2)], -0.180540, epsilon = 1e-4);

        // Row 1
        assert_relative_eq!(r[(1, 0)], 0.068031, epsilon = 1e-4);
        assert_relative_eq!(r[(1, 1)], 0.950581, epsilon = 1e-4);
        assert_relative_eq!(r[(1, 2)], -0.302932, epsilon = 1e-4);

        // Row 2 (checking first col)
        assert_relative_eq!(r[(2, 0)], 0.210191, epsilon = 1e-4);

        // Translation
        assert_relative_eq!(t.x, 0.05, epsilon = 1e-5);
        assert_relative_eq!(t.y, -0.04, epsilon = 1e-5);
        assert_relative_eq!(t.z, 1.0, epsilon = 1e-5);

        // Rodrigues Vector
        assert_relative_eq!(rvec.x, 0.3, epsilon = 1e-5);
        assert_relative_eq!(rvec.y, -0.2, epsilon = 1e-5);
        assert_relative_eq!(rvec.z, 0.1, epsilon = 1e-5);

        Ok(())
    }
}

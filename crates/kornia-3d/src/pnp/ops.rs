#![allow(clippy::op_ref)]

use nalgebra::{DMatrix, DVector, Matrix3, Vector3, Vector4};

use crate::camera::{project_camera_point, undistort_point_polynomial, CameraIntrinsic, PolynomialDistortion};

/// Remove lens distortion from pixel coordinates, keeping the same camera matrix.
pub(crate) fn undistort_image_points(
    points_image: &[[f64; 2]],
    k: &Matrix3<f64>,
    distortion: Option<&PolynomialDistortion>,
) -> Vec<[f64; 2]> {
    match distortion {
        Some(d) if !d.is_identity() => {
            let intr = CameraIntrinsic::from_matrix(k);
            points_image
                .iter()
                .map(|p| {
                    let (u, v) = undistort_point_polynomial(p[0], p[1], &intr, d);
                    [u, v]
                })
                .collect()
        }
        _ => points_image.to_vec(),
    }
}

/// Root-mean-square reprojection error in pixels.
///
/// Points behind the camera contribute an infinite error.
pub(crate) fn reprojection_rmse(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    k: &Matrix3<f64>,
    distortion: Option<&PolynomialDistortion>,
) -> f64 {
    let intr = CameraIntrinsic::from_matrix(k);
    let n = points_world.len().max(1) as f64;

    let mut sum_sq = 0.0;
    for (pw, uv) in points_world.iter().zip(points_image.iter()) {
        let pc = r * Vector3::from(*pw) + t;
        if pc.z <= 0.0 {
            return f64::INFINITY;
        }
        let [u_hat, v_hat] = project_camera_point(&pc, &intr, distortion);
        let du = u_hat - uv[0];
        let dv = v_hat - uv[1];
        sum_sq += du.mul_add(du, dv * dv);
    }

    (sum_sq / n).sqrt()
}

pub(crate) fn gauss_newton(beta_init: [f64; 4], null4: &DMatrix<f64>, rho: &[f64; 6]) -> [f64; 4] {
    const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

    let mut bet = Vector4::from_column_slice(&beta_init);

    for _ in 0..6 {
        let mut f_vec = DVector::<f64>::zeros(6);
        let mut j_mat = DMatrix::<f64>::zeros(6, 4);

        for (r, (i, j)) in PAIRS.iter().enumerate() {
            // Vi = (null4 block rows 3*i..3*i+3) * bet
            let block_i = null4.view((*i * 3, 0), (3, 4));
            let block_j = null4.view((*j * 3, 0), (3, 4));

            let vi = &block_i * &bet;
            let vj = &block_j * &bet;

            let diff_vec = Vector3::new(vi[0] - vj[0], vi[1] - vj[1], vi[2] - vj[2]);

            f_vec[r] = diff_vec.dot(&diff_vec) - rho[r];

            for k in 0..4 {
                let vi_k = block_i.column(k);
                let vj_k = block_j.column(k);
                let col_diff = Vector3::new(vi_k[0] - vj_k[0], vi_k[1] - vj_k[1], vi_k[2] - vj_k[2]);
                j_mat[(r, k)] = col_diff.dot(&diff_vec) * 2.0;
            }
        }

        let jt = j_mat.transpose();
        let a = &jt * &j_mat + DMatrix::<f64>::identity(4, 4) * 1e-12;
        let b = &jt * f_vec;

        if let Some(delta) = a.lu().solve(&b) {
            let norm_val = delta.norm();
            bet -= &delta;
            if norm_val < 1e-12 {
                break;
            }
        } else {
            break;
        }
    }

    [bet[0], bet[1], bet[2], bet[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gauss_newton_zero_null_space() {
        // with a zero null space the jacobian vanishes and betas stay put
        let beta_init = [1.0, 2.0, 3.0, 4.0];
        let null4 = DMatrix::<f64>::zeros(12, 4);
        let rho = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let result = gauss_newton(beta_init, &null4, &rho);
        assert_eq!(result, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reprojection_rmse() {
        let k = Matrix3::new(100.0, 0.0, 50.0, 0.0, 100.0, 50.0, 0.0, 0.0, 1.0);
        let world = [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0]];
        let image = [[50.0, 50.0], [153.0, 54.0]];
        let rmse = reprojection_rmse(&world, &image, &Matrix3::identity(), &Vector3::zeros(), &k, None);
        // errors 0 and 5 px
        assert_relative_eq!(rmse, (25.0f64 / 2.0).sqrt(), epsilon = 1e-12);

        let behind = [[0.0, 0.0, -1.0]];
        let rmse = reprojection_rmse(&behind, &image[..1], &Matrix3::identity(), &Vector3::zeros(), &k, None);
        assert!(rmse.is_infinite());
    }

    #[test]
    fn test_undistort_image_points_identity() {
        let k = Matrix3::identity();
        let pts = vec![[1.0, 2.0]];
        assert_eq!(undistort_image_points(&pts, &k, None), pts);
        let d = PolynomialDistortion::default();
        assert_eq!(undistort_image_points(&pts, &k, Some(&d)), pts);
    }
}

use kornia_image::ImageSize;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use super::CalibError;
use crate::pose::{find_homography_dlt, PlaneFrame};

/// Closed form camera matrix of a planar target.
///
/// The principal point is placed at the image center and the focal lengths
/// are solved from the orthogonality constraints every plane to image
/// homography puts on the image of the absolute conic. Skew is zero.
///
/// # Arguments
///
/// * `object_points` - Target points per view, each view coplanar.
/// * `image_points` - Pixel coordinates per view.
/// * `image_size` - Size of the images.
/// * `aspect_ratio` - If set, the returned matrix has `fx / fy` equal to this ratio.
///
/// # Returns
///
/// The initial 3x3 camera matrix.
pub fn init_intrinsics_planar(
    object_points: &[Vec<[f64; 3]>],
    image_points: &[Vec<[f64; 2]>],
    image_size: ImageSize,
    aspect_ratio: Option<f64>,
) -> Result<Matrix3<f64>, CalibError> {
    let cx = (image_size.width.max(1) as f64 - 1.0) * 0.5;
    let cy = (image_size.height.max(1) as f64 - 1.0) * 0.5;

    let num_views = object_points.len().min(image_points.len());
    let mut a = DMatrix::<f64>::zeros(2 * num_views, 2);
    let mut b = DVector::<f64>::zeros(2 * num_views);

    for (i, (obj, img)) in object_points.iter().zip(image_points.iter()).enumerate() {
        let frame = PlaneFrame::fit(obj).ok_or(CalibError::NonPlanarTarget)?;
        let plane: Vec<[f64; 2]> = obj.iter().map(|p| frame.to_plane(p)).collect();
        let mut h = find_homography_dlt(&plane, img)?;

        // move the principal point to the origin
        for j in 0..3 {
            h[(0, j)] -= h[(2, j)] * cx;
            h[(1, j)] -= h[(2, j)] * cy;
        }

        let c0: Vector3<f64> = h.column(0).into_owned();
        let c1: Vector3<f64> = h.column(1).into_owned();
        let hv = c0.normalize();
        let vv = c1.normalize();
        let d1 = ((c0 + c1) * 0.5).normalize();
        let d2 = ((c0 - c1) * 0.5).normalize();

        a[(2 * i, 0)] = hv.x * vv.x;
        a[(2 * i, 1)] = hv.y * vv.y;
        b[2 * i] = -hv.z * vv.z;
        a[(2 * i + 1, 0)] = d1.x * d2.x;
        a[(2 * i + 1, 1)] = d1.y * d2.y;
        b[2 * i + 1] = -d1.z * d2.z;
    }

    let f = a
        .svd(true, true)
        .solve(&b, 1e-15)
        .map_err(|e| CalibError::IntrinsicInit(e.to_string()))?;

    let mut fx = (1.0 / f[0]).abs().sqrt();
    let mut fy = (1.0 / f[1]).abs().sqrt();

    if let Some(ratio) = aspect_ratio {
        let tf = (fx + fy) / (ratio + 1.0);
        fx = ratio * tf;
        fy = tf;
    }

    if !fx.is_finite() || !fy.is_finite() || fx <= 0.0 || fy <= 0.0 {
        return Err(CalibError::IntrinsicInit(format!(
            "degenerate views, focal lengths ({fx}, {fy})"
        )));
    }

    log::debug!("initial intrinsics fx={fx:.3} fy={fy:.3} cx={cx:.3} cy={cy:.3}");

    Ok(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

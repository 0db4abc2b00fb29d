use std::sync::Arc;

use kornia_3d::linalg::{matrix4_to_rigid, rigid_to_matrix4};
use kornia_image::{Image, ImageSize};
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

/// Grayscale image a pose was captured from.
pub type PoseImage = Image<u8, 1>;

/// One observation of the calibration pattern by one camera.
///
/// The finder fills the correspondences, the calibration fills the
/// transformation and the reprojected points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Globally unique pose id.
    pub id: usize,
    /// Shared handle to the source image, not serialized.
    #[serde(skip)]
    pub image: Option<Arc<PoseImage>>,
    /// Detected pixel coordinates of the pattern points.
    pub points2d: Vec<[f64; 2]>,
    /// Pattern coordinates matching `points2d`.
    pub points3d: Vec<[f64; 3]>,
    /// Indices of the detected pattern points.
    pub point_indices: Vec<usize>,
    /// Set when the pose was excluded from the last calibration.
    pub rejected: bool,
    /// Transformation from pattern coordinates into the camera frame.
    pub transformation: Matrix4<f64>,
    /// `points3d` reprojected through the calibrated camera.
    pub projected2d: Vec<[f64; 2]>,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            id: 0,
            image: None,
            points2d: Vec::new(),
            points3d: Vec::new(),
            point_indices: Vec::new(),
            rejected: false,
            transformation: Matrix4::identity(),
            projected2d: Vec::new(),
        }
    }
}

impl Pose {
    /// Create an empty pose for an image.
    pub fn new(id: usize, image: Option<Arc<PoseImage>>) -> Self {
        Self {
            id,
            image,
            ..Default::default()
        }
    }

    /// Size of the source image, if any.
    pub fn image_size(&self) -> Option<ImageSize> {
        self.image.as_ref().map(|img| img.size())
    }

    /// Number of detected correspondences.
    pub fn num_correspondences(&self) -> usize {
        self.point_indices.len()
    }

    /// Rotation and translation of the transformation.
    pub fn rigid(&self) -> (Matrix3<f64>, Vector3<f64>) {
        matrix4_to_rigid(&self.transformation)
    }

    /// Set the transformation from a rotation and a translation.
    pub fn set_rigid(&mut self, rotation: &Matrix3<f64>, translation: &Vector3<f64>) {
        self.transformation = rigid_to_matrix4(rotation, translation);
    }

    /// RMS distance between the detected and the reprojected points.
    ///
    /// Returns `None` until the pose has been reprojected.
    pub fn reprojection_rmse(&self) -> Option<f64> {
        if self.projected2d.is_empty() || self.projected2d.len() != self.points2d.len() {
            return None;
        }
        let sum_sq: f64 = self
            .points2d
            .iter()
            .zip(self.projected2d.iter())
            .map(|(a, b)| (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2))
            .sum();
        Some((sum_sq / self.points2d.len() as f64).sqrt())
    }
}

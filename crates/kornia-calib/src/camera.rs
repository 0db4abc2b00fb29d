use std::collections::BTreeMap;

use kornia_image::ImageSize;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::pose::Pose;

/// A camera with its calibration and its observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Camera id.
    pub id: usize,
    /// Size shared by every image of the camera.
    pub image_size: ImageSize,
    /// 3x3 camera matrix.
    pub intrinsic: Matrix3<f64>,
    /// Distortion coefficients `k1, k2, p1, p2, k3`.
    pub distortion: Vec<f64>,
    /// Reprojection RMS of the last calibration in pixels.
    pub error: f64,
    /// Observations in insertion order.
    pub poses: Vec<Pose>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            id: 0,
            image_size: ImageSize::default(),
            intrinsic: Matrix3::identity(),
            distortion: Vec::new(),
            error: 0.0,
            poses: Vec::new(),
        }
    }
}

impl Camera {
    /// Create an uncalibrated camera.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Focal lengths `[fx, fy]`.
    pub fn focal_length(&self) -> [f64; 2] {
        [self.intrinsic[(0, 0)], self.intrinsic[(1, 1)]]
    }

    /// Principal point `[cx, cy]`.
    pub fn principal_point(&self) -> [f64; 2] {
        [self.intrinsic[(0, 2)], self.intrinsic[(1, 2)]]
    }

    /// Pose with the given id.
    pub fn pose(&self, id: usize) -> Option<&Pose> {
        self.poses.iter().find(|p| p.id == id)
    }

    /// Mutable pose with the given id.
    pub fn pose_mut(&mut self, id: usize) -> Option<&mut Pose> {
        self.poses.iter_mut().find(|p| p.id == id)
    }

    /// Copy of the camera parameters without any pose.
    pub(crate) fn empty_copy(&self) -> Self {
        Self {
            id: self.id,
            image_size: self.image_size,
            intrinsic: self.intrinsic,
            distortion: self.distortion.clone(),
            error: self.error,
            poses: Vec::new(),
        }
    }
}

/// Cameras ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraSet {
    cameras: BTreeMap<usize, Camera>,
}

impl CameraSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cameras.
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    /// Returns true if the set has no camera.
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Total number of poses over all cameras.
    pub fn pose_count(&self) -> usize {
        self.cameras.values().map(|c| c.poses.len()).sum()
    }

    /// Insert a camera under its id, returning the one it replaces.
    pub fn insert(&mut self, camera: Camera) -> Option<Camera> {
        self.cameras.insert(camera.id, camera)
    }

    /// Remove every camera.
    pub fn clear(&mut self) {
        self.cameras.clear();
    }

    /// Camera with the given id.
    pub fn camera(&self, id: usize) -> Result<&Camera, CalibrationError> {
        self.cameras
            .get(&id)
            .ok_or(CalibrationError::CameraNotFound(id))
    }

    /// Mutable camera with the given id.
    pub fn camera_mut(&mut self, id: usize) -> Result<&mut Camera, CalibrationError> {
        self.cameras
            .get_mut(&id)
            .ok_or(CalibrationError::CameraNotFound(id))
    }

    /// Pose with the given id, searched over all cameras.
    pub fn pose(&self, id: usize) -> Result<&Pose, CalibrationError> {
        self.cameras
            .values()
            .find_map(|c| c.pose(id))
            .ok_or(CalibrationError::PoseNotFound(id))
    }

    /// Cameras in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    /// Mutable cameras in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Camera> {
        self.cameras.values_mut()
    }

    /// Camera ids in order.
    pub fn ids(&self) -> Vec<usize> {
        self.cameras.keys().copied().collect()
    }

    pub(crate) fn entry(&mut self, id: usize) -> &mut Camera {
        self.cameras.entry(id).or_insert_with(|| Camera::new(id))
    }

    /// The two cameras with the smallest ids.
    pub(crate) fn pair_mut(&mut self) -> Option<(&mut Camera, &mut Camera)> {
        let mut it = self.cameras.values_mut();
        let first = it.next()?;
        let second = it.next()?;
        Some((first, second))
    }
}

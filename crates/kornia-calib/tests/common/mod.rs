#![allow(dead_code)]

use std::sync::Arc;

use kornia_3d::camera::{project_points, CameraIntrinsic, PolynomialDistortion};
use kornia_3d::linalg::rvec_to_rotation;
use kornia_calib::{CalibrationError, CameraCalibration, Pattern, PoseImage, PrecomputedFinder};
use kornia_image::{Image, ImageSize};
use nalgebra::{Matrix3, Vector3};

pub const SIZE: ImageSize = ImageSize {
    width: 640,
    height: 480,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Board poses (rvec, tvec) seen by the first camera.
pub fn board_poses() -> Vec<([f64; 3], [f64; 3])> {
    vec![
        ([0.3, -0.2, 0.05], [-0.12, -0.08, 0.9]),
        ([-0.25, 0.3, -0.1], [-0.15, -0.1, 1.0]),
        ([0.1, 0.4, 0.2], [-0.1, -0.12, 1.1]),
        ([-0.4, -0.1, 0.0], [-0.14, -0.06, 0.95]),
        ([0.2, 0.2, -0.3], [-0.08, -0.1, 1.05]),
        ([0.05, -0.35, 0.15], [-0.1, -0.09, 0.85]),
    ]
}

/// Two cameras observing a chessboard from the same board poses.
pub struct Rig {
    pub pattern: Pattern,
    pub camera_matrix: [Matrix3<f64>; 2],
    pub dist_coeffs: [Vec<f64>; 2],
    /// First to second camera.
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Pattern to camera pose of every frame, per camera.
    pub poses: Vec<[(Matrix3<f64>, Vector3<f64>); 2]>,
    /// Rendered pattern points of every frame, per camera.
    pub views: Vec<[Vec<[f64; 2]>; 2]>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_pattern(Pattern::chessboard(9, 6, 0.025), board_poses().len())
    }

    /// Rig rendering `pattern` from the first `frames` board poses.
    pub fn with_pattern(pattern: Pattern, frames: usize) -> Self {
        let intrinsics = [
            CameraIntrinsic {
                fx: 800.0,
                fy: 795.0,
                cx: 322.0,
                cy: 238.0,
            },
            CameraIntrinsic {
                fx: 780.0,
                fy: 782.0,
                cx: 316.0,
                cy: 242.0,
            },
        ];
        let dist_coeffs = [
            vec![-0.1, 0.02, 0.0, 0.0, 0.0],
            vec![0.05, -0.01, 0.0, 0.0, 0.0],
        ];
        let rotation = rvec_to_rotation(&[0.01, -0.05, 0.02]);
        let translation = Vector3::new(-0.1, 0.002, 0.001);

        let mut poses = Vec::new();
        let mut views = Vec::new();
        for (rvec, tvec) in board_poses().into_iter().take(frames) {
            let r1 = rvec_to_rotation(&rvec);
            let t1 = Vector3::from(tvec);
            let r2 = rotation * r1;
            let t2 = rotation * t1 + translation;

            let render = |r: &Matrix3<f64>, t: &Vector3<f64>, cam: usize| {
                let dist = PolynomialDistortion::from_coeffs(&dist_coeffs[cam]);
                project_points(pattern.points(), r, t, &intrinsics[cam], Some(&dist))
            };
            views.push([render(&r1, &t1, 0), render(&r2, &t2, 1)]);
            poses.push([(r1, t1), (r2, t2)]);
        }

        Self {
            pattern,
            camera_matrix: [intrinsics[0].matrix(), intrinsics[1].matrix()],
            dist_coeffs,
            rotation,
            translation,
            poses,
            views,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.views.len()
    }

    /// Pose id of a frame when the images are added frame by frame, camera 0 first.
    pub fn pose_id(frame: usize, camera: usize) -> usize {
        2 * frame + camera
    }

    /// Finder holding the full detections of both cameras.
    pub fn finder(&self) -> PrecomputedFinder {
        let mut finder = PrecomputedFinder::new(self.pattern.clone());
        let indices: Vec<usize> = (0..self.pattern.len()).collect();
        for (frame, view) in self.views.iter().enumerate() {
            for (camera, points) in view.iter().enumerate() {
                finder
                    .insert(Self::pose_id(frame, camera), points.clone(), indices.clone())
                    .expect("valid detection");
            }
        }
        finder
    }

    /// Add one image per camera and frame, in pose id order.
    pub fn add_images(&self, calib: &mut CameraCalibration) -> Result<(), CalibrationError> {
        let image = image(SIZE);
        for frame in 0..self.num_frames() {
            for camera in 0..2 {
                let id = calib.add_image(image.clone(), camera)?;
                assert_eq!(id, Self::pose_id(frame, camera));
            }
        }
        Ok(())
    }
}

pub fn image(size: ImageSize) -> Arc<PoseImage> {
    Arc::new(Image::from_size_val(size, 0u8).expect("valid image"))
}

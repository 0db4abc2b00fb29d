mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use common::{init_logger, Rig, SIZE};
use kornia_3d::calib::{
    CalibError, CalibFlags, CameraCalibrationResult, CameraObservations, StereoCalibrationResult,
};
use kornia_calib::{
    CalibrationError, CalibrationSolver, Camera, CameraSet, Finder, FnFinder, NativeSolver,
    Pattern, Pose, PrecomputedFinder, SingleCalibration, SingleCalibrationConfig, TermCriteria,
};
use nalgebra::{Matrix3, Matrix4, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn calibration(finder: Arc<dyn Finder>) -> SingleCalibration {
    let mut calib = SingleCalibration::new();
    calib.set_finder(finder);
    calib.set_term_criteria(TermCriteria::new(100, 1e-15));
    calib
}

#[test]
fn single_calibration_end_to_end() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::with_pattern(Pattern::chessboard(5, 2, 0.05), 5);

    let mut calib = SingleCalibration::new();
    calib.set_finder(Arc::new(rig.finder()));
    rig.add_images(&mut calib)?;
    calib.calibrate_accumulated()?;

    for camera in calib.cameras().iter() {
        assert_ne!(camera.intrinsic, Matrix3::identity());
        assert_eq!(camera.distortion.len(), 5);
        assert!(camera.error >= 0.0);
        assert_eq!(camera.poses.len(), 5);
        for pose in &camera.poses {
            assert!(!pose.rejected);
            assert_eq!(pose.point_indices.len(), 10);
            assert_ne!(pose.transformation, Matrix4::identity());
            assert_eq!(pose.projected2d.len(), 10);
        }
    }
    assert_eq!(calib.progress().processed(), 10);
    assert_eq!(calib.progress().fraction(), 1.0);
    Ok(())
}

#[test]
fn single_calibration_recovers_ground_truth() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::new();

    let mut calib = calibration(Arc::new(rig.finder()));
    rig.add_images(&mut calib)?;
    calib.calibrate_accumulated()?;

    for cam in 0..2 {
        let camera = calib.camera(cam)?;
        assert_eq!(camera.image_size, SIZE);
        assert!(camera.error < 1e-4, "camera {cam} rms {}", camera.error);
        assert_relative_eq!(camera.intrinsic, rig.camera_matrix[cam], max_relative = 5e-4);
        assert_relative_eq!(camera.distortion[0], rig.dist_coeffs[cam][0], epsilon = 1e-3);

        for (frame, poses) in rig.poses.iter().enumerate() {
            let pose = calib.pose(Rig::pose_id(frame, cam))?;
            let (rotation, translation) = pose.rigid();
            assert_relative_eq!(rotation, poses[cam].0, epsilon = 1e-4);
            assert_relative_eq!(translation, poses[cam].1, epsilon = 1e-4);
            let rmse = pose.reprojection_rmse().expect("reprojected pose");
            assert!(rmse < 1e-3);
        }
    }
    Ok(())
}

#[test]
fn single_calibration_with_noise() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::new();
    let mut rng = StdRng::seed_from_u64(42);

    let mut finder = PrecomputedFinder::new(rig.pattern.clone());
    let indices: Vec<usize> = (0..rig.pattern.len()).collect();
    for (frame, view) in rig.views.iter().enumerate() {
        for (cam, points) in view.iter().enumerate() {
            let noisy = points
                .iter()
                .map(|p| {
                    [
                        p[0] + rng.random_range(-0.2..0.2),
                        p[1] + rng.random_range(-0.2..0.2),
                    ]
                })
                .collect();
            finder.insert(Rig::pose_id(frame, cam), noisy, indices.clone())?;
        }
    }

    let mut calib = SingleCalibration::with_config(
        SingleCalibrationConfig::default().with_tangential_distortion(false),
    );
    calib.set_finder(Arc::new(finder));
    rig.add_images(&mut calib)?;
    calib.calibrate_accumulated()?;

    for cam in 0..2 {
        let camera = calib.camera(cam)?;
        assert!(camera.error > 0.0 && camera.error < 0.3, "rms {}", camera.error);
        assert_relative_eq!(camera.focal_length()[0], rig.camera_matrix[cam][(0, 0)], max_relative = 1e-2);
        assert_relative_eq!(camera.focal_length()[1], rig.camera_matrix[cam][(1, 1)], max_relative = 1e-2);
        assert_eq!(camera.distortion[2], 0.0);
        assert_eq!(camera.distortion[3], 0.0);
    }
    Ok(())
}

/// Chessboard folded along its middle column, the sides rising towards the camera.
fn folded_board() -> Pattern {
    let points = Pattern::chessboard(9, 6, 0.025)
        .points()
        .iter()
        .map(|&[x, y, _]| [x, y, -0.02 * (x - 0.1).abs() / 0.1])
        .collect();
    Pattern::from_points(points)
}

#[test]
fn single_calibration_non_planar_target() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::with_pattern(folded_board(), 6);

    // a folded board cannot be initialized in closed form
    let mut calib = calibration(Arc::new(rig.finder()));
    rig.add_images(&mut calib)?;
    assert!(matches!(
        calib.calibrate_accumulated(),
        Err(CalibrationError::Solver(CalibError::NonPlanarTarget))
    ));

    let mut calib = SingleCalibration::with_config(
        SingleCalibrationConfig::default().with_use_intrinsic_guess(true),
    );
    calib.set_finder(Arc::new(rig.finder()));
    calib.set_term_criteria(TermCriteria::new(100, 1e-15));
    rig.add_images(&mut calib)?;
    for cam in 0..2 {
        let truth = rig.camera_matrix[cam];
        let camera = calib.cameras_mut().camera_mut(cam)?;
        camera.intrinsic = Matrix3::new(
            truth[(0, 0)] * 0.97,
            0.0,
            truth[(0, 2)] + 5.0,
            0.0,
            truth[(1, 1)] * 1.03,
            truth[(1, 2)] - 4.0,
            0.0,
            0.0,
            1.0,
        );
    }
    calib.calibrate_accumulated()?;

    for cam in 0..2 {
        let camera = calib.camera(cam)?;
        assert!(camera.error < 1e-4, "camera {cam} rms {}", camera.error);
        assert_relative_eq!(camera.intrinsic, rig.camera_matrix[cam], max_relative = 5e-4);
        assert_relative_eq!(camera.distortion[0], rig.dist_coeffs[cam][0], epsilon = 1e-3);

        for (frame, poses) in rig.poses.iter().enumerate() {
            let pose = calib.pose(Rig::pose_id(frame, cam))?;
            assert!(!pose.rejected);
            let (rotation, translation) = pose.rigid();
            assert_relative_eq!(rotation, poses[cam].0, epsilon = 1e-4);
            assert_relative_eq!(translation, poses[cam].1, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn single_calibration_excludes_weak_camera() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::new();

    let mut finder = PrecomputedFinder::new(rig.pattern.clone());
    let indices: Vec<usize> = (0..rig.pattern.len()).collect();
    for (frame, view) in rig.views.iter().enumerate() {
        finder.insert(Rig::pose_id(frame, 0), view[0].clone(), indices.clone())?;
        // three corners only, not enough for the second camera
        finder.insert(Rig::pose_id(frame, 1), view[1][..3].to_vec(), indices[..3].to_vec())?;
    }

    let mut calib = calibration(Arc::new(finder));
    rig.add_images(&mut calib)?;
    calib.calibrate_accumulated()?;

    assert_eq!(calib.filtered_cameras().ids(), vec![0]);

    let calibrated = calib.camera(0)?;
    assert!(calibrated.poses.iter().all(|p| !p.rejected));
    assert_relative_eq!(calibrated.intrinsic, rig.camera_matrix[0], max_relative = 5e-4);

    let excluded = calib.camera(1)?;
    assert_eq!(excluded.intrinsic, Matrix3::identity());
    assert_eq!(excluded.error, 0.0);
    assert!(excluded.distortion.is_empty());
    for pose in &excluded.poses {
        assert!(pose.rejected);
        assert_eq!(pose.transformation, Matrix4::identity());
        assert!(pose.projected2d.is_empty());
    }
    Ok(())
}

#[test]
fn single_calibration_parallel_matches_sequential() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::new();
    let precomputed = Arc::new(rig.finder());

    let calls = Arc::new(AtomicUsize::new(0));
    let sequential = {
        let inner = Arc::clone(&precomputed);
        let calls = Arc::clone(&calls);
        FnFinder::new(move |pose: &mut Pose| {
            calls.fetch_add(1, Ordering::SeqCst);
            inner.find(pose)
        })
    };
    assert!(!sequential.supports_parallel());

    let mut results = Vec::new();
    let finders: [Arc<dyn Finder>; 2] = [precomputed, Arc::new(sequential)];
    for finder in finders {
        let mut calib = calibration(finder);
        rig.add_images(&mut calib)?;
        calib.calibrate_accumulated()?;

        let progress = calib.progress();
        assert_eq!(progress.processed(), 2 * rig.num_frames());
        assert_eq!(progress.total(), 2 * rig.num_frames());
        results.push(calib.cameras().clone());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2 * rig.num_frames());
    for (parallel, sequential) in results[0].iter().zip(results[1].iter()) {
        assert_relative_eq!(parallel.intrinsic, sequential.intrinsic, epsilon = 1e-9);
        assert_eq!(parallel.poses.len(), sequential.poses.len());
    }
    Ok(())
}

#[test]
fn single_filter_is_idempotent() -> Result<(), CalibrationError> {
    let rig = Rig::new();
    let finder = rig.finder();

    let mut cs = CameraSet::new();
    let mut camera = Camera::new(0);
    camera.image_size = SIZE;
    for frame in 0..rig.num_frames() {
        let mut pose = Pose::new(Rig::pose_id(frame, 0), None);
        finder.find(&mut pose)?;
        if frame == 2 {
            pose.point_indices.truncate(2);
        }
        camera.poses.push(pose);
    }
    cs.insert(camera);

    let mut calib = SingleCalibration::new();
    calib.filter(&mut cs);
    let first = calib.filtered_cameras().clone();
    calib.filter(&mut cs);
    assert_eq!(calib.filtered_cameras(), &first);
    assert_eq!(first.camera(0)?.poses.len(), rig.num_frames() - 1);
    Ok(())
}

/// Solver returning fixed values and counting its calls.
#[derive(Default)]
struct FixedSolver {
    calls: AtomicUsize,
}

impl FixedSolver {
    fn camera_matrix() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }
}

impl CalibrationSolver for FixedSolver {
    fn calibrate_camera(
        &self,
        object_points: &[Vec<[f64; 3]>],
        _camera: &CameraObservations,
        flags: CalibFlags,
        _criteria: &TermCriteria,
    ) -> Result<CameraCalibrationResult, CalibError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(flags.contains(CalibFlags::FIX_PRINCIPAL_POINT));
        let n = object_points.len();
        Ok(CameraCalibrationResult {
            camera_matrix: Self::camera_matrix(),
            dist_coeffs: vec![0.0; 5],
            rvecs: vec![[0.0; 3]; n],
            tvecs: (0..n).map(|i| [0.0, 0.0, 1.0 + i as f64]).collect(),
            per_view_errors: vec![0.25; n],
            rms: 0.25,
            iterations: 1,
        })
    }

    fn stereo_calibrate(
        &self,
        _object_points: &[Vec<[f64; 3]>],
        _camera1: &CameraObservations,
        _camera2: &CameraObservations,
        _flags: CalibFlags,
        _criteria: &TermCriteria,
    ) -> Result<StereoCalibrationResult, CalibError> {
        Err(CalibError::NoViews)
    }

    fn solve_pnp(
        &self,
        _object_points: &[[f64; 3]],
        _image_points: &[[f64; 2]],
        _camera_matrix: &Matrix3<f64>,
        _dist_coeffs: &[f64],
    ) -> Result<(Matrix3<f64>, Vector3<f64>), CalibError> {
        Ok((Matrix3::identity(), Vector3::zeros()))
    }

    fn project_points(
        &self,
        object_points: &[[f64; 3]],
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
    ) -> Vec<[f64; 2]> {
        NativeSolver.project_points(object_points, rotation, translation, camera_matrix, dist_coeffs)
    }
}

#[test]
fn single_calibration_with_custom_solver() -> Result<(), CalibrationError> {
    init_logger();
    let rig = Rig::new();
    let solver = Arc::new(FixedSolver::default());

    let mut calib = calibration(Arc::new(rig.finder()));
    calib.set_solver(solver.clone());
    calib.configure(true, false, true, false);
    rig.add_images(&mut calib)?;
    calib.calibrate_accumulated()?;

    assert_eq!(solver.calls.load(Ordering::SeqCst), 2);
    for camera in calib.cameras().iter() {
        assert_eq!(camera.intrinsic, FixedSolver::camera_matrix());
        assert_eq!(camera.error, 0.25);
        for (i, pose) in camera.poses.iter().enumerate() {
            assert_eq!(pose.transformation[(2, 3)], 1.0 + i as f64);
            assert_eq!(pose.projected2d.len(), rig.pattern.len());
        }
    }
    Ok(())
}

#[test]
fn single_calibration_requires_finder() {
    let mut calib = SingleCalibration::new();
    let mut cs = CameraSet::new();
    assert!(matches!(
        calib.calibrate(&mut cs),
        Err(CalibrationError::FinderNotSet)
    ));
}

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};

use kornia_3d::calib::{calibrate_camera, CalibFlags, CameraObservations, TermCriteria};
use kornia_3d::camera::{project_points_rvec, CameraIntrinsic, PolynomialDistortion};
use kornia_image::ImageSize;
use nalgebra::Matrix3;

type Views = (Vec<Vec<[f64; 3]>>, Vec<Vec<[f64; 2]>>);

fn synthetic_views(num_views: usize) -> Views {
    let intr = CameraIntrinsic {
        fx: 800.0,
        fy: 800.0,
        cx: 320.0,
        cy: 240.0,
    };
    let dist = PolynomialDistortion::from_coeffs(&[-0.1, 0.01, 0.0, 0.0, 0.0]);
    let board: Vec<[f64; 3]> = (0..54)
        .map(|i| [0.025 * (i % 9) as f64, 0.025 * (i / 9) as f64, 0.0])
        .collect();

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut object_points = Vec::with_capacity(num_views);
    let mut image_points = Vec::with_capacity(num_views);
    for _ in 0..num_views {
        let rvec = [
            rng.random_range(-0.4..0.4),
            rng.random_range(-0.4..0.4),
            rng.random_range(-0.2..0.2),
        ];
        let tvec = [-0.1, -0.06, rng.random_range(0.8..1.2)];
        let pts = project_points_rvec(&board, &rvec, &tvec, &intr, Some(&dist))
            .into_iter()
            .map(|[u, v]| [u + rng.random_range(-0.1..0.1), v + rng.random_range(-0.1..0.1)])
            .collect();
        object_points.push(board.clone());
        image_points.push(pts);
    }
    (object_points, image_points)
}

fn bench_calibrate_camera(c: &mut Criterion) {
    let mut group = c.benchmark_group("calibrate_camera");

    for num_views in [5, 10, 20].iter() {
        let (object_points, image_points) = synthetic_views(*num_views);
        let camera = CameraObservations {
            image_points: &image_points,
            image_size: ImageSize {
                width: 640,
                height: 480,
            },
            camera_matrix: Matrix3::identity(),
            dist_coeffs: &[],
        };

        group.bench_with_input(
            BenchmarkId::new("planar", num_views),
            &object_points,
            |b, object_points| {
                b.iter(|| {
                    black_box(calibrate_camera(
                        object_points,
                        &camera,
                        CalibFlags::NONE,
                        &TermCriteria::default(),
                    ))
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_calibrate_camera);
criterion_main!(benches);

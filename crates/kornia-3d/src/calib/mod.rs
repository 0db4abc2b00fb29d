//! Planar target camera calibration.
//!
//! - [`calibrate_camera`]: intrinsics, distortion and per-view poses of a single camera
//! - [`stereo_calibrate`]: joint calibration of a camera pair and their relative pose
//!
//! Both minimize the reprojection error with Levenberg-Marquardt, honouring
//! the [`CalibFlags`] option bits.

mod init;
mod mono;
mod params;
mod stereo;

pub use init::init_intrinsics_planar;
pub use mono::{calibrate_camera, CameraCalibrationResult};
pub use stereo::{stereo_calibrate, StereoCalibrationResult};

use std::ops::{BitAnd, BitOr, BitOrAssign};

use kornia_image::ImageSize;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::linalg::LinalgError;
use crate::optim::{LevenbergMarquardt, OptimizerError};
use crate::pnp::PnPError;
use crate::pose::HomographyError;

/// Calibration option bits.
///
/// The bit values match the OpenCV `CALIB_*` constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibFlags(u32);

impl CalibFlags {
    /// No option set.
    pub const NONE: Self = Self(0);
    /// The supplied camera matrix seeds the refinement.
    pub const USE_INTRINSIC_GUESS: Self = Self(1);
    /// The ratio fx/fy is held at its initial value.
    pub const FIX_ASPECT_RATIO: Self = Self(1 << 1);
    /// The principal point is held at its initial value.
    pub const FIX_PRINCIPAL_POINT: Self = Self(1 << 2);
    /// Tangential distortion coefficients are held at zero.
    pub const ZERO_TANGENT_DIST: Self = Self(1 << 3);
    /// Intrinsics and distortion of both cameras are fixed, only extrinsics are solved.
    pub const FIX_INTRINSIC: Self = Self(1 << 8);
    /// Both cameras share fx and fy.
    pub const SAME_FOCAL_LENGTH: Self = Self(1 << 9);

    /// The raw bit representation.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Build flags from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns true if all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Set or clear the bits of `other`.
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for CalibFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CalibFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CalibFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Termination criteria of the iterative refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermCriteria {
    /// Maximum number of accepted refinement steps.
    pub max_iterations: usize,
    /// Relative change of the reprojection cost below which the refinement stops.
    pub epsilon: f64,
}

impl Default for TermCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            epsilon: 1e-6,
        }
    }
}

impl TermCriteria {
    /// Create new criteria.
    pub fn new(max_iterations: usize, epsilon: f64) -> Self {
        Self {
            max_iterations,
            epsilon,
        }
    }

    pub(crate) fn optimizer(&self) -> LevenbergMarquardt {
        LevenbergMarquardt {
            max_iterations: self.max_iterations,
            cost_tolerance: self.epsilon,
            ..Default::default()
        }
    }
}

/// Observations of one camera fed to the calibration routines.
#[derive(Debug, Clone, Copy)]
pub struct CameraObservations<'a> {
    /// Detected pixel coordinates, one list per view.
    pub image_points: &'a [Vec<[f64; 2]>],
    /// Size of the images the points come from.
    pub image_size: ImageSize,
    /// Initial camera matrix, used with [`CalibFlags::USE_INTRINSIC_GUESS`],
    /// [`CalibFlags::FIX_INTRINSIC`] or for the aspect ratio of
    /// [`CalibFlags::FIX_ASPECT_RATIO`].
    pub camera_matrix: Matrix3<f64>,
    /// Initial distortion coefficients in `k1, k2, p1, p2, k3` order.
    pub dist_coeffs: &'a [f64],
}

/// Error types for camera calibration.
#[derive(Debug, Error)]
pub enum CalibError {
    /// No view was provided.
    #[error("At least one view is required")]
    NoViews,

    /// Object and image point lists cover a different number of views.
    #[error("Object points cover {object} views but image points cover {image}")]
    MismatchedViews {
        /// Number of object point views.
        object: usize,
        /// Number of image point views.
        image: usize,
    },

    /// Object and image points of a view have different lengths.
    #[error("View {view}: {object} object points but {image} image points")]
    MismatchedPoints {
        /// View index.
        view: usize,
        /// Number of object points.
        object: usize,
        /// Number of image points.
        image: usize,
    },

    /// A view has too few points.
    #[error("View {view}: at least {required} points are required, got {actual}")]
    InsufficientPoints {
        /// View index.
        view: usize,
        /// Minimum number of points.
        required: usize,
        /// Number of points provided.
        actual: usize,
    },

    /// The image size is empty.
    #[error("Invalid image size {0}")]
    InvalidImageSize(ImageSize),

    /// The supplied camera matrix cannot be used.
    #[error("Invalid camera matrix: {0}")]
    InvalidCameraMatrix(String),

    /// Non-planar targets need an intrinsic guess.
    #[error("Non-planar calibration targets require an initial intrinsic guess")]
    NonPlanarTarget,

    /// The closed form intrinsic initialization failed.
    #[error("Intrinsic initialization failed: {0}")]
    IntrinsicInit(String),

    /// Homography estimation failed.
    #[error(transparent)]
    Homography(#[from] HomographyError),

    /// Pose estimation failed.
    #[error(transparent)]
    PnP(#[from] PnPError),

    /// Refinement failed.
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra failure.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Check the view lists and return the total number of points.
pub(crate) fn validate_views(
    object_points: &[Vec<[f64; 3]>],
    image_points: &[Vec<[f64; 2]>],
) -> Result<usize, CalibError> {
    if object_points.is_empty() {
        return Err(CalibError::NoViews);
    }
    if object_points.len() != image_points.len() {
        return Err(CalibError::MismatchedViews {
            object: object_points.len(),
            image: image_points.len(),
        });
    }

    let mut total = 0;
    for (view, (obj, img)) in object_points.iter().zip(image_points.iter()).enumerate() {
        if obj.len() != img.len() {
            return Err(CalibError::MismatchedPoints {
                view,
                object: obj.len(),
                image: img.len(),
            });
        }
        if obj.len() < 4 {
            return Err(CalibError::InsufficientPoints {
                view,
                required: 4,
                actual: obj.len(),
            });
        }
        total += obj.len();
    }

    Ok(total)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calib_flags() {
        let mut flags = CalibFlags::FIX_PRINCIPAL_POINT | CalibFlags::ZERO_TANGENT_DIST;
        assert!(flags.contains(CalibFlags::FIX_PRINCIPAL_POINT));
        assert!(!flags.contains(CalibFlags::FIX_ASPECT_RATIO));
        assert_eq!(flags.bits(), 4 | 8);

        flags.set(CalibFlags::ZERO_TANGENT_DIST, false);
        flags |= CalibFlags::SAME_FOCAL_LENGTH;
        assert_eq!(flags.bits(), 4 | 512);
        assert!(CalibFlags::NONE.is_empty());
        assert_eq!(
            (flags & CalibFlags::SAME_FOCAL_LENGTH),
            CalibFlags::SAME_FOCAL_LENGTH
        );
        assert_eq!(CalibFlags::from_bits(256), CalibFlags::FIX_INTRINSIC);
    }

    #[test]
    fn test_validate_views() {
        let obj = vec![vec![[0.0; 3]; 4], vec![[0.0; 3]; 5]];
        let img = vec![vec![[0.0; 2]; 4], vec![[0.0; 2]; 5]];
        assert!(matches!(validate_views(&obj, &img), Ok(9)));
        assert!(matches!(
            validate_views(&obj, &img[..1]),
            Err(CalibError::MismatchedViews { object: 2, image: 1 })
        ));
        assert!(matches!(validate_views(&[], &[]), Err(CalibError::NoViews)));

        let short = vec![vec![[0.0; 3]; 3]];
        let short_img = vec![vec![[0.0; 2]; 3]];
        assert!(matches!(
            validate_views(&short, &short_img),
            Err(CalibError::InsufficientPoints { view: 0, .. })
        ));
    }
}

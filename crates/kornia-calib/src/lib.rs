#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Shared calibration state: image accumulation and finder fan-out.
pub mod calibration;

/// Cameras and camera sets.
pub mod camera;

/// Error types.
pub mod error;

/// Correspondence finders.
pub mod finder;

/// Camera set persistence.
pub mod io;

/// Pattern observations.
pub mod pose;

/// Progress reporting.
pub mod progress;

/// Per camera calibration.
pub mod single;

/// Numerical backends.
pub mod solver;

/// Two camera calibration.
pub mod stereo;

pub use calibration::{CameraCalibration, DEFAULT_MIN_POSE_CORRESPONDENCES};
pub use camera::{Camera, CameraSet};
pub use error::{CalibrationError, FinderError, ValidationError};
pub use finder::{Detection, Finder, FnFinder, Pattern, PrecomputedFinder};
pub use pose::{Pose, PoseImage};
pub use progress::Progress;
pub use single::{SingleCalibration, SingleCalibrationConfig};
pub use solver::{CalibrationSolver, NativeSolver};
pub use stereo::{StereoCalibration, StereoCalibrationConfig};

pub use kornia_3d::calib::{CalibFlags, TermCriteria};

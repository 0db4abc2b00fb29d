#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Pinhole camera model and lens distortion.
pub mod camera;

/// Camera calibration from views of a target.
pub mod calib;

/// Linear algebra utilities.
pub mod linalg;

/// Dense non-linear least squares.
pub mod optim;

/// Pose estimation algorithms.
pub mod pose;

/// Perspective-n-Point (PnP) solvers.
pub mod pnp;

//! # Pose estimation
//!
//! Planar geometry used to bootstrap camera poses.
//!
//! - homography (planar scenes, 8 DOF) and its decomposition into a plane pose

mod homography;
pub use homography::*;

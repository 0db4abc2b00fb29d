use kornia_3d::calib::CalibError;
use kornia_image::ImageSize;
use thiserror::Error;

/// Invalid camera set handed to a calibrator.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Stereo calibration needs exactly two cameras.
    #[error("Stereo calibration requires exactly 2 cameras, got {0}")]
    CameraCount(usize),

    /// The two cameras of a stereo pair have different image sizes.
    #[error("Cameras {first} and {second} have different image sizes: {first_size} vs {second_size}")]
    ImageSizeMismatch {
        /// Id of the first camera.
        first: usize,
        /// Id of the second camera.
        second: usize,
        /// Image size of the first camera.
        first_size: ImageSize,
        /// Image size of the second camera.
        second_size: ImageSize,
    },

    /// The two cameras of a stereo pair hold a different number of poses.
    #[error("Stereo cameras hold {0} and {1} poses, positional pairing needs equal counts")]
    PoseCountMismatch(usize, usize),
}

/// Error raised by a correspondence finder.
#[derive(Debug, Error, PartialEq)]
pub enum FinderError {
    /// A detection refers to a pattern point that does not exist.
    #[error("Pattern point index {index} out of range for a pattern of {len} points")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of pattern points.
        len: usize,
    },

    /// A detection has a different number of points and indices.
    #[error("Detection has {points} points but {indices} indices")]
    MismatchedDetection {
        /// Number of detected points.
        points: usize,
        /// Number of pattern indices.
        indices: usize,
    },

    /// Finder specific failure.
    #[error("Finder failed: {0}")]
    Custom(String),
}

/// Error types of the calibration orchestration.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No correspondence finder was installed.
    #[error("Finder not set")]
    FinderNotSet,

    /// An image does not match the size recorded for its camera.
    #[error("Camera {camera_id}: image size {actual} differs from the stored {expected}")]
    DimensionMismatch {
        /// Id of the camera.
        camera_id: usize,
        /// Image size recorded on the first pose.
        expected: ImageSize,
        /// Image size of the rejected image.
        actual: ImageSize,
    },

    /// The camera set cannot be calibrated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No camera with this id.
    #[error("Camera {0} not found")]
    CameraNotFound(usize),

    /// No pose with this id.
    #[error("Pose {0} not found")]
    PoseNotFound(usize),

    /// Correspondence detection failed.
    #[error(transparent)]
    Finder(#[from] FinderError),

    /// The numerical solver failed.
    #[error(transparent)]
    Solver(#[from] CalibError),

    /// Reading or writing a file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::camera::CameraSet;
use crate::error::CalibrationError;

/// Persist a camera set as pretty printed JSON.
///
/// Pose images are not written.
pub fn write_camera_set(path: impl AsRef<Path>, cs: &CameraSet) -> Result<(), CalibrationError> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, cs)?;
    writer.flush()?;
    log::debug!(
        "wrote {} cameras to {}",
        cs.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Load a camera set written by [`write_camera_set`].
pub fn read_camera_set(path: impl AsRef<Path>) -> Result<CameraSet, CalibrationError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

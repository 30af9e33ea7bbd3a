use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// Backends wrap a loaded model runtime and convert its native output into
/// [`Detection`] records before returning, so nothing past this trait depends
/// on the runtime's result shape.
///
/// `detect` takes `&mut self`; callers share a backend through
/// [`DetectorHandle`](crate::detect::DetectorHandle), which serializes access.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a decoded RGB image.
    ///
    /// Boxes are in pixel coordinates of `image`. Labels may be raw class
    /// names; the handle normalizes them.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

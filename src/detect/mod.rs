mod backend;
mod backends;
mod handle;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractYoloBackend;
pub use handle::DetectorHandle;
pub use result::{BoundingBox, Detection};

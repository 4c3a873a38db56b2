pub mod backend;
pub mod controller;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod geometry;
mod platform;
pub mod region;

pub use backend::{
    AdapterContext, AdapterDuplicator, DisplayChangeProbe, DuplicationContext,
    DuplicatorEnvironment, EnumeratedAdapter,
};
pub use controller::{ControllerHandle, D3dInfo, DuplicatorController};
pub use error::{DuplicationError, DuplicationResult, result_name};
pub use frame::{CaptureFrame, DesktopFrame, PixelFormat};
pub use geometry::{Point, Rect, Size};
pub use region::UpdatedRegion;

/// Capture the entire virtual desktop once through the shared
/// controller.
pub fn duplicate_once() -> DuplicationResult<CaptureFrame> {
    let controller = DuplicatorController::instance();
    let mut frame = CaptureFrame::new();
    controller.duplicate(&mut frame)?;
    controller.unregister(frame.context());
    Ok(frame)
}

pub(crate) mod adapter;
pub(crate) mod com;
pub(crate) mod d3d11;
pub(crate) mod probes;

use anyhow::Result;

use crate::backend::{DisplayChangeProbe, DuplicatorEnvironment, EnumeratedAdapter};
use crate::geometry::Point;

pub(crate) fn utf16z_to_string(input: &[u16]) -> String {
    let len = input.iter().position(|&ch| ch == 0).unwrap_or(input.len());
    String::from_utf16_lossy(&input[..len])
}

/// The real platform capability set: DXGI adapter enumeration plus the
/// GDI/session probes.
pub(crate) struct WindowsEnvironment;

impl DuplicatorEnvironment for WindowsEnvironment {
    fn enumerate_adapters(&self) -> Result<Vec<EnumeratedAdapter>> {
        let devices = d3d11::enumerate_devices()?;

        let mut adapters = Vec::with_capacity(devices.len());
        for device in devices {
            // Each duplicator keeps its own COM guard so the apartment
            // outlives the duplication handles it owns.
            let com = com::CoInitGuard::init_multithreaded()?;
            adapters.push(EnumeratedAdapter {
                feature_level: device.feature_level,
                duplicator: Box::new(adapter::DxgiAdapterDuplicator::new(device, com)),
            });
        }
        Ok(adapters)
    }

    fn new_display_change_probe(&self) -> Box<dyn DisplayChangeProbe> {
        Box::new(probes::WindowsDisplayChangeProbe::new())
    }

    fn is_session_supported(&self) -> bool {
        probes::is_session_interactive()
    }

    fn query_dpi(&self) -> Option<Point> {
        probes::query_dpi()
    }
}

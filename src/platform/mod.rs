use crate::backend::DuplicatorEnvironment;
#[cfg(not(target_os = "windows"))]
use crate::backend::{DisplayChangeProbe, EnumeratedAdapter};
#[cfg(not(target_os = "windows"))]
use crate::geometry::Point;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(not(target_os = "windows"))]
struct UnsupportedEnvironment;

#[cfg(not(target_os = "windows"))]
struct NullDisplayChangeProbe;

#[cfg(not(target_os = "windows"))]
impl DisplayChangeProbe for NullDisplayChangeProbe {
    fn is_changed(&mut self) -> bool {
        false
    }

    fn reset(&mut self) {}
}

#[cfg(not(target_os = "windows"))]
impl DuplicatorEnvironment for UnsupportedEnvironment {
    fn enumerate_adapters(&self) -> anyhow::Result<Vec<EnumeratedAdapter>> {
        anyhow::bail!("desktop duplication is only supported on Windows")
    }

    fn new_display_change_probe(&self) -> Box<dyn DisplayChangeProbe> {
        Box::new(NullDisplayChangeProbe)
    }

    fn is_session_supported(&self) -> bool {
        true
    }

    fn query_dpi(&self) -> Option<Point> {
        None
    }
}

#[cfg(target_os = "windows")]
pub(crate) fn default_environment() -> Box<dyn DuplicatorEnvironment> {
    Box::new(windows::WindowsEnvironment)
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn default_environment() -> Box<dyn DuplicatorEnvironment> {
    Box::new(UnsupportedEnvironment)
}

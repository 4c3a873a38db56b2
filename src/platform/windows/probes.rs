use std::ptr::null_mut;

use rustc_hash::FxHashMap;
use tracing::warn;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    DEVMODEW, DISPLAY_DEVICE_ATTACHED_TO_DESKTOP, DISPLAY_DEVICEW, ENUM_CURRENT_SETTINGS,
    EnumDisplayDevicesW, EnumDisplaySettingsW, GetDC, GetDeviceCaps, LOGPIXELSX, LOGPIXELSY,
    ReleaseDC,
};
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::Threading::GetCurrentProcessId;
use windows::Win32::UI::WindowsAndMessaging::{
    GetSystemMetrics, SM_CXVIRTUALSCREEN, SM_CYVIRTUALSCREEN, SM_XVIRTUALSCREEN,
    SM_YVIRTUALSCREEN,
};
use windows::core::PCWSTR;

use crate::backend::DisplayChangeProbe;
use crate::geometry::{Point, Rect};

use super::utf16z_to_string;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DisplayMode {
    width: u32,
    height: u32,
    frequency: u32,
    position: (i32, i32),
}

/// What the probe compares between observations: the virtual screen
/// bounds plus the current mode of every attached display device. Mode
/// switches that keep the virtual bounds intact (a refresh-rate change,
/// for example) are still caught through the per-device modes.
#[derive(Debug, Default, PartialEq, Eq)]
struct DisplaySnapshot {
    virtual_rect: Rect,
    modes: FxHashMap<String, DisplayMode>,
}

fn current_snapshot() -> DisplaySnapshot {
    let left = unsafe { GetSystemMetrics(SM_XVIRTUALSCREEN) };
    let top = unsafe { GetSystemMetrics(SM_YVIRTUALSCREEN) };
    let width = unsafe { GetSystemMetrics(SM_CXVIRTUALSCREEN) };
    let height = unsafe { GetSystemMetrics(SM_CYVIRTUALSCREEN) };
    let virtual_rect = Rect::from_ltrb(left, top, left + width, top + height);

    let mut modes = FxHashMap::default();
    let mut device_idx = 0u32;
    loop {
        let mut device = DISPLAY_DEVICEW {
            cb: std::mem::size_of::<DISPLAY_DEVICEW>() as u32,
            ..Default::default()
        };
        if !unsafe { EnumDisplayDevicesW(PCWSTR::null(), device_idx, &mut device, 0) }.as_bool() {
            break;
        }
        device_idx += 1;

        if (device.StateFlags & DISPLAY_DEVICE_ATTACHED_TO_DESKTOP) == 0 {
            continue;
        }

        let mut devmode = DEVMODEW {
            dmSize: std::mem::size_of::<DEVMODEW>() as u16,
            ..Default::default()
        };
        if !unsafe {
            EnumDisplaySettingsW(
                PCWSTR(device.DeviceName.as_ptr()),
                ENUM_CURRENT_SETTINGS,
                &mut devmode,
            )
        }
        .as_bool()
        {
            continue;
        }

        // SAFETY: for display devices the union carries the display
        // layout, selected by the dmFields bits EnumDisplaySettings set.
        let position = unsafe { devmode.Anonymous1.Anonymous2.dmPosition };
        modes.insert(
            utf16z_to_string(&device.DeviceName),
            DisplayMode {
                width: devmode.dmPelsWidth,
                height: devmode.dmPelsHeight,
                frequency: devmode.dmDisplayFrequency,
                position: (position.x, position.y),
            },
        );
    }

    DisplaySnapshot { virtual_rect, modes }
}

/// Polls the OS display configuration and reports whether it changed
/// since the previous observation.
pub(crate) struct WindowsDisplayChangeProbe {
    snapshot: Option<DisplaySnapshot>,
}

impl WindowsDisplayChangeProbe {
    pub(crate) fn new() -> Self {
        Self { snapshot: None }
    }
}

impl DisplayChangeProbe for WindowsDisplayChangeProbe {
    fn is_changed(&mut self) -> bool {
        let current = current_snapshot();
        // The first observation after a reset records the baseline and
        // reports no change.
        let changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| *previous != current);
        self.snapshot = Some(current);
        changed
    }

    fn reset(&mut self) {
        self.snapshot = None;
    }
}

/// Whether the process session can reach the interactive desktop.
/// Services run in session 0, where DXGI duplication cannot work.
pub(crate) fn is_session_interactive() -> bool {
    let mut session_id = 0u32;
    if unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) }.is_err() {
        warn!("failed to retrieve the current session id; the process may lack required privileges");
        return false;
    }
    session_id != 0
}

/// Logical DPI of the desktop, or `None` when no device context is
/// available so callers keep their cached value.
pub(crate) fn query_dpi() -> Option<Point> {
    let hdc = unsafe { GetDC(HWND(null_mut())) };
    if hdc.0.is_null() {
        return None;
    }
    let dpi = Point::new(
        unsafe { GetDeviceCaps(hdc, LOGPIXELSX) },
        unsafe { GetDeviceCaps(hdc, LOGPIXELSY) },
    );
    unsafe {
        let _ = ReleaseDC(HWND(null_mut()), hdc);
    }
    Some(dpi)
}

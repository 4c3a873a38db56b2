use anyhow::{Context, Result};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2,
    D3D_FEATURE_LEVEL_9_3, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CREATE_DEVICE_SINGLETHREADED, D3D11_SDK_VERSION,
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, IDXGIAdapter, IDXGIFactory1,
};
use windows::core::Interface;

/// A graphics adapter with a D3D11 device created on it.
pub(crate) struct GraphicsDevice {
    pub(crate) adapter: IDXGIAdapter,
    pub(crate) device: ID3D11Device,
    pub(crate) context: ID3D11DeviceContext,
    /// Raw `D3D_FEATURE_LEVEL` value the runtime selected.
    pub(crate) feature_level: u32,
}

/// Enumerate graphics adapters and create a D3D11 device on each.
///
/// Adapters that refuse device creation are skipped. The order is the
/// DXGI adapter enumeration order and is stable until the display
/// configuration changes.
pub(crate) fn enumerate_devices() -> Result<Vec<GraphicsDevice>> {
    let factory: IDXGIFactory1 =
        unsafe { CreateDXGIFactory1() }.context("CreateDXGIFactory1 failed")?;

    let mut devices = Vec::new();
    let mut adapter_idx = 0u32;
    loop {
        let adapter1 = match unsafe { factory.EnumAdapters1(adapter_idx) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("EnumAdapters1({adapter_idx}) failed")));
            }
        };
        let adapter: IDXGIAdapter = adapter1
            .cast()
            .context("failed to cast IDXGIAdapter1 to IDXGIAdapter")?;

        match create_device(&adapter) {
            Ok((device, context, feature_level)) => devices.push(GraphicsDevice {
                adapter,
                device,
                context,
                feature_level,
            }),
            Err(error) => {
                tracing::debug!("skipping adapter {adapter_idx}: {error:#}");
            }
        }
        adapter_idx += 1;
    }

    Ok(devices)
}

/// Create a D3D11 device on the given adapter, letting the runtime pick
/// the highest feature level the hardware supports.
///
/// The device is created single-threaded: the controller serializes all
/// access behind its mutex, so the internal driver locking is pure
/// overhead.
fn create_device(adapter: &IDXGIAdapter) -> Result<(ID3D11Device, ID3D11DeviceContext, u32)> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    let mut feature_level = D3D_FEATURE_LEVEL::default();
    let feature_levels = [
        D3D_FEATURE_LEVEL_11_1,
        D3D_FEATURE_LEVEL_11_0,
        D3D_FEATURE_LEVEL_10_1,
        D3D_FEATURE_LEVEL_10_0,
        D3D_FEATURE_LEVEL_9_3,
        D3D_FEATURE_LEVEL_9_2,
        D3D_FEATURE_LEVEL_9_1,
    ];

    unsafe {
        D3D11CreateDevice(
            adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_SINGLETHREADED,
            Some(&feature_levels),
            D3D11_SDK_VERSION,
            Some(&mut device),
            Some(&mut feature_level),
            Some(&mut context),
        )
    }
    .context("D3D11CreateDevice failed")?;

    let device = device.context("D3D11CreateDevice did not return a device")?;
    let context = context.context("D3D11CreateDevice did not return a device context")?;
    Ok((device, context, feature_level.0 as u32))
}

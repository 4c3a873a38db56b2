use anyhow::{Context as _, bail};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_STAGING, ID3D11Device, ID3D11DeviceContext, ID3D11Resource, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_NOT_FOUND, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, IDXGIAdapter, IDXGIOutput1, IDXGIOutput5, IDXGIOutputDuplication,
    IDXGIResource,
};
use windows::core::Interface;

use crate::backend::{AdapterContext, AdapterDuplicator, OutputContext};
use crate::env_config;
use crate::frame::DesktopFrame;
use crate::geometry::{Point, Rect, Size};

use super::com::CoInitGuard;
use super::d3d11::GraphicsDevice;
use super::utf16z_to_string;

/// Wait budget for a steady-state frame acquisition. The desktop rarely
/// goes a full vsync without a present, so timeouts here mean "nothing
/// changed" and are served from the cached image.
const ACQUIRE_TIMEOUT_MS: u32 = 50;

/// Longer budget for the first acquisition after the duplication
/// interface is (re)created, before it has accumulated a desktop image.
const FIRST_ACQUIRE_TIMEOUT_MS: u32 = 250;

/// Forces the legacy `DuplicateOutput` path instead of
/// `IDXGIOutput5::DuplicateOutput1`.
const DISABLE_OUTPUT5_ENV: &str = "DESKTOP_DUP_DISABLE_OUTPUT5";

fn create_duplication(
    output: &IDXGIOutput1,
    device: &ID3D11Device,
) -> anyhow::Result<IDXGIOutputDuplication> {
    if !env_config::env_var_truthy(DISABLE_OUTPUT5_ENV) {
        if let Ok(output5) = output.cast::<IDXGIOutput5>() {
            let formats = [DXGI_FORMAT_B8G8R8A8_UNORM];
            if let Ok(duplication) = unsafe { output5.DuplicateOutput1(device, 0, &formats) } {
                return Ok(duplication);
            }
        }
    }

    unsafe { output.DuplicateOutput(device) }.context("DuplicateOutput failed")
}

/// Duplicates one monitor of an adapter.
///
/// Owns the DXGI duplication handle, a staging texture for GPU-to-CPU
/// readback, and a CPU copy of the most recent desktop image. The cached
/// image lets consumers that missed a frame (AcquireNextFrame reports
/// nothing when the screen did not change) still receive pixels.
struct DxgiOutputDuplicator {
    output: IDXGIOutput1,
    duplication: IDXGIOutputDuplication,
    /// Monitor rectangle in virtual desktop coordinates; shifted by the
    /// controller's translation offset after initialization.
    desktop_rect: Rect,
    device_name: String,
    staging: Option<ID3D11Texture2D>,
    last_image: Option<DesktopFrame>,
    /// Bumped for every freshly acquired desktop image. Consumers track
    /// the serial they last received in their [`OutputContext`].
    frame_serial: u64,
    num_frames_captured: i64,
}

impl DxgiOutputDuplicator {
    fn new(device: &ID3D11Device, output: IDXGIOutput1) -> anyhow::Result<Self> {
        let desc = unsafe { output.GetDesc() }.context("IDXGIOutput::GetDesc failed")?;
        let device_name = utf16z_to_string(&desc.DeviceName);
        let coords = desc.DesktopCoordinates;
        let duplication = create_duplication(&output, device)?;

        Ok(Self {
            output,
            duplication,
            desktop_rect: Rect::from_ltrb(coords.left, coords.top, coords.right, coords.bottom),
            device_name,
            staging: None,
            last_image: None,
            frame_serial: 0,
            num_frames_captured: 0,
        })
    }

    fn recreate_duplication(&mut self, device: &ID3D11Device) -> anyhow::Result<()> {
        self.staging = None;
        self.last_image = None;
        self.duplication = create_duplication(&self.output, device)?;
        Ok(())
    }

    /// Serve one duplication request: refresh the cached image if the
    /// GPU has a newer frame, then blit it into `target` at this
    /// monitor's rectangle shifted by `offset`. A consumer that has
    /// already seen the current serial still holds valid frame content,
    /// so nothing is written for it.
    fn duplicate(
        &mut self,
        device: &ID3D11Device,
        device_context: &ID3D11DeviceContext,
        context: &mut OutputContext,
        offset: Point,
        target: &mut DesktopFrame,
    ) -> anyhow::Result<()> {
        self.acquire_and_cache(device, device_context)?;

        let Some(image) = self.last_image.as_ref() else {
            bail!("no desktop image available yet for {}", self.device_name);
        };

        if context.last_frame_serial < self.frame_serial {
            let dest_rect = self.desktop_rect.translated(offset);
            target.copy_frame(image, dest_rect)?;
            target.updated_region_mut().add(dest_rect);
            context.last_frame_serial = self.frame_serial;
        }
        Ok(())
    }

    /// Acquire the next frame and copy it into the cached CPU image.
    /// A wait timeout is not an error: it means the desktop has not
    /// changed since the last acquisition.
    fn acquire_and_cache(
        &mut self,
        device: &ID3D11Device,
        device_context: &ID3D11DeviceContext,
    ) -> anyhow::Result<()> {
        let timeout_ms = if self.last_image.is_none() {
            FIRST_ACQUIRE_TIMEOUT_MS
        } else {
            ACQUIRE_TIMEOUT_MS
        };

        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired =
            unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) };
        if let Err(error) = acquired {
            if error.code() == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(());
            }
            if error.code() == DXGI_ERROR_ACCESS_LOST {
                // Mode switches and secure-desktop transitions invalidate
                // the duplication interface. Recreate it so the rebuilt
                // generation starts clean, then report the failure.
                self.recreate_duplication(device)?;
                bail!("duplication access lost on {}", self.device_name);
            }
            return Err(anyhow::Error::from(error).context("AcquireNextFrame failed"));
        }

        let cached = (|| -> anyhow::Result<()> {
            let resource = resource.context("AcquireNextFrame returned no resource")?;
            let texture: ID3D11Texture2D = resource
                .cast()
                .context("failed to cast acquired IDXGIResource to ID3D11Texture2D")?;
            self.cache_texture(device, device_context, &texture)
        })();
        unsafe { self.duplication.ReleaseFrame() }.ok();
        cached?;

        self.frame_serial += 1;
        self.num_frames_captured += 1;
        Ok(())
    }

    fn cache_texture(
        &mut self,
        device: &ID3D11Device,
        device_context: &ID3D11DeviceContext,
        texture: &ID3D11Texture2D,
    ) -> anyhow::Result<()> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        if desc.Format != DXGI_FORMAT_B8G8R8A8_UNORM {
            bail!(
                "unsupported desktop texture format {:?} on {}",
                desc.Format,
                self.device_name
            );
        }

        let staging = self.ensure_staging(device, &desc)?;
        let staging_resource: ID3D11Resource = staging
            .cast()
            .context("failed to cast staging texture to ID3D11Resource")?;
        let source_resource: ID3D11Resource = texture
            .cast()
            .context("failed to cast desktop texture to ID3D11Resource")?;

        unsafe {
            device_context.CopyResource(&staging_resource, &source_resource);
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { device_context.Map(&staging_resource, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .context("failed to map staging texture")?;
        let copied = self.copy_mapped_into_cache(&desc, &mapped);
        unsafe {
            device_context.Unmap(&staging_resource, 0);
        }
        copied
    }

    fn ensure_staging(
        &mut self,
        device: &ID3D11Device,
        src: &D3D11_TEXTURE2D_DESC,
    ) -> anyhow::Result<ID3D11Texture2D> {
        if let Some(existing) = &self.staging {
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            unsafe { existing.GetDesc(&mut desc) };
            if desc.Width == src.Width && desc.Height == src.Height && desc.Format == src.Format {
                return Ok(existing.clone());
            }
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: src.Width,
            Height: src.Height,
            MipLevels: 1,
            ArraySize: 1,
            Format: src.Format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: Default::default(),
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .context("failed to create staging texture")?;
        let texture = texture.context("CreateTexture2D did not return a texture")?;
        self.staging = Some(texture.clone());
        Ok(texture)
    }

    fn copy_mapped_into_cache(
        &mut self,
        desc: &D3D11_TEXTURE2D_DESC,
        mapped: &D3D11_MAPPED_SUBRESOURCE,
    ) -> anyhow::Result<()> {
        let size = Size::new(desc.Width as i32, desc.Height as i32);
        let image = self.last_image.get_or_insert_with(DesktopFrame::empty);
        image.resize(size)?;

        let src_pitch = mapped.RowPitch as usize;
        let height = desc.Height as usize;
        let row_bytes = desc.Width as usize * 4;
        let total = src_pitch
            .checked_mul(height.saturating_sub(1))
            .and_then(|base| base.checked_add(row_bytes))
            .context("mapped surface size overflowed")?;

        // SAFETY: the mapped pointer stays valid until Unmap and spans
        // at least RowPitch bytes for each of the texture's rows.
        let src = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, total) };
        image.write_pixels(Rect::from_size(size), src, src_pitch)
    }
}

/// Duplicates every desktop-attached output of one graphics adapter.
pub(crate) struct DxgiAdapterDuplicator {
    _com: CoInitGuard,
    device: ID3D11Device,
    device_context: ID3D11DeviceContext,
    adapter: IDXGIAdapter,
    outputs: Vec<DxgiOutputDuplicator>,
    desktop_rect: Rect,
}

impl DxgiAdapterDuplicator {
    pub(crate) fn new(graphics: GraphicsDevice, com: CoInitGuard) -> Self {
        Self {
            _com: com,
            device: graphics.device,
            device_context: graphics.context,
            adapter: graphics.adapter,
            outputs: Vec::new(),
            desktop_rect: Rect::default(),
        }
    }
}

impl AdapterDuplicator for DxgiAdapterDuplicator {
    fn initialize(&mut self) -> anyhow::Result<()> {
        debug_assert!(self.outputs.is_empty());

        let mut output_idx = 0u32;
        loop {
            let output = match unsafe { self.adapter.EnumOutputs(output_idx) } {
                Ok(output) => output,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => {
                    return Err(
                        anyhow::Error::from(e).context(format!("EnumOutputs({output_idx}) failed"))
                    );
                }
            };
            output_idx += 1;

            let desc = unsafe { output.GetDesc() }.context("IDXGIOutput::GetDesc failed")?;
            if !desc.AttachedToDesktop.as_bool() {
                continue;
            }

            let output1: IDXGIOutput1 = output.cast().context("failed to query IDXGIOutput1")?;
            let duplicator = DxgiOutputDuplicator::new(&self.device, output1)?;
            self.desktop_rect = self.desktop_rect.united(duplicator.desktop_rect);
            self.outputs.push(duplicator);
        }

        if self.outputs.is_empty() {
            bail!("adapter has no desktop-attached outputs");
        }
        Ok(())
    }

    fn desktop_rect(&self) -> Rect {
        self.desktop_rect
    }

    fn screen_count(&self) -> usize {
        self.outputs.len()
    }

    fn screen_rect(&self, index: usize) -> Rect {
        self.outputs
            .get(index)
            .map(|output| output.desktop_rect)
            .unwrap_or_default()
    }

    fn device_name(&self, index: usize) -> String {
        self.outputs
            .get(index)
            .map(|output| output.device_name.clone())
            .unwrap_or_default()
    }

    fn num_frames_captured(&self) -> i64 {
        self.outputs
            .iter()
            .map(|output| output.num_frames_captured)
            .min()
            .unwrap_or(i64::MAX)
    }

    fn setup(&mut self, context: &mut AdapterContext) {
        context.outputs = vec![OutputContext::default(); self.outputs.len()];
    }

    fn unregister(&mut self, _context: &AdapterContext) {
        // Consumer state lives entirely in the context; there is nothing
        // adapter-side to drop.
    }

    fn duplicate(
        &mut self,
        context: &mut AdapterContext,
        target: &mut DesktopFrame,
    ) -> anyhow::Result<()> {
        if context.outputs.len() != self.outputs.len() {
            bail!("adapter context does not match the current output set");
        }
        for (output, sub) in self.outputs.iter_mut().zip(context.outputs.iter_mut()) {
            output.duplicate(&self.device, &self.device_context, sub, Point::zero(), target)?;
        }
        Ok(())
    }

    fn duplicate_monitor(
        &mut self,
        context: &mut AdapterContext,
        index: usize,
        target: &mut DesktopFrame,
    ) -> anyhow::Result<()> {
        if index >= self.outputs.len() || context.outputs.len() != self.outputs.len() {
            bail!("monitor index {index} is not valid for this adapter");
        }
        let output = &mut self.outputs[index];
        // The caller's frame is monitor-sized; shift the blit so the
        // monitor lands at the frame origin.
        let offset = Point::zero() - output.desktop_rect.top_left();
        output.duplicate(
            &self.device,
            &self.device_context,
            &mut context.outputs[index],
            offset,
            target,
        )
    }

    fn translate_rect(&mut self, offset: Point) {
        self.desktop_rect.translate(offset);
        for output in &mut self.outputs {
            output.desktop_rect.translate(offset);
        }
    }
}

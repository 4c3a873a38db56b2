use anyhow::{anyhow, bail};

use crate::backend::DuplicationContext;
use crate::geometry::{Point, Rect, Size};
use crate::region::UpdatedRegion;

/// Pixel layout of captured frames. DXGI duplication delivers 32-bit
/// BGRA surfaces, which is also the layout consumers receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 => 4,
        }
    }
}

fn byte_len(format: PixelFormat, size: Size) -> anyhow::Result<usize> {
    if size.is_empty() {
        return Ok(0);
    }
    let width = usize::try_from(size.width)?;
    let height = usize::try_from(size.height)?;
    match width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(format.bytes_per_pixel()))
    {
        Some(len) => Ok(len),
        None => bail!(
            "frame dimensions overflow: {}x{}",
            size.width,
            size.height
        ),
    }
}

/// An owned pixel buffer positioned in virtual desktop coordinates.
///
/// `top_left` is `(0, 0)` for full-desktop captures; single-monitor
/// captures carry the monitor's origin so consumers can place the image.
pub struct DesktopFrame {
    format: PixelFormat,
    size: Size,
    top_left: Point,
    data: Vec<u8>,
    updated_region: UpdatedRegion,
}

impl DesktopFrame {
    pub fn new(size: Size) -> anyhow::Result<Self> {
        let mut frame = Self::empty();
        frame.resize(size)?;
        Ok(frame)
    }

    pub fn empty() -> Self {
        Self {
            format: PixelFormat::Bgra8,
            size: Size::default(),
            top_left: Point::zero(),
            data: Vec::new(),
            updated_region: UpdatedRegion::new(),
        }
    }

    /// Resize the pixel buffer, reusing the existing allocation when it
    /// is large enough. Grown allocations reserve a little headroom so
    /// repeated small growth doesn't reallocate every time.
    pub fn resize(&mut self, size: Size) -> anyhow::Result<()> {
        let len = byte_len(self.format, size)?;
        if len > self.data.capacity() {
            let extra = len - self.data.len();
            self.data.reserve(extra + len / 8);
        }
        self.data.resize(len, 0);
        self.size = size;
        Ok(())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Bytes per row. Rows are tightly packed.
    pub fn stride(&self) -> usize {
        self.size.width.max(0) as usize * self.format.bytes_per_pixel()
    }

    pub fn top_left(&self) -> Point {
        self.top_left
    }

    pub fn set_top_left(&mut self, top_left: Point) {
        self.top_left = top_left;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn updated_region(&self) -> &UpdatedRegion {
        &self.updated_region
    }

    pub fn updated_region_mut(&mut self) -> &mut UpdatedRegion {
        &mut self.updated_region
    }

    /// Copy pixel rows from `src` into `dest_rect` of this frame.
    ///
    /// `dest_rect` is in frame-local coordinates and must lie within the
    /// frame. `src` must hold `dest_rect.height()` rows of
    /// `dest_rect.width()` pixels at `src_stride` bytes apart.
    pub fn write_pixels(
        &mut self,
        dest_rect: Rect,
        src: &[u8],
        src_stride: usize,
    ) -> anyhow::Result<()> {
        if dest_rect.is_empty() {
            return Ok(());
        }
        if !Rect::from_size(self.size).contains(dest_rect) {
            bail!(
                "destination rect {dest_rect:?} does not fit a {}x{} frame",
                self.size.width,
                self.size.height
            );
        }

        let overflow = || anyhow!("pixel offset arithmetic overflowed");
        let bpp = self.format.bytes_per_pixel();
        let copy_w = dest_rect.width() as usize;
        let copy_h = dest_rect.height() as usize;
        let row_bytes = copy_w.checked_mul(bpp).ok_or_else(overflow)?;
        let dst_stride = self.stride();

        let src_required = src_stride
            .checked_mul(copy_h - 1)
            .and_then(|base| base.checked_add(row_bytes))
            .ok_or_else(overflow)?;
        if src.len() < src_required {
            bail!(
                "source buffer holds {} bytes, {} required",
                src.len(),
                src_required
            );
        }

        let mut dst_row = (dest_rect.top() as usize)
            .checked_mul(dst_stride)
            .and_then(|off| off.checked_add(dest_rect.left() as usize * bpp))
            .ok_or_else(overflow)?;
        let mut src_row = 0usize;
        for _ in 0..copy_h {
            self.data[dst_row..dst_row + row_bytes]
                .copy_from_slice(&src[src_row..src_row + row_bytes]);
            dst_row += dst_stride;
            src_row += src_stride;
        }
        Ok(())
    }

    /// Blit an entire source frame into `dest_rect` of this frame.
    pub fn copy_frame(&mut self, src: &DesktopFrame, dest_rect: Rect) -> anyhow::Result<()> {
        if dest_rect.size() != src.size() {
            bail!(
                "destination rect {dest_rect:?} does not match source size {:?}",
                src.size()
            );
        }
        self.write_pixels(dest_rect, src.data(), src.stride())
    }
}

impl std::fmt::Debug for DesktopFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopFrame")
            .field("size", &self.size)
            .field("top_left", &self.top_left)
            .field("data_len", &self.data.len())
            .field("updated_region", &self.updated_region)
            .finish()
    }
}

/// A caller-owned capture handle: the pixel frame plus the per-caller
/// duplication context the controller refits across generations.
///
/// Callers that tear down should pass the context to
/// [`DuplicatorController::unregister`](crate::controller::DuplicatorController::unregister)
/// so adapter duplicators can drop any per-consumer bookkeeping.
#[derive(Debug, Default)]
pub struct CaptureFrame {
    context: DuplicationContext,
    frame: DesktopFrame,
    monitor: Option<usize>,
}

impl CaptureFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the pixel buffer for a capture of `size` and record which
    /// monitor (or `None` for the full desktop) the frame targets.
    pub fn prepare(&mut self, size: Size, monitor: Option<usize>) -> anyhow::Result<()> {
        if self.frame.size() != size || self.monitor != monitor {
            // The target geometry changed, so the buffered pixels no
            // longer match what the context claims this consumer has
            // seen; force a full rewrite on the next duplication.
            self.context.invalidate_frames();
        }
        self.frame.resize(size)?;
        self.monitor = monitor;
        Ok(())
    }

    /// The monitor recorded by the last [`prepare`](Self::prepare), or
    /// `None` for a full-desktop capture.
    pub fn monitor(&self) -> Option<usize> {
        self.monitor
    }

    pub fn context(&self) -> &DuplicationContext {
        &self.context
    }

    pub fn frame(&self) -> &DesktopFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut DesktopFrame {
        &mut self.frame
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut DuplicationContext, &mut DesktopFrame) {
        (&mut self.context, &mut self.frame)
    }
}

impl Default for DesktopFrame {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_reuses_allocation_when_shrinking() {
        let mut frame = DesktopFrame::new(Size::new(64, 64)).unwrap();
        let capacity = frame.data.capacity();
        frame.resize(Size::new(32, 32)).unwrap();
        assert_eq!(frame.data.len(), 32 * 32 * 4);
        assert_eq!(frame.data.capacity(), capacity);
    }

    #[test]
    fn resize_accepts_empty_size() {
        let mut frame = DesktopFrame::empty();
        frame.resize(Size::new(0, 0)).unwrap();
        assert_eq!(frame.data().len(), 0);
        frame.resize(Size::new(-4, 16)).unwrap();
        assert_eq!(frame.data().len(), 0);
    }

    #[test]
    fn resize_rejects_overflowing_dimensions() {
        let mut frame = DesktopFrame::empty();
        assert!(frame.resize(Size::new(i32::MAX, i32::MAX)).is_err());
    }

    #[test]
    fn write_pixels_places_rows_at_destination() {
        let mut frame = DesktopFrame::new(Size::new(4, 4)).unwrap();
        let src = [0xabu8; 2 * 2 * 4];
        frame
            .write_pixels(Rect::from_ltrb(2, 2, 4, 4), &src, 2 * 4)
            .unwrap();

        let stride = frame.stride();
        assert_eq!(frame.data()[0], 0);
        assert_eq!(frame.data()[2 * stride + 2 * 4], 0xab);
        assert_eq!(frame.data()[3 * stride + 3 * 4 + 3], 0xab);
    }

    #[test]
    fn write_pixels_rejects_out_of_bounds_rect() {
        let mut frame = DesktopFrame::new(Size::new(4, 4)).unwrap();
        let src = [0u8; 4 * 4 * 4];
        assert!(
            frame
                .write_pixels(Rect::from_ltrb(2, 2, 6, 6), &src, 4 * 4)
                .is_err()
        );
    }

    #[test]
    fn write_pixels_rejects_short_source() {
        let mut frame = DesktopFrame::new(Size::new(4, 4)).unwrap();
        let src = [0u8; 7];
        assert!(
            frame
                .write_pixels(Rect::from_ltrb(0, 0, 2, 2), &src, 8)
                .is_err()
        );
    }

    #[test]
    fn copy_frame_requires_matching_sizes() {
        let src = DesktopFrame::new(Size::new(2, 2)).unwrap();
        let mut dst = DesktopFrame::new(Size::new(4, 4)).unwrap();
        assert!(dst.copy_frame(&src, Rect::from_ltrb(0, 0, 2, 2)).is_ok());
        assert!(dst.copy_frame(&src, Rect::from_ltrb(0, 0, 3, 2)).is_err());
    }

    #[test]
    fn prepare_records_monitor_and_sizes_buffer() {
        let mut frame = CaptureFrame::new();
        frame.prepare(Size::new(8, 8), Some(1)).unwrap();
        assert_eq!(frame.monitor(), Some(1));
        assert_eq!(frame.frame().data().len(), 8 * 8 * 4);

        frame.prepare(Size::new(0, 0), None).unwrap();
        assert_eq!(frame.monitor(), None);
        assert_eq!(frame.frame().data().len(), 0);
    }

    #[test]
    fn prepare_invalidates_context_serials_when_retargeted() {
        use crate::backend::{AdapterContext, OutputContext};

        let mut frame = CaptureFrame::new();
        frame.prepare(Size::new(8, 8), Some(0)).unwrap();
        frame.context.adapters = vec![AdapterContext {
            outputs: vec![OutputContext {
                last_frame_serial: 7,
            }],
        }];

        // Same target: the tracked serials stay.
        frame.prepare(Size::new(8, 8), Some(0)).unwrap();
        assert_eq!(frame.context.adapters[0].outputs[0].last_frame_serial, 7);

        // Different monitor: serials are reset to force a full rewrite.
        frame.prepare(Size::new(8, 8), Some(1)).unwrap();
        assert_eq!(frame.context.adapters[0].outputs[0].last_frame_serial, 0);
    }
}

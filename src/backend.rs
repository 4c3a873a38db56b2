use crate::frame::DesktopFrame;
use crate::geometry::{Point, Rect};

/// Per-adapter duplication collaborator.
///
/// One implementation exists per graphics adapter; it owns the adapter's
/// duplication handles and the monitors attached to that adapter. All
/// rectangles it reports are in virtual desktop coordinates and are
/// shifted as a group via [`translate_rect`](Self::translate_rect) after
/// the controller computes the virtual desktop origin.
pub trait AdapterDuplicator: Send {
    /// Acquire the adapter's duplication resources. Some adapters
    /// (virtual ones in particular) legitimately fail here; the caller
    /// decides whether that is fatal.
    fn initialize(&mut self) -> anyhow::Result<()>;

    /// Union of this adapter's monitor rectangles. Non-empty after a
    /// successful [`initialize`](Self::initialize).
    fn desktop_rect(&self) -> Rect;

    /// Number of monitors attached to this adapter.
    fn screen_count(&self) -> usize;

    /// Rectangle of the monitor at `index` (adapter-local index).
    fn screen_rect(&self, index: usize) -> Rect;

    /// Device name of the monitor at `index`.
    fn device_name(&self, index: usize) -> String;

    /// Frames captured since initialization, as the minimum across this
    /// adapter's monitors.
    fn num_frames_captured(&self) -> i64;

    /// Fit `context` to this adapter so later duplications can track
    /// what the consumer has already seen.
    fn setup(&mut self, context: &mut AdapterContext);

    /// Drop any per-consumer bookkeeping for `context`. Idempotent.
    fn unregister(&mut self, context: &AdapterContext);

    /// Duplicate the whole adapter region into `target`, which covers
    /// the full virtual desktop.
    fn duplicate(
        &mut self,
        context: &mut AdapterContext,
        target: &mut DesktopFrame,
    ) -> anyhow::Result<()>;

    /// Duplicate the monitor at `index` into `target`, which is sized to
    /// that monitor.
    fn duplicate_monitor(
        &mut self,
        context: &mut AdapterContext,
        index: usize,
        target: &mut DesktopFrame,
    ) -> anyhow::Result<()>;

    /// Apply an additive translation to every rectangle this adapter
    /// reports.
    fn translate_rect(&mut self, offset: Point);
}

/// Stateful display-topology change detector. `is_changed` is a one-shot
/// query: it reports whether the configuration changed since the
/// previous observation and records the current one. The first call
/// after [`reset`](Self::reset) records a baseline and returns `false`.
pub trait DisplayChangeProbe: Send {
    fn is_changed(&mut self) -> bool;

    fn reset(&mut self);
}

/// A graphics adapter yielded by enumeration: its D3D feature level and
/// an uninitialized duplicator for it.
pub struct EnumeratedAdapter {
    /// Raw `D3D_FEATURE_LEVEL` value reported by the adapter's device.
    pub feature_level: u32,
    pub duplicator: Box<dyn AdapterDuplicator>,
}

/// Platform capabilities the controller depends on. The Windows
/// implementation wires the real DXGI/GDI queries; tests inject mocks.
pub trait DuplicatorEnvironment: Send {
    /// Enumerate graphics adapters in a stable order.
    fn enumerate_adapters(&self) -> anyhow::Result<Vec<EnumeratedAdapter>>;

    fn new_display_change_probe(&self) -> Box<dyn DisplayChangeProbe>;

    /// Whether the hosting session can reach the interactive desktop
    /// (`false` for service session 0).
    fn is_session_supported(&self) -> bool;

    /// Current logical DPI, or `None` when the query fails so the
    /// caller keeps its cached value.
    fn query_dpi(&self) -> Option<Point>;
}

/// Opaque per-consumer state one adapter duplicator tracks, one slot per
/// monitor on that adapter.
#[derive(Clone, Debug, Default)]
pub struct AdapterContext {
    pub(crate) outputs: Vec<OutputContext>,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OutputContext {
    /// Serial of the last output image this consumer received. `0`
    /// means the consumer has seen nothing yet.
    pub(crate) last_frame_serial: u64,
}

/// Per-caller controller state: the controller generation the context
/// was fitted to and one [`AdapterContext`] per adapter in that
/// generation. A context whose `controller_id` no longer matches the
/// controller is expired and is silently refitted on next use.
#[derive(Clone, Debug, Default)]
pub struct DuplicationContext {
    pub(crate) controller_id: u32,
    pub(crate) adapters: Vec<AdapterContext>,
}

impl DuplicationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every sub-context as having seen nothing, forcing the next
    /// duplication to rewrite the whole frame. Used when the caller
    /// retargets its frame and the buffered pixels no longer correspond
    /// to the tracked serials.
    pub(crate) fn invalidate_frames(&mut self) {
        for adapter in &mut self.adapters {
            for output in &mut adapter.outputs {
                output.last_frame_serial = 0;
            }
        }
    }
}

//! The process-wide duplication controller.
//!
//! [`DuplicatorController`] presents the monitors of every graphics
//! adapter as one virtual desktop with its origin at `(0, 0)` and
//! produces frames of either the whole desktop or a single monitor.
//! Display-topology changes (resolution switches, monitor hot-plug) are
//! absorbed by tearing the adapter state down and rebuilding it on the
//! next call; per-caller contexts from the previous generation are
//! detected through an identity counter and silently refitted.

use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::{
    AdapterContext, AdapterDuplicator, DisplayChangeProbe, DuplicationContext,
    DuplicatorEnvironment, EnumeratedAdapter,
};
use crate::env_config;
use crate::error::{DuplicationError, DuplicationResult};
use crate::frame::{CaptureFrame, DesktopFrame};
use crate::geometry::{Point, Rect, Size};

/// Smallest and largest D3D feature level (raw `D3D_FEATURE_LEVEL`
/// values) observed across adapters at initialization time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct D3dInfo {
    pub min_feature_level: u32,
    pub max_feature_level: u32,
}

/// Assumed refresh interval for warm-up pacing. 17 ms is enough to see
/// at least one new frame on monitors running at 60 Hz or above.
const WARMUP_FRAME_INTERVAL: Duration = Duration::from_millis(17);

/// Frames discarded after each (re)initialization. The duplication API
/// reports nothing on the very first acquisition, so one full refresh
/// must have happened before a capture is considered usable.
const WARMUP_FRAMES_TO_SKIP: i64 = 1;

const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Overrides the warm-up deadline in milliseconds. Useful on virtual
/// machines whose refresh cadence is far below 60 Hz.
const WARMUP_TIMEOUT_ENV: &str = "DESKTOP_DUP_WARMUP_TIMEOUT_MS";

fn warmup_timeout() -> Duration {
    env_config::env_var_positive_u64(WARMUP_TIMEOUT_ENV)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WARMUP_TIMEOUT)
}

struct ControllerState {
    environment: Box<dyn DuplicatorEnvironment>,
    display_probe: Box<dyn DisplayChangeProbe>,
    /// One duplicator per adapter, in device enumeration order. Empty
    /// while deinitialized.
    adapters: Vec<Box<dyn AdapterDuplicator>>,
    /// Union of all adapter desktop rects, translated so its top-left
    /// corner is `(0, 0)`. Empty iff `adapters` is empty.
    desktop_rect: Rect,
    /// Generation counter, bumped on every successful initialization and
    /// never reset, so contexts created against torn-down generations
    /// stay recognizably expired.
    identity: u32,
    succeeded_duplications: i64,
    d3d_info: D3dInfo,
    /// Last successfully observed logical DPI. Kept across failed
    /// re-queries.
    dpi: Point,
}

impl ControllerState {
    fn initialize(&mut self) -> bool {
        if !self.adapters.is_empty() {
            return true;
        }
        if self.do_initialize() {
            return true;
        }
        self.deinitialize();
        false
    }

    fn do_initialize(&mut self) -> bool {
        debug_assert!(self.desktop_rect.is_empty());
        debug_assert!(self.adapters.is_empty());

        self.d3d_info = D3dInfo::default();

        let enumerated = match self.environment.enumerate_adapters() {
            Ok(enumerated) => enumerated,
            Err(error) => {
                warn!("graphics adapter enumeration failed: {error:#}");
                return false;
            }
        };
        if enumerated.is_empty() {
            warn!("no graphics adapters found");
            return false;
        }

        for (index, enumerated) in enumerated.into_iter().enumerate() {
            let EnumeratedAdapter {
                feature_level,
                mut duplicator,
            } = enumerated;

            if self.d3d_info.max_feature_level == 0
                || feature_level > self.d3d_info.max_feature_level
            {
                self.d3d_info.max_feature_level = feature_level;
            }
            if self.d3d_info.min_feature_level == 0
                || feature_level < self.d3d_info.min_feature_level
            {
                self.d3d_info.min_feature_level = feature_level;
            }

            // Some adapters (non-official virtual adapters in particular)
            // do not support duplication; they must not prevent the
            // working adapters from taking effect.
            if let Err(error) = duplicator.initialize() {
                warn!("failed to initialize duplication on adapter {index}: {error:#}");
                continue;
            }

            debug_assert!(!duplicator.desktop_rect().is_empty());
            self.desktop_rect = self.desktop_rect.united(duplicator.desktop_rect());
            self.adapters.push(duplicator);
        }

        if self.adapters.is_empty() {
            warn!("no adapter supports desktop duplication");
            return false;
        }

        self.translate_rect();

        // Keep the old DPI value when the query fails.
        if let Some(dpi) = self.environment.query_dpi() {
            self.dpi = dpi;
        }

        self.identity += 1;
        true
    }

    fn deinitialize(&mut self) {
        self.desktop_rect = Rect::default();
        self.adapters.clear();
        self.display_probe.reset();
    }

    /// Shift the desktop union and every adapter rectangle so the
    /// virtual desktop origin lands on `(0, 0)`.
    fn translate_rect(&mut self) {
        let offset = Point::zero() - self.desktop_rect.top_left();
        self.desktop_rect.translate(offset);
        for adapter in &mut self.adapters {
            adapter.translate_rect(offset);
        }
    }

    fn context_expired(&self, context: &DuplicationContext) -> bool {
        context.controller_id != self.identity
            || context.adapters.len() != self.adapters.len()
    }

    fn setup_context(&mut self, context: &mut DuplicationContext) {
        if !self.context_expired(context) {
            return;
        }
        context.adapters.clear();
        context
            .adapters
            .resize_with(self.adapters.len(), AdapterContext::default);
        for (adapter, sub) in self.adapters.iter_mut().zip(context.adapters.iter_mut()) {
            adapter.setup(sub);
        }
        context.controller_id = self.identity;
    }

    fn do_duplicate_unlocked(
        &mut self,
        context: &mut DuplicationContext,
        monitor: Option<usize>,
        target: &mut DesktopFrame,
    ) -> bool {
        self.setup_context(context);

        if !self.ensure_frame_captured(context, target) {
            return false;
        }

        match monitor {
            None => self.do_duplicate_all(context, target),
            Some(id) => self.do_duplicate_one(context, id, target),
        }
    }

    fn do_duplicate_all(
        &mut self,
        context: &mut DuplicationContext,
        target: &mut DesktopFrame,
    ) -> bool {
        for (adapter, sub) in self.adapters.iter_mut().zip(context.adapters.iter_mut()) {
            if let Err(error) = adapter.duplicate(sub, target) {
                debug!("adapter duplication failed: {error:#}");
                return false;
            }
        }
        true
    }

    fn do_duplicate_one(
        &mut self,
        context: &mut DuplicationContext,
        monitor_id: usize,
        target: &mut DesktopFrame,
    ) -> bool {
        let mut remaining = monitor_id;
        for (adapter, sub) in self.adapters.iter_mut().zip(context.adapters.iter_mut()) {
            let count = adapter.screen_count();
            if remaining >= count {
                remaining -= count;
                continue;
            }
            match adapter.duplicate_monitor(sub, remaining, target) {
                Ok(()) => {
                    target.set_top_left(adapter.screen_rect(remaining).top_left());
                    return true;
                }
                Err(error) => {
                    debug!("monitor duplication failed: {error:#}");
                    return false;
                }
            }
        }
        false
    }

    /// Discard the first frames of a fresh generation.
    ///
    /// All adapters advance together: the skip count is satisfied only
    /// when the minimum capture count across adapters reaches
    /// [`WARMUP_FRAMES_TO_SKIP`], and only full-desktop duplication is
    /// performed during warm-up. When the caller's frame cannot hold the
    /// whole desktop, a scratch frame is used and discarded.
    fn ensure_frame_captured(
        &mut self,
        context: &mut DuplicationContext,
        target: &mut DesktopFrame,
    ) -> bool {
        if self.num_frames_captured() >= WARMUP_FRAMES_TO_SKIP {
            return true;
        }

        let desktop_size = self.desktop_size();
        let mut fallback;
        let used_fallback;
        let warm_target = if target.size().width >= desktop_size.width
            && target.size().height >= desktop_size.height
        {
            used_fallback = false;
            target
        } else {
            fallback = match DesktopFrame::new(desktop_size) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!("failed to allocate warm-up frame: {error:#}");
                    return false;
                }
            };
            used_fallback = true;
            &mut fallback
        };

        let timeout = warmup_timeout();
        let start = Instant::now();
        let mut last_frame_start = Instant::now();

        while self.num_frames_captured() < WARMUP_FRAMES_TO_SKIP {
            if self.num_frames_captured() > 0 {
                // Give the video adapter time to refresh the screen
                // before capturing the next frame.
                thread::sleep(WARMUP_FRAME_INTERVAL.saturating_sub(last_frame_start.elapsed()));
            }
            last_frame_start = Instant::now();

            if !self.do_duplicate_all(context, warm_target) {
                return false;
            }

            if start.elapsed() > timeout {
                error!(
                    "failed to capture {WARMUP_FRAMES_TO_SKIP} frame(s) within {} ms",
                    timeout.as_millis()
                );
                return false;
            }
        }

        if used_fallback {
            // The warm-up frames landed in the discarded scratch frame,
            // so the context must not claim the caller's frame has seen
            // them; force the dispatch to rewrite it in full.
            context.invalidate_frames();
        }
        true
    }

    /// Minimum capture count across adapters; a generation is warm only
    /// when every adapter has individually produced frames.
    fn num_frames_captured(&self) -> i64 {
        self.adapters
            .iter()
            .map(|adapter| adapter.num_frames_captured())
            .min()
            .unwrap_or(i64::MAX)
    }

    fn screen_count_unlocked(&self) -> usize {
        self.adapters
            .iter()
            .map(|adapter| adapter.screen_count())
            .sum()
    }

    fn device_names_unlocked(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.screen_count_unlocked());
        for adapter in &self.adapters {
            for index in 0..adapter.screen_count() {
                names.push(adapter.device_name(index));
            }
        }
        names
    }

    /// Rectangle of the flat monitor id `monitor_id`, or an empty rect
    /// when the id is out of range.
    fn screen_rect(&self, monitor_id: usize) -> Rect {
        let mut remaining = monitor_id;
        for adapter in &self.adapters {
            let count = adapter.screen_count();
            if remaining >= count {
                remaining -= count;
            } else {
                return adapter.screen_rect(remaining);
            }
        }
        Rect::default()
    }

    fn desktop_size(&self) -> Size {
        self.desktop_rect.size()
    }

    fn selected_desktop_size(&self, monitor: Option<usize>) -> Size {
        match monitor {
            None => self.desktop_size(),
            Some(id) => self.screen_rect(id).size(),
        }
    }
}

/// The process-wide duplication controller.
///
/// Obtain the shared instance through [`instance`](Self::instance); the
/// returned [`ControllerHandle`] participates in the reference count
/// that keeps the GPU-side state alive. All operations serialize on one
/// internal mutex; duplication latency (about one vsync) dwarfs the
/// critical-section cost.
pub struct DuplicatorController {
    refcount: AtomicI32,
    state: Mutex<ControllerState>,
}

impl DuplicatorController {
    /// The shared controller, with its reference count incremented.
    ///
    /// The underlying object is created on first demand and never
    /// deallocated; when the last handle drops, only its internal GPU
    /// state is torn down and it is rebuilt lazily on the next call.
    pub fn instance() -> ControllerHandle {
        static INSTANCE: OnceLock<DuplicatorController> = OnceLock::new();
        let controller = INSTANCE.get_or_init(|| {
            DuplicatorController::with_environment(crate::platform::default_environment())
        });
        controller.add_ref();
        ControllerHandle { controller }
    }

    /// Build a controller over an explicit set of platform capabilities.
    ///
    /// Embedders and tests use this to run the controller against
    /// non-default collaborators; everything else should go through
    /// [`instance`](Self::instance).
    pub fn with_environment(environment: Box<dyn DuplicatorEnvironment>) -> Self {
        let display_probe = environment.new_display_change_probe();
        Self {
            refcount: AtomicI32::new(0),
            state: Mutex::new(ControllerState {
                environment,
                display_probe,
                adapters: Vec::new(),
                desktop_rect: Rect::default(),
                identity: 0,
                succeeded_duplications: 0,
                d3d_info: D3dInfo::default(),
                dpi: Point::zero(),
            }),
        }
    }

    pub fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. When the count reaches zero the controller
    /// unloads its duplication state; the object itself stays usable.
    pub fn release(&self) {
        let refcount = self.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(refcount >= 0);
        if refcount == 0 {
            warn!("reference count reached zero; unloading duplication state");
            self.unload();
        }
    }

    /// Whether desktop duplication can be initialized right now.
    pub fn is_supported(&self) -> bool {
        self.lock_state().initialize()
    }

    /// Min/max D3D feature levels across adapters. When initialization
    /// fails the boolean is `false` and the returned info reflects the
    /// most recent attempt.
    pub fn d3d_info(&self) -> (bool, D3dInfo) {
        let mut state = self.lock_state();
        let ok = state.initialize();
        let info = state.d3d_info;
        drop(state);

        if !ok {
            warn!("failed to initialize duplication; D3D info may be inaccurate or out of date");
        }
        (ok, info)
    }

    /// Last-observed logical DPI, or `(0, 0)` when initialization fails.
    pub fn dpi(&self) -> Point {
        let mut state = self.lock_state();
        if state.initialize() {
            return state.dpi;
        }
        Point::zero()
    }

    /// Total monitor count across all adapters, or 0 when duplication
    /// cannot be initialized.
    pub fn screen_count(&self) -> usize {
        let mut state = self.lock_state();
        if state.initialize() {
            return state.screen_count_unlocked();
        }
        0
    }

    /// Per-monitor device names in virtual-monitor-id order, or `None`
    /// when duplication cannot be initialized.
    pub fn device_names(&self) -> Option<Vec<String>> {
        let mut state = self.lock_state();
        if state.initialize() {
            return Some(state.device_names_unlocked());
        }
        None
    }

    /// Capture the entire virtual desktop into `frame`.
    pub fn duplicate(&self, frame: &mut CaptureFrame) -> DuplicationResult<()> {
        self.do_duplicate(frame, None)
    }

    /// Capture the monitor with flat id `monitor_id` into `frame`. On
    /// success the frame's top-left is set to the monitor's origin in
    /// virtual desktop coordinates.
    pub fn duplicate_monitor(
        &self,
        frame: &mut CaptureFrame,
        monitor_id: usize,
    ) -> DuplicationResult<()> {
        self.do_duplicate(frame, Some(monitor_id))
    }

    /// Remove a caller's context from all adapter duplicators. A context
    /// fitted to an older generation was never registered with the
    /// current duplicators, so this is a no-op for expired contexts.
    pub fn unregister(&self, context: &DuplicationContext) {
        let mut state = self.lock_state();
        let state = &mut *state;
        if state.context_expired(context) {
            return;
        }
        for (adapter, sub) in state.adapters.iter_mut().zip(context.adapters.iter()) {
            adapter.unregister(sub);
        }
    }

    /// Force deinitialization. The next operation rebuilds the adapter
    /// state from scratch.
    pub fn unload(&self) {
        self.lock_state().deinitialize();
    }

    fn do_duplicate(
        &self,
        frame: &mut CaptureFrame,
        monitor: Option<usize>,
    ) -> DuplicationResult<()> {
        let mut state = self.lock_state();
        let state = &mut *state;

        // The duplication API does not pick up resolution changes without
        // a reinitialization, so the topology probe is polled exactly
        // once per call, before initialization; a change during a capture
        // is observed on the next call rather than mid-flight.
        if state.display_probe.is_changed() {
            state.deinitialize();
        }

        if !state.initialize() {
            if state.succeeded_duplications == 0 && !state.environment.is_session_supported() {
                warn!("process is running in session 0; desktop duplication cannot be initialized");
                return Err(DuplicationError::UnsupportedSession);
            }
            // The display mode may be changing; the next call retries
            // from scratch.
            return Err(DuplicationError::InitializationFailed);
        }

        let size = state.selected_desktop_size(monitor);
        if let Err(error) = frame.prepare(size, monitor) {
            warn!("failed to prepare caller frame: {error:#}");
            return Err(DuplicationError::FramePreparationFailed);
        }

        let (context, target) = frame.parts_mut();
        target.updated_region_mut().clear();

        if state.do_duplicate_unlocked(context, monitor, target) {
            state.succeeded_duplications += 1;
            return Ok(());
        }

        if monitor.is_some_and(|id| id >= state.screen_count_unlocked()) {
            // A monitor id beyond the screen count is a caller error; the
            // duplication stack itself is fine, so nothing is torn down.
            return Err(DuplicationError::InvalidMonitorId);
        }

        // The monitor id is valid but the duplication call failed, so
        // something is wrong in the capture stack; rebuild it next call.
        state.deinitialize();
        Err(DuplicationError::DuplicationFailed)
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reference-counted handle to the shared [`DuplicatorController`].
/// Cloning adds a reference; dropping releases it. When the last handle
/// drops, the controller's duplication state is unloaded.
pub struct ControllerHandle {
    controller: &'static DuplicatorController,
}

impl Deref for ControllerHandle {
    type Target = DuplicatorController;

    fn deref(&self) -> &DuplicatorController {
        self.controller
    }
}

impl Clone for ControllerHandle {
    fn clone(&self) -> Self {
        self.controller.add_ref();
        Self {
            controller: self.controller,
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.controller.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const LEFT: Rect = Rect::from_ltrb(0, 0, 1920, 1080);
    const RIGHT: Rect = Rect::from_ltrb(1920, 0, 3840, 1080);
    const NEG_LEFT: Rect = Rect::from_ltrb(-1920, 0, 0, 1080);

    #[derive(Clone, Default)]
    struct AdapterRecorders {
        full_calls: Arc<AtomicUsize>,
        warm_sizes: Arc<Mutex<Vec<Size>>>,
        monitor_calls: Arc<Mutex<Vec<usize>>>,
        translations: Arc<Mutex<Vec<Point>>>,
        unregisters: Arc<AtomicUsize>,
        fail_duplicate: Arc<AtomicBool>,
    }

    struct MockAdapter {
        desktop_rect: Rect,
        screens: Vec<Rect>,
        advance_on_duplicate: bool,
        fail_initialize: bool,
        frames_captured: i64,
        rec: AdapterRecorders,
    }

    fn mock_adapter(screens: &[Rect], rec: AdapterRecorders) -> MockAdapter {
        MockAdapter {
            desktop_rect: screens
                .iter()
                .fold(Rect::default(), |acc, rect| acc.united(*rect)),
            screens: screens.to_vec(),
            advance_on_duplicate: true,
            fail_initialize: false,
            frames_captured: 0,
            rec,
        }
    }

    fn enumerated(feature_level: u32, adapter: MockAdapter) -> EnumeratedAdapter {
        EnumeratedAdapter {
            feature_level,
            duplicator: Box::new(adapter),
        }
    }

    impl AdapterDuplicator for MockAdapter {
        fn initialize(&mut self) -> anyhow::Result<()> {
            if self.fail_initialize {
                anyhow::bail!("mock adapter has no duplication support");
            }
            Ok(())
        }

        fn desktop_rect(&self) -> Rect {
            self.desktop_rect
        }

        fn screen_count(&self) -> usize {
            self.screens.len()
        }

        fn screen_rect(&self, index: usize) -> Rect {
            self.screens[index]
        }

        fn device_name(&self, index: usize) -> String {
            format!("\\\\.\\DISPLAY{}", index + 1)
        }

        fn num_frames_captured(&self) -> i64 {
            self.frames_captured
        }

        fn setup(&mut self, context: &mut AdapterContext) {
            context.outputs =
                vec![crate::backend::OutputContext::default(); self.screens.len()];
        }

        fn unregister(&mut self, _context: &AdapterContext) {
            self.rec.unregisters.fetch_add(1, Ordering::SeqCst);
        }

        fn duplicate(
            &mut self,
            context: &mut AdapterContext,
            target: &mut DesktopFrame,
        ) -> anyhow::Result<()> {
            assert_eq!(context.outputs.len(), self.screens.len());
            self.rec.full_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut sizes = self.rec.warm_sizes.lock().unwrap();
                if sizes.last() != Some(&target.size()) {
                    sizes.push(target.size());
                }
            }
            if self.rec.fail_duplicate.load(Ordering::SeqCst) {
                anyhow::bail!("mock duplication failure");
            }
            target.updated_region_mut().add(self.desktop_rect);
            if self.advance_on_duplicate {
                self.frames_captured += 1;
            }
            Ok(())
        }

        fn duplicate_monitor(
            &mut self,
            _context: &mut AdapterContext,
            index: usize,
            _target: &mut DesktopFrame,
        ) -> anyhow::Result<()> {
            self.rec.monitor_calls.lock().unwrap().push(index);
            if self.rec.fail_duplicate.load(Ordering::SeqCst) {
                anyhow::bail!("mock duplication failure");
            }
            Ok(())
        }

        fn translate_rect(&mut self, offset: Point) {
            self.rec.translations.lock().unwrap().push(offset);
            self.desktop_rect.translate(offset);
            for screen in &mut self.screens {
                screen.translate(offset);
            }
        }
    }

    type AdapterFactory = Box<dyn Fn() -> anyhow::Result<Vec<EnumeratedAdapter>> + Send + Sync>;

    struct MockEnvironment {
        factory: AdapterFactory,
        enumerations: Arc<AtomicUsize>,
        session_ok: Arc<AtomicBool>,
        dpi: Arc<Mutex<Option<Point>>>,
        probe_script: Arc<Mutex<VecDeque<bool>>>,
    }

    struct ScriptedProbe {
        script: Arc<Mutex<VecDeque<bool>>>,
        resets: Arc<AtomicUsize>,
    }

    impl DisplayChangeProbe for ScriptedProbe {
        fn is_changed(&mut self) -> bool {
            self.script.lock().unwrap().pop_front().unwrap_or(false)
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DuplicatorEnvironment for MockEnvironment {
        fn enumerate_adapters(&self) -> anyhow::Result<Vec<EnumeratedAdapter>> {
            self.enumerations.fetch_add(1, Ordering::SeqCst);
            (self.factory)()
        }

        fn new_display_change_probe(&self) -> Box<dyn DisplayChangeProbe> {
            Box::new(ScriptedProbe {
                script: Arc::clone(&self.probe_script),
                resets: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn is_session_supported(&self) -> bool {
            self.session_ok.load(Ordering::SeqCst)
        }

        fn query_dpi(&self) -> Option<Point> {
            *self.dpi.lock().unwrap()
        }
    }

    #[derive(Clone)]
    struct EnvHandles {
        enumerations: Arc<AtomicUsize>,
        session_ok: Arc<AtomicBool>,
        dpi: Arc<Mutex<Option<Point>>>,
        probe_script: Arc<Mutex<VecDeque<bool>>>,
    }

    impl EnvHandles {
        fn schedule_display_change(&self) {
            self.probe_script.lock().unwrap().push_back(true);
        }
    }

    fn controller_with(
        factory: impl Fn() -> anyhow::Result<Vec<EnumeratedAdapter>> + Send + Sync + 'static,
    ) -> (DuplicatorController, EnvHandles) {
        let handles = EnvHandles {
            enumerations: Arc::new(AtomicUsize::new(0)),
            session_ok: Arc::new(AtomicBool::new(true)),
            dpi: Arc::new(Mutex::new(Some(Point::new(96, 96)))),
            probe_script: Arc::new(Mutex::new(VecDeque::new())),
        };
        let environment = MockEnvironment {
            factory: Box::new(factory),
            enumerations: Arc::clone(&handles.enumerations),
            session_ok: Arc::clone(&handles.session_ok),
            dpi: Arc::clone(&handles.dpi),
            probe_script: Arc::clone(&handles.probe_script),
        };
        (
            DuplicatorController::with_environment(Box::new(environment)),
            handles,
        )
    }

    fn dual_adapter_controller() -> (DuplicatorController, EnvHandles, AdapterRecorders, AdapterRecorders)
    {
        let rec_a = AdapterRecorders::default();
        let rec_b = AdapterRecorders::default();
        let (controller, env) = controller_with({
            let rec_a = rec_a.clone();
            let rec_b = rec_b.clone();
            move || {
                Ok(vec![
                    enumerated(0xb000, mock_adapter(&[LEFT], rec_a.clone())),
                    enumerated(0xb100, mock_adapter(&[RIGHT], rec_b.clone())),
                ])
            }
        });
        (controller, env, rec_a, rec_b)
    }

    #[test]
    fn aggregates_adapters_into_one_virtual_desktop() {
        let (controller, _env, _rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.frame().size(), Size::new(3840, 1080));
        assert_eq!(frame.context().controller_id, 1);
        assert!(!frame.frame().updated_region().is_empty());
        assert_eq!(controller.screen_count(), 2);
        assert_eq!(
            controller.d3d_info(),
            (
                true,
                D3dInfo {
                    min_feature_level: 0xb000,
                    max_feature_level: 0xb100,
                }
            )
        );
    }

    #[test]
    fn negative_origin_layout_is_translated_to_zero() {
        let rec_a = AdapterRecorders::default();
        let rec_b = AdapterRecorders::default();
        let (controller, _env) = controller_with({
            let rec_a = rec_a.clone();
            let rec_b = rec_b.clone();
            move || {
                Ok(vec![
                    enumerated(0xb000, mock_adapter(&[NEG_LEFT], rec_a.clone())),
                    enumerated(0xb000, mock_adapter(&[LEFT], rec_b.clone())),
                ])
            }
        });

        let mut frame = CaptureFrame::new();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.frame().size(), Size::new(3840, 1080));
        assert_eq!(
            *rec_a.translations.lock().unwrap(),
            vec![Point::new(1920, 0)]
        );
        assert_eq!(
            *rec_b.translations.lock().unwrap(),
            vec![Point::new(1920, 0)]
        );

        // Monitor origins follow the translation.
        assert_eq!(controller.duplicate_monitor(&mut frame, 0), Ok(()));
        assert_eq!(frame.frame().top_left(), Point::zero());
        assert_eq!(controller.duplicate_monitor(&mut frame, 1), Ok(()));
        assert_eq!(frame.frame().top_left(), Point::new(1920, 0));
    }

    #[test]
    fn invalid_monitor_id_leaves_state_untouched() {
        let (controller, env, _rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(
            controller.duplicate_monitor(&mut frame, 5),
            Err(DuplicationError::InvalidMonitorId)
        );

        // No teardown: the next capture reuses the same generation.
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 1);
        assert_eq!(env.enumerations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsupported_session_is_reported_only_before_first_success() {
        let enumerate_ok = Arc::new(AtomicBool::new(false));
        let rec = AdapterRecorders::default();
        let (controller, env) = controller_with({
            let enumerate_ok = Arc::clone(&enumerate_ok);
            let rec = rec.clone();
            move || {
                if enumerate_ok.load(Ordering::SeqCst) {
                    Ok(vec![enumerated(0xb000, mock_adapter(&[LEFT], rec.clone()))])
                } else {
                    anyhow::bail!("no graphics devices in this session")
                }
            }
        });

        env.session_ok.store(false, Ordering::SeqCst);
        let mut frame = CaptureFrame::new();
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::UnsupportedSession)
        );

        // The process gains interactive-session rights.
        env.session_ok.store(true, Ordering::SeqCst);
        enumerate_ok.store(true, Ordering::SeqCst);
        assert_eq!(controller.duplicate(&mut frame), Ok(()));

        // Later failures are no longer blamed on the session, even if it
        // has gone away again.
        env.session_ok.store(false, Ordering::SeqCst);
        enumerate_ok.store(false, Ordering::SeqCst);
        env.schedule_display_change();
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::InitializationFailed)
        );
    }

    #[test]
    fn display_change_reinitializes_and_refits_contexts() {
        let (controller, env, _rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 1);

        env.schedule_display_change();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 2);
        assert_eq!(env.enumerations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn display_change_on_first_call_still_initializes() {
        let (controller, env, _rec_a, _rec_b) = dual_adapter_controller();
        env.schedule_display_change();

        let mut frame = CaptureFrame::new();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 1);
    }

    #[test]
    fn failing_adapter_does_not_poison_working_ones() {
        let rec_a = AdapterRecorders::default();
        let rec_b = AdapterRecorders::default();
        let (controller, _env) = controller_with({
            let rec_a = rec_a.clone();
            let rec_b = rec_b.clone();
            move || {
                let mut broken = mock_adapter(&[RIGHT], rec_b.clone());
                broken.fail_initialize = true;
                Ok(vec![
                    enumerated(0xb100, mock_adapter(&[LEFT], rec_a.clone())),
                    enumerated(0x9100, broken),
                ])
            }
        });

        assert_eq!(controller.screen_count(), 1);

        let mut frame = CaptureFrame::new();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.frame().size(), Size::new(1920, 1080));

        // Feature levels are recorded for every enumerated device, even
        // those whose duplicator failed to initialize.
        assert_eq!(
            controller.d3d_info(),
            (
                true,
                D3dInfo {
                    min_feature_level: 0x9100,
                    max_feature_level: 0xb100,
                }
            )
        );
    }

    #[test]
    fn all_adapters_failing_reports_initialization_failure() {
        let rec = AdapterRecorders::default();
        let (controller, _env) = controller_with({
            let rec = rec.clone();
            move || {
                let mut broken = mock_adapter(&[LEFT], rec.clone());
                broken.fail_initialize = true;
                Ok(vec![enumerated(0xb000, broken)])
            }
        });

        let mut frame = CaptureFrame::new();
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::InitializationFailed)
        );
        // Feature levels from the failed attempt remain readable.
        let (ok, info) = controller.d3d_info();
        assert!(!ok);
        assert_eq!(info.max_feature_level, 0xb000);
    }

    #[test]
    fn duplication_failure_tears_down_for_rebuild() {
        let (controller, env, rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        rec_a.fail_duplicate.store(true, Ordering::SeqCst);
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::DuplicationFailed)
        );

        // The next call rebuilds the whole adapter set.
        rec_a.fail_duplicate.store(false, Ordering::SeqCst);
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(env.enumerations.load(Ordering::SeqCst), 2);
        assert_eq!(frame.context().controller_id, 2);
    }

    #[test]
    fn warmup_runs_full_desktop_captures_before_monitor_capture() {
        let (controller, _env, rec_a, rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate_monitor(&mut frame, 0), Ok(()));
        assert_eq!(frame.frame().size(), Size::new(1920, 1080));

        // Both adapters advanced together during warm-up even though only
        // one monitor was requested, and the warm-up wrote into a
        // desktop-sized scratch frame, not the undersized caller frame.
        assert_eq!(rec_a.full_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rec_b.full_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *rec_a.warm_sizes.lock().unwrap(),
            vec![Size::new(3840, 1080)]
        );
        assert_eq!(*rec_a.monitor_calls.lock().unwrap(), vec![0]);
        assert!(rec_b.monitor_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn warmup_reuses_caller_frame_when_it_covers_the_desktop() {
        let (controller, _env, rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        // One warm-up pass plus the dispatched capture, all into the
        // caller's desktop-sized frame.
        assert_eq!(rec_a.full_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *rec_a.warm_sizes.lock().unwrap(),
            vec![Size::new(3840, 1080)]
        );

        // A warm generation skips straight to the dispatch.
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(rec_a.full_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn warmup_gives_up_after_the_deadline() {
        // Tighten the deadline so the test doesn't spin for the default
        // 500 ms. The variable only affects warm-ups that never finish.
        unsafe { std::env::set_var(WARMUP_TIMEOUT_ENV, "50") };

        let rec = AdapterRecorders::default();
        let (controller, env) = controller_with({
            let rec = rec.clone();
            move || {
                let mut adapter = mock_adapter(&[LEFT], rec.clone());
                adapter.advance_on_duplicate = false;
                Ok(vec![enumerated(0xb000, adapter)])
            }
        });

        let mut frame = CaptureFrame::new();
        let start = Instant::now();
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::DuplicationFailed)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));

        // The timeout tears the generation down.
        assert_eq!(
            controller.duplicate(&mut frame),
            Err(DuplicationError::DuplicationFailed)
        );
        assert_eq!(env.enumerations.load(Ordering::SeqCst), 2);

        unsafe { std::env::remove_var(WARMUP_TIMEOUT_ENV) };
    }

    #[test]
    fn unregister_skips_expired_contexts() {
        let (controller, env, rec_a, rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        // A context that was never set up is not registered anywhere.
        controller.unregister(frame.context());
        assert_eq!(rec_a.unregisters.load(Ordering::SeqCst), 0);

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        controller.unregister(frame.context());
        assert_eq!(rec_a.unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(rec_b.unregisters.load(Ordering::SeqCst), 1);

        // Unregister is idempotent while the context stays current.
        controller.unregister(frame.context());
        assert_eq!(rec_a.unregisters.load(Ordering::SeqCst), 2);

        // After a generation change the old context is expired and its
        // sub-contexts must not be forwarded.
        env.schedule_display_change();
        let mut other = CaptureFrame::new();
        assert_eq!(controller.duplicate(&mut other), Ok(()));
        controller.unregister(frame.context());
        assert_eq!(rec_a.unregisters.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dpi_is_retained_across_failed_queries() {
        let (controller, env, _rec_a, _rec_b) = dual_adapter_controller();
        let mut frame = CaptureFrame::new();

        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(controller.dpi(), Point::new(96, 96));

        // Reinitialize with a failing DPI query; the cached value stays.
        *env.dpi.lock().unwrap() = None;
        env.schedule_display_change();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(controller.dpi(), Point::new(96, 96));
    }

    #[test]
    fn dpi_is_zero_when_initialization_fails() {
        let (controller, _env) = controller_with(|| anyhow::bail!("no devices"));
        assert_eq!(controller.dpi(), Point::zero());
        assert_eq!(controller.screen_count(), 0);
        assert_eq!(controller.device_names(), None);
        assert!(!controller.is_supported());
    }

    #[test]
    fn device_names_match_screen_count() {
        let rec = AdapterRecorders::default();
        let (controller, _env) = controller_with({
            let rec = rec.clone();
            move || {
                Ok(vec![
                    enumerated(
                        0xb000,
                        mock_adapter(&[LEFT, RIGHT], rec.clone()),
                    ),
                    enumerated(
                        0xb000,
                        mock_adapter(&[Rect::from_ltrb(3840, 0, 5760, 1080)], rec.clone()),
                    ),
                ])
            }
        });

        let names = controller.device_names().unwrap();
        assert_eq!(names.len(), controller.screen_count());
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn monitor_walk_resolves_adapter_local_index() {
        let rec_a = AdapterRecorders::default();
        let rec_b = AdapterRecorders::default();
        let third = Rect::from_ltrb(3840, 0, 5760, 1080);
        let (controller, _env) = controller_with({
            let rec_a = rec_a.clone();
            let rec_b = rec_b.clone();
            move || {
                Ok(vec![
                    enumerated(0xb000, mock_adapter(&[LEFT, RIGHT], rec_a.clone())),
                    enumerated(0xb000, mock_adapter(&[third], rec_b.clone())),
                ])
            }
        });

        let mut frame = CaptureFrame::new();
        assert_eq!(controller.duplicate_monitor(&mut frame, 2), Ok(()));
        assert!(rec_a.monitor_calls.lock().unwrap().is_empty());
        assert_eq!(*rec_b.monitor_calls.lock().unwrap(), vec![0]);
        assert_eq!(frame.frame().top_left(), Point::new(3840, 0));
    }

    #[test]
    fn release_at_zero_unloads_but_identity_keeps_growing() {
        let (controller, env, _rec_a, _rec_b) = dual_adapter_controller();
        controller.add_ref();

        let mut frame = CaptureFrame::new();
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 1);

        controller.release();

        // The teardown preserved the identity counter, so the old
        // context is recognized as expired and refitted.
        assert_eq!(controller.duplicate(&mut frame), Ok(()));
        assert_eq!(frame.context().controller_id, 2);
        assert_eq!(env.enumerations.load(Ordering::SeqCst), 2);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn shared_instance_fails_gracefully_without_platform_support() {
        let handle = DuplicatorController::instance();
        assert!(!handle.is_supported());
        assert_eq!(handle.screen_count(), 0);

        let mut frame = CaptureFrame::new();
        assert_eq!(
            handle.duplicate(&mut frame),
            Err(DuplicationError::InitializationFailed)
        );
    }
}

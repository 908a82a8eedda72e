// ============================================================================
// Animation controller: owns the live worker, the frame loop and the canvas
// ============================================================================
//
// Single-threaded: the owner drives everything through `pump(now)`, which
// first dispatches worker events and then runs due frame ticks. Worker
// callbacks and ticks share state through `Rc<RefCell<..>>` handles owned by
// the current live session; `teardown` drops that session so nothing from a
// previous build can reach the canvas again.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::canvas::{Canvas, RasterBuffer};
use crate::io::{self, DecodeError};
use crate::recorder::Recorder;
use crate::regions::{self, RegionInput};
use crate::scheduler::{FrameHandle, FrameScheduler, TickOutcome};
use crate::settings::Settings;
use crate::worker::{
    ExecutionHost, ExecutionRequest, ExecutionResult, HostState, SandboxLimits, parse_image_count,
    total_iterations,
};

pub const NO_IMAGE_MESSAGE: &str = "Please upload an image to start animation";
pub const WORKER_STARTED_MESSAGE: &str = "Worker created successfully. Starting animation...";

/// Where the base image for a build comes from.
#[derive(Clone, Debug)]
pub enum ImageSource {
    /// Nothing uploaded yet.
    None,
    /// The built-in sprite.
    Default,
    /// Already decoded pixels.
    Raster(RasterBuffer),
    /// Encoded file contents (upload or drag-and-drop).
    Encoded(Vec<u8>),
    File(PathBuf),
    Clipboard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Loading,
    Running,
    Failed,
}

/// Notifications for external collaborators.
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerEvent {
    FrameRendered { frame: u64, progress: Option<f64> },
    ExecutionFailed(String),
    Console(String),
    PlaceholderShown,
}

/// Lifecycle counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub hosts_created: u64,
    /// `terminate` calls that ended a live host.
    pub terminate_calls: u64,
    pub loops_started: u64,
    /// `stop` calls issued on live frame loops.
    pub stop_calls: u64,
    pub requests_posted: u64,
    pub frames_drawn: u64,
    /// `totalIterations` of the most recent request.
    pub last_total_iterations: Option<u32>,
}

/// The text output panel. `write` replaces the status line, `append` only logs.
#[derive(Clone, Debug, Default)]
pub struct OutputSurface {
    status: String,
    lines: Vec<String>,
}

impl OutputSurface {
    pub fn write(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.lines.push(text.clone());
        self.status = text;
    }

    pub fn append(&mut self, text: impl Into<String>) {
        self.lines.push(text.into());
    }

    /// Current status text.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Everything written so far, oldest first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

type Listener = Box<dyn FnMut(&ControllerEvent)>;

/// State shared between the controller and the closures of one live session.
#[derive(Clone)]
struct Shared {
    canvas: Rc<RefCell<Canvas>>,
    output: Rc<RefCell<OutputSurface>>,
    state: Rc<Cell<ControllerState>>,
    stats: Rc<RefCell<ControllerStats>>,
    listeners: Rc<RefCell<Vec<Listener>>>,
    recorder: Rc<RefCell<Option<Recorder>>>,
    scheduler: FrameScheduler,
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        for listener in self.listeners.borrow_mut().iter_mut() {
            listener(&event);
        }
    }

    /// Report a fault and halt this session's frame loop.
    fn fail(&self, message: String, handle: &Cell<Option<FrameHandle>>) {
        crate::log_err!("{}", message);
        self.output.borrow_mut().write(message.clone());
        if let Some(h) = handle.take() {
            self.scheduler.stop(h);
            self.stats.borrow_mut().stop_calls += 1;
        }
        self.state.set(ControllerState::Failed);
        self.emit(ControllerEvent::ExecutionFailed(message));
    }

    fn draw(&self, result: &ExecutionResult) {
        let Some(frame) = result.first_frame() else { return };
        self.canvas.borrow_mut().put_image_data(frame, 0, 0);
        let drawn = {
            let mut stats = self.stats.borrow_mut();
            stats.frames_drawn += 1;
            stats.frames_drawn
        };
        if let Some(rec) = self.recorder.borrow_mut().as_mut() {
            rec.capture(self.canvas.borrow().snapshot());
        }
        if let Some(p) = result.progress {
            self.output
                .borrow_mut()
                .write(format!("Processing: {}% complete", (p * 100.0).round() as i64));
        }
        self.emit(ControllerEvent::FrameRendered {
            frame: drawn,
            progress: result.progress,
        });
    }
}

struct LiveSession {
    host: Rc<RefCell<ExecutionHost>>,
    handle: Rc<Cell<Option<FrameHandle>>>,
}

pub struct AnimationController {
    intensity: f64,
    limits: SandboxLimits,
    shared: Shared,
    image_count: Rc<RefCell<String>>,
    regions: Rc<RefCell<RegionInput>>,
    original: Option<Arc<RasterBuffer>>,
    live: Option<LiveSession>,
}

impl AnimationController {
    pub fn new(settings: &Settings) -> Self {
        Self {
            intensity: settings.intensity,
            limits: settings.limits,
            shared: Shared {
                canvas: Rc::new(RefCell::new(Canvas::placeholder())),
                output: Rc::new(RefCell::new(OutputSurface::default())),
                state: Rc::new(Cell::new(ControllerState::Idle)),
                stats: Rc::new(RefCell::new(ControllerStats::default())),
                listeners: Rc::new(RefCell::new(Vec::new())),
                recorder: Rc::new(RefCell::new(None)),
                scheduler: FrameScheduler::new(settings.frame_rate),
            },
            image_count: Rc::new(RefCell::new(settings.default_image_count.to_string())),
            regions: Rc::new(RefCell::new(RegionInput::Groups(Vec::new()))),
            original: None,
            live: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        self.shared.state.get()
    }

    pub fn stats(&self) -> ControllerStats {
        *self.shared.stats.borrow()
    }

    pub fn canvas_snapshot(&self) -> RasterBuffer {
        self.shared.canvas.borrow().snapshot().clone()
    }

    pub fn canvas_draw_count(&self) -> u64 {
        self.shared.canvas.borrow().draw_count()
    }

    pub fn output_status(&self) -> String {
        self.shared.output.borrow().status().to_string()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.shared.output.borrow().lines().to_vec()
    }

    pub fn output_contains(&self, needle: &str) -> bool {
        self.shared.output.borrow().contains(needle)
    }

    /// Base image of the current build.
    pub fn original(&self) -> Option<&Arc<RasterBuffer>> {
        self.original.as_ref()
    }

    /// Regions as currently held, before normalization.
    pub fn regions(&self) -> RegionInput {
        self.regions.borrow().clone()
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.shared.scheduler
    }

    pub fn live_host_id(&self) -> Option<Uuid> {
        self.live.as_ref().map(|l| l.host.borrow().id())
    }

    pub fn live_host_state(&self) -> Option<HostState> {
        self.live.as_ref().map(|l| l.host.borrow().state())
    }

    /// Requests the live worker has not finished handling.
    pub fn in_flight(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.host.borrow().in_flight())
    }

    /// Whether the frame loop of the current build is still scheduled.
    pub fn is_looping(&self) -> bool {
        self.live
            .as_ref()
            .and_then(|l| l.handle.get())
            .is_some_and(|h| self.shared.scheduler.is_active(h))
    }

    /// When the frame loop next wants to run.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.shared.scheduler.next_due()
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Raw text of the image-count control, read when each request is built.
    pub fn set_image_count(&mut self, raw: &str) {
        *self.image_count.borrow_mut() = raw.to_string();
    }

    /// Replace the held regions; any tolerated shape is accepted.
    pub fn set_regions(&mut self, regions: RegionInput) {
        *self.regions.borrow_mut() = regions;
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&ControllerEvent) + 'static) {
        self.shared.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Capture every drawn frame into a fresh recorder.
    pub fn start_recording(&mut self, fps: f32, max_frames: usize) {
        *self.shared.recorder.borrow_mut() = Some(Recorder::new(fps, max_frames));
    }

    pub fn take_recording(&mut self) -> Option<Recorder> {
        self.shared.recorder.borrow_mut().take()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear down the current build, load `image` and start a new worker for
    /// `source`. Safe to call any number of times in a row.
    pub fn rebuild(&mut self, source: &str, image: ImageSource) -> ControllerState {
        self.teardown();
        self.shared.state.set(ControllerState::Loading);
        crate::log_info!("Rebuilding animation ({} bytes of source)", source.len());

        let raster = match load_image(image) {
            Ok(Some(raster)) => raster,
            Ok(None) => {
                self.show_placeholder();
                self.shared.output.borrow_mut().write(NO_IMAGE_MESSAGE);
                self.shared.state.set(ControllerState::Idle);
                return self.state();
            }
            Err(e) => {
                crate::log_err!("Image decode failed: {}", e);
                self.show_placeholder();
                let message = format!("Error: {}", e);
                self.shared.output.borrow_mut().write(message.clone());
                self.shared.state.set(ControllerState::Failed);
                self.shared.emit(ControllerEvent::ExecutionFailed(message));
                return self.state();
            }
        };

        *self.regions.borrow_mut() = RegionInput::from(regions::extract(&raster));

        // Original first, so a slow or broken worker still leaves it visible.
        let mut canvas = Canvas::new(raster.width(), raster.height());
        canvas.put_image_data(&raster, 0, 0);
        *self.shared.canvas.borrow_mut() = canvas;

        self.original = Some(Arc::new(raster));
        self.start_live(source);
        self.state()
    }

    /// Stop the frame loop and end the live worker. Returns to `Idle`.
    pub fn teardown(&mut self) {
        if let Some(live) = self.live.take() {
            if let Some(handle) = live.handle.take() {
                self.shared.scheduler.stop(handle);
                self.shared.stats.borrow_mut().stop_calls += 1;
            }
            if live.host.borrow_mut().terminate() {
                self.shared.stats.borrow_mut().terminate_calls += 1;
            }
            crate::log_info!("Animation torn down");
        }
        self.shared.state.set(ControllerState::Idle);
    }

    /// Dispatch worker events, then run due frame ticks.
    /// Returns the number of events and ticks handled.
    pub fn pump(&mut self, now: Instant) -> usize {
        let events = match &self.live {
            Some(live) => live.host.borrow_mut().pump(),
            None => 0,
        };
        events + self.shared.scheduler.run_due(now)
    }

    fn show_placeholder(&mut self) {
        *self.shared.canvas.borrow_mut() = Canvas::placeholder();
        self.original = None;
        self.shared.emit(ControllerEvent::PlaceholderShown);
    }

    fn start_live(&mut self, source: &str) {
        let Some(original) = self.original.clone() else { return };
        let handle: Rc<Cell<Option<FrameHandle>>> = Rc::new(Cell::new(None));

        let mut host = ExecutionHost::create(source, self.limits);
        self.shared.stats.borrow_mut().hosts_created += 1;

        {
            let shared = self.shared.clone();
            let handle = handle.clone();
            host.on_result(move |result| match &result.error {
                Some(error) => shared.fail(format!("Worker Error: {}", error), &handle),
                None => shared.draw(&result),
            });
        }
        {
            let shared = self.shared.clone();
            let handle = handle.clone();
            host.on_error(move |message| shared.fail(message, &handle));
        }
        {
            let shared = self.shared.clone();
            host.on_console(move |line| {
                shared.output.borrow_mut().append(line.clone());
                shared.emit(ControllerEvent::Console(line));
            });
        }

        let host = Rc::new(RefCell::new(host));
        self.shared.output.borrow_mut().write(WORKER_STARTED_MESSAGE);

        let tick = {
            let host = host.clone();
            let shared = self.shared.clone();
            let handle = handle.clone();
            let regions = self.regions.clone();
            let image_count = self.image_count.clone();
            let intensity = self.intensity;
            move || -> TickOutcome {
                let mut host = host.borrow_mut();
                if host.is_terminated() {
                    return TickOutcome::Stop;
                }
                // At most one request in flight; a slow worker lowers the frame rate.
                if host.in_flight() > 0 {
                    return TickOutcome::Rearm;
                }

                let regions = regions::normalize(&regions.borrow(), original.pixel_count());
                let total = total_iterations(parse_image_count(&image_count.borrow()));
                let request = ExecutionRequest::streamed(original.clone(), regions, intensity, total);

                match host.post(&request) {
                    Ok(()) => {
                        let mut stats = shared.stats.borrow_mut();
                        stats.requests_posted += 1;
                        stats.last_total_iterations = Some(total);
                        TickOutcome::Rearm
                    }
                    Err(e) => {
                        if host.terminate() {
                            shared.stats.borrow_mut().terminate_calls += 1;
                        }
                        // Returning Stop ends the loop; nothing left to stop.
                        handle.set(None);
                        shared.fail(format!("Error posting to worker: {}", e), &handle);
                        TickOutcome::Stop
                    }
                }
            }
        };

        handle.set(Some(self.shared.scheduler.start(tick)));
        self.shared.stats.borrow_mut().loops_started += 1;
        self.shared.state.set(ControllerState::Running);
        self.live = Some(LiveSession { host, handle });
    }
}

impl Drop for AnimationController {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn load_image(source: ImageSource) -> Result<Option<RasterBuffer>, DecodeError> {
    match source {
        ImageSource::None => Ok(None),
        ImageSource::Default => Ok(Some(io::default_image())),
        ImageSource::Raster(raster) => Ok(Some(raster)),
        ImageSource::Encoded(bytes) => io::decode_bytes(&bytes).map(Some),
        ImageSource::File(path) => io::decode_path(&path).map(Some),
        ImageSource::Clipboard => io::paste_from_clipboard().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};

    #[test]
    fn no_image_shows_placeholder_and_prompt() {
        let mut controller = AnimationController::new(&Settings::default());
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        controller.subscribe(move |e| sink.borrow_mut().push(e.clone()));

        let state = controller.rebuild("", ImageSource::None);
        assert_eq!(state, ControllerState::Idle);
        assert_eq!(controller.output_status(), NO_IMAGE_MESSAGE);
        let snap = controller.canvas_snapshot();
        assert_eq!(snap.dimensions(), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
        assert!(controller.live_host_id().is_none());
        assert_eq!(*events.borrow(), vec![ControllerEvent::PlaceholderShown]);
    }

    #[test]
    fn undecodable_upload_fails_without_a_host() {
        let mut controller = AnimationController::new(&Settings::default());
        let state = controller.rebuild("", ImageSource::Encoded(b"not an image".to_vec()));
        assert_eq!(state, ControllerState::Failed);
        assert!(controller.output_status().starts_with("Error: "));
        assert_eq!(controller.stats().hosts_created, 0);
        assert_eq!(
            controller.canvas_snapshot().dimensions(),
            (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)
        );
    }

    #[test]
    fn rebuild_draws_original_and_extracts_regions() {
        let mut controller = AnimationController::new(&Settings::default());
        let raster = RasterBuffer::filled(4, 4, [9, 9, 9, 255]);
        let state = controller.rebuild("", ImageSource::Raster(raster.clone()));
        assert_eq!(state, ControllerState::Running);
        assert_eq!(controller.canvas_snapshot(), raster);
        assert_eq!(controller.canvas_draw_count(), 1);
        assert_eq!(
            controller.regions(),
            RegionInput::Groups(vec![(0..16).collect()])
        );
        assert!(controller.is_looping());
        assert_eq!(controller.output_status(), WORKER_STARTED_MESSAGE);
    }

    #[test]
    fn default_image_source_uses_builtin_sprite() {
        let mut controller = AnimationController::new(&Settings::default());
        controller.rebuild("", ImageSource::Default);
        assert_eq!(controller.canvas_snapshot(), io::default_image());
    }

    #[test]
    fn teardown_returns_to_idle() {
        let mut controller = AnimationController::new(&Settings::default());
        controller.rebuild("", ImageSource::Default);
        controller.teardown();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(!controller.is_looping());
        assert_eq!(controller.stats().terminate_calls, 1);
        assert_eq!(controller.stats().stop_calls, 1);
        controller.teardown();
        assert_eq!(controller.stats().terminate_calls, 1);
    }

    #[test]
    fn failed_post_terminates_the_host_exactly_once() {
        let settings = Settings {
            limits: SandboxLimits {
                max_array_size: 4,
                ..SandboxLimits::default()
            },
            ..Settings::default()
        };
        let mut controller = AnimationController::new(&settings);
        controller.rebuild("", ImageSource::Raster(RasterBuffer::filled(4, 4, [1, 2, 3, 255])));
        controller.pump(Instant::now());

        assert_eq!(controller.state(), ControllerState::Failed);
        assert!(controller.output_status().starts_with("Error posting to worker: "));
        assert_eq!(controller.live_host_state(), Some(HostState::Terminated));
        assert_eq!(controller.stats().terminate_calls, 1);

        controller.teardown();
        let stats = controller.stats();
        assert_eq!(stats.terminate_calls, 1);
        assert_eq!(stats.stop_calls, 0);
        assert_eq!(stats.requests_posted, 0);
    }

    #[test]
    fn output_surface_status_tracks_last_write() {
        let mut out = OutputSurface::default();
        out.write("one");
        out.append("console");
        out.write("two");
        assert_eq!(out.status(), "two");
        assert_eq!(out.lines().len(), 3);
        assert!(out.contains("console"));
    }
}

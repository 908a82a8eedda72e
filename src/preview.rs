// ============================================================================
// Batch frame previewer: one short-lived worker per grid frame
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::canvas::{Canvas, RasterBuffer};
use crate::regions::RegionSet;
use crate::settings::Settings;
use crate::worker::{
    ExecutionHost, ExecutionRequest, FRAMES_PER_IMAGE, SandboxLimits, total_iterations,
};

/// How one preview frame ended.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Pending,
    Drawn,
    Failed(String),
    /// The worker handled the request without replying.
    NoReply,
}

/// Where frame `index` of `n` sits in the animation: `(progress, currentIteration)`.
pub fn frame_position(index: usize, n: usize) -> (f64, u32) {
    let progress = if n <= 1 {
        0.0
    } else {
        index as f64 / (n - 1) as f64
    };
    let current = (progress * n as f64 * FRAMES_PER_IMAGE as f64).floor() as u32;
    (progress, current)
}

struct FrameSlot {
    host: ExecutionHost,
    canvas: Rc<RefCell<Canvas>>,
    outcome: Rc<RefCell<FrameOutcome>>,
    progress: f64,
    current_iteration: u32,
    terminations: u32,
}

impl FrameSlot {
    fn finish(&mut self) {
        if self.host.terminate() {
            self.terminations += 1;
        }
    }

    fn is_finished(&self) -> bool {
        self.host.is_terminated()
    }
}

/// Result of one preview frame once its worker is gone.
#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub index: usize,
    pub host_id: Uuid,
    pub progress: f64,
    pub current_iteration: u32,
    pub outcome: FrameOutcome,
    pub canvas: Canvas,
    /// Times this frame's worker was terminated.
    pub terminations: u32,
}

impl PreviewFrame {
    pub fn image(&self) -> Option<&RasterBuffer> {
        match self.outcome {
            FrameOutcome::Drawn => Some(self.canvas.snapshot()),
            _ => None,
        }
    }
}

/// An in-progress batch. Drive it with `pump` or block with `finish`.
pub struct BatchPreview {
    slots: Vec<FrameSlot>,
    total_iterations: u32,
}

impl BatchPreview {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `n * 24`, sent on every request of this batch.
    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    /// Dispatch worker events and retire every frame that has an outcome.
    /// Returns how many frames are still pending.
    pub fn pump(&mut self) -> usize {
        let mut pending = 0;
        for slot in self.slots.iter_mut().filter(|s| !s.is_finished()) {
            slot.host.pump();
            let settled_silently = slot.host.in_flight() == 0;
            let mut outcome = slot.outcome.borrow_mut();
            if *outcome == FrameOutcome::Pending && settled_silently {
                *outcome = FrameOutcome::NoReply;
            }
            let done = *outcome != FrameOutcome::Pending;
            drop(outcome);
            if done {
                slot.finish();
            } else {
                pending += 1;
            }
        }
        pending
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(FrameSlot::is_finished)
    }

    /// Pump until every frame is retired.
    pub fn finish(mut self) -> Vec<PreviewFrame> {
        while self.pump() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let frames = self.frames();
        crate::log_info!(
            "Batch preview finished: {} of {} frames drawn",
            frames.iter().filter(|f| f.outcome == FrameOutcome::Drawn).count(),
            frames.len()
        );
        frames
    }

    /// Current view of every frame, in index order.
    pub fn frames(&self) -> Vec<PreviewFrame> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| PreviewFrame {
                index,
                host_id: slot.host.id(),
                progress: slot.progress,
                current_iteration: slot.current_iteration,
                outcome: slot.outcome.borrow().clone(),
                canvas: slot.canvas.borrow().clone(),
                terminations: slot.terminations,
            })
            .collect()
    }

    /// Abandon all frames still running.
    pub fn cancel(&mut self) {
        for slot in self.slots.iter_mut().filter(|s| !s.is_finished()) {
            slot.finish();
        }
    }
}

impl Drop for BatchPreview {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawns batches of preview workers, independent of any live loop.
pub struct BatchFramePreviewer {
    intensity: f64,
    limits: SandboxLimits,
}

impl BatchFramePreviewer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            intensity: settings.intensity,
            limits: settings.limits,
        }
    }

    /// Start `n` workers, one per frame, each posted a single deterministic
    /// request. Returns immediately; frames finish in any order.
    pub fn generate(
        &self,
        n: usize,
        raster: &RasterBuffer,
        regions: &RegionSet,
        source: &str,
    ) -> BatchPreview {
        let total = total_iterations(n as u32);
        let image = Arc::new(raster.clone());
        let mut slots = Vec::with_capacity(n);

        for i in 0..n {
            let (progress, current_iteration) = frame_position(i, n);
            let canvas = Rc::new(RefCell::new(Canvas::new(raster.width(), raster.height())));
            let outcome = Rc::new(RefCell::new(FrameOutcome::Pending));

            let mut host = ExecutionHost::create(source, self.limits);
            {
                let canvas = canvas.clone();
                let outcome = outcome.clone();
                host.on_result(move |result| {
                    let mut outcome = outcome.borrow_mut();
                    if *outcome != FrameOutcome::Pending {
                        return;
                    }
                    *outcome = match (&result.error, result.first_frame()) {
                        (Some(error), _) => FrameOutcome::Failed(format!("Worker Error: {}", error)),
                        (None, Some(frame)) => {
                            canvas.borrow_mut().put_image_data(frame, 0, 0);
                            FrameOutcome::Drawn
                        }
                        // Progress-only reply; wait for the frame or the settle.
                        (None, None) => return,
                    };
                });
            }
            {
                let outcome = outcome.clone();
                host.on_error(move |message| {
                    let mut outcome = outcome.borrow_mut();
                    if *outcome == FrameOutcome::Pending {
                        *outcome = FrameOutcome::Failed(message);
                    }
                });
            }

            let request = ExecutionRequest::one_shot(
                image.clone(),
                regions.clone(),
                self.intensity,
                total,
                current_iteration,
            );
            let mut slot = FrameSlot {
                host,
                canvas,
                outcome,
                progress,
                current_iteration,
                terminations: 0,
            };
            if let Err(e) = slot.host.post(&request) {
                crate::log_warn!("Preview frame {} could not be posted: {}", i + 1, e);
                *slot.outcome.borrow_mut() = FrameOutcome::Failed(format!("Error posting to worker: {}", e));
                slot.finish();
            }
            slots.push(slot);
        }

        crate::log_info!("Batch preview started: {} frames, totalIterations {}", n, total);
        BatchPreview {
            slots,
            total_iterations: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_positions_span_the_animation() {
        assert_eq!(frame_position(0, 5), (0.0, 0));
        assert_eq!(frame_position(2, 5), (0.5, 60));
        assert_eq!(frame_position(4, 5), (1.0, 120));
    }

    #[test]
    fn single_frame_does_not_divide_by_zero() {
        assert_eq!(frame_position(0, 1), (0.0, 0));
    }

    #[test]
    fn empty_batch_is_complete_immediately() {
        let previewer = BatchFramePreviewer::new(&Settings::default());
        let raster = RasterBuffer::new(2, 2);
        let batch = previewer.generate(0, &raster, &RegionSet::default(), "");
        assert!(batch.is_complete());
        assert!(batch.finish().is_empty());
    }

    #[test]
    fn unposted_frame_fails_without_blocking_siblings() {
        let settings = Settings {
            limits: SandboxLimits {
                max_array_size: 4,
                ..SandboxLimits::default()
            },
            ..Settings::default()
        };
        let previewer = BatchFramePreviewer::new(&settings);
        let raster = RasterBuffer::new(4, 4);
        let frames = previewer
            .generate(2, &raster, &RegionSet::default(), "")
            .finish();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert!(matches!(frame.outcome, FrameOutcome::Failed(_)));
            assert_eq!(frame.terminations, 1);
        }
    }
}

//! End-to-end runs of the live animation loop against real worker threads.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use pixelplay::canvas::RasterBuffer;
use pixelplay::controller::{AnimationController, ControllerEvent, ControllerState, ImageSource};
use pixelplay::regions::RegionInput;
use pixelplay::settings::Settings;

const ECHO: &str = r#"
fn onmessage(e) {
    postMessage(#{ segmentedImages: [e.imageData], progress: 0.25 });
}
"#;

const INVERT_SELECTED: &str = r#"
fn onmessage(e) {
    let img = e.imageData;
    for region in e.selectedRegions {
        for i in region {
            let p = img.get_pixel(i);
            img.set_pixel(i, 255 - p[0], 255 - p[1], 255 - p[2], p[3]);
        }
    }
    postMessage(#{ segmentedImages: [img] });
}
"#;

/// Pump until `done` holds or three seconds pass.
fn pump_until(
    controller: &mut AnimationController,
    mut done: impl FnMut(&AnimationController) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        controller.pump(Instant::now());
        if done(controller) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn sprite() -> RasterBuffer {
    RasterBuffer::filled(4, 4, [200, 100, 50, 255])
}

#[test]
fn repeated_rebuilds_leave_one_host_and_one_loop() {
    let mut controller = AnimationController::new(&Settings::default());
    let n = 6;
    let mut ids = Vec::new();
    for _ in 0..n {
        controller.rebuild(ECHO, ImageSource::Raster(sprite()));
        ids.push(controller.live_host_id());
    }

    let stats = controller.stats();
    assert_eq!(stats.hosts_created, n);
    assert_eq!(stats.terminate_calls, n - 1);
    assert_eq!(stats.stop_calls, n - 1);
    assert_eq!(stats.loops_started, n);
    assert_eq!(controller.scheduler().active(), 1);
    assert!(controller.is_looping());

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len() as u64, n);
}

#[test]
fn echo_worker_keeps_drawing_frames() {
    let mut controller = AnimationController::new(&Settings::default());
    let frames = Rc::new(RefCell::new(0u64));
    let sink = frames.clone();
    controller.subscribe(move |event| {
        if let ControllerEvent::FrameRendered { .. } = event {
            *sink.borrow_mut() += 1;
        }
    });

    assert_eq!(
        controller.rebuild(ECHO, ImageSource::Raster(sprite())),
        ControllerState::Running
    );
    assert!(pump_until(&mut controller, |c| c.stats().frames_drawn >= 3));
    assert_eq!(*frames.borrow(), controller.stats().frames_drawn);
    assert_eq!(controller.canvas_snapshot(), sprite());
    assert_eq!(controller.output_status(), "Processing: 25% complete");
}

#[test]
fn fully_transparent_image_still_posts() {
    let mut controller = AnimationController::new(&Settings::default());
    let clear = RasterBuffer::new(3, 3);
    controller.rebuild(ECHO, ImageSource::Raster(clear));

    assert_eq!(controller.regions(), RegionInput::Groups(vec![Vec::new()]));
    assert!(pump_until(&mut controller, |c| c.stats().frames_drawn >= 1));
    assert_eq!(controller.state(), ControllerState::Running);
}

#[test]
fn thrown_type_error_halts_the_loop_and_keeps_the_original() {
    let mut controller = AnimationController::new(&Settings::default());
    let failures = Rc::new(RefCell::new(Vec::new()));
    let sink = failures.clone();
    controller.subscribe(move |event| {
        if let ControllerEvent::ExecutionFailed(msg) = event {
            sink.borrow_mut().push(msg.clone());
        }
    });

    controller.rebuild(
        r#"fn onmessage(e) { throw "TypeError: e.imageData.pixels is undefined"; }"#,
        ImageSource::Raster(sprite()),
    );
    assert!(pump_until(&mut controller, |c| c.state() == ControllerState::Failed));

    assert!(controller.output_contains("TypeError"));
    assert!(controller.output_status().starts_with("Worker Error: "));
    assert!(!controller.is_looping());
    assert_eq!(controller.canvas_draw_count(), 1);
    assert_eq!(controller.canvas_snapshot(), sprite());
    assert_eq!(failures.borrow().len(), 1);
}

#[test]
fn error_field_in_a_reply_is_reported() {
    let mut controller = AnimationController::new(&Settings::default());
    controller.rebuild(
        r#"fn onmessage(e) { postMessage(#{ error: "bad regions" }); }"#,
        ImageSource::Raster(sprite()),
    );
    assert!(pump_until(&mut controller, |c| c.state() == ControllerState::Failed));
    assert_eq!(controller.output_status(), "Worker Error: bad regions");
    assert_eq!(controller.stats().frames_drawn, 0);
}

#[test]
fn syntax_error_reports_creation_without_drawing() {
    let mut controller = AnimationController::new(&Settings::default());
    controller.rebuild("fn onmessage(e) { let = ; }", ImageSource::Raster(sprite()));
    assert!(pump_until(&mut controller, |c| c.state() == ControllerState::Failed));
    assert!(controller.output_status().starts_with("Worker Error: "));
    assert_eq!(controller.canvas_snapshot(), sprite());
}

#[test]
fn worker_sees_total_iterations_from_image_count() {
    let mut controller = AnimationController::new(&Settings::default());
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = lines.clone();
    controller.subscribe(move |event| {
        if let ControllerEvent::Console(line) = event {
            sink.borrow_mut().push(line.clone());
        }
    });

    controller.rebuild(
        r#"fn onmessage(e) { print(e.value5); postMessage(#{}); }"#,
        ImageSource::Raster(sprite()),
    );
    assert!(pump_until(&mut controller, |_| !lines.borrow().is_empty()));
    assert_eq!(lines.borrow()[0], "120");
    assert_eq!(controller.stats().last_total_iterations, Some(120));

    controller.set_image_count("2");
    let before = controller.stats().requests_posted;
    assert!(pump_until(&mut controller, |c| c.stats().requests_posted > before + 1));
    assert_eq!(controller.stats().last_total_iterations, Some(48));
}

#[test]
fn legacy_mask_regions_are_normalized_before_posting() {
    let mut controller = AnimationController::new(&Settings::default());
    controller.rebuild(INVERT_SELECTED, ImageSource::Raster(RasterBuffer::filled(2, 1, [10, 10, 10, 255])));
    // Only the first pixel is flagged.
    controller.set_regions(RegionInput::Mask(vec![1, 0]));

    let target = [245, 245, 245, 255];
    assert!(pump_until(&mut controller, |c| {
        c.canvas_snapshot().pixel(0, 0) == Some(target)
    }));
    assert_eq!(controller.canvas_snapshot().pixel(1, 0), Some([10, 10, 10, 255]));
}

#[test]
fn teardown_discards_late_replies() {
    let mut controller = AnimationController::new(&Settings::default());
    controller.rebuild(ECHO, ImageSource::Raster(sprite()));
    controller.pump(Instant::now());
    controller.teardown();

    let drawn = controller.stats().frames_drawn;
    std::thread::sleep(Duration::from_millis(50));
    controller.pump(Instant::now());
    assert_eq!(controller.stats().frames_drawn, drawn);
    assert_eq!(controller.scheduler().active(), 0);
}

#[test]
fn recording_captures_drawn_frames() {
    let mut controller = AnimationController::new(&Settings::default());
    controller.start_recording(10.0, 2);
    controller.rebuild(ECHO, ImageSource::Raster(sprite()));
    assert!(pump_until(&mut controller, |c| c.stats().frames_drawn >= 3));

    let recorder = controller.take_recording().unwrap();
    assert_eq!(recorder.len(), 2);
    assert!(recorder.dropped() >= 1);
}

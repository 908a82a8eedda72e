//! Batch preview: one short-lived worker per frame.

use std::collections::HashSet;

use pixelplay::canvas::RasterBuffer;
use pixelplay::preview::{BatchFramePreviewer, FrameOutcome, frame_position};
use pixelplay::regions::{self, RegionSet};
use pixelplay::settings::Settings;

/// Paints the red channel with the frame's iteration.
const ITERATION_PAINTER: &str = r#"
fn onmessage(e) {
    let img = e.imageData;
    for region in e.selectedRegions {
        for i in region {
            img.set_pixel(i, e.currentIteration, 0, 0, 255);
        }
    }
    postMessage(#{ segmentedImages: [img] });
}
"#;

fn setup() -> (RasterBuffer, RegionSet) {
    let raster = RasterBuffer::filled(3, 2, [0, 0, 0, 255]);
    let regions = regions::extract(&raster);
    (raster, regions)
}

#[test]
fn every_frame_gets_its_own_worker() {
    let (raster, regions) = setup();
    let batch = BatchFramePreviewer::new(&Settings::default()).generate(
        5,
        &raster,
        &regions,
        ITERATION_PAINTER,
    );
    assert_eq!(batch.len(), 5);
    assert_eq!(batch.total_iterations(), 120);

    let frames = batch.finish();
    let hosts: HashSet<_> = frames.iter().map(|f| f.host_id).collect();
    assert_eq!(hosts.len(), 5);

    for frame in &frames {
        assert_eq!(frame.outcome, FrameOutcome::Drawn);
        assert_eq!(frame.terminations, 1);
        let (progress, iteration) = frame_position(frame.index, 5);
        assert_eq!(frame.progress, progress);
        assert_eq!(frame.current_iteration, iteration);
        let red = frame.image().unwrap().pixel(0, 0).unwrap()[0];
        assert_eq!(red as u32, iteration.min(255));
    }
}

#[test]
fn a_failing_frame_does_not_block_its_siblings() {
    let (raster, regions) = setup();
    let source = r#"
    fn onmessage(e) {
        if e.currentIteration == 0 { throw "TypeError: frame zero"; }
        postMessage(#{ segmentedImages: [e.imageData] });
    }
    "#;
    let frames = BatchFramePreviewer::new(&Settings::default())
        .generate(3, &raster, &regions, source)
        .finish();

    assert!(matches!(&frames[0].outcome, FrameOutcome::Failed(m) if m.contains("TypeError")));
    assert!(frames[0].image().is_none());
    assert_eq!(frames[1].outcome, FrameOutcome::Drawn);
    assert_eq!(frames[2].outcome, FrameOutcome::Drawn);
    assert!(frames.iter().all(|f| f.terminations == 1));
}

#[test]
fn progress_before_the_frame_does_not_end_the_frame() {
    let (raster, regions) = setup();
    let source = r#"
    fn onmessage(e) {
        postMessage(#{ progress: 0.0 });
        postMessage(#{ segmentedImages: [e.imageData], progress: 1.0 });
    }
    "#;
    let frames = BatchFramePreviewer::new(&Settings::default())
        .generate(3, &raster, &regions, source)
        .finish();
    for frame in &frames {
        assert_eq!(frame.outcome, FrameOutcome::Drawn);
        assert_eq!(frame.terminations, 1);
        assert_eq!(frame.image(), Some(&raster));
    }
}

#[test]
fn progress_only_replies_end_as_no_reply() {
    let (raster, regions) = setup();
    let frames = BatchFramePreviewer::new(&Settings::default())
        .generate(2, &raster, &regions, "fn onmessage(e) { postMessage(#{ progress: 0.5 }); }")
        .finish();
    assert!(frames.iter().all(|f| f.outcome == FrameOutcome::NoReply));
}

#[test]
fn silent_worker_is_reported_as_no_reply() {
    let (raster, regions) = setup();
    let frames = BatchFramePreviewer::new(&Settings::default())
        .generate(2, &raster, &regions, "fn onmessage(e) { }")
        .finish();
    assert!(frames.iter().all(|f| f.outcome == FrameOutcome::NoReply));
}

#[test]
fn syntax_error_fails_every_frame() {
    let (raster, regions) = setup();
    let frames = BatchFramePreviewer::new(&Settings::default())
        .generate(2, &raster, &regions, "fn onmessage(e) {")
        .finish();
    for frame in frames {
        assert!(matches!(frame.outcome, FrameOutcome::Failed(_)));
        assert_eq!(frame.terminations, 1);
    }
}

// ============================================================================
// PixelPlay CLI: headless driver around the animation pipeline
// ============================================================================
//
// Usage examples:
//   pixelplay --input sprite.png --script ripple.rhai --record ripple.gif
//   pixelplay -i *.png --script hue.rhai --frames 120 --snapshot last.png --output-dir out/
//   pixelplay --default-image --grid 5 --grid-sheet sheet.png
//   pixelplay --clipboard --session work.pps --save-session work.pps
//
// Each input gets its own controller: the live loop runs for --frames
// requests, then the canvas, recording and batch preview are written out.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;

use crate::controller::{AnimationController, ControllerEvent, ControllerState, ImageSource};
use crate::io::{compose_contact_sheet, save_png};
use crate::preview::{BatchFramePreviewer, FrameOutcome};
use crate::regions;
use crate::session::Session;
use crate::settings::Settings;

/// Worker script used when neither --script nor --session supplies one.
pub const DEFAULT_SCRIPT: &str = include_str!("../demos/ripple.rhai");

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PixelPlay headless animation runner.
///
/// Runs a Rhai worker script against an image frame by frame and writes the
/// resulting animation, final canvas and preview grid.
#[derive(Parser, Debug)]
#[command(
    name = "pixelplay",
    about = "PixelPlay headless animation runner",
    long_about = "Run a sandboxed Rhai worker script against an image, frame by frame,\n\
                  and export the animation (GIF/APNG), the final canvas, or a grid of\n\
                  preview frames.\n\n\
                  Example:\n  \
                  pixelplay --input sprite.png --script ripple.rhai --record ripple.gif\n  \
                  pixelplay --default-image --grid 5 --grid-sheet sheet.png"
)]
pub struct CliArgs {
    /// Input image file(s). Glob patterns accepted (e.g. "*.png", "sprites/*.webp").
    #[arg(short, long, num_args = 1..)]
    pub input: Vec<String>,

    /// Rhai worker script defining `fn onmessage(e)`. A built-in ripple demo is used when omitted.
    #[arg(short, long, value_name = "SCRIPT.rhai")]
    pub script: Option<PathBuf>,

    /// Also run on the image currently on the system clipboard.
    #[arg(long)]
    pub clipboard: bool,

    /// Also run on the built-in default sprite.
    #[arg(long)]
    pub default_image: bool,

    /// Image count control; multiplied by 24 to give totalIterations.
    #[arg(short = 'n', long, value_name = "COUNT")]
    pub image_count: Option<String>,

    /// Live-loop requests to run per input before writing outputs.
    #[arg(long, default_value_t = 60, value_name = "N")]
    pub frames: u64,

    /// Record every drawn frame and write an animation (.gif or .png).
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,

    /// Write the final canvas as PNG.
    #[arg(long, value_name = "FILE.png")]
    pub snapshot: Option<PathBuf>,

    /// Generate a batch preview of N frames.
    #[arg(long, value_name = "N")]
    pub grid: Option<usize>,

    /// Directory for individual preview frames (frame_1.png, …).
    #[arg(long, value_name = "DIR")]
    pub grid_dir: Option<PathBuf>,

    /// Write the preview frames as one labelled contact sheet.
    #[arg(long, value_name = "FILE.png")]
    pub grid_sheet: Option<PathBuf>,

    /// Output directory for multi-input runs; file names get the input stem as prefix.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Load source, image and image count from a session file.
    #[arg(long, value_name = "FILE.pps")]
    pub session: Option<PathBuf>,

    /// Save the session after the run.
    #[arg(long, value_name = "FILE.pps")]
    pub save_session: Option<PathBuf>,

    /// Live-loop refresh rate (overrides the settings file).
    #[arg(long, value_name = "FPS")]
    pub fps: Option<u32>,

    /// Print worker console output and per-input timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

/// One image to animate.
struct Job {
    label: String,
    stem: String,
    source: ImageSource,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the CLI and return an OS exit code.
/// `0` = every input succeeded, `1` = one or more failed.
pub fn run(args: CliArgs) -> ExitCode {
    crate::logger::set_echo(args.verbose);

    let mut settings = Settings::load();
    if let Some(fps) = args.fps {
        settings.frame_rate = fps.clamp(1, 240);
    }

    let mut session = match &args.session {
        Some(path) => match Session::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: could not load session '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Session::new(DEFAULT_SCRIPT),
    };

    if let Some(path) = &args.script {
        match std::fs::read_to_string(path) {
            Ok(src) => session.set_source(src),
            Err(e) => {
                eprintln!("error: could not read script '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(count) = &args.image_count {
        session.set_image_count(count.clone());
    }

    let jobs = collect_jobs(&args, &session);
    let multi = jobs.len() > 1;

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!(
            "error: could not create output directory '{}': {}",
            dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let total = jobs.len();
    let mut any_failure = false;

    for (idx, job) in jobs.into_iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, job.label);
        }
        let started = Instant::now();
        let outputs = Outputs::new(&args, &job.stem, multi);

        match run_one(job, &args, &settings, &mut session, &outputs) {
            Ok(frames) => {
                if args.verbose || multi {
                    println!(
                        "  → {} frames ({:.0}ms)",
                        frames,
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if let Some(path) = &args.save_session
        && let Err(e) = session.save(path)
    {
        eprintln!("error: could not save session '{}': {}", path.display(), e);
        any_failure = true;
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-input pipeline
// ============================================================================

/// Output destinations for one input.
struct Outputs {
    snapshot: Option<PathBuf>,
    record: Option<PathBuf>,
    grid_dir: Option<PathBuf>,
    grid_sheet: Option<PathBuf>,
}

impl Outputs {
    fn new(args: &CliArgs, stem: &str, multi: bool) -> Self {
        let place = |p: &Option<PathBuf>| {
            p.as_deref()
                .map(|p| output_path(p, stem, multi, args.output_dir.as_deref()))
        };
        Self {
            snapshot: place(&args.snapshot),
            record: place(&args.record),
            grid_dir: place(&args.grid_dir),
            grid_sheet: place(&args.grid_sheet),
        }
    }
}

/// Run the live loop for one input and write its outputs.
/// Returns the number of frames drawn.
fn run_one(
    job: Job,
    args: &CliArgs,
    settings: &Settings,
    session: &mut Session,
    outputs: &Outputs,
) -> Result<u64, String> {
    let mut controller = AnimationController::new(settings);
    controller.set_image_count(&session.image_count);
    if outputs.record.is_some() {
        controller.start_recording(settings.record_fps, settings.record_max_frames);
    }
    if args.verbose {
        controller.subscribe(|event| match event {
            ControllerEvent::Console(line) => println!("  [script] {}", line),
            ControllerEvent::ExecutionFailed(msg) => println!("  [failed] {}", msg),
            _ => {}
        });
    }

    let state = controller.rebuild(&session.source, job.source);
    match state {
        ControllerState::Failed => return Err(controller.output_status()),
        ControllerState::Idle => return Err(controller.output_status()),
        _ => {}
    }

    drive(&mut controller, args.frames);
    let stats = controller.stats();
    let failure =
        (controller.state() == ControllerState::Failed).then(|| controller.output_status());

    if let Some(original) = controller.original() {
        session.set_image(Some((**original).clone()));
    }

    // Grid before teardown: it previews the original and regions of this build.
    if failure.is_none()
        && let Some(n) = args.grid
    {
        write_grid(&controller, &session.source, settings, n, outputs, args.verbose)?;
    }

    controller.teardown();

    if let Some(path) = &outputs.snapshot {
        save_png(&controller.canvas_snapshot(), path)
            .map_err(|e| format!("snapshot '{}' failed: {}", path.display(), e))?;
    }

    if let Some(path) = &outputs.record
        && let Some(recorder) = controller.take_recording()
    {
        if args.verbose && recorder.dropped() > 0 {
            println!("  recording capped: {} frames dropped", recorder.dropped());
        }
        if !recorder.is_empty() {
            recorder
                .export(path, settings.gif_max_colors)
                .map_err(|e| format!("recording '{}' failed: {}", path.display(), e))?;
        }
    }

    match failure {
        Some(message) => Err(message),
        None => Ok(stats.frames_drawn),
    }
}

/// Pump the controller until `requests` have been posted and handled, or it fails.
fn drive(controller: &mut AnimationController, requests: u64) {
    let idle = Duration::from_millis(1);
    loop {
        controller.pump(Instant::now());
        if controller.state() == ControllerState::Failed {
            break;
        }
        if controller.stats().requests_posted >= requests && controller.in_flight() == 0 {
            // Pick up anything queued with the final settle.
            controller.pump(Instant::now());
            break;
        }
        let wait = controller
            .next_wakeup()
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(idle)
            .clamp(idle, Duration::from_millis(50));
        std::thread::sleep(wait);
    }
}

fn write_grid(
    controller: &AnimationController,
    source: &str,
    settings: &Settings,
    n: usize,
    outputs: &Outputs,
    verbose: bool,
) -> Result<(), String> {
    let original = controller
        .original()
        .ok_or_else(|| "no image to preview".to_string())?;
    let regions = regions::normalize(&controller.regions(), original.pixel_count());

    let frames = BatchFramePreviewer::new(settings)
        .generate(n, original, &regions, source)
        .finish();

    if verbose {
        for f in &frames {
            let status = match &f.outcome {
                FrameOutcome::Drawn => "drawn".to_string(),
                FrameOutcome::NoReply => "no reply".to_string(),
                FrameOutcome::Failed(msg) => msg.clone(),
                FrameOutcome::Pending => "pending".to_string(),
            };
            println!(
                "  Frame {} (iteration {}): {}",
                f.index + 1,
                f.current_iteration,
                status
            );
        }
    }

    if let Some(dir) = &outputs.grid_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("could not create '{}': {}", dir.display(), e))?;
        for f in &frames {
            if let Some(img) = f.image() {
                let path = dir.join(format!("frame_{}.png", f.index + 1));
                save_png(img, &path).map_err(|e| format!("'{}': {}", path.display(), e))?;
            }
        }
    }

    if let Some(path) = &outputs.grid_sheet {
        let images: Vec<_> = frames.iter().map(|f| f.image().cloned()).collect();
        let columns = (n as f64).sqrt().ceil() as u32;
        let sheet = compose_contact_sheet(&images, columns)
            .ok_or_else(|| "no preview frame was drawn".to_string())?;
        save_png(&sheet, path).map_err(|e| format!("'{}': {}", path.display(), e))?;
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn collect_jobs(args: &CliArgs, session: &Session) -> Vec<Job> {
    let mut jobs: Vec<Job> = resolve_inputs(&args.input)
        .into_iter()
        .map(|path| Job {
            label: path.display().to_string(),
            stem: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string()),
            source: ImageSource::File(path),
        })
        .collect();

    if args.clipboard {
        jobs.push(Job {
            label: "clipboard".to_string(),
            stem: "clipboard".to_string(),
            source: ImageSource::Clipboard,
        });
    }
    if args.default_image {
        jobs.push(Job {
            label: "default image".to_string(),
            stem: "default".to_string(),
            source: ImageSource::Default,
        });
    }
    if jobs.is_empty() {
        let source = match &session.image {
            Some(img) => ImageSource::Raster(img.clone()),
            None => ImageSource::None,
        };
        jobs.push(Job {
            label: session.display_title(),
            stem: "session".to_string(),
            source,
        });
    }
    jobs
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            // Literal path: use directly
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        // Treat as glob pattern
        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Output path for one input. Single-input runs use `requested` as given;
/// multi-input runs prefix the file name with the input stem and place it in
/// `output_dir` when one was given.
fn output_path(requested: &Path, stem: &str, multi: bool, output_dir: Option<&Path>) -> PathBuf {
    if !multi {
        return match output_dir {
            Some(dir) if requested.is_relative() => dir.join(requested),
            _ => requested.to_path_buf(),
        };
    }
    let name = requested
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = format!("{}_{}", stem, name);
    match output_dir {
        Some(dir) => dir.join(file),
        None => requested.with_file_name(file),
    }
}

// ============================================================================
// Worker sandbox: Rhai engine construction, limits and the worker-side API
// ============================================================================
//
// Each worker thread owns one engine. Scripts see only plain data (maps,
// arrays, BLOBs) and the native functions registered here; there is no
// filesystem, network or host-object access.

use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Position};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::host::WorkerEvent;
use super::protocol::ExecutionResult;

// ============================================================================
// Limits
// ============================================================================

/// Resource limits applied to every worker engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SandboxLimits {
    /// Operations allowed per script call (top-level run or one message).
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    /// Applies to arrays and BLOBs; must exceed the largest image byte size.
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 10_000,
            max_array_size: 64 * 1024 * 1024,
            max_map_size: 1_000,
        }
    }
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    fn at(message: String, pos: Position) -> Self {
        let line = pos.line().filter(|&l| l > 0);
        let column = pos.position().filter(|&c| c > 0);
        Self {
            message,
            line,
            column,
        }
    }

    pub fn from_parse(err: &rhai::ParseError) -> Self {
        Self::at(err.to_string(), err.position())
    }

    pub fn from_eval(err: &EvalAltResult) -> Self {
        Self::at(err.to_string(), err.position())
    }

    /// Error explanation with line context and a hint for common mistakes.
    pub fn friendly_message(&self) -> String {
        let raw = &self.message;
        let mut parts = Vec::new();

        match (self.line, self.column) {
            (Some(line), Some(col)) => parts.push(format!("Error on line {}, column {}:", line, col)),
            (Some(line), None) => parts.push(format!("Error on line {}:", line)),
            _ => parts.push("Script error:".to_string()),
        }

        let cleaned = raw.split(" (line ").next().unwrap_or(raw);
        parts.push(format!("  {}", cleaned));

        if raw.contains("Variable not found:") {
            parts.push(
                "  Tip: functions cannot see top-level variables; keep state in `this`.".to_string(),
            );
        } else if raw.contains("Syntax error") || raw.contains("Expected") {
            parts.push(
                "  Tip: check for missing semicolons, brackets, or typos near this line.".to_string(),
            );
        } else if raw.contains("Too many operations") {
            parts.push(
                "  Tip: the frame exceeded the operation limit; loop over selectedRegions or use for_each_index().".to_string(),
            );
        } else if raw.contains("Function not found:") {
            parts.push(
                "  Tip: closures stored in variables are invoked with .call(...).".to_string(),
            );
        }

        parts.join("\n")
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let (Some(line), Some(col)) = (self.line, self.column) {
            write!(f, "Line {}, Col {}: {}", line, col, self.message)
        } else if let Some(line) = self.line {
            write!(f, "Line {}: {}", line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ScriptError {}

// ============================================================================
// Worker context: shared state between the engine and native functions
// ============================================================================

pub(crate) struct WorkerContext {
    /// Channel back to the owning host.
    pub(crate) events: Sender<WorkerEvent>,
    pub(crate) cancelled: Arc<AtomicBool>,
    /// PRNG state (xorshift64)
    rng_state: u64,
    started: Instant,
}

impl WorkerContext {
    pub(crate) fn new(events: Sender<WorkerEvent>, cancelled: Arc<AtomicBool>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
            ^ 0x517cc1b727220a95;
        Self {
            events,
            cancelled,
            rng_state: seed.max(1),
            started: Instant::now(),
        }
    }

    fn next_random(&mut self) -> u64 {
        let mut s = self.rng_state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng_state = s;
        s
    }
}

pub(crate) type SharedContext = Arc<Mutex<WorkerContext>>;

fn cancelled_error() -> Box<EvalAltResult> {
    "Worker terminated".into()
}

// ============================================================================
// Engine construction
// ============================================================================

/// Create a sandboxed engine with the worker API registered.
pub(crate) fn create_engine(ctx: SharedContext, limits: &SandboxLimits) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    // terminate() flips this flag; the progress hook aborts the running call
    let cancel_flag = {
        let c = ctx.lock().unwrap_or_else(|e| e.into_inner());
        c.cancelled.clone()
    };
    engine.on_progress(move |_ops| {
        if cancel_flag.load(Ordering::Relaxed) {
            Some(Dynamic::from("Worker terminated".to_string()))
        } else {
            None
        }
    });

    register_message_api(&mut engine, ctx.clone());
    register_pixel_api(&mut engine, ctx.clone());
    register_utility_api(&mut engine, ctx);

    engine
}

// ============================================================================
// Message API
// ============================================================================

fn register_message_api(engine: &mut Engine, ctx: SharedContext) {
    // postMessage(#{ segmentedImages, error, progress })
    let c = ctx.clone();
    engine.register_fn(
        "postMessage",
        move |msg: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let result = ExecutionResult::from_message(msg)
                .map_err(|e| -> Box<EvalAltResult> { format!("DataCloneError: {}", e).into() })?;
            let lock = c.lock().unwrap_or_else(|e| e.into_inner());
            if lock.cancelled.load(Ordering::Relaxed) {
                return Err(cancelled_error());
            }
            let _ = lock.events.send(WorkerEvent::Reply(result));
            Ok(())
        },
    );

    let c = ctx;
    engine.on_print(move |msg| {
        let lock = c.lock().unwrap_or_else(|e| e.into_inner());
        let _ = lock.events.send(WorkerEvent::Console(msg.to_string()));
    });
}

// ============================================================================
// Pixel API: operates on #{ width, height, data } image maps
// ============================================================================

fn with_pixels<T>(
    img: &mut Map,
    f: impl FnOnce(&mut Blob) -> T,
) -> Result<T, Box<EvalAltResult>> {
    let data = img
        .get_mut("data")
        .ok_or_else(|| -> Box<EvalAltResult> { "image is missing 'data'".into() })?;
    let mut blob = data
        .write_lock::<Blob>()
        .ok_or_else(|| -> Box<EvalAltResult> { "image 'data' must be a BLOB".into() })?;
    Ok(f(&mut blob))
}

fn register_pixel_api(engine: &mut Engine, ctx: SharedContext) {
    // pixel_count(img)
    engine.register_fn("pixel_count", |img: &mut Map| -> i64 {
        let w = img.get("width").and_then(|v| v.as_int().ok()).unwrap_or(0);
        let h = img.get("height").and_then(|v| v.as_int().ok()).unwrap_or(0);
        w.max(0) * h.max(0)
    });

    // get_pixel(img, idx) -> [r, g, b, a]
    engine.register_fn(
        "get_pixel",
        |img: &mut Map, idx: i64| -> Result<Array, Box<EvalAltResult>> {
            with_pixels(img, |px| {
                let i = idx.max(0) as usize * 4;
                if idx < 0 || i + 3 >= px.len() {
                    return vec![Dynamic::from(0_i64); 4];
                }
                px[i..i + 4].iter().map(|&b| Dynamic::from(b as i64)).collect()
            })
        },
    );

    // set_pixel(img, idx, r, g, b, a)
    engine.register_fn(
        "set_pixel",
        |img: &mut Map, idx: i64, r: i64, g: i64, b: i64, a: i64| -> Result<(), Box<EvalAltResult>> {
            with_pixels(img, |px| {
                let i = idx.max(0) as usize * 4;
                if idx < 0 || i + 3 >= px.len() {
                    return;
                }
                px[i] = r.clamp(0, 255) as u8;
                px[i + 1] = g.clamp(0, 255) as u8;
                px[i + 2] = b.clamp(0, 255) as u8;
                px[i + 3] = a.clamp(0, 255) as u8;
            })
        },
    );

    // blank_like(img): transparent image of the same size
    engine.register_fn("blank_like", |img: &mut Map| -> Map {
        let mut out = img.clone();
        let len = img
            .get("data")
            .and_then(|d| d.read_lock::<Blob>().map(|b| b.len()))
            .unwrap_or(0);
        out.insert("data".into(), Dynamic::from_blob(vec![0u8; len]));
        out
    });

    // ── Bulk iteration: for_each_index(img, indices, |i, r, g, b, a| [r, g, b, a]) ──
    // A returned 4-element array replaces the pixel; anything else leaves it.
    let c = ctx;
    engine.register_fn(
        "for_each_index",
        move |ncc: rhai::NativeCallContext,
              img: &mut Map,
              indices: Array,
              callback: FnPtr|
              -> Result<(), Box<EvalAltResult>> {
            let mut pixels = with_pixels(img, |px| std::mem::take(px))?;
            let mut outcome = Ok(());

            for (n, entry) in indices.iter().enumerate() {
                let Ok(idx) = entry.as_int() else { continue };
                let i = idx.max(0) as usize * 4;
                if idx < 0 || i + 3 >= pixels.len() {
                    continue;
                }
                let (r, g, b, a) = (
                    pixels[i] as i64,
                    pixels[i + 1] as i64,
                    pixels[i + 2] as i64,
                    pixels[i + 3] as i64,
                );
                let result = match callback.call_within_context::<Dynamic>(&ncc, (idx, r, g, b, a)) {
                    Ok(v) => v,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                };
                if let Some(arr) = result.try_cast::<Array>()
                    && arr.len() >= 4
                {
                    pixels[i] = arr[0].as_int().unwrap_or(r).clamp(0, 255) as u8;
                    pixels[i + 1] = arr[1].as_int().unwrap_or(g).clamp(0, 255) as u8;
                    pixels[i + 2] = arr[2].as_int().unwrap_or(b).clamp(0, 255) as u8;
                    pixels[i + 3] = arr[3].as_int().unwrap_or(a).clamp(0, 255) as u8;
                }

                if n % 10_000 == 0 {
                    let lock = c.lock().unwrap_or_else(|e| e.into_inner());
                    if lock.cancelled.load(Ordering::Relaxed) {
                        outcome = Err(cancelled_error());
                        break;
                    }
                }
            }

            with_pixels(img, |px| *px = pixels)?;
            outcome
        },
    );
}

// ============================================================================
// Utility API
// ============================================================================

fn register_utility_api(engine: &mut Engine, ctx: SharedContext) {
    // print_line(msg): same destination as print()
    let c = ctx.clone();
    engine.register_fn("print_line", move |msg: ImmutableString| {
        let lock = c.lock().unwrap_or_else(|e| e.into_inner());
        let _ = lock.events.send(WorkerEvent::Console(msg.to_string()));
    });

    // now_ms(): wall clock in Unix milliseconds (Date.now() equivalent)
    engine.register_fn("now_ms", || -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    });

    // elapsed_ms(): milliseconds since this worker started
    let c = ctx.clone();
    engine.register_fn("elapsed_ms", move || -> i64 {
        let lock = c.lock().unwrap_or_else(|e| e.into_inner());
        lock.started.elapsed().as_millis() as i64
    });

    let c = ctx.clone();
    engine.register_fn("rand_int", move |min: i64, max: i64| -> i64 {
        if min >= max {
            return min;
        }
        let mut lock = c.lock().unwrap_or_else(|e| e.into_inner());
        let s = lock.next_random();
        let range = (max - min) as u64;
        min + ((s % range.max(1)) as i64)
    });

    let c = ctx.clone();
    engine.register_fn("rand_float", move |min: f64, max: f64| -> f64 {
        if min >= max {
            return min;
        }
        let mut lock = c.lock().unwrap_or_else(|e| e.into_inner());
        let s = lock.next_random();
        min + ((s as f64) / (u64::MAX as f64)) * (max - min)
    });

    let c = ctx;
    engine.register_fn("rand_float", move || -> f64 {
        let mut lock = c.lock().unwrap_or_else(|e| e.into_inner());
        (lock.next_random() as f64) / (u64::MAX as f64)
    });

    engine.register_fn("clamp", |v: i64, lo: i64, hi: i64| -> i64 { v.clamp(lo, hi.max(lo)) });
    engine.register_fn("clamp", |v: f64, lo: f64, hi: f64| -> f64 { v.clamp(lo, hi.max(lo)) });
    engine.register_fn("lerp", |a: f64, b: f64, t: f64| -> f64 { a + (b - a) * t });
    engine.register_fn("distance", |x1: f64, y1: f64, x2: f64, y2: f64| -> f64 {
        ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt()
    });
    engine.register_fn("abs", |x: f64| -> f64 { x.abs() });
    engine.register_fn("min", |a: i64, b: i64| -> i64 { a.min(b) });
    engine.register_fn("max", |a: i64, b: i64| -> i64 { a.max(b) });
    engine.register_fn("min", |a: f64, b: f64| -> f64 { a.min(b) });
    engine.register_fn("max", |a: f64, b: f64| -> f64 { a.max(b) });
    engine.register_fn("floor", |x: f64| -> f64 { x.floor() });
    engine.register_fn("ceil", |x: f64| -> f64 { x.ceil() });
    engine.register_fn("round", |x: f64| -> f64 { x.round() });
    engine.register_fn("sqrt", |x: f64| -> f64 { x.sqrt() });
    engine.register_fn("pow", |x: f64, y: f64| -> f64 { x.powf(y) });
    engine.register_fn("sin", |x: f64| -> f64 { x.sin() });
    engine.register_fn("cos", |x: f64| -> f64 { x.cos() });
    engine.register_fn("tan", |x: f64| -> f64 { x.tan() });
    engine.register_fn("atan2", |y: f64, x: f64| -> f64 { y.atan2(x) });

    engine.register_fn("rgb_to_hsl", |r: i64, g: i64, b: i64| -> Array {
        let (h, s, l) = rgb_to_hsl(r, g, b);
        vec![Dynamic::from(h), Dynamic::from(s), Dynamic::from(l)]
    });

    engine.register_fn("hsl_to_rgb", |h: f64, s: f64, l: f64| -> Array {
        let [r, g, b] = hsl_to_rgb(h, s, l);
        vec![Dynamic::from(r), Dynamic::from(g), Dynamic::from(b)]
    });
}

/// Hue in degrees, saturation and lightness in percent.
fn rgb_to_hsl(r: i64, g: i64, b: i64) -> (f64, f64, f64) {
    let rf = r.clamp(0, 255) as f64 / 255.0;
    let gf = g.clamp(0, 255) as f64 / 255.0;
    let bf = b.clamp(0, 255) as f64 / 255.0;
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let l = (max + min) / 2.0;
    if (max - min).abs() < 1e-10 {
        return (0.0, 0.0, l * 100.0);
    }
    let d = max - min;
    let s = if l > 0.5 {
        d / (2.0 - max - min)
    } else {
        d / (max + min)
    };
    let h = if (max - rf).abs() < 1e-10 {
        (gf - bf) / d + if gf < bf { 6.0 } else { 0.0 }
    } else if (max - gf).abs() < 1e-10 {
        (bf - rf) / d + 2.0
    } else {
        (rf - gf) / d + 4.0
    } * 60.0;
    (h, s * 100.0, l * 100.0)
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> [i64; 3] {
    let s = s / 100.0;
    let l = l / 100.0;
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let h2 = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (h2 % 2.0 - 1.0).abs());
    let (r1, g1, b1) = match h2 as i32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    [
        ((r1 + m) * 255.0).round() as i64,
        ((g1 + m) * 255.0).round() as i64,
        ((b1 + m) * 255.0).round() as i64,
    ]
}

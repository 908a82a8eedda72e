// ============================================================================
// Worker protocol: the message shapes user scripts are written against
// ============================================================================
//
// Inbound:  #{ imageData, selectedRegions, value, value5, currentIteration, reset }
// Outbound: #{ segmentedImages, error, progress }
//
// Images cross the boundary as #{ width, height, data } where `data` is a
// BLOB of RGBA bytes. Every inbound message carries its own copy of the
// pixel bytes, so in-place edits inside the worker never reach the original.

use rhai::{Array, Blob, Dynamic, Map};
use std::sync::Arc;

use crate::canvas::RasterBuffer;
use crate::regions::RegionSet;

/// Animation frames allotted to each image in the preview count.
pub const FRAMES_PER_IMAGE: u32 = 24;
/// Image count used when the control is empty or unparsable.
pub const DEFAULT_IMAGE_COUNT: u32 = 5;

pub const IMAGE_DATA: &str = "imageData";
pub const SELECTED_REGIONS: &str = "selectedRegions";
pub const VALUE: &str = "value";
pub const VALUE5: &str = "value5";
pub const CURRENT_ITERATION: &str = "currentIteration";
pub const RESET: &str = "reset";
pub const SEGMENTED_IMAGES: &str = "segmentedImages";
pub const ERROR: &str = "error";
pub const PROGRESS: &str = "progress";

const WIDTH: &str = "width";
const HEIGHT: &str = "height";
const DATA: &str = "data";

/// `image_count * FRAMES_PER_IMAGE`.
pub fn total_iterations(image_count: u32) -> u32 {
    image_count.saturating_mul(FRAMES_PER_IMAGE)
}

/// Integer parse of the image-count control; empty, zero, negative or
/// malformed input falls back to [`DEFAULT_IMAGE_COUNT`].
pub fn parse_image_count(raw: &str) -> u32 {
    match raw.trim().parse::<u32>() {
        Ok(0) | Err(_) => DEFAULT_IMAGE_COUNT,
        Ok(n) => n,
    }
}

/// One message posted to a worker.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Shared read-only original; copied when marshalled.
    pub image_data: Arc<RasterBuffer>,
    pub regions: RegionSet,
    /// Sent as `value`.
    pub intensity: f64,
    /// Sent as `value5`.
    pub total_iterations: u32,
    pub current_iteration: Option<u32>,
    pub reset: bool,
}

impl ExecutionRequest {
    /// Continuous live-loop frame; the worker tracks its own phase.
    pub fn streamed(
        image_data: Arc<RasterBuffer>,
        regions: RegionSet,
        intensity: f64,
        total_iterations: u32,
    ) -> Self {
        Self {
            image_data,
            regions,
            intensity,
            total_iterations,
            current_iteration: None,
            reset: false,
        }
    }

    /// Deterministic one-shot frame at a fixed iteration.
    pub fn one_shot(
        image_data: Arc<RasterBuffer>,
        regions: RegionSet,
        intensity: f64,
        total_iterations: u32,
        current_iteration: u32,
    ) -> Self {
        Self {
            image_data,
            regions,
            intensity,
            total_iterations,
            current_iteration: Some(current_iteration),
            reset: true,
        }
    }

    /// Build the inbound message map handed to `onmessage`.
    pub(crate) fn to_message(&self) -> Dynamic {
        let regions: Array = self
            .regions
            .groups()
            .iter()
            .map(|group| {
                let indices: Array = group.iter().map(|&i| Dynamic::from(i as i64)).collect();
                Dynamic::from_array(indices)
            })
            .collect();

        let mut msg = Map::new();
        msg.insert(IMAGE_DATA.into(), raster_to_dynamic(&self.image_data));
        msg.insert(SELECTED_REGIONS.into(), Dynamic::from_array(regions));
        msg.insert(VALUE.into(), Dynamic::from_float(self.intensity));
        msg.insert(VALUE5.into(), Dynamic::from(self.total_iterations as i64));
        msg.insert(
            CURRENT_ITERATION.into(),
            match self.current_iteration {
                Some(i) => Dynamic::from(i as i64),
                None => Dynamic::UNIT,
            },
        );
        msg.insert(RESET.into(), Dynamic::from_bool(self.reset));
        Dynamic::from_map(msg)
    }
}

/// One reply from a worker.
///
/// When `error` is set the frames are dropped; consumers draw `frames[0]` only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    pub frames: Vec<RasterBuffer>,
    pub error: Option<String>,
    pub progress: Option<f64>,
}

impl ExecutionResult {
    pub fn first_frame(&self) -> Option<&RasterBuffer> {
        if self.error.is_some() {
            return None;
        }
        self.frames.first()
    }

    /// Decode an outbound `postMessage` payload.
    pub(crate) fn from_message(msg: Dynamic) -> Result<Self, String> {
        let type_name = msg.type_name();
        let Some(map) = msg.try_cast::<Map>() else {
            return Err(format!("postMessage expects an object map, got {}", type_name));
        };

        let error = match map.get(ERROR) {
            None => None,
            Some(v) if v.is_unit() => None,
            Some(v) => Some(match v.clone().into_string() {
                Ok(s) => s,
                Err(_) => v.to_string(),
            }),
        };

        let progress = match map.get(PROGRESS) {
            None => None,
            Some(v) => number(v),
        };

        if error.is_some() {
            return Ok(Self {
                frames: Vec::new(),
                error,
                progress,
            });
        }

        let frames = match map.get(SEGMENTED_IMAGES) {
            None => Vec::new(),
            Some(v) if v.is_unit() => Vec::new(),
            Some(v) => {
                let Some(items) = v.clone().try_cast::<Array>() else {
                    return Err(format!(
                        "{} must be an array, got {}",
                        SEGMENTED_IMAGES,
                        v.type_name()
                    ));
                };
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| {
                        raster_from_dynamic(item)
                            .map_err(|e| format!("{}[{}]: {}", SEGMENTED_IMAGES, i, e))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(Self {
            frames,
            error: None,
            progress,
        })
    }
}

fn number(v: &Dynamic) -> Option<f64> {
    v.as_float().ok().or_else(|| v.as_int().ok().map(|i| i as f64))
}

/// `#{ width, height, data: BLOB }` holding a private copy of the bytes.
pub(crate) fn raster_to_dynamic(raster: &RasterBuffer) -> Dynamic {
    let mut map = Map::new();
    map.insert(WIDTH.into(), Dynamic::from(raster.width() as i64));
    map.insert(HEIGHT.into(), Dynamic::from(raster.height() as i64));
    map.insert(DATA.into(), Dynamic::from_blob(raster.data().to_vec()));
    Dynamic::from_map(map)
}

pub(crate) fn raster_from_dynamic(value: Dynamic) -> Result<RasterBuffer, String> {
    let type_name = value.type_name();
    let Some(map) = value.try_cast::<Map>() else {
        return Err(format!("expected an image map, got {}", type_name));
    };
    raster_from_map(&map)
}

pub(crate) fn raster_from_map(map: &Map) -> Result<RasterBuffer, String> {
    let dim = |key: &str| -> Result<u32, String> {
        let v = map
            .get(key)
            .ok_or_else(|| format!("image is missing '{}'", key))?;
        let n = v
            .as_int()
            .map_err(|_| format!("image '{}' must be an integer", key))?;
        u32::try_from(n).map_err(|_| format!("image '{}' out of range: {}", key, n))
    };
    let width = dim(WIDTH)?;
    let height = dim(HEIGHT)?;

    let data = map
        .get(DATA)
        .ok_or_else(|| "image is missing 'data'".to_string())?;
    let bytes = if let Some(blob) = data.clone().try_cast::<Blob>() {
        blob
    } else if let Some(items) = data.clone().try_cast::<Array>() {
        items
            .iter()
            .map(|v| v.as_int().map(|n| n.clamp(0, 255) as u8))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| "image 'data' array must hold integers".to_string())?
    } else {
        return Err(format!(
            "image 'data' must be a BLOB or array, got {}",
            data.type_name()
        ));
    };

    RasterBuffer::from_raw(width, height, bytes).map_err(|e| e.to_string())
}

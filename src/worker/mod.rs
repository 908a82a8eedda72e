//! Sandboxed script workers and the message protocol they speak.

pub mod host;
pub mod protocol;
pub mod sandbox;

pub use host::{CREATION_ERROR_PREFIX, ExecutionHost, HostError, HostState, WORKER_ERROR_PREFIX};
pub use protocol::{
    DEFAULT_IMAGE_COUNT, ExecutionRequest, ExecutionResult, FRAMES_PER_IMAGE, parse_image_count,
    total_iterations,
};
pub use sandbox::{SandboxLimits, ScriptError};

//! PixelPlay: run sandboxed Rhai worker scripts against an image, frame by frame.
//!
//! The pipeline is
//! [`regions`] (pick the pixels to animate) →
//! [`worker`] (one isolated script host per animation) →
//! [`scheduler`] (display-rate frame loop) →
//! [`controller`] (owns the live host, loop and canvas),
//! with [`preview`] producing a static grid of frames on the side.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

#[macro_use]
pub mod logger;

pub mod canvas;
pub mod cli;
pub mod controller;
pub mod io;
pub mod preview;
pub mod recorder;
pub mod regions;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod text;
pub mod worker;

//! gfeed-test-utils: Test infrastructure for gfeed.
//!
//! Provides:
//! - MockStreamer: Scripted in-memory streaming manager, no hardware
//! - synthetic_gcode: Deterministic G-code program generator

mod gcode;
mod mock_streamer;

pub use gcode::synthetic_gcode;
pub use mock_streamer::{MockStreamer, SentLine};

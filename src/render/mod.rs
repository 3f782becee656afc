/// Offscreen thumbnail rendering
///
/// Architecture:
/// - `pipeline.rs` - bounding box framing, camera, lighting and PNG encode
/// - `raster.rs` - CPU triangle rasterizer with depth buffer and supersampling
///
/// Everything runs on the CPU and is fully deterministic: the same geometry
/// always produces the same PNG bytes.

pub mod pipeline;
pub mod raster;

// The rasterizer stays behind the pipeline
pub use pipeline::{render, render_with_size, BoundingBox, PREVIEW_SIZE};

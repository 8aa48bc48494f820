// Pixel-level and frame-level building blocks. None of these know about endpoints,
// the fabric or the filesystem layout of a pass.

pub mod diff_engine;
pub mod frame;
pub mod manifest;
pub mod partition;
pub mod pixel;
pub mod smart_pixel;

use thiserror::Error;

/// Errors surfaced by terrain construction, layer replacement, scenario
/// loading and export.
///
/// Hot-path grid access does not go through this type: indices handed to
/// `get`/`set` are the caller's responsibility.
#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("grid resolution {nx}x{ny} is too small, both axes need at least 2 samples")]
    InvalidResolution { nx: usize, ny: usize },

    #[error("bounding box has a non-positive extent ({width} x {height})")]
    DegenerateBox { width: f32, height: f32 },

    #[error("field of {found_x}x{found_y} does not match terrain resolution {expected_x}x{expected_y}")]
    ShapeMismatch {
        expected_x: usize,
        expected_y: usize,
        found_x: usize,
        found_y: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

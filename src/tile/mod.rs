//! Level-of-detail texture tiling
//!
//! A quad-tree over each large image source decides per frame whether a
//! node's projected screen coverage warrants descending into four children
//! or rendering the node's own downsampled tile. Tile loads run on a worker
//! pool under a renderer-wide in-flight budget; idle subtrees are pruned
//! once their loads settle. For gigapixel sources a one-time disk pyramid
//! replaces the in-memory full-resolution root.

mod loader;
mod pyramid;
mod tree;

pub use loader::{TileLoadJob, TileLoadResult, TileLoadSource, TileLoader};
pub use pyramid::{build_pyramid, PyramidIndex, PyramidMetadata, MANIFEST_FILE};
pub use tree::{TileDraw, TileView, TiledImage};

/// Errors from tile sources and pyramids.
#[derive(Debug)]
pub enum TileError {
    /// Filesystem error reading or writing a tile or manifest
    Io(std::io::Error),
    /// Source image unreadable or undecodable
    Source(String),
    /// Pyramid manifest missing or malformed
    Manifest(String),
}

impl std::fmt::Display for TileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileError::Io(e) => write!(f, "Tile I/O error: {}", e),
            TileError::Source(msg) => write!(f, "Tile source error: {}", msg),
            TileError::Manifest(msg) => write!(f, "Pyramid manifest error: {}", msg),
        }
    }
}

impl std::error::Error for TileError {}

impl From<std::io::Error> for TileError {
    fn from(e: std::io::Error) -> Self {
        TileError::Io(e)
    }
}

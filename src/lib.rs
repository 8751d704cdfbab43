//! PixelWall Library
//!
//! A distributed tiled display wall engine: one controller replicates a
//! scene graph to N renderer processes, external producers push pixel
//! streams over TCP, and large images are painted through a
//! level-of-detail tile tree under a global loader budget.

pub mod cache;
pub mod geometry;
pub mod gpu;
pub mod ingest;
pub mod replication;
pub mod scene;
pub mod settings;
pub mod stream;
pub mod telemetry;
pub mod tile;
pub mod wall;

pub use cache::ObjectCache;
pub use geometry::{NormRect, PixelRect};
pub use gpu::{NullUploader, TextureId, TextureUploader};
pub use scene::{ContentKind, ContentWindow, ControlFlags, Cursor, SceneEvent, SceneGraph};
pub use settings::{RendererConfig, WallSettings};
pub use stream::{PixelStream, PixelStreamManager, Segment};
pub use tile::{build_pyramid, TileDraw, TileLoader, TiledImage};
pub use wall::{Controller, FramePlan, FrameStatus, Renderer, WallError};

//! Collaborator seam for GPU texture upload.
//!
//! The core never issues draw calls or owns a graphics device. The draw
//! layer hands the per-renderer coordinator an uploader; decoded images go
//! in, opaque texture ids come out. Textures are created and released only
//! from the draw thread, so every implementation of this trait may assume
//! single-threaded use.

use image::RgbaImage;

/// Opaque handle to a GPU-resident texture owned by the draw layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Texture-upload capability provided by the draw layer.
pub trait TextureUploader {
    /// Upload an RGBA image, returning a handle to the resident texture.
    fn upload(&mut self, image: &RgbaImage) -> TextureId;

    /// Release a previously uploaded texture.
    fn release(&mut self, id: TextureId);
}

/// Counting uploader used by tests and headless runs.
#[derive(Debug, Default)]
pub struct NullUploader {
    next: u64,
    pub live: usize,
}

impl TextureUploader for NullUploader {
    fn upload(&mut self, _image: &RgbaImage) -> TextureId {
        self.next += 1;
        self.live += 1;
        TextureId(self.next)
    }

    fn release(&mut self, _id: TextureId) {
        self.live = self.live.saturating_sub(1);
    }
}

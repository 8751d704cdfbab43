//! Per-stream double buffer of image segments.

use bytes::Bytes;
use image::RgbaImage;

use super::decoder::{DecodeJob, DecodePool, DecodeResult};
use crate::geometry::{NormRect, PixelRect};
use crate::gpu::{TextureId, TextureUploader};
use crate::scene::ContentWindow;

/// One rectangular tile of a pixel-stream frame.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Placement in the stream's own pixel space
    pub rect: PixelRect,
    /// JPEG when true, raw RGBA8 otherwise
    pub compressed: bool,
    pub data: Bytes,
}

/// Decode/upload progress of one front-buffer segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentState {
    /// Nothing scheduled yet (or deferred by pool backpressure)
    #[default]
    Empty,
    /// Submitted to the decode pool
    Decoding,
    /// Decoded image available, ready for upload
    Ready,
    /// Decode failed; the segment is skipped for this frame
    Failed,
}

/// Render-side state of one segment: the decoded image handed back by a
/// worker, and the texture it was uploaded to.
#[derive(Debug, Default)]
pub struct SegmentRenderer {
    state: SegmentState,
    image: Option<RgbaImage>,
    texture: Option<TextureId>,
}

impl SegmentRenderer {
    fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }
}

/// Double-buffered segment state for one stream URI.
///
/// Invariants: at most one undecoded back frame exists at any time (a newer
/// frame silently replaces an older one), and at most one frame is in
/// flight for decode at a time.
pub struct PixelStream {
    uri: String,
    /// Segments currently being decoded/rendered
    front: Vec<Segment>,
    /// Per-segment render state, parallel to `front`
    renderers: Vec<SegmentRenderer>,
    /// Most recently fully received frame, waiting for promotion
    back: Option<Vec<Segment>>,
    /// Incremented on every promotion; tags decode jobs for staleness
    frame_index: u64,
    decodes_in_flight: usize,
    width: u32,
    height: u32,
}

impl PixelStream {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            front: Vec::new(),
            renderers: Vec::new(),
            back: None,
            frame_index: 0,
            decodes_in_flight: 0,
            width: 0,
            height: 0,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Bounding box of the current front segments.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn decodes_in_flight(&self) -> usize {
        self.decodes_in_flight
    }

    /// Segments ready for upload.
    pub fn ready_count(&self) -> usize {
        self.renderers
            .iter()
            .filter(|r| r.state() == SegmentState::Ready)
            .count()
    }

    /// Replace the back buffer with a newly received frame. Any undecoded
    /// frame already waiting is dropped, never queued.
    pub fn insert_frame(&mut self, segments: Vec<Segment>) {
        if self.back.is_some() {
            tracing::debug!(uri = %self.uri, "Frame dropped (back buffer overwritten)");
        }
        self.back = Some(segments);
    }

    /// Swap the back buffer into front, recompute stream dimensions and
    /// reset every per-segment renderer. No-op when no frame is waiting.
    ///
    /// Callers must not promote while decodes are in flight.
    pub fn promote_back_buffer(&mut self) -> bool {
        let Some(segments) = self.back.take() else {
            return false;
        };
        debug_assert_eq!(self.decodes_in_flight, 0);

        let bbox = segments
            .iter()
            .fold(PixelRect::default(), |acc, s| acc.union(&s.rect));
        self.width = bbox.right();
        self.height = bbox.bottom();

        self.renderers = segments.iter().map(|_| SegmentRenderer::new()).collect();
        self.front = segments;
        self.frame_index += 1;
        true
    }

    /// The wall region covered by segment `idx`, given the owning window.
    fn segment_wall_region(&self, idx: usize, window: &ContentWindow) -> NormRect {
        if self.width == 0 || self.height == 0 {
            return NormRect::default();
        }
        let r = &self.front[idx].rect;
        let content_rect = NormRect::new(
            r.x as f64 / self.width as f64,
            r.y as f64 / self.height as f64,
            r.width as f64 / self.width as f64,
            r.height as f64 / self.height as f64,
        );
        window.project(&content_rect)
    }

    /// Schedule decodes for every front segment visible in `view_region`.
    ///
    /// Compressed segments go to the pool (skipped this cycle when the pool
    /// is saturated); uncompressed ones are copied directly. Invisible
    /// segments stay untouched.
    pub fn schedule_visible(
        &mut self,
        pool: &DecodePool,
        window: &ContentWindow,
        view_region: &NormRect,
    ) {
        for idx in 0..self.front.len() {
            if self.renderers[idx].state() != SegmentState::Empty {
                continue;
            }
            if !self.segment_wall_region(idx, window).intersects(view_region) {
                continue;
            }

            let segment = &self.front[idx];
            if segment.compressed {
                let job = DecodeJob {
                    uri: self.uri.clone(),
                    frame_index: self.frame_index,
                    segment_index: idx,
                    rect: segment.rect,
                    data: segment.data.clone(),
                };
                if pool.try_submit(job) {
                    self.renderers[idx].state = SegmentState::Decoding;
                    self.decodes_in_flight += 1;
                }
                // A saturated pool defers the segment to a later cycle
            } else {
                match Self::copy_raw(segment) {
                    Some(image) => {
                        self.renderers[idx].image = Some(image);
                        self.renderers[idx].state = SegmentState::Ready;
                    }
                    None => {
                        tracing::warn!(
                            uri = %self.uri,
                            segment = idx,
                            "Raw segment size mismatch, dropped"
                        );
                        self.renderers[idx].state = SegmentState::Failed;
                    }
                }
            }
        }
    }

    /// Write one finished decode back. Results tagged with a superseded
    /// frame index are discarded.
    pub fn apply_decode_result(&mut self, result: DecodeResult) {
        self.decodes_in_flight = self.decodes_in_flight.saturating_sub(1);

        if result.frame_index != self.frame_index {
            tracing::debug!(uri = %self.uri, "Stale decode result discarded");
            return;
        }
        let Some(renderer) = self.renderers.get_mut(result.segment_index) else {
            return;
        };
        match result.image {
            Ok(image) => {
                renderer.image = Some(image);
                renderer.state = SegmentState::Ready;
            }
            Err(e) => {
                tracing::warn!(
                    uri = %self.uri,
                    segment = result.segment_index,
                    error = %e,
                    "Segment decode failed, dropped"
                );
                renderer.state = SegmentState::Failed;
            }
        }
    }

    /// Upload every ready segment image, releasing textures it replaces.
    /// Draw-thread only. Returns the number of uploads performed.
    pub fn upload_ready(&mut self, uploader: &mut dyn TextureUploader) -> usize {
        let mut uploads = 0;
        for renderer in &mut self.renderers {
            if renderer.state() != SegmentState::Ready {
                continue;
            }
            let Some(image) = renderer.image.take() else {
                continue;
            };
            if let Some(old) = renderer.texture.take() {
                uploader.release(old);
            }
            renderer.texture = Some(uploader.upload(&image));
            uploads += 1;
        }
        uploads
    }

    /// Uploaded segment textures with their stream-space rectangles, for
    /// the draw layer.
    pub fn textures(&self) -> impl Iterator<Item = (PixelRect, TextureId)> + '_ {
        self.front
            .iter()
            .zip(self.renderers.iter())
            .filter_map(|(seg, r)| r.texture().map(|t| (seg.rect, t)))
    }

    fn copy_raw(segment: &Segment) -> Option<RgbaImage> {
        let expected = segment.rect.area() as usize * 4;
        if segment.data.len() != expected {
            return None;
        }
        RgbaImage::from_raw(
            segment.rect.width,
            segment.rect.height,
            segment.data.to_vec(),
        )
    }
}

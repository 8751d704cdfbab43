//! Pixel-stream buffering and decode scheduling
//!
//! External producers push frames as sets of rectangular segments. Each
//! stream keeps a double buffer: the *front* set is being decoded/rendered
//! while the *back* set holds the most recently received complete frame.
//! Excess frames overwrite the back set: frames are dropped, never
//! queued, and that is the whole back-pressure mechanism.
//!
//! Compressed segments are decoded by a bounded worker pool; segments not
//! visible on this renderer's screen region are neither decoded nor
//! uploaded.

mod buffer;
mod decoder;

pub use buffer::{PixelStream, Segment, SegmentRenderer, SegmentState};
pub use decoder::{DecodeJob, DecodePool, DecodeResult};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::geometry::NormRect;
use crate::scene::ContentWindow;

/// All pixel streams of one process, keyed by URI, plus the shared decode
/// pool. Safe for concurrent use by the ingest/replication tasks (frame
/// insertion) and the draw loop (pre-render updates).
pub struct PixelStreamManager {
    streams: Mutex<HashMap<String, Arc<Mutex<PixelStream>>>>,
    pool: DecodePool,
}

impl PixelStreamManager {
    /// Create a manager with `decode_workers` worker threads.
    pub fn new(decode_workers: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            pool: DecodePool::new(decode_workers),
        }
    }

    /// Create the stream for `uri` if it does not exist yet.
    pub fn open_stream(&self, uri: &str) -> Arc<Mutex<PixelStream>> {
        let mut streams = self.streams.lock().unwrap();
        Arc::clone(
            streams
                .entry(uri.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PixelStream::new(uri)))),
        )
    }

    pub fn stream(&self, uri: &str) -> Option<Arc<Mutex<PixelStream>>> {
        self.streams.lock().unwrap().get(uri).cloned()
    }

    /// Drop the stream for `uri`. In-flight decode results for it are
    /// discarded when they surface.
    pub fn close_stream(&self, uri: &str) -> bool {
        self.streams.lock().unwrap().remove(uri).is_some()
    }

    pub fn stream_uris(&self) -> Vec<String> {
        self.streams.lock().unwrap().keys().cloned().collect()
    }

    /// Store a complete frame into the stream's back buffer, replacing any
    /// undecoded frame already waiting there (last-write-wins).
    pub fn insert_frame(&self, uri: &str, segments: Vec<Segment>) {
        let stream = self.open_stream(uri);
        stream.lock().unwrap().insert_frame(segments);
    }

    /// Once-per-draw-cycle update for one stream: apply finished decodes,
    /// swap the back buffer in when decoding is quiescent, and schedule
    /// decodes for the segments visible in `view_region`.
    ///
    /// `window` is the stream's ContentWindow from the scene mirror;
    /// `view_region` is this renderer's wall region in normalized
    /// coordinates.
    pub fn pre_render_update(&self, uri: &str, window: &ContentWindow, view_region: &NormRect) {
        self.apply_decode_results();

        let Some(stream) = self.stream(uri) else {
            return;
        };
        let mut stream = stream.lock().unwrap();

        // A frame still being decoded blocks the swap; the back buffer
        // keeps absorbing newer frames meanwhile. The controller holds
        // back each relay until every renderer reports quiescence, so the
        // same local check gates the swap for the whole cluster.
        if stream.decodes_in_flight() == 0 {
            stream.promote_back_buffer();
        }

        stream.schedule_visible(&self.pool, window, view_region);
    }

    /// Drain the decode results channel, writing each finished image back
    /// into its stream. Results for a superseded frame or a closed stream
    /// are discarded.
    pub fn apply_decode_results(&self) {
        for result in self.pool.drain_results() {
            let Some(stream) = self.stream(&result.uri) else {
                tracing::debug!(uri = %result.uri, "Decode result for closed stream discarded");
                continue;
            };
            stream.lock().unwrap().apply_decode_result(result);
        }
    }

    /// Number of decode jobs currently in flight for `uri`.
    pub fn decodes_in_flight(&self, uri: &str) -> usize {
        self.stream(uri)
            .map(|s| s.lock().unwrap().decodes_in_flight())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelRect;
    use crate::scene::ContentKind;
    use bytes::Bytes;

    fn raw_segment(x: u32, y: u32, w: u32, h: u32) -> Segment {
        Segment {
            rect: PixelRect::new(x, y, w, h),
            compressed: false,
            data: Bytes::from(vec![0u8; (w * h * 4) as usize]),
        }
    }

    fn fullscreen_window(uri: &str) -> ContentWindow {
        let mut w = ContentWindow::new(uri, ContentKind::PixelStream);
        w.set_coords(NormRect::unit(), false);
        w
    }

    #[test]
    fn test_open_segment_finish_scenario() {
        // OPEN("s1"), SEGMENT(0,0,100,100, raw), FINISH_FRAME, one update:
        // dimensions are 100x100 and one renderer is ready.
        let mgr = PixelStreamManager::new(1);
        mgr.open_stream("s1");
        mgr.insert_frame("s1", vec![raw_segment(0, 0, 100, 100)]);
        mgr.pre_render_update("s1", &fullscreen_window("s1"), &NormRect::unit());

        let stream = mgr.stream("s1").unwrap();
        let stream = stream.lock().unwrap();
        assert_eq!(stream.dimensions(), (100, 100));
        assert_eq!(stream.ready_count(), 1);
    }

    #[test]
    fn test_two_inserts_last_write_wins() {
        let mgr = PixelStreamManager::new(1);
        mgr.insert_frame("s1", vec![raw_segment(0, 0, 50, 50)]);
        mgr.insert_frame("s1", vec![raw_segment(0, 0, 200, 100)]);
        mgr.pre_render_update("s1", &fullscreen_window("s1"), &NormRect::unit());

        // Only the second frame's segments are ever visible
        let stream = mgr.stream("s1").unwrap();
        assert_eq!(stream.lock().unwrap().dimensions(), (200, 100));
    }

    #[test]
    fn test_invisible_segments_not_decoded() {
        let mgr = PixelStreamManager::new(1);
        // Stream is 200 wide; the right half falls outside the view region
        mgr.insert_frame(
            "s1",
            vec![raw_segment(0, 0, 100, 100), raw_segment(100, 0, 100, 100)],
        );
        let left_half = NormRect::new(0.0, 0.0, 0.5, 1.0);
        mgr.pre_render_update("s1", &fullscreen_window("s1"), &left_half);

        let stream = mgr.stream("s1").unwrap();
        let stream = stream.lock().unwrap();
        assert_eq!(stream.dimensions(), (200, 100));
        assert_eq!(stream.ready_count(), 1);
    }

    #[test]
    fn test_hostile_rect_saturates_instead_of_wrapping() {
        let mgr = PixelStreamManager::new(1);
        mgr.insert_frame(
            "s1",
            vec![Segment {
                rect: PixelRect::new(u32::MAX, 0, 2, 1),
                compressed: false,
                data: Bytes::from(vec![0u8; 2 * 4]),
            }],
        );
        mgr.pre_render_update("s1", &fullscreen_window("s1"), &NormRect::unit());

        let stream = mgr.stream("s1").unwrap();
        assert_eq!(stream.lock().unwrap().dimensions(), (u32::MAX, 1));
    }

    #[test]
    fn test_close_stream_discards_state() {
        let mgr = PixelStreamManager::new(1);
        mgr.insert_frame("s1", vec![raw_segment(0, 0, 10, 10)]);
        assert!(mgr.close_stream("s1"));
        assert!(mgr.stream("s1").is_none());
        assert!(!mgr.close_stream("s1"));
    }
}

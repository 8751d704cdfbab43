//! Tile load workers and the global in-flight budget.
//!
//! Tile loads (downsampling from an in-memory source, or reading a pyramid
//! file) run on a small worker pool. A renderer-wide budget counter bounds
//! the number of loads in flight; when the budget is exhausted a node simply
//! tries again on a later frame.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use image::{imageops, RgbaImage};

use crate::geometry::PixelRect;

/// Where a tile's pixels come from.
pub enum TileLoadSource {
    /// Crop `region` out of the shared source image and downsample it to
    /// fit `max_edge`
    Downsample {
        source: Arc<RgbaImage>,
        region: PixelRect,
        max_edge: u32,
    },
    /// Read a precomputed pyramid tile from disk
    PyramidFile(PathBuf),
}

/// One tile load, tagged with the owning image and arena node.
pub struct TileLoadJob {
    pub uri: String,
    pub node_id: usize,
    pub source: TileLoadSource,
}

/// Finished tile load.
pub struct TileLoadResult {
    pub uri: String,
    pub node_id: usize,
    pub image: Result<RgbaImage, String>,
}

/// Worker pool plus the global in-flight budget.
///
/// One slot is reserved per accepted job and released when its result is
/// drained, so `in_flight()` never exceeds the configured budget.
pub struct TileLoader {
    max_in_flight: usize,
    in_flight: Mutex<usize>,
    work_tx: Option<SyncSender<TileLoadJob>>,
    result_rx: Mutex<Receiver<TileLoadResult>>,
    workers: Vec<JoinHandle<()>>,
}

impl TileLoader {
    /// Spawn a loader with the given in-flight budget. Worker count equals
    /// the budget: more threads could never be busy at once.
    pub fn new(budget: usize) -> Self {
        let budget = budget.max(1);
        let (work_tx, work_rx) = mpsc::sync_channel::<TileLoadJob>(budget);
        let (result_tx, result_rx) = mpsc::channel::<TileLoadResult>();

        let work_rx = Arc::new(Mutex::new(work_rx));
        let workers = (0..budget)
            .map(|i| {
                let work_rx = Arc::clone(&work_rx);
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("tile-loader-{}", i))
                    .spawn(move || Self::worker_loop(work_rx, result_tx))
                    .expect("Failed to spawn tile loader thread")
            })
            .collect();

        Self {
            max_in_flight: budget,
            in_flight: Mutex::new(0),
            work_tx: Some(work_tx),
            result_rx: Mutex::new(result_rx),
            workers,
        }
    }

    pub fn budget(&self) -> usize {
        self.max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap()
    }

    /// Reserve a budget slot and submit a load. Returns false (leaving the
    /// budget untouched) when the budget is exhausted; the node retries on
    /// a later frame.
    pub fn try_begin_load(&self, job: TileLoadJob) -> bool {
        let Some(tx) = &self.work_tx else {
            return false;
        };
        let mut in_flight = self.in_flight.lock().unwrap();
        if *in_flight >= self.max_in_flight {
            return false;
        }
        match tx.try_send(job) {
            Ok(()) => {
                *in_flight += 1;
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Collect finished loads without blocking, releasing one budget slot
    /// per result.
    pub fn drain_results(&self) -> Vec<TileLoadResult> {
        let results: Vec<_> = {
            let rx = self.result_rx.lock().unwrap();
            rx.try_iter().collect()
        };
        if !results.is_empty() {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight = in_flight.saturating_sub(results.len());
        }
        results
    }

    /// Block until one load finishes. Test helper.
    #[cfg(test)]
    pub fn recv_result(&self) -> Option<TileLoadResult> {
        let result = self.result_rx.lock().unwrap().recv().ok()?;
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight = in_flight.saturating_sub(1);
        Some(result)
    }

    fn worker_loop(work_rx: Arc<Mutex<Receiver<TileLoadJob>>>, result_tx: Sender<TileLoadResult>) {
        loop {
            let job = {
                let rx = work_rx.lock().unwrap();
                rx.recv()
            };
            let Ok(job) = job else {
                break;
            };
            let image = Self::load(&job.source);
            let result = TileLoadResult {
                uri: job.uri,
                node_id: job.node_id,
                image,
            };
            if result_tx.send(result).is_err() {
                break;
            }
        }
    }

    fn load(source: &TileLoadSource) -> Result<RgbaImage, String> {
        match source {
            TileLoadSource::Downsample {
                source,
                region,
                max_edge,
            } => {
                if region.right() > source.width() || region.bottom() > source.height() {
                    return Err(format!(
                        "tile region {:?} outside source {}x{}",
                        region,
                        source.width(),
                        source.height()
                    ));
                }
                let cropped =
                    imageops::crop_imm(source.as_ref(), region.x, region.y, region.width, region.height)
                        .to_image();
                Ok(downsample_to_edge(&cropped, *max_edge))
            }
            TileLoadSource::PyramidFile(path) => {
                let file = image::open(path)
                    .map_err(|e| format!("pyramid tile {} unreadable: {}", path.display(), e))?;
                Ok(file.to_rgba8())
            }
        }
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.work_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Shrink `image` so its longer edge is at most `max_edge`, preserving
/// aspect ratio. Images already small enough are returned as-is.
pub fn downsample_to_edge(image: &RgbaImage, max_edge: u32) -> RgbaImage {
    let (w, h) = (image.width(), image.height());
    let longest = w.max(h);
    if longest <= max_edge {
        return image.clone();
    }
    let scale = max_edge as f64 / longest as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    imageops::resize(image, nw, nh, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downsample_job(node_id: usize, source: &Arc<RgbaImage>, region: PixelRect) -> TileLoadJob {
        TileLoadJob {
            uri: "file:///big.png".into(),
            node_id,
            source: TileLoadSource::Downsample {
                source: Arc::clone(source),
                region,
                max_edge: 64,
            },
        }
    }

    #[test]
    fn test_budget_never_exceeded() {
        let loader = TileLoader::new(2);
        let source = Arc::new(RgbaImage::new(256, 256));
        let region = PixelRect::of_size(256, 256);

        assert!(loader.try_begin_load(downsample_job(0, &source, region)));
        assert!(loader.try_begin_load(downsample_job(1, &source, region)));
        assert_eq!(loader.in_flight(), 2);
        // Budget exhausted until a result is drained
        assert!(!loader.try_begin_load(downsample_job(2, &source, region)));

        assert!(loader.recv_result().is_some());
        assert!(loader.in_flight() <= loader.budget());
        assert!(loader.try_begin_load(downsample_job(3, &source, region)));
    }

    #[test]
    fn test_downsample_preserves_aspect() {
        let image = RgbaImage::new(200, 100);
        let small = downsample_to_edge(&image, 64);
        assert_eq!((small.width(), small.height()), (64, 32));

        let tiny = RgbaImage::new(10, 10);
        assert_eq!(downsample_to_edge(&tiny, 64).width(), 10);
    }

    #[test]
    fn test_out_of_bounds_region_is_error() {
        let loader = TileLoader::new(1);
        let source = Arc::new(RgbaImage::new(100, 100));
        let job = TileLoadJob {
            uri: "u".into(),
            node_id: 0,
            source: TileLoadSource::Downsample {
                source,
                region: PixelRect::new(50, 50, 100, 100),
                max_edge: 64,
            },
        };
        assert!(loader.try_begin_load(job));
        let result = loader.recv_result().unwrap();
        assert!(result.image.is_err());
    }

    #[test]
    fn test_missing_pyramid_file_is_error() {
        let loader = TileLoader::new(1);
        let job = TileLoadJob {
            uri: "u".into(),
            node_id: 0,
            source: TileLoadSource::PyramidFile(PathBuf::from("/nonexistent/tile.png")),
        };
        assert!(loader.try_begin_load(job));
        let result = loader.recv_result().unwrap();
        assert!(result.image.is_err());
    }
}

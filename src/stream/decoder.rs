//! Bounded decode worker pool.
//!
//! A fixed number of worker threads consume jobs from a bounded channel and
//! hand decoded images back on a results channel. A full work channel never
//! blocks the caller: submission fails and the segment is retried on a
//! later draw cycle.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use image::RgbaImage;

use crate::geometry::PixelRect;

/// Work-channel capacity per worker.
const JOBS_PER_WORKER: usize = 4;

/// One compressed segment to decode.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub uri: String,
    /// Front-buffer generation the segment belongs to
    pub frame_index: u64,
    /// Index into the stream's front segment list
    pub segment_index: usize,
    /// Expected segment placement; decode fails on dimension mismatch
    pub rect: PixelRect,
    pub data: Bytes,
}

/// Outcome of one decode job, delivered on the results channel.
#[derive(Debug)]
pub struct DecodeResult {
    pub uri: String,
    pub frame_index: u64,
    pub segment_index: usize,
    pub image: Result<RgbaImage, String>,
}

/// Bounded pool of decode worker threads.
pub struct DecodePool {
    work_tx: Option<SyncSender<DecodeJob>>,
    result_rx: Mutex<Receiver<DecodeResult>>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodePool {
    /// Spawn `workers` decode threads.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (work_tx, work_rx) = mpsc::sync_channel::<DecodeJob>(workers * JOBS_PER_WORKER);
        let (result_tx, result_rx) = mpsc::channel::<DecodeResult>();

        let work_rx = std::sync::Arc::new(Mutex::new(work_rx));
        let handles = (0..workers)
            .map(|i| {
                let work_rx = std::sync::Arc::clone(&work_rx);
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("segment-decode-{}", i))
                    .spawn(move || Self::worker_loop(work_rx, result_tx))
                    .expect("Failed to spawn decode worker thread")
            })
            .collect();

        Self {
            work_tx: Some(work_tx),
            result_rx: Mutex::new(result_rx),
            workers: handles,
        }
    }

    /// Submit a job without blocking. Returns false when the pool is
    /// saturated; the caller retries on a later cycle.
    pub fn try_submit(&self, job: DecodeJob) -> bool {
        let Some(tx) = &self.work_tx else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Decode pool saturated, segment deferred");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Collect every finished result without blocking.
    pub fn drain_results(&self) -> Vec<DecodeResult> {
        let rx = self.result_rx.lock().unwrap();
        rx.try_iter().collect()
    }

    /// Block until one result arrives. Test helper; the draw loop only ever
    /// drains.
    #[cfg(test)]
    pub fn recv_result(&self) -> Option<DecodeResult> {
        self.result_rx.lock().unwrap().recv().ok()
    }

    fn worker_loop(
        work_rx: std::sync::Arc<Mutex<Receiver<DecodeJob>>>,
        result_tx: mpsc::Sender<DecodeResult>,
    ) {
        loop {
            // Hold the lock only while picking up a job
            let job = {
                let rx = work_rx.lock().unwrap();
                rx.recv()
            };
            let Ok(job) = job else {
                break; // pool dropped
            };

            let image = Self::decode(&job);
            let result = DecodeResult {
                uri: job.uri,
                frame_index: job.frame_index,
                segment_index: job.segment_index,
                image,
            };
            if result_tx.send(result).is_err() {
                break;
            }
        }
    }

    fn decode(job: &DecodeJob) -> Result<RgbaImage, String> {
        let decoded = image::load_from_memory(&job.data)
            .map_err(|e| format!("segment decode error: {}", e))?;
        let image = decoded.to_rgba8();
        if image.width() != job.rect.width || image.height() != job.rect.height {
            return Err(format!(
                "decoded size {}x{} does not match segment rect {}x{}",
                image.width(),
                image.height(),
                job.rect.width,
                job.rect.height
            ));
        }
        Ok(image)
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        // Closing the work channel ends every worker loop
        self.work_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

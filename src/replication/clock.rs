//! Cluster wall clock
//!
//! Renderer rank 0 is the clock source. The controller calibrates against
//! it once at startup with a single round trip (half the measured RTT is
//! taken as one-way latency); the remaining renderers subscribe and track
//! its periodic ticks. Every downstream timing decision (cursor staleness,
//! decode pacing) reads the calibrated clock, so the whole cluster agrees
//! on "now" to within a network round trip.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ReplicationError;

const REQUEST_CALIBRATE: u8 = 0;
const REQUEST_SUBSCRIBE: u8 = 1;

/// Monotonic seconds with a settable offset. `now()` is lock-free and safe
/// to call from any thread, including decode workers.
pub struct WallClock {
    start: Instant,
    /// f64 offset in seconds, stored as raw bits.
    offset: AtomicU64,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64() + f64::from_bits(self.offset.load(Ordering::Relaxed))
    }

    /// Jump the clock so `now()` reads `remote_now`.
    pub fn adjust_to(&self, remote_now: f64) {
        let offset = remote_now - self.start.elapsed().as_secs_f64();
        self.offset.store(offset.to_bits(), Ordering::Relaxed);
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock source, run by renderer rank 0. Answers calibration requests and
/// streams ticks to subscribed peers.
pub struct ClockServer {
    listener: TcpListener,
    clock: Arc<WallClock>,
    interval: Duration,
}

impl ClockServer {
    pub async fn bind(
        addr: SocketAddr,
        clock: Arc<WallClock>,
        interval: Duration,
    ) -> Result<Self, ReplicationError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Clock source on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            clock,
            interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept peers until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => return,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Clock accept failed: {}", e);
                    continue;
                }
            };
            debug!("Clock peer connected from {}", peer);
            let clock = Arc::clone(&self.clock);
            let interval = self.interval;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = serve_peer(socket, clock, interval, shutdown).await;
            });
        }
    }
}

async fn serve_peer(
    mut socket: TcpStream,
    clock: Arc<WallClock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let mut request = [0u8; 1];
    socket.read_exact(&mut request).await?;
    match request[0] {
        REQUEST_CALIBRATE => {
            socket.write_all(&clock.now().to_le_bytes()).await?;
        }
        REQUEST_SUBSCRIBE => {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        socket.write_all(&clock.now().to_le_bytes()).await?;
                    }
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
        other => {
            warn!("Unknown clock request {}", other);
        }
    }
    Ok(())
}

/// Calibration and tick-following against the clock source.
pub struct ClockClient;

impl ClockClient {
    /// One-shot round trip. Sets `clock` to the source's reading plus half
    /// the measured round-trip time.
    pub async fn calibrate(addr: impl ToSocketAddrs, clock: &WallClock) -> Result<(), ReplicationError> {
        let mut socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let t0 = clock.now();
        socket.write_all(&[REQUEST_CALIBRATE]).await?;
        let mut reading = [0u8; 8];
        socket.read_exact(&mut reading).await?;
        let rtt = clock.now() - t0;
        let remote_now = f64::from_le_bytes(reading) + rtt / 2.0;
        clock.adjust_to(remote_now);
        debug!("Clock calibrated, rtt {:.3} ms", rtt * 1000.0);
        Ok(())
    }

    /// Follow the source's periodic ticks until the connection drops or
    /// `shutdown` fires. Run by every renderer except the source itself.
    pub async fn follow(
        addr: impl ToSocketAddrs,
        clock: Arc<WallClock>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReplicationError> {
        let mut socket = TcpStream::connect(addr).await?;
        socket.write_all(&[REQUEST_SUBSCRIBE]).await?;
        let mut reading = [0u8; 8];
        loop {
            tokio::select! {
                read = socket.read_exact(&mut reading) => {
                    read?;
                    clock.adjust_to(f64::from_le_bytes(reading));
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

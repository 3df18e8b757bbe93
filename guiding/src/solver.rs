//! Worker side of the guiding protocol
//!
//! [`SolverClient`] is what runs inside the solving worker: it connects to
//! the coordinator, says hello, copies each announced frame out of the shared
//! buffer before acknowledging it, and answers solve requests for that frame
//! using a [`PlateSolver`].
//!
//! The only solver shipped here is [`EchoSolver`], which answers with the
//! hint coordinates (optionally shifted by a fixed drift).

use crate::buffer::SharedImageBuffer;
use crate::codec::{read_message, write_message};
use crate::correction::SkyCoordinates;
use crate::error::{GuidingError, GuidingResult, ProtocolError};
use crate::protocol::{SolveRequest, SolveResponse, WorkerMessage};
use async_trait::async_trait;
use mast_device::ImageGeometry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

/// Solves an image against a coordinate hint
#[async_trait]
pub trait PlateSolver: Send + Sync {
    async fn solve(&self, pixels: &[u32], geometry: ImageGeometry, hint: SkyCoordinates) -> Result<SkyCoordinates, String>;
}

/// Answers with the hint plus a fixed drift
#[derive(Debug, Clone, Default)]
pub struct EchoSolver {
    drift: Option<SkyCoordinates>,
    delay: Duration,
}

impl EchoSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every solution shifted by `ra_hours`/`dec_degs` from the hint
    pub fn with_drift(mut self, ra_hours: f64, dec_degs: f64) -> Self {
        self.drift = Some(SkyCoordinates::new(ra_hours, dec_degs));
        self
    }

    /// Pretend solving takes this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl PlateSolver for EchoSolver {
    async fn solve(&self, pixels: &[u32], _geometry: ImageGeometry, hint: SkyCoordinates) -> Result<SkyCoordinates, String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if pixels.iter().all(|p| *p == 0) {
            return Err("blank image".to_string());
        }
        Ok(match self.drift {
            Some(drift) => SkyCoordinates::new(hint.ra_hours + drift.ra_hours, hint.dec_degs + drift.dec_degs),
            None => hint,
        })
    }
}

/// Worker-side connection settings
#[derive(Debug, Clone)]
pub struct SolverClientConfig {
    pub coordinator: SocketAddr,
    pub buffer_dir: PathBuf,
    pub buffer_name: String,
    pub connect_timeout: Duration,
}

/// Frame copied out of the shared buffer when it was acknowledged
struct HeldFrame {
    generation: u64,
    geometry: ImageGeometry,
    pixels: Vec<u32>,
}

pub struct SolverClient<S: PlateSolver> {
    config: SolverClientConfig,
    solver: S,
}

impl<S: PlateSolver> SolverClient<S> {
    pub fn new(config: SolverClientConfig, solver: S) -> Self {
        Self { config, solver }
    }

    /// Connect, retrying until the coordinator listens or the timeout expires
    async fn connect(&self) -> GuidingResult<TcpStream> {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            match TcpStream::connect(self.config.coordinator).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(GuidingError::WorkerUnreachable(format!(
                        "cannot reach coordinator at {}: {}",
                        self.config.coordinator, e
                    )))
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    /// Serve the coordinator until it says goodbye or disconnects
    pub async fn run(&self) -> GuidingResult<()> {
        let mut stream = self.connect().await?;
        tracing::info!("solver: connected to coordinator at {}", self.config.coordinator);
        write_message(
            &mut stream,
            &WorkerMessage::Hello {
                ready: true,
                reasons: vec![],
            },
        )
        .await?;

        let mut buffer: Option<SharedImageBuffer> = None;
        let mut frame: Option<HeldFrame> = None;
        loop {
            let message = match read_message(&mut stream).await {
                Ok(message) => message,
                Err(ProtocolError::Closed) => {
                    tracing::info!("solver: coordinator closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let reply = match message {
                WorkerMessage::ImageReady {
                    generation,
                    width,
                    height,
                } => Some(self.attach(&mut buffer, &mut frame, generation, width, height)),
                WorkerMessage::SolveRequest(request) => {
                    Some(WorkerMessage::SolveResponse(self.answer(frame.as_ref(), &request).await))
                }
                WorkerMessage::Goodbye => {
                    tracing::info!("solver: coordinator said goodbye");
                    return Ok(());
                }
                other => {
                    tracing::warn!("solver: ignoring unexpected {}", other.kind());
                    None
                }
            };

            if let Some(reply) = reply {
                write_message(&mut stream, &reply).await?;
            }
        }
    }

    /// Attach the buffer (re-attaching on a geometry change) and copy the
    /// frame out before acknowledging it
    fn attach(
        &self,
        buffer: &mut Option<SharedImageBuffer>,
        frame: &mut Option<HeldFrame>,
        generation: u64,
        width: u32,
        height: u32,
    ) -> WorkerMessage {
        *frame = None;
        let nack = |reason: String| {
            tracing::warn!("solver: image {} rejected: {}", generation, reason);
            WorkerMessage::ImageAck {
                generation,
                ok: false,
                reasons: vec![reason],
            }
        };

        let geometry = match ImageGeometry::new(width, height) {
            Ok(g) => g,
            Err(e) => return nack(e.to_string()),
        };
        let attached = match buffer.take() {
            Some(existing) if existing.geometry() == geometry => existing,
            _ => match SharedImageBuffer::attach(&self.config.buffer_dir, &self.config.buffer_name, geometry) {
                Ok(attached) => attached,
                Err(e) => return nack(e.to_string()),
            },
        };
        *frame = Some(HeldFrame {
            generation,
            geometry,
            pixels: attached.read_pixels(),
        });
        *buffer = Some(attached);

        WorkerMessage::ImageAck {
            generation,
            ok: true,
            reasons: vec![],
        }
    }

    async fn answer(&self, frame: Option<&HeldFrame>, request: &SolveRequest) -> SolveResponse {
        let Some(frame) = frame else {
            return SolveResponse::failed(request.id, "no image has been acknowledged");
        };
        if request.generation != frame.generation {
            return SolveResponse::failed(
                request.id,
                format!(
                    "request is for image {} but the held image is {}",
                    request.generation, frame.generation
                ),
            );
        }
        if request.geometry() != Some(frame.geometry) {
            return SolveResponse::failed(
                request.id,
                format!(
                    "request geometry {}x{} does not match image {}",
                    request.width, request.height, frame.geometry
                ),
            );
        }

        let hint = SkyCoordinates::new(request.ra, request.dec);
        match self.solver.solve(&frame.pixels, frame.geometry, hint).await {
            Ok(solved) => {
                tracing::info!("solver: request {} solved at {}", request.id, solved);
                SolveResponse {
                    id: request.id,
                    ra: solved.ra_hours,
                    dec: solved.dec_degs,
                    success: true,
                    reasons: vec![],
                }
            }
            Err(reason) => {
                tracing::warn!("solver: request {} failed: {}", request.id, reason);
                SolveResponse::failed(request.id, reason)
            }
        }
    }
}

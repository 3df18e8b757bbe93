//! Coordinator side of the worker connection
//!
//! [`WorkerListener`] accepts the worker and completes the `hello` handshake,
//! producing a [`WorkerChannel`]. The channel splits the socket: a reader task
//! decodes frames into an mpsc queue, so every receive can be bounded by a
//! timeout (or dropped on cancellation) without losing framing.

use crate::codec::{read_message, write_message};
use crate::correction::SkyCoordinates;
use crate::error::{GuidingError, GuidingResult, ProtocolError};
use crate::protocol::{SolveRequest, SolveResponse, WorkerMessage};
use mast_device::ImageGeometry;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Frames buffered between the reader task and the coordinator
const INBOUND_QUEUE: usize = 16;

pub struct WorkerListener {
    listener: TcpListener,
    address: SocketAddr,
}

impl WorkerListener {
    pub async fn bind(address: &str) -> GuidingResult<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            GuidingError::WorkerUnreachable(format!("cannot listen on {}: {}", address, e))
        })?;
        let address = listener.local_addr().map_err(ProtocolError::from)?;
        tracing::info!("ipc: listening for the solving worker on {}", address);
        Ok(Self { listener, address })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Wait for the worker to connect and say hello, within `limit`
    pub async fn accept(&self, limit: Duration) -> GuidingResult<WorkerChannel> {
        let deadline = Instant::now() + limit;

        let (stream, peer) = match timeout_at(deadline, self.listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(ProtocolError::Io(e).into()),
            Err(_) => {
                return Err(GuidingError::WorkerUnreachable(format!(
                    "no worker connected to {} within {:?}",
                    self.address, limit
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        tracing::info!("ipc: worker connected from {}", peer);

        let mut channel = WorkerChannel::from_stream(stream, peer);
        let hello = channel
            .recv_until(deadline, "hello", |message| match message {
                WorkerMessage::Hello { ready, reasons } => Some((ready, reasons)),
                _ => None,
            })
            .await;

        match hello {
            Ok((true, _)) => {
                tracing::info!("ipc: worker at {} is ready", peer);
                Ok(channel)
            }
            Ok((false, reasons)) => Err(GuidingError::WorkerUnreachable(format!(
                "worker is not ready: {}",
                reasons.join(", ")
            ))),
            Err(ProtocolError::Timeout { .. }) => Err(GuidingError::WorkerUnreachable(format!(
                "worker at {} connected but sent no hello within {:?}",
                peer, limit
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// An established, handshaken connection to the worker
pub struct WorkerChannel {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Result<WorkerMessage, ProtocolError>>,
    reader: JoinHandle<()>,
    generation: u64,
    /// Generation announced whose ack never arrived; the worker may still be
    /// copying it out of the shared buffer
    unacked: Option<u64>,
    next_request_id: u64,
}

impl WorkerChannel {
    fn from_stream(stream: tokio::net::TcpStream, peer: SocketAddr) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);

        let reader = tokio::spawn(async move {
            loop {
                let frame = read_message(&mut read_half).await;
                let done = frame.is_err();
                if tx.send(frame).await.is_err() || done {
                    break;
                }
            }
            tracing::debug!("ipc: reader for {} stopped", peer);
        });

        Self {
            peer,
            writer,
            inbound,
            reader,
            generation: 0,
            unacked: None,
            next_request_id: 1,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Generation of the last announced image
    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn send(&mut self, message: &WorkerMessage) -> Result<(), ProtocolError> {
        write_message(&mut self.writer, message).await
    }

    /// Receive until `accept` returns `Some`, discarding everything else.
    /// Cancel-safe: dropping the future loses no frames.
    async fn recv_until<T>(
        &mut self,
        deadline: Instant,
        waiting_for: &str,
        mut accept: impl FnMut(WorkerMessage) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        loop {
            let message = match timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(frame)) => frame?,
                Ok(None) => return Err(ProtocolError::Closed),
                Err(_) => {
                    return Err(ProtocolError::Timeout {
                        duration: deadline.saturating_duration_since(Instant::now()),
                        waiting_for: waiting_for.to_string(),
                    })
                }
            };

            if message == WorkerMessage::Goodbye {
                return Err(ProtocolError::Closed);
            }
            let kind = message.kind();
            match accept(message) {
                Some(value) => return Ok(value),
                None => tracing::debug!("ipc: discarding {} while waiting for {}", kind, waiting_for),
            }
        }
    }

    /// True while the worker may still be reading the shared buffer
    pub fn buffer_on_loan(&self) -> bool {
        self.unacked.is_some()
    }

    /// Wait for the late ack of an announced image whose acknowledgment timed
    /// out. The shared buffer must not be rewritten before this returns.
    pub async fn reclaim_buffer(&mut self, limit: Duration) -> GuidingResult<()> {
        let Some(generation) = self.unacked else {
            return Ok(());
        };
        tracing::debug!("ipc: waiting for the late ack of image {}", generation);
        self.await_ack(generation, limit).await?;
        Ok(())
    }

    async fn await_ack(&mut self, generation: u64, limit: Duration) -> Result<(bool, Vec<String>), ProtocolError> {
        let deadline = Instant::now() + limit;
        let ack = self
            .recv_until(deadline, "image_ack", |message| match message {
                WorkerMessage::ImageAck {
                    generation: g,
                    ok,
                    reasons,
                } if g == generation => Some((ok, reasons)),
                _ => None,
            })
            .await
            .map_err(|e| with_duration(e, limit))?;
        self.unacked = None;
        Ok(ack)
    }

    /// Tell the worker a new frame is in the shared buffer and wait for its
    /// acknowledgment. Returns the frame generation.
    pub async fn announce_image(&mut self, geometry: ImageGeometry, limit: Duration) -> GuidingResult<u64> {
        if let Some(pending) = self.unacked {
            return Err(GuidingError::Config(format!(
                "image {} is still unacknowledged; reclaim the buffer first",
                pending
            )));
        }
        self.generation += 1;
        let generation = self.generation;
        self.send(&WorkerMessage::ImageReady {
            generation,
            width: geometry.width,
            height: geometry.height,
        })
        .await?;
        self.unacked = Some(generation);

        let (ok, reasons) = self.await_ack(generation, limit).await?;

        if !ok {
            return Err(GuidingError::SolveFailure(format!(
                "worker rejected image {}: {}",
                generation,
                reasons.join(", ")
            )));
        }
        Ok(generation)
    }

    /// Ask the worker to solve the last announced image and wait for the
    /// matching response. Responses to earlier (timed-out) requests are
    /// discarded.
    pub async fn solve(
        &mut self,
        hint: SkyCoordinates,
        geometry: ImageGeometry,
        limit: Duration,
    ) -> GuidingResult<SolveResponse> {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.send(&WorkerMessage::SolveRequest(SolveRequest {
            id,
            generation: self.generation,
            ra: hint.ra_hours,
            dec: hint.dec_degs,
            width: geometry.width,
            height: geometry.height,
        }))
        .await?;

        let deadline = Instant::now() + limit;
        let response = self
            .recv_until(deadline, "solve_response", |message| match message {
                WorkerMessage::SolveResponse(response) if response.id == id => Some(response),
                WorkerMessage::SolveResponse(stale) => {
                    tracing::warn!(
                        "ipc: discarding stale solve response {} (waiting for {})",
                        stale.id,
                        id
                    );
                    None
                }
                _ => None,
            })
            .await
            .map_err(|e| with_duration(e, limit))?;
        Ok(response)
    }

    /// Say goodbye and close the connection
    pub async fn shutdown(mut self) {
        if let Err(e) = self.send(&WorkerMessage::Goodbye).await {
            tracing::debug!("ipc: goodbye to {} not delivered: {}", self.peer, e);
        }
        let _ = self.writer.shutdown().await;
        self.reader.abort();
        tracing::info!("ipc: connection to worker {} closed", self.peer);
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Report the configured limit rather than the remaining time
fn with_duration(err: ProtocolError, limit: Duration) -> ProtocolError {
    match err {
        ProtocolError::Timeout { waiting_for, .. } => ProtocolError::Timeout {
            duration: limit,
            waiting_for,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_message, write_message};
    use tokio::net::TcpStream;

    async fn connect(address: SocketAddr, hello: WorkerMessage) -> TcpStream {
        let mut stream = TcpStream::connect(address).await.unwrap();
        write_message(&mut stream, &hello).await.unwrap();
        stream
    }

    fn ready() -> WorkerMessage {
        WorkerMessage::Hello {
            ready: true,
            reasons: vec![],
        }
    }

    fn geometry() -> ImageGeometry {
        ImageGeometry::new(100, 100).unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();
        let worker = tokio::spawn(connect(address, ready()));

        let channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        let _stream = worker.await.unwrap();
        assert_eq!(channel.generation(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_worker_is_unreachable() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();
        let worker = tokio::spawn(connect(
            address,
            WorkerMessage::Hello {
                ready: false,
                reasons: vec!["no shared memory".into()],
            },
        ));

        let err = listener.accept(Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, GuidingError::WorkerUnreachable(_)));
        drop(worker.await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_times_out_without_worker() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let err = listener.accept(Duration::from_millis(50)).await.err().unwrap();
        assert!(matches!(err, GuidingError::WorkerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_solve_discards_stale_responses() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();

        let worker = tokio::spawn(async move {
            let mut stream = connect(address, ready()).await;
            // First request: never answered in time
            let first = match read_message(&mut stream).await.unwrap() {
                WorkerMessage::SolveRequest(r) => r,
                other => panic!("unexpected {:?}", other),
            };
            let second = match read_message(&mut stream).await.unwrap() {
                WorkerMessage::SolveRequest(r) => r,
                other => panic!("unexpected {:?}", other),
            };
            for (id, ra) in [(first.id, 1.0), (second.id, 2.0)] {
                let response = SolveResponse {
                    id,
                    ra,
                    dec: 0.0,
                    success: true,
                    reasons: vec![],
                };
                write_message(&mut stream, &WorkerMessage::SolveResponse(response))
                    .await
                    .unwrap();
            }
            stream
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        let hint = SkyCoordinates::new(10.0, 20.0);

        let err = channel
            .solve(hint, geometry(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GuidingError::Protocol(ProtocolError::Timeout { .. })));

        let response = channel.solve(hint, geometry(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.id, 2);
        assert_eq!(response.ra, 2.0);
        drop(worker.await.unwrap());
    }

    #[tokio::test]
    async fn test_image_ack_and_rejection() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();

        let worker = tokio::spawn(async move {
            let mut stream = connect(address, ready()).await;
            for accept in [true, false] {
                let generation = match read_message(&mut stream).await.unwrap() {
                    WorkerMessage::ImageReady { generation, .. } => generation,
                    other => panic!("unexpected {:?}", other),
                };
                let ack = WorkerMessage::ImageAck {
                    generation,
                    ok: accept,
                    reasons: if accept { vec![] } else { vec!["geometry mismatch".into()] },
                };
                write_message(&mut stream, &ack).await.unwrap();
            }
            stream
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        assert_eq!(channel.announce_image(geometry(), Duration::from_secs(5)).await.unwrap(), 1);
        let err = channel
            .announce_image(geometry(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GuidingError::SolveFailure(_)));
        drop(worker.await.unwrap());
    }

    #[tokio::test]
    async fn test_late_ack_keeps_buffer_on_loan() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(async move {
            let mut stream = connect(address, ready()).await;
            let first = match read_message(&mut stream).await.unwrap() {
                WorkerMessage::ImageReady { generation, .. } => generation,
                other => panic!("unexpected {:?}", other),
            };
            // Still busy with the first frame when the coordinator gives up
            release_rx.await.unwrap();
            let ack = |generation| WorkerMessage::ImageAck {
                generation,
                ok: true,
                reasons: vec![],
            };
            write_message(&mut stream, &ack(first)).await.unwrap();

            let second = match read_message(&mut stream).await.unwrap() {
                WorkerMessage::ImageReady { generation, .. } => generation,
                other => panic!("unexpected {:?}", other),
            };
            write_message(&mut stream, &ack(second)).await.unwrap();
            match read_message(&mut stream).await.unwrap() {
                WorkerMessage::SolveRequest(request) => assert_eq!(request.generation, second),
                other => panic!("unexpected {:?}", other),
            }
            stream
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        let err = channel
            .announce_image(geometry(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GuidingError::Protocol(ProtocolError::Timeout { .. })));
        assert!(channel.buffer_on_loan());

        // Nothing new may be announced while the worker holds the buffer
        assert!(channel.announce_image(geometry(), Duration::from_secs(5)).await.is_err());
        let err = channel.reclaim_buffer(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, GuidingError::Protocol(ProtocolError::Timeout { .. })));
        assert!(channel.buffer_on_loan());

        release_tx.send(()).unwrap();
        channel.reclaim_buffer(Duration::from_secs(5)).await.unwrap();
        assert!(!channel.buffer_on_loan());

        assert_eq!(channel.announce_image(geometry(), Duration::from_secs(5)).await.unwrap(), 2);
        let _ = channel
            .solve(SkyCoordinates::new(1.0, 2.0), geometry(), Duration::from_millis(50))
            .await;
        drop(worker.await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_disconnect_is_closed() {
        let listener = WorkerListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr();
        let worker = tokio::spawn(async move {
            let stream = connect(address, ready()).await;
            drop(stream);
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        worker.await.unwrap();
        let err = channel
            .solve(SkyCoordinates::new(1.0, 2.0), geometry(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuidingError::Protocol(ProtocolError::Closed) | GuidingError::Protocol(ProtocolError::Io(_))
        ));
    }
}

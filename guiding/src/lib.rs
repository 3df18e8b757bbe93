//! MAST guiding core
//!
//! The closed guide loop for a MAST unit: the [`GuidingCoordinator`] exposes
//! the guide camera, hands each image to an external solving worker through a
//! [`SharedImageBuffer`] and the length-prefixed [`WorkerMessage`] protocol,
//! and turns the solved coordinates into a mount offset.
//!
//! The worker side of the protocol lives here as well ([`SolverClient`]), so
//! a simulated solving worker can be built from the same crate.

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod correction;
pub mod error;
pub mod protocol;
pub mod solver;
pub mod unit;
pub mod worker;

pub use buffer::{default_buffer_dir, SharedImageBuffer, DEFAULT_BUFFER_NAME};
pub use channel::{WorkerChannel, WorkerListener};
pub use config::{GuidingConfig, WorkerConfig};
pub use coordinator::{EndReason, GuidingCoordinator, GuidingState, GuidingStatus, SessionReport};
pub use correction::{compute_offset, RequestSkew, SkyCoordinates};
pub use error::{BufferError, GuidingError, GuidingResult, ProtocolError};
pub use protocol::{SolveRequest, SolveResponse, WorkerMessage, MAX_FRAME_LEN};
pub use solver::{EchoSolver, PlateSolver, SolverClient, SolverClientConfig};
pub use unit::{Unit, UnitActivity, UnitConfig, UnitOutcome, UnitStatus};
pub use worker::{ExternalWorker, ProcessWorker, WorkerEndpoint, WorkerLauncher};

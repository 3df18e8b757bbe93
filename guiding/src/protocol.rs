//! Coordinator ↔ worker wire messages
//!
//! The coordinator listens; the solving worker connects and introduces itself
//! with [`WorkerMessage::Hello`]. After that each guide cycle is one
//! `image_ready`/`image_ack` exchange followed by one
//! `solve_request`/`solve_response` exchange. The worker copies the frame
//! out of the shared buffer before it sends `image_ack`, so the ack is what
//! hands the buffer back to the coordinator.
//!
//! Messages are JSON objects tagged by `"type"`; see [`crate::codec`] for
//! framing.

use mast_device::ImageGeometry;
use serde::{Deserialize, Deserializer, Serialize};

/// Largest accepted frame body, in bytes
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Solve request sent by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    /// Correlates the response with this request
    pub id: u64,
    /// Image generation to solve; the worker refuses any other
    pub generation: u64,
    /// Hint right ascension, hours
    pub ra: f64,
    /// Hint declination, degrees
    pub dec: f64,
    pub width: u32,
    pub height: u32,
}

impl SolveRequest {
    pub fn geometry(&self) -> Option<ImageGeometry> {
        ImageGeometry::new(self.width, self.height).ok()
    }
}

/// Solve result returned by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResponse {
    pub id: u64,
    /// Solved right ascension, hours
    pub ra: f64,
    /// Solved declination, degrees
    pub dec: f64,
    pub success: bool,
    #[serde(default, deserialize_with = "one_or_many")]
    pub reasons: Vec<String>,
}

impl SolveResponse {
    pub fn failed(id: u64, reason: impl Into<String>) -> Self {
        Self {
            id,
            ra: 0.0,
            dec: 0.0,
            success: false,
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker → coordinator, first message after connecting
    Hello {
        ready: bool,
        #[serde(default, deserialize_with = "one_or_many")]
        reasons: Vec<String>,
    },
    /// Coordinator → worker: the shared buffer holds a new frame
    ImageReady {
        generation: u64,
        width: u32,
        height: u32,
    },
    /// Worker → coordinator: buffer attached and geometry validated
    ImageAck {
        generation: u64,
        ok: bool,
        #[serde(default, deserialize_with = "one_or_many")]
        reasons: Vec<String>,
    },
    SolveRequest(SolveRequest),
    SolveResponse(SolveResponse),
    /// Either side: the session is over
    Goodbye,
}

impl WorkerMessage {
    /// Wire name of the message type, for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "hello",
            WorkerMessage::ImageReady { .. } => "image_ready",
            WorkerMessage::ImageAck { .. } => "image_ack",
            WorkerMessage::SolveRequest(_) => "solve_request",
            WorkerMessage::SolveResponse(_) => "solve_response",
            WorkerMessage::Goodbye => "goodbye",
        }
    }
}

/// Accept `"reason"`, `["a", "b"]` or `null`
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

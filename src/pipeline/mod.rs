//! Capture-to-result pipeline
//!
//! The capture context persists a frame and hands its reference across a
//! context transition; the receiving context loads it, runs the engine
//! and presents the result. Both roles are played by `Orchestrator`.

pub mod orchestrator;
pub mod workers;

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::InferenceResult;
use crate::error::{PipelineError, PipelineResult};
use crate::signals::ProcessingScope;
use crate::storage::FrameReference;

pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use workers::{WorkerHandle, WorkerPool};

/// Data carried across a context transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPayload {
    /// The persisted frame to process
    #[serde(rename = "fileName")]
    pub frame: FrameReference,
}

impl HandoffPayload {
    /// Serialize for the transition boundary
    pub fn encode(&self) -> PipelineResult<String> {
        serde_json::to_string(self)
            .context("Failed to encode handoff payload")
            .map_err(PipelineError::Handoff)
    }

    /// Parse a payload received across the boundary
    pub fn decode(raw: &str) -> PipelineResult<Self> {
        serde_json::from_str(raw)
            .context("Failed to decode handoff payload")
            .map_err(PipelineError::Handoff)
    }
}

/// A context transition in flight.
///
/// Owns the processing scope of its capture, so the `ProcessingEnded`
/// signal fires even if the transition is dropped undelivered.
#[derive(Debug)]
pub struct Transition {
    /// Encoded `HandoffPayload`
    pub payload: String,
    pub(crate) scope: ProcessingScope,
}

/// Receives what the pipeline produced
pub trait Presenter: Send + Sync {
    /// A successful inference
    fn present_result(&self, result: InferenceResult);

    /// A short diagnostic for a failed request
    fn present_error(&self, message: String);
}

/// What a presenter was handed
#[derive(Debug, Clone)]
pub enum Presentation {
    Result(InferenceResult),
    Error(String),
}

/// Presenter forwarding everything to a channel read by the foreground
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: Sender<Presentation>,
}

impl ChannelPresenter {
    /// Create a presenter and the receiving end of its channel
    pub fn new() -> (Self, Receiver<Presentation>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn deliver(&self, presentation: Presentation) {
        if self.tx.send(presentation).is_err() {
            debug!("Presentation target is gone, dropping delivery");
        }
    }
}

impl Presenter for ChannelPresenter {
    fn present_result(&self, result: InferenceResult) {
        self.deliver(Presentation::Result(result));
    }

    fn present_error(&self, message: String) {
        self.deliver(Presentation::Error(message));
    }
}

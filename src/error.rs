//! Pipeline error taxonomy
//!
//! Every failure the handoff pipeline can surface to a caller or to the
//! presentation collaborator. Causes are kept as `anyhow::Error` so the
//! underlying io/image/runtime context chain survives.

use thiserror::Error;

use crate::storage::FrameReference;

/// Errors produced by the capture-to-inference pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The capture capability is not bound yet
    #[error("capture is not ready (camera not bound)")]
    CaptureNotReady,

    /// The capture source reported a failure instead of a frame
    #[error("capture failed: {0:#}")]
    Capture(anyhow::Error),

    /// The frame could not be written to or read from storage
    #[error("failed to persist frame: {0:#}")]
    PersistenceFailure(anyhow::Error),

    /// The frame reference no longer resolves to a stored entry
    #[error("frame not found: {0}")]
    NotFound(FrameReference),

    /// The inference engine could not be constructed
    #[error("failed to initialize inference engine: {0:#}")]
    EngineInit(anyhow::Error),

    /// Inference was requested before an engine was ensured
    #[error("inference engine is not ready")]
    EngineNotReady,

    /// The engine failed while running on a frame
    #[error("inference failed: {0:#}")]
    InferenceFailure(anyhow::Error),

    /// The context transition could not carry the payload
    #[error("context handoff failed: {0:#}")]
    Handoff(anyhow::Error),
}

impl PipelineError {
    /// Short diagnostic suitable for showing to a user
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::CaptureNotReady => "Camera is not ready yet".to_string(),
            PipelineError::Capture(_) => "Could not take a photo".to_string(),
            PipelineError::PersistenceFailure(_) => "Could not save the photo".to_string(),
            PipelineError::NotFound(_) => "The saved photo is no longer available".to_string(),
            PipelineError::EngineInit(e) => format!("Could not load the OCR model: {}", e),
            PipelineError::EngineNotReady => "The OCR model is not loaded".to_string(),
            PipelineError::InferenceFailure(e) => format!("Text recognition failed: {}", e),
            PipelineError::Handoff(_) => "Could not hand the photo over for processing".to_string(),
        }
    }
}

/// Result alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keeps_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("writing IMG_20240101_120000.jpg");
        let err = PipelineError::PersistenceFailure(cause);
        let text = err.to_string();
        assert!(text.contains("writing IMG_20240101_120000.jpg"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn test_user_message_is_never_empty() {
        let errors = [
            PipelineError::CaptureNotReady,
            PipelineError::EngineNotReady,
            PipelineError::NotFound(FrameReference::from("/tmp/missing.jpg")),
            PipelineError::InferenceFailure(anyhow::anyhow!("bad tensor")),
        ];
        for err in &errors {
            assert!(!err.user_message().is_empty());
        }
    }
}

//! Capture-to-result orchestration
//!
//! The capture side runs on the `io` worker: take a frame, open a
//! processing scope, persist, and hand a `Transition` to the receiving
//! context. The receiving side runs on the `inference` worker: decode the
//! payload, load the frame, ensure the engine and present the outcome.
//! Every scope opened here is closed exactly once, whichever path is taken.

use anyhow::anyhow;
use crossbeam_channel::Sender;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::workers::panic_message;
use super::{HandoffPayload, Presenter, Transition, WorkerHandle};
use crate::capture::{CaptureSource, Frame};
use crate::engine::{AccelerationMode, EngineManager, InferenceResult};
use crate::error::{PipelineError, PipelineResult};
use crate::signals::SignalBus;
use crate::storage::{FrameReference, FrameStore};

/// Collaborators shared by every orchestrator instance
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub capture: Arc<dyn CaptureSource>,
    pub store: Arc<FrameStore>,
    pub bus: SignalBus,
    pub engine: Arc<EngineManager>,
    pub presenter: Arc<dyn Presenter>,
    /// Capture and persistence run here
    pub io: WorkerHandle,
    /// Engine work runs here
    pub inference: WorkerHandle,
    /// Outgoing context transitions
    pub transitions: Sender<Transition>,
    /// Mode the receiving context asks the engine for
    pub acceleration: AccelerationMode,
}

/// Drives one request from capture to presented result
#[derive(Clone)]
pub struct Orchestrator {
    deps: Arc<OrchestratorDeps>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self { deps: Arc::new(deps) }
    }

    /// Bind the capture capability. Until this succeeds every trigger
    /// fails with `CaptureNotReady`.
    pub fn bind_capture(&self) -> PipelineResult<()> {
        self.deps.capture.bind().map_err(PipelineError::Capture)?;
        info!("Capture bound");
        Ok(())
    }

    /// Request one capture.
    ///
    /// Returns once the capture is queued; the outcome arrives through the
    /// presenter. Fails without emitting any signal when capture is unbound.
    pub fn trigger_capture(&self) -> PipelineResult<()> {
        if !self.deps.capture.is_bound() {
            warn!("Capture triggered before the camera was bound");
            return Err(PipelineError::CaptureNotReady);
        }

        let this = self.clone();
        self.deps
            .io
            .submit(move || this.capture_once())
            .map_err(PipelineError::Handoff)?;

        debug!("Capture queued");
        Ok(())
    }

    /// Runs on the io worker. A panic in the capture source or in the
    /// capture path still ends in a presented error.
    fn capture_once(&self) {
        let presented = Arc::new(AtomicBool::new(false));
        let handler = self.clone();
        let done = presented.clone();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.deps.capture.capture(Box::new(move |outcome| {
                let _ = handler.on_capture_outcome(outcome);
                done.store(true, Ordering::Release);
            }));
        }));

        // Any scope opened before the panic was ended while unwinding
        if let Err(panic) = outcome {
            if !presented.load(Ordering::Acquire) {
                let err = PipelineError::Capture(anyhow!("capture panicked: {}", panic_message(&*panic)));
                error!("{}", err);
                self.deps.presenter.present_error(err.user_message());
            }
        }
    }

    fn on_capture_outcome(&self, outcome: anyhow::Result<Frame>) -> PipelineResult<FrameReference> {
        match outcome {
            Ok(frame) => self.on_capture_complete(frame),
            Err(e) => {
                let err = PipelineError::Capture(e);
                error!("{}", err);
                self.deps.presenter.present_error(err.user_message());
                Err(err)
            }
        }
    }

    /// Handle a captured frame: signal start, persist it and hand its
    /// reference to the receiving context.
    ///
    /// On failure the end signal is published before the error is
    /// presented and returned.
    pub fn on_capture_complete(&self, frame: Frame) -> PipelineResult<FrameReference> {
        let scope = self.deps.bus.begin_processing();

        let handoff = self.deps.store.persist(frame).and_then(|reference| {
            let payload = HandoffPayload {
                frame: reference.clone(),
            }
            .encode()?;
            Ok((reference, payload))
        });

        let (reference, payload) = match handoff {
            Ok(handoff) => handoff,
            Err(e) => {
                scope.finish();
                error!("{}", e);
                self.deps.presenter.present_error(e.user_message());
                return Err(e);
            }
        };

        // An undelivered transition drops its scope, which ends it
        if self.deps.transitions.send(Transition { payload, scope }).is_err() {
            let err = PipelineError::Handoff(anyhow!("receiving context is gone"));
            error!("{}", err);
            self.deps.presenter.present_error(err.user_message());
            return Err(err);
        }

        info!("Handed off {}", reference);
        Ok(reference)
    }

    /// Receiving side of a transition: queue the frame for inference
    pub fn activate(&self, transition: Transition) -> PipelineResult<()> {
        let this = self.clone();
        // On failure the job, and the scope inside it, is dropped
        self.deps
            .inference
            .submit(move || this.process(transition))
            .map_err(|e| {
                let err = PipelineError::Handoff(e);
                error!("{}", err);
                self.deps.presenter.present_error(err.user_message());
                err
            })
    }

    fn process(&self, transition: Transition) {
        let Transition { payload, scope } = transition;

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(&payload))).unwrap_or_else(|panic| {
            Err(PipelineError::InferenceFailure(anyhow!(
                "engine panicked: {}",
                panic_message(&*panic)
            )))
        });

        match outcome {
            Ok(result) => {
                self.present_result(result);
                scope.finish();
            }
            Err(e) => {
                scope.finish();
                error!("{}", e);
                self.deps.presenter.present_error(e.user_message());
            }
        }
    }

    fn run(&self, payload: &str) -> PipelineResult<InferenceResult> {
        let HandoffPayload { frame: reference } = HandoffPayload::decode(payload)?;
        let frame = self.deps.store.load(&reference)?;

        self.deps.engine.ensure_engine(self.deps.acceleration)?;
        let result = self.deps.engine.run_inference(&frame)?;

        info!(
            "Recognized {} fragment(s) in {} ({} ms)",
            result.items_found.len(),
            reference,
            result.elapsed.as_millis()
        );
        Ok(result)
    }

    /// Hand a result to the presentation collaborator
    pub fn present_result(&self, result: InferenceResult) {
        self.deps.presenter.present_result(result);
    }
}

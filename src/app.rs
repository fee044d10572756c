//! Application Coordinator
//!
//! Wires the frame store, signal bus, engine manager and workers together
//! and runs the router thread that delivers context transitions to a
//! fresh receiving-side orchestrator.

use anyhow::{Context, Result};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use crate::capture::CaptureSource;
use crate::config::AppConfig;
use crate::engine::{EngineFactory, EngineManager, EngineState};
use crate::error::PipelineResult;
use crate::pipeline::{Orchestrator, OrchestratorDeps, Presenter, Transition, WorkerPool};
use crate::signals::{SignalBus, Subscription};
use crate::storage::{FrameReference, FrameStore};

/// Main application coordinator
pub struct HandoffApp {
    /// Capture-side orchestrator
    capture_context: Orchestrator,
    bus: SignalBus,
    store: Arc<FrameStore>,
    engine: Arc<EngineManager>,
    /// Stops the router thread
    shutdown: Sender<()>,
    router_handle: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
}

impl HandoffApp {
    /// Create the coordinator and start its threads
    pub fn new(
        config: &AppConfig,
        capture: Arc<dyn CaptureSource>,
        factory: Arc<dyn EngineFactory>,
        presenter: Arc<dyn Presenter>,
    ) -> Result<Self> {
        let store = Arc::new(FrameStore::new(config.storage.frame_store_config()?));
        let bus = SignalBus::new();
        let engine = Arc::new(EngineManager::new(factory));
        let workers = WorkerPool::new()?;
        let (transitions_tx, transitions_rx) = unbounded();
        let (shutdown, shutdown_rx) = unbounded();

        let deps = OrchestratorDeps {
            capture,
            store: store.clone(),
            bus: bus.clone(),
            engine: engine.clone(),
            presenter,
            io: workers.io.handle(),
            inference: workers.inference.handle(),
            transitions: transitions_tx,
            acceleration: config.engine.acceleration,
        };
        let capture_context = Orchestrator::new(deps.clone());

        let router_handle = std::thread::Builder::new()
            .name("handoff-router".to_string())
            .spawn(move || route_transitions(deps, transitions_rx, shutdown_rx))
            .context("Failed to spawn router thread")?;

        info!("Frames are stored in {:?}", store.dir());

        Ok(Self {
            capture_context,
            bus,
            store,
            engine,
            shutdown,
            router_handle: Some(router_handle),
            workers: Some(workers),
        })
    }

    /// Bind the capture source
    pub fn bind_capture(&self) -> PipelineResult<()> {
        self.capture_context.bind_capture()
    }

    /// Request one capture; the outcome arrives at the presenter
    pub fn trigger_capture(&self) -> PipelineResult<()> {
        self.capture_context.trigger_capture()
    }

    /// Listen to processing signals
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Persisted frames, newest first
    pub fn frames(&self) -> PipelineResult<Vec<FrameReference>> {
        self.store.list()
    }

    /// Current engine state
    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Check if the router is still running
    pub fn is_running(&self) -> bool {
        self.router_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HandoffApp {
    fn drop(&mut self) {
        // Signal the router to stop
        let _ = self.shutdown.send(());

        if let Some(handle) = self.router_handle.take() {
            let _ = handle.join();
        }

        // Queued captures and inferences finish before the engine is released
        drop(self.workers.take());
        self.engine.shutdown();
        debug!("Handoff app shut down");
    }
}

/// Deliver each transition to a new receiving-side orchestrator
fn route_transitions(deps: OrchestratorDeps, transitions: Receiver<Transition>, shutdown: Receiver<()>) {
    debug!("Router thread started");
    loop {
        select! {
            recv(transitions) -> msg => match msg {
                Ok(transition) => {
                    let result_context = Orchestrator::new(deps.clone());
                    if let Err(e) = result_context.activate(transition) {
                        error!("Failed to activate result context: {}", e);
                    }
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Router thread exiting");
}

//! Engine lifecycle manager
//!
//! Owns at most one live engine. `ensure_engine`, `run_inference` and
//! `shutdown` all run under the same exclusive lock, so a run never sees a
//! half-built or half-released engine and two rebuilds cannot leak a handle.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{AccelerationMode, EngineFactory, InferenceEngine, InferenceResult};
use crate::capture::Frame;
use crate::error::{PipelineError, PipelineResult};

/// Observable state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No engine is loaded
    Uninitialized,
    /// An engine built with this mode is loaded
    Ready(AccelerationMode),
}

struct EngineHandle {
    engine: Box<dyn InferenceEngine>,
    mode: AccelerationMode,
}

/// Owner of the single live inference engine
pub struct EngineManager {
    factory: Arc<dyn EngineFactory>,
    handle: Mutex<Option<EngineHandle>>,
}

impl EngineManager {
    /// Create a manager with no engine loaded
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            handle: Mutex::new(None),
        }
    }

    /// Make sure an engine built with `mode` is loaded.
    ///
    /// An engine with another mode is released before the new one is
    /// built. If building fails the manager is left without an engine.
    pub fn ensure_engine(&self, mode: AccelerationMode) -> PipelineResult<()> {
        let mut slot = self.handle.lock();

        if let Some(handle) = slot.as_ref() {
            if handle.mode == mode {
                debug!("Engine already loaded with {:?}", mode);
                return Ok(());
            }
        }

        if let Some(mut old) = slot.take() {
            info!("Releasing {:?} engine before switching to {:?}", old.mode, mode);
            old.engine.release();
        }

        let start = Instant::now();
        match self.factory.create(mode) {
            Ok(engine) => {
                *slot = Some(EngineHandle { engine, mode });
                info!("Engine loaded with {:?} in {:?}", mode, start.elapsed());
                Ok(())
            }
            Err(e) => {
                error!("Failed to create {:?} engine: {:#}", mode, e);
                Err(PipelineError::EngineInit(e))
            }
        }
    }

    /// Run the loaded engine on `frame`
    pub fn run_inference(&self, frame: &Frame) -> PipelineResult<InferenceResult> {
        let mut slot = self.handle.lock();
        let handle = slot.as_mut().ok_or(PipelineError::EngineNotReady)?;

        debug!("Running {:?} inference on {}x{} frame", handle.mode, frame.width, frame.height);
        handle
            .engine
            .infer(frame)
            .map_err(PipelineError::InferenceFailure)
    }

    /// Release the loaded engine, if any
    pub fn shutdown(&self) {
        let mut slot = self.handle.lock();
        if let Some(mut handle) = slot.take() {
            handle.engine.release();
            info!("Engine ({:?}) shut down", handle.mode);
        }
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        match self.handle.lock().as_ref() {
            Some(handle) => EngineState::Ready(handle.mode),
            None => EngineState::Uninitialized,
        }
    }

    /// Mode of the loaded engine
    pub fn active_mode(&self) -> Option<AccelerationMode> {
        self.handle.lock().as_ref().map(|handle| handle.mode)
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FrameStore, FrameStoreConfig};
    use crate::testing::{solid_frame, CountingFactory};
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager_with(factory: Arc<CountingFactory>) -> EngineManager {
        EngineManager::new(factory)
    }

    #[test]
    fn test_run_before_ensure_is_not_ready() {
        let manager = manager_with(Arc::new(CountingFactory::new()));
        let result = manager.run_inference(&solid_frame(8, 0));
        assert!(matches!(result, Err(PipelineError::EngineNotReady)));
        assert_eq!(manager.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_same_mode_keeps_engine() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(factory.clone());

        manager.ensure_engine(AccelerationMode::Reference).unwrap();
        manager.ensure_engine(AccelerationMode::Reference).unwrap();

        assert_eq!(factory.counters.created(), 1);
        assert_eq!(manager.state(), EngineState::Ready(AccelerationMode::Reference));
    }

    #[test]
    fn test_mode_change_releases_before_building() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(factory.clone());

        manager.ensure_engine(AccelerationMode::Reference).unwrap();
        manager.ensure_engine(AccelerationMode::Accelerated).unwrap();
        manager.ensure_engine(AccelerationMode::Reference).unwrap();

        assert_eq!(factory.counters.created(), 3);
        assert_eq!(factory.counters.released(), 2);
        assert_eq!(factory.counters.max_live(), 1);
        assert_eq!(manager.active_mode(), Some(AccelerationMode::Reference));
    }

    #[test]
    fn test_failed_build_leaves_no_engine() {
        let factory = Arc::new(CountingFactory::new());
        factory.fail_on(AccelerationMode::Accelerated);
        let manager = manager_with(factory.clone());

        manager.ensure_engine(AccelerationMode::Reference).unwrap();
        let result = manager.ensure_engine(AccelerationMode::Accelerated);

        assert!(matches!(result, Err(PipelineError::EngineInit(_))));
        assert_eq!(manager.state(), EngineState::Uninitialized);
        assert_eq!(factory.counters.live(), 0);
        assert!(matches!(
            manager.run_inference(&solid_frame(4, 0)),
            Err(PipelineError::EngineNotReady)
        ));
    }

    #[test]
    fn test_inference_failure_keeps_engine() {
        let factory = Arc::new(CountingFactory::new());
        factory.fail_inference();
        let manager = manager_with(factory.clone());

        manager.ensure_engine(AccelerationMode::Reference).unwrap();
        let result = manager.run_inference(&solid_frame(4, 0));

        assert!(matches!(result, Err(PipelineError::InferenceFailure(_))));
        assert_eq!(manager.state(), EngineState::Ready(AccelerationMode::Reference));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager_with(factory.clone());

        manager.shutdown();
        manager.ensure_engine(AccelerationMode::Reference).unwrap();
        manager.shutdown();
        manager.shutdown();

        assert_eq!(factory.counters.released(), 1);
        assert_eq!(manager.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_drop_releases_engine() {
        let factory = Arc::new(CountingFactory::new());
        {
            let manager = manager_with(factory.clone());
            manager.ensure_engine(AccelerationMode::Accelerated).unwrap();
        }
        assert_eq!(factory.counters.live(), 0);
    }

    #[test]
    fn test_persisted_frame_through_engine_then_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(FrameStoreConfig::in_dir(dir.path()));
        let reference = store.persist(solid_frame(100, 42)).unwrap();

        let manager = manager_with(Arc::new(CountingFactory::new()));
        manager.ensure_engine(AccelerationMode::Reference).unwrap();

        let frame = store.load(&reference).unwrap();
        let result = manager.run_inference(&frame).unwrap();
        assert_eq!(result.image.dimensions(), (100, 100));
        assert!(result.items_found.contains_key("100x100"));

        manager.shutdown();
        assert!(matches!(
            manager.run_inference(&frame),
            Err(PipelineError::EngineNotReady)
        ));
    }

    #[test]
    fn test_concurrent_ensure_never_doubles_engines() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(1)));
        let manager = Arc::new(manager_with(factory.clone()));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        let mode = if (i + round) % 2 == 0 {
                            AccelerationMode::Reference
                        } else {
                            AccelerationMode::Accelerated
                        };
                        if manager.ensure_engine(mode).is_ok() {
                            let _ = manager.run_inference(&solid_frame(4, 0));
                        }
                        if round % 7 == 0 {
                            manager.shutdown();
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(factory.counters.max_live(), 1);
        manager.shutdown();
        assert_eq!(factory.counters.live(), 0);
        assert_eq!(factory.counters.created(), factory.counters.released());
    }
}

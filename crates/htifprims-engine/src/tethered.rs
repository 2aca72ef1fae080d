//! Engine on its own thread, driven from a simulator's step loop.
//!
//! The simulator keeps the thread of control and talks to the target-facing
//! [`DriverPort`]; the session runs ordinary blocking code over the paired
//! [`EnginePort`]. Only one of the two is ever runnable.

use std::thread::JoinHandle;

use bytes::BytesMut;
use htifprims_transport::{handoff, ChunkGeometry, DriverPort, EnginePort};
use tracing::debug;

use crate::error::{HtifError, Result};
use crate::target::TargetModel;

/// A session thread plus the driver end of its link.
pub struct Tethered<R> {
    driver: DriverPort,
    engine: Option<JoinHandle<Result<R>>>,
}

impl<R: Send + 'static> Tethered<R> {
    /// Spawn `session` on a new thread with the engine end of a handoff link.
    ///
    /// The closure does not run until the driver first yields or asks for
    /// bytes.
    pub fn spawn<F>(geometry: ChunkGeometry, session: F) -> Result<Self>
    where
        F: FnOnce(EnginePort) -> Result<R> + Send + 'static,
    {
        let (engine_port, driver) = handoff(geometry);
        let engine = std::thread::Builder::new()
            .name("htif-engine".to_string())
            .spawn(move || {
                engine_port.wait_for_turn();
                session(engine_port)
            })?;
        Ok(Self {
            driver,
            engine: Some(engine),
        })
    }

    pub fn driver(&self) -> &DriverPort {
        &self.driver
    }

    /// True once the session closure has returned.
    pub fn is_finished(&self) -> bool {
        self.driver.engine_finished()
    }

    /// Wait for the session thread and return its result.
    pub fn join(mut self) -> Result<R> {
        let handle = self
            .engine
            .take()
            .ok_or_else(|| HtifError::EngineThread("already joined".to_string()))?;
        // Let the engine observe the closed driver if it is still waiting.
        drop(self.driver);
        match handle.join() {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "engine thread panicked".to_string());
                Err(HtifError::EngineThread(message))
            }
        }
    }
}

/// One simulator step for a [`TargetModel`] behind a driver port.
///
/// Takes whatever requests the engine has queued, answers them and returns
/// the number answered. With nothing queued the engine gets a turn instead.
pub fn step_model(driver: &DriverPort, model: &mut TargetModel, inbox: &mut BytesMut) -> Result<usize> {
    let pending = driver.pending();
    if pending == 0 {
        driver.yield_to_engine();
        return Ok(0);
    }
    let mut bytes = vec![0u8; pending];
    if !driver.recv_nonblocking(&mut bytes) {
        return Ok(0);
    }
    inbox.extend_from_slice(&bytes);
    let mut outbox = Vec::new();
    let handled = model.serve(inbox, &mut outbox)?;
    driver.send(&outbox);
    debug!(handled, bytes = outbox.len(), "model step");
    Ok(handled)
}

/// Drive `model` until the session thread finishes.
pub fn drive_model(driver: &DriverPort, model: &mut TargetModel) -> Result<u64> {
    let mut inbox = BytesMut::new();
    let mut steps = 0u64;
    while !driver.engine_finished() {
        step_model(driver, model, &mut inbox)?;
        steps += 1;
    }
    Ok(steps)
}

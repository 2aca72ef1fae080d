//! Strict ping-pong handoff between a stepping driver and a blocking engine.
//!
//! A cycle-level simulator owns the thread of control: once per target clock
//! it asks whether the host has bytes for it and hands back whatever the
//! target produced. The protocol engine, on the other hand, is written as
//! ordinary blocking code (`read_cr`, `read_chunk`, ...). The handoff lets
//! both coexist: the engine runs on its own thread, but exactly one side is
//! runnable at any instant and control only moves at the explicit switch
//! points below.
//!
//! - The driver side holds the turn first.
//! - [`DriverPort::recv_nonblocking`] with too few bytes queued passes the
//!   turn to the engine and returns `false` once the engine yields back.
//! - [`EnginePort`] reads with nothing queued pass the turn to the driver.
//! - Engine writes and driver sends only append to a FIFO; they never switch.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{ChunkGeometry, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Driver,
    Engine,
}

#[derive(Debug)]
struct State {
    turn: Side,
    /// Driver -> engine bytes (target-originated traffic).
    to_engine: BytesMut,
    /// Engine -> driver bytes (host-originated traffic).
    to_driver: BytesMut,
    engine_finished: bool,
    driver_closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the turn to `to` and sleep until it comes back to `me`.
    ///
    /// Returns early if the other side is gone for good.
    fn switch<'a>(&'a self, mut state: MutexGuard<'a, State>, me: Side) -> MutexGuard<'a, State> {
        let to = match me {
            Side::Driver => Side::Engine,
            Side::Engine => Side::Driver,
        };
        trace!(from = ?me, to = ?to, "handoff");
        state.turn = to;
        self.cond.notify_all();
        while state.turn != me && !peer_gone(&state, me) {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state
    }
}

fn peer_gone(state: &State, me: Side) -> bool {
    match me {
        Side::Driver => state.engine_finished,
        Side::Engine => state.driver_closed,
    }
}

/// Create a connected engine/driver pair sharing one pair of byte queues.
pub fn handoff(geometry: ChunkGeometry) -> (EnginePort, DriverPort) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            turn: Side::Driver,
            to_engine: BytesMut::new(),
            to_driver: BytesMut::new(),
            engine_finished: false,
            driver_closed: false,
        }),
        cond: Condvar::new(),
    });
    (
        EnginePort {
            shared: Arc::clone(&shared),
            geometry,
        },
        DriverPort { shared },
    )
}

/// Engine-facing end: a blocking [`Transport`] whose reads yield to the driver.
#[derive(Debug)]
pub struct EnginePort {
    shared: Arc<Shared>,
    geometry: ChunkGeometry,
}

impl EnginePort {
    /// Block until the driver first passes the turn (or goes away).
    ///
    /// The engine thread must call this before touching the link so it never
    /// runs concurrently with the driver.
    pub fn wait_for_turn(&self) {
        let mut state = self.shared.lock();
        while state.turn != Side::Engine && !state.driver_closed {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Read for EnginePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        loop {
            if !state.to_engine.is_empty() {
                let n = buf.len().min(state.to_engine.len());
                buf[..n].copy_from_slice(&state.to_engine[..n]);
                state.to_engine.advance(n);
                return Ok(n);
            }
            if state.driver_closed {
                return Ok(0);
            }
            state = self.shared.switch(state, Side::Engine);
        }
    }
}

impl Write for EnginePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.shared.lock();
        if state.driver_closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "driver side of handoff closed",
            ));
        }
        state.to_driver.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for EnginePort {
    fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }
}

impl Drop for EnginePort {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.engine_finished = true;
        state.turn = Side::Driver;
        self.shared.cond.notify_all();
    }
}

/// Driver-facing end, called from the simulator's step loop.
#[derive(Debug)]
pub struct DriverPort {
    shared: Arc<Shared>,
}

impl DriverPort {
    /// Queue bytes for the engine. Never switches.
    pub fn send(&self, bytes: &[u8]) {
        self.shared.lock().to_engine.extend_from_slice(bytes);
    }

    /// Take exactly `buf.len()` bytes if they are already queued.
    ///
    /// Otherwise the engine gets one turn to produce more, and this returns
    /// `false` when control comes back. Once the engine has finished no
    /// switch happens.
    pub fn recv_nonblocking(&self, buf: &mut [u8]) -> bool {
        let mut state = self.shared.lock();
        if state.to_driver.len() >= buf.len() {
            buf.copy_from_slice(&state.to_driver[..buf.len()]);
            state.to_driver.advance(buf.len());
            return true;
        }
        if !state.engine_finished {
            drop(self.shared.switch(state, Side::Driver));
        }
        false
    }

    /// Block (switching as often as needed) until `buf` is filled.
    pub fn recv(&self, buf: &mut [u8]) -> Result<()> {
        loop {
            if self.recv_nonblocking(buf) {
                return Ok(());
            }
            if self.engine_finished() {
                return Err(TransportError::Shutdown);
            }
        }
    }

    /// Give the engine one turn without asking for bytes.
    pub fn yield_to_engine(&self) {
        let state = self.shared.lock();
        if !state.engine_finished {
            drop(self.shared.switch(state, Side::Driver));
        }
    }

    /// Bytes the engine has queued that the driver has not taken yet.
    pub fn pending(&self) -> usize {
        self.shared.lock().to_driver.len()
    }

    /// True once the engine side has been dropped.
    pub fn engine_finished(&self) -> bool {
        self.shared.lock().engine_finished
    }
}

impl Drop for DriverPort {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.driver_closed = true;
        self.shared.cond.notify_all();
    }
}

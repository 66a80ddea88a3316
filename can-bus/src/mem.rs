//! An in-memory CAN bus segment.
//!
//! Every controller attached to a [`MemBus`] observes every frame sent by the
//! other controllers, subject to its own acceptance filters. This is the
//! hosted stand-in for a real controller: integration tests and the device
//! simulator run on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::filter::accepted_by;
use crate::{CanController, CanFrame, DriverConfig, DriverError, FrameFilter};

/// A process-local CAN bus that any number of controllers can attach to.
#[derive(Clone)]
pub struct MemBus {
	inner: Arc<Mutex<BusInner>>,
}

struct BusInner {
	next_id: usize,
	taps: Vec<(usize, Sender<CanFrame>)>,
}

impl MemBus {
	/// Create a new, empty bus.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(BusInner {
				next_id: 0,
				taps: Vec::new(),
			})),
		}
	}

	/// Attach a new controller to the bus.
	pub fn controller(&self) -> MemController {
		let (tx, rx) = std::sync::mpsc::channel();
		let mut inner = self.inner.lock().unwrap();
		let id = inner.next_id;
		inner.next_id += 1;
		inner.taps.push((id, tx));
		MemController {
			bus: self.clone(),
			id,
			rx,
			filters: Vec::new(),
			started: false,
			fault: Arc::new(Fault {
				bus_off: AtomicBool::new(false),
				restart_ok: AtomicBool::new(true),
			}),
		}
	}

	fn broadcast(&self, from: usize, frame: CanFrame) {
		let inner = self.inner.lock().unwrap();
		for (id, tap) in &inner.taps {
			if *id != from {
				let _ = tap.send(frame);
			}
		}
	}

	fn detach(&self, id: usize) {
		let mut inner = self.inner.lock().unwrap();
		inner.taps.retain(|(tap_id, _)| *tap_id != id);
	}
}

impl Default for MemBus {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for MemBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemBus").finish_non_exhaustive()
	}
}

struct Fault {
	bus_off: AtomicBool,
	restart_ok: AtomicBool,
}

/// Fault injection for tests: force bus-off, make recovery fail.
#[derive(Clone)]
pub struct FaultHandle {
	fault: Arc<Fault>,
}

impl FaultHandle {
	/// Put the controller in (or out of) the bus-off state.
	pub fn set_bus_off(&self, bus_off: bool) {
		self.fault.bus_off.store(bus_off, Ordering::SeqCst);
	}

	/// Control whether a restart attempt succeeds.
	pub fn set_restart_ok(&self, ok: bool) {
		self.fault.restart_ok.store(ok, Ordering::SeqCst);
	}
}

impl std::fmt::Debug for FaultHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FaultHandle").finish_non_exhaustive()
	}
}

/// A controller attached to a [`MemBus`].
pub struct MemController {
	bus: MemBus,
	id: usize,
	rx: Receiver<CanFrame>,
	filters: Vec<FrameFilter>,
	started: bool,
	fault: Arc<Fault>,
}

impl MemController {
	/// Get a fault-injection handle for this controller.
	pub fn fault_handle(&self) -> FaultHandle {
		FaultHandle {
			fault: self.fault.clone(),
		}
	}
}

impl CanController for MemController {
	fn start(&mut self, _config: &DriverConfig, filters: &[FrameFilter]) -> Result<(), DriverError> {
		self.filters = filters.to_vec();
		self.started = true;
		Ok(())
	}

	fn stop(&mut self) {
		self.started = false;
	}

	fn send(&mut self, frame: &CanFrame) -> Result<(), DriverError> {
		if !self.started {
			return Err(DriverError::DriverClosed);
		}
		if self.fault.bus_off.load(Ordering::SeqCst) {
			return Err(DriverError::BusOff);
		}
		self.bus.broadcast(self.id, *frame);
		Ok(())
	}

	fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, DriverError> {
		if !self.started {
			return Err(DriverError::DriverClosed);
		}
		if self.fault.bus_off.load(Ordering::SeqCst) {
			return Err(DriverError::BusOff);
		}
		let deadline = Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			match self.rx.recv_timeout(remaining) {
				Ok(frame) => {
					if accepted_by(&self.filters, frame.id()) {
						return Ok(Some(frame));
					}
					// Filtered out, keep waiting for the rest of the window.
				}
				Err(RecvTimeoutError::Timeout) => return Ok(None),
				Err(RecvTimeoutError::Disconnected) => return Ok(None),
			}
		}
	}

	fn restart(&mut self) -> Result<(), DriverError> {
		if self.fault.restart_ok.load(Ordering::SeqCst) {
			self.fault.bus_off.store(false, Ordering::SeqCst);
			Ok(())
		} else {
			Err(DriverError::BusOff)
		}
	}
}

impl Drop for MemController {
	fn drop(&mut self) {
		self.bus.detach(self.id);
	}
}

impl std::fmt::Debug for MemController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemController")
			.field("id", &self.id)
			.field("started", &self.started)
			.finish_non_exhaustive()
	}
}

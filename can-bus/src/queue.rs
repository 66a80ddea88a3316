use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::{CanFrame, DriverError};

/// Depth of the bounded transmit queue.
pub const TX_QUEUE_DEPTH: usize = 32;

/// Depth of each per-node SDO response slot.
pub const SDO_QUEUE_DEPTH: usize = 16;

/// Depth of the raw fan-out channel.
pub const RAW_QUEUE_DEPTH: usize = 64;

/// How long a producer may wait for transmit-queue capacity before `QueueFull`.
const TX_SEND_WAIT: Duration = Duration::from_millis(20);

/// First CAN ID of the SDO response block (`0x580 + node`).
const SDO_RESPONSE_BASE: u16 = 0x580;

/// Producer handle for the bounded transmit queue.
///
/// Frames enqueued by one producer are transmitted in enqueue order.
/// The single consumer is the driver pump thread.
#[derive(Clone, Debug)]
pub struct TxQueue {
	tx: mpsc::Sender<CanFrame>,
}

impl TxQueue {
	/// Enqueue a frame, waiting briefly for capacity.
	///
	/// Fails with [`DriverError::QueueFull`] when the queue stays saturated.
	pub async fn send(&self, frame: CanFrame) -> Result<(), DriverError> {
		match self.tx.send_timeout(frame, TX_SEND_WAIT).await {
			Ok(()) => Ok(()),
			Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(DriverError::QueueFull),
			Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DriverError::DriverClosed),
		}
	}

	/// Enqueue a frame without waiting.
	pub fn try_send(&self, frame: CanFrame) -> Result<(), DriverError> {
		match self.tx.try_send(frame) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => Err(DriverError::QueueFull),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(DriverError::DriverClosed),
		}
	}
}

/// Create the transmit queue pair.
pub(crate) fn tx_queue() -> (TxQueue, mpsc::Receiver<CanFrame>) {
	let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
	(TxQueue { tx }, rx)
}

/// Routes received frames to their consumers.
///
/// Frames in the SDO response block (`0x580..=0x5FF`) are delivered to the
/// slot registered for the addressed node; everything else fans out to the
/// raw subscribers. Frames for nodes without a registered slot are dropped.
#[derive(Clone)]
pub struct RxRouter {
	inner: Arc<RxRouterInner>,
}

struct RxRouterInner {
	slots: Mutex<HashMap<u8, mpsc::Sender<CanFrame>>>,
	raw: broadcast::Sender<CanFrame>,
}

impl RxRouter {
	/// Create a new router with no registered node slots.
	pub fn new() -> Self {
		let (raw, _) = broadcast::channel(RAW_QUEUE_DEPTH);
		Self {
			inner: Arc::new(RxRouterInner {
				slots: Mutex::new(HashMap::new()),
				raw,
			}),
		}
	}

	/// Register the SDO response slot for a node.
	///
	/// Replaces any previous registration; the old receiver stops getting
	/// frames.
	pub fn register_node(&self, node: u8) -> mpsc::Receiver<CanFrame> {
		let (tx, rx) = mpsc::channel(SDO_QUEUE_DEPTH);
		self.inner.slots.lock().unwrap().insert(node, tx);
		rx
	}

	/// Drop the SDO response slot for a node.
	pub fn release_node(&self, node: u8) {
		self.inner.slots.lock().unwrap().remove(&node);
	}

	/// Subscribe to the raw fan-out of all non-SDO frames.
	pub fn subscribe_raw(&self) -> broadcast::Receiver<CanFrame> {
		self.inner.raw.subscribe()
	}

	/// Classify and deliver one received frame.
	///
	/// Called from the pump thread; never blocks.
	pub fn route(&self, frame: CanFrame) {
		let id = frame.id().as_u16();
		if (SDO_RESPONSE_BASE..SDO_RESPONSE_BASE + 0x80).contains(&id) {
			let node = (id - SDO_RESPONSE_BASE) as u8;
			let slots = self.inner.slots.lock().unwrap();
			match slots.get(&node) {
				Some(slot) => {
					if slot.try_send(frame).is_err() {
						log::warn!("SDO response slot for node {node} is full, dropping {frame:?}");
					}
				}
				None => log::trace!("no SDO waiter for node {node}, dropping {frame:?}"),
			}
		} else {
			// Err means no current subscribers, which is fine.
			let _ = self.inner.raw.send(frame);
		}
	}
}

impl Default for RxRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for RxRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RxRouter").finish_non_exhaustive()
	}
}

//! Node discovery by identity probes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sdo::SdoClient;
use crate::{objects, CancelToken, NodeId};

/// Default per-node probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(20);

/// Pause between probes so other traffic gets bus time.
const INTER_NODE_YIELD: Duration = Duration::from_millis(2);

/// Parameters of one scan pass.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanRange {
	/// First node ID to probe.
	pub start: u8,

	/// Last node ID to probe (inclusive).
	pub end: u8,

	/// How long to wait for each node's identity response.
	pub probe_timeout: Duration,
}

impl ScanRange {
	/// A range with the default probe timeout.
	pub fn new(start: u8, end: u8) -> Self {
		Self {
			start,
			end,
			probe_timeout: DEFAULT_PROBE_TIMEOUT,
		}
	}
}

/// Events emitted while scanning.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScanEvent {
	/// A scan started (`active`) or terminated, naturally or forced.
	Status {
		/// Whether a scan is running.
		active: bool,
	},

	/// A node answered the identity probe.
	Discovered {
		/// The responding node.
		node: NodeId,
		/// The serial number it reported.
		serial: u32,
	},
}

struct ScanTask {
	cancel: CancelToken,
	handle: JoinHandle<()>,
}

/// The node scanner.
///
/// At most one scan runs at a time; starting a new one replaces the running
/// scan. Stopping is cooperative: the current probe finishes first, and the
/// task never leaves dangling in-flight SDO state behind.
#[derive(Clone)]
pub struct Scanner {
	client: SdoClient,
	current: Arc<Mutex<Option<ScanTask>>>,
}

impl Scanner {
	/// Create a scanner over the transactor.
	pub fn new(client: SdoClient) -> Self {
		Self {
			client,
			current: Arc::new(Mutex::new(None)),
		}
	}

	/// Start a scan, replacing any running one.
	///
	/// Events go out on `events`; the final event of every scan is
	/// `Status { active: false }`.
	pub fn start(&self, range: ScanRange, events: mpsc::Sender<ScanEvent>) {
		let mut current = self.current.lock().unwrap();
		let previous = current.take();
		if let Some(previous) = &previous {
			previous.cancel.cancel();
		}

		let cancel = CancelToken::new();
		let token = cancel.clone();
		let client = self.client.clone();
		let handle = tokio::spawn(async move {
			// Let a replaced scan finish its current probe first.
			if let Some(previous) = previous {
				let _ = previous.handle.await;
			}
			run_scan(client, range, events, token).await;
		});
		*current = Some(ScanTask { cancel, handle });
	}

	/// Request the running scan to stop after its current probe.
	pub fn stop(&self) {
		if let Some(task) = self.current.lock().unwrap().take() {
			task.cancel.cancel();
		}
	}
}

impl std::fmt::Debug for Scanner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scanner").finish_non_exhaustive()
	}
}

async fn run_scan(
	client: SdoClient,
	range: ScanRange,
	events: mpsc::Sender<ScanEvent>,
	cancel: CancelToken,
) {
	log::info!("scanning nodes {} to {}", range.start, range.end);
	let _ = events.send(ScanEvent::Status { active: true }).await;

	for id in range.start..=range.end {
		if cancel.is_cancelled() {
			break;
		}
		let Ok(node) = NodeId::new(id) else {
			break;
		};
		match client.read_expedited(node, objects::SERIAL_NUMBER, range.probe_timeout).await {
			Ok(serial) => {
				log::info!("discovered node {node} with serial 0x{serial:08X}");
				let _ = events.send(ScanEvent::Discovered { node, serial }).await;
			}
			// Timeouts and aborts are skipped silently.
			Err(e) => log::trace!("node {id} did not answer the identity probe: {e}"),
		}
		tokio::time::sleep(INTER_NODE_YIELD).await;
	}

	log::info!("scan finished");
	let _ = events.send(ScanEvent::Status { active: false }).await;
}

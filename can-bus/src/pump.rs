use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::{CanDriver, CanFrame, DriverConfig, DriverError, RxRouter, TxQueue};

/// How long the pump blocks on the controller waiting for RX.
///
/// Keeps the loop comfortably above the 100 Hz scheduler tick floor.
const RX_POLL: Duration = Duration::from_millis(1);

/// Idle sleep while the driver is closed or bus-off is persistent.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Work driven by the pump thread on every loop iteration.
///
/// The periodic scheduler implements this; frames it emits go on the wire
/// ahead of the queued TX backlog of that iteration.
pub trait TickSource: Send {
	/// Called once per pump iteration with the current time.
	fn poll(&mut self, now: Instant, out: &mut Vec<CanFrame>);
}

/// A tick source that never emits anything.
impl TickSource for () {
	fn poll(&mut self, _now: Instant, _out: &mut Vec<CanFrame>) {}
}

/// Health of the bus as seen by the pump.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusStatus {
	/// The controller is running (or closed on purpose).
	Running,

	/// The controller is bus-off and one automatic restart failed.
	///
	/// Persists until the driver is reconfigured.
	BusOff,
}

/// Reconfiguration requests executed on the pump thread.
///
/// The driver is owned by the pump, so mode switches are serialized with the
/// queue I/O instead of racing it.
#[derive(Debug)]
enum DriverCommand {
	OpenForScan,
	OpenForNode(u8),
	Configure(DriverConfig),
	Close,
	Shutdown,
}

/// Handle for requesting driver reconfiguration from other contexts.
#[derive(Clone, Debug)]
pub struct DriverControl {
	commands: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverControl {
	/// Switch the driver to accept-all filtering for a scan.
	pub fn open_for_scan(&self) {
		let _ = self.commands.send(DriverCommand::OpenForScan);
	}

	/// Switch the driver filters to a single node's traffic.
	pub fn open_for_node(&self, node: u8) {
		let _ = self.commands.send(DriverCommand::OpenForNode(node));
	}

	/// Apply a new driver configuration. Clears a persistent bus-off status.
	pub fn configure(&self, config: DriverConfig) {
		let _ = self.commands.send(DriverCommand::Configure(config));
	}

	/// Close the driver.
	pub fn close(&self) {
		let _ = self.commands.send(DriverCommand::Close);
	}
}

/// Running pump thread.
#[derive(Debug)]
pub struct PumpHandle {
	thread: Option<std::thread::JoinHandle<()>>,
	commands: mpsc::UnboundedSender<DriverCommand>,
}

impl PumpHandle {
	/// Stop the pump thread and wait for it to exit.
	pub fn shutdown(mut self) {
		let _ = self.commands.send(DriverCommand::Shutdown);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for PumpHandle {
	fn drop(&mut self) {
		let _ = self.commands.send(DriverCommand::Shutdown);
	}
}

/// Spawn the driver pump on a dedicated thread.
///
/// The pump owns the driver: it drains the TX queue, classifies RX through
/// the router and drives the tick source. Returns the TX producer handle,
/// the reconfiguration handle, the bus status watch and the thread handle.
pub fn spawn_pump(
	driver: CanDriver,
	router: RxRouter,
	tick: Box<dyn TickSource>,
) -> (TxQueue, DriverControl, watch::Receiver<BusStatus>, PumpHandle) {
	let (tx_queue, tx_rx) = crate::queue::tx_queue();
	let (commands_tx, commands_rx) = mpsc::unbounded_channel();
	let (status_tx, status_rx) = watch::channel(BusStatus::Running);

	let thread = std::thread::Builder::new()
		.name("can-pump".into())
		.spawn(move || pump_loop(driver, router, tick, tx_rx, commands_rx, status_tx))
		.expect("failed to spawn CAN pump thread");

	let control = DriverControl {
		commands: commands_tx.clone(),
	};
	let handle = PumpHandle {
		thread: Some(thread),
		commands: commands_tx,
	};
	(tx_queue, control, status_rx, handle)
}

fn pump_loop(
	mut driver: CanDriver,
	router: RxRouter,
	mut tick: Box<dyn TickSource>,
	mut tx_rx: mpsc::Receiver<CanFrame>,
	mut commands: mpsc::UnboundedReceiver<DriverCommand>,
	status: watch::Sender<BusStatus>,
) {
	let mut scratch = Vec::new();
	loop {
		// Reconfiguration first: it may clear a persistent bus-off.
		loop {
			match commands.try_recv() {
				Ok(DriverCommand::Shutdown) => {
					driver.close();
					return;
				}
				Ok(command) => {
					let result = match command {
						DriverCommand::OpenForScan => driver.open_for_scan(),
						DriverCommand::OpenForNode(node) => driver.open_for_node(node),
						DriverCommand::Configure(config) => driver.configure(config),
						DriverCommand::Close => {
							driver.close();
							Ok(())
						}
						DriverCommand::Shutdown => unreachable!(),
					};
					match result {
						Ok(()) => {
							let _ = status.send(BusStatus::Running);
						}
						Err(e) => log::error!("driver reconfiguration failed: {e}"),
					}
				}
				Err(mpsc::error::TryRecvError::Empty) => break,
				Err(mpsc::error::TryRecvError::Disconnected) => {
					driver.close();
					return;
				}
			}
		}

		if *status.borrow() == BusStatus::BusOff {
			std::thread::sleep(IDLE_SLEEP);
			continue;
		}

		// While closed, leave queued TX in place for the next open.
		if driver.mode().is_none() {
			std::thread::sleep(IDLE_SLEEP);
			continue;
		}

		let now = Instant::now();
		tick.poll(now, &mut scratch);
		let mut bus_off = false;
		for frame in scratch.drain(..) {
			bus_off |= send_frame(&mut driver, &frame);
		}
		while !bus_off {
			match tx_rx.try_recv() {
				Ok(frame) => bus_off |= send_frame(&mut driver, &frame),
				Err(mpsc::error::TryRecvError::Empty) => break,
				Err(mpsc::error::TryRecvError::Disconnected) => break,
			}
		}

		if !bus_off {
			match driver.recv(RX_POLL) {
				Ok(Some(frame)) => {
					log::trace!("RX {frame:?}");
					router.route(frame);
				}
				Ok(None) => {}
				Err(DriverError::BusOff) => bus_off = true,
				Err(_) => std::thread::sleep(IDLE_SLEEP),
			}
		}

		if bus_off {
			// One automatic restart; failure promotes to a persistent status.
			match driver.restart() {
				Ok(()) => log::warn!("CAN controller recovered from bus-off"),
				Err(e) => {
					log::error!("CAN bus-off restart failed: {e}");
					let _ = status.send(BusStatus::BusOff);
				}
			}
		}
	}
}

/// Send one frame; returns true when the controller reported bus-off.
fn send_frame(driver: &mut CanDriver, frame: &CanFrame) -> bool {
	log::trace!("TX {frame:?}");
	match driver.send(frame) {
		Ok(()) => false,
		Err(DriverError::BusOff) => true,
		Err(e) => {
			log::warn!("dropping TX frame {frame:?}: {e}");
			false
		}
	}
}

use std::sync::Arc;

use can_bus::{
	spawn_pump,
	BitRate,
	BusStatus,
	CanController,
	CanDriver,
	DriverConfig,
	DriverControl,
	PumpHandle,
	RxRouter,
	TxQueue,
};
use tokio::sync::watch;

use crate::broker::Broker;
use crate::firmware::FirmwareUpdater;
use crate::scanner::Scanner;
use crate::scheduler::Scheduler;
use crate::sdo::SdoClient;
use crate::store::{self, Store};

/// The gateway core.
///
/// One value, constructed once at startup, owning the driver pump and every
/// protocol component. Components receive clonable handles; nothing lives in
/// a process global.
pub struct Core {
	broker: Broker,
	client: SdoClient,
	scheduler: Scheduler,
	control: DriverControl,
	tx: TxQueue,
	router: RxRouter,
	bus_status: watch::Receiver<BusStatus>,
	pump: Option<PumpHandle>,
}

impl Core {
	/// Build and start the gateway over a CAN controller and a config store.
	///
	/// Spawns the pump thread and the broker's background tasks, re-arms
	/// persisted periodic jobs and opens the driver in scan mode. Must be
	/// called inside a tokio runtime.
	pub fn new(controller: Box<dyn CanController>, config: DriverConfig, store: Arc<dyn Store>) -> Self {
		let router = RxRouter::new();
		let scheduler = Scheduler::new();
		let driver = CanDriver::new(controller, config);
		let (tx, control, bus_status, pump) =
			spawn_pump(driver, router.clone(), Box::new(scheduler.clone()));
		control.open_for_scan();

		let client = SdoClient::new(tx.clone(), router.clone());
		let scanner = Scanner::new(client.clone());
		let updater = FirmwareUpdater::new(client.clone(), scheduler.clone());
		let broker = Broker::new(
			client.clone(),
			scheduler.clone(),
			scanner,
			updater,
			tx.clone(),
			control.clone(),
			bus_status.clone(),
			store,
		);
		broker.rearm_persisted_jobs();

		Self {
			broker,
			client,
			scheduler,
			control,
			tx,
			router,
			bus_status,
			pump: Some(pump),
		}
	}

	/// The session broker.
	pub fn broker(&self) -> &Broker {
		&self.broker
	}

	/// The SDO transactor.
	pub fn sdo(&self) -> &SdoClient {
		&self.client
	}

	/// The periodic scheduler.
	pub fn scheduler(&self) -> &Scheduler {
		&self.scheduler
	}

	/// The driver reconfiguration handle.
	pub fn driver_control(&self) -> &DriverControl {
		&self.control
	}

	/// The transmit queue.
	pub fn tx_queue(&self) -> &TxQueue {
		&self.tx
	}

	/// The RX router, for raw frame subscriptions.
	pub fn router(&self) -> &RxRouter {
		&self.router
	}

	/// Watch the bus health reported by the pump.
	pub fn bus_status(&self) -> watch::Receiver<BusStatus> {
		self.bus_status.clone()
	}

	/// Stop all periodic jobs and shut the pump down.
	pub fn shutdown(mut self) {
		self.scheduler.stop_all(None);
		if let Some(pump) = self.pump.take() {
			pump.shutdown();
		}
	}
}

impl std::fmt::Debug for Core {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Core")
			.field("scheduler", &self.scheduler)
			.finish_non_exhaustive()
	}
}

/// Build the driver configuration from the config store, with the stock
/// ESP32 pin assignment as the fallback.
pub fn driver_config_from_store(store: &dyn Store) -> DriverConfig {
	let pin = |key: &str| {
		store
			.get(key)
			.and_then(|value| value.as_u64())
			.map(|value| value as u8)
	};
	let bit_rate = store
		.get(store::keys::CAN_BAUD)
		.and_then(|value| value.as_u64())
		.and_then(|value| BitRate::from_bit_per_sec(value as u32))
		.unwrap_or(BitRate::K500);
	DriverConfig {
		bit_rate,
		tx_pin: pin(store::keys::CAN_TX_PIN).unwrap_or(5),
		rx_pin: pin(store::keys::CAN_RX_PIN).unwrap_or(4),
		enable_pin: pin(store::keys::CAN_ENABLE_PIN),
	}
}

//! Client sessions, action dispatch and event publication.
//!
//! The broker is the single entry point for the client surface: it maps
//! inbound tagged actions onto the transactor, scheduler, scanner and
//! firmware engine, correlates every reply with a broker-generated request
//! ID, and fans asynchronous events out to all registered sessions.

mod action;
mod event;

pub use action::Action;
pub use event::{Event, SpotValue};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use can_bus::{BusStatus, CanData, CanFrame, CanId, DriverControl, TxQueue};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::control::ControlState;
use crate::firmware::{FirmwareUpdater, OtaEvent, DEFAULT_PAGE_SIZE};
use crate::scanner::{ScanEvent, ScanRange, Scanner};
use crate::scheduler::{JobKind, Scheduler};
use crate::sdo::{SdoError, SdoClient, EXPEDITED_TIMEOUT, SEGMENT_TIMEOUT};
use crate::store::{self, SavedDevice, Store};
use crate::{objects, CancelToken, NodeId};

/// Lower clamp bound of the spot-value interval.
const SPOT_MIN_MS: u64 = 100;

/// Upper clamp bound of the spot-value interval.
const SPOT_MAX_MS: u64 = 10_000;

/// Events queued per session before the broker starts dropping.
const SESSION_QUEUE: usize = 64;

/// Job key of the control-frame emitter.
const CANIO_JOB: &str = "canio";

/// Identifier of a registered client session.
pub type SessionId = u64;

/// A raw periodic job persisted in the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedJob {
	can_id: u16,
	data: Vec<u8>,
	interval: u64,
}

#[derive(Clone)]
struct Connection {
	node: NodeId,
	serial: Option<String>,
}

struct SpotTask {
	cancel: CancelToken,
}

struct OtaTask {
	cancel: CancelToken,
	handle: JoinHandle<()>,
}

struct BrokerInner {
	client: SdoClient,
	scheduler: Scheduler,
	scanner: Scanner,
	updater: FirmwareUpdater,
	tx: TxQueue,
	control: DriverControl,
	bus_status: watch::Receiver<BusStatus>,
	store: Arc<dyn Store>,
	sessions: Mutex<HashMap<SessionId, mpsc::Sender<Event>>>,
	next_session: AtomicU64,
	next_request: AtomicU32,
	connection: Mutex<Option<Connection>>,
	canio_state: Mutex<Option<Arc<Mutex<ControlState>>>>,
	spot: Mutex<Option<SpotTask>>,
	ota: Mutex<Option<OtaTask>>,
	scan_events: mpsc::Sender<ScanEvent>,
}

/// The session broker.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Broker {
	inner: Arc<BrokerInner>,
}

impl Broker {
	/// Wire up a broker over the protocol components.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		client: SdoClient,
		scheduler: Scheduler,
		scanner: Scanner,
		updater: FirmwareUpdater,
		tx: TxQueue,
		control: DriverControl,
		bus_status: watch::Receiver<BusStatus>,
		store: Arc<dyn Store>,
	) -> Self {
		let (scan_events, scan_rx) = mpsc::channel(16);
		let broker = Self {
			inner: Arc::new(BrokerInner {
				client,
				scheduler,
				scanner,
				updater,
				tx,
				control,
				bus_status,
				store,
				sessions: Mutex::new(HashMap::new()),
				next_session: AtomicU64::new(0),
				next_request: AtomicU32::new(0),
				connection: Mutex::new(None),
				canio_state: Mutex::new(None),
				spot: Mutex::new(None),
				ota: Mutex::new(None),
				scan_events,
			}),
		};
		tokio::spawn(forward_scan_events(broker.clone(), scan_rx));
		broker
	}

	/// Register a new client session.
	///
	/// Events for the session arrive on the returned receiver. A session
	/// that stops draining its queue loses events.
	pub fn register_session(&self) -> (SessionId, mpsc::Receiver<Event>) {
		let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(SESSION_QUEUE);
		self.inner.sessions.lock().unwrap().insert(id, tx);
		log::debug!("registered session {id}");
		(id, rx)
	}

	/// Remove a client session.
	pub fn drop_session(&self, session: SessionId) {
		self.inner.sessions.lock().unwrap().remove(&session);
		log::debug!("dropped session {session}");
	}

	/// Parse and dispatch one inbound JSON action.
	pub async fn dispatch_json(&self, session: SessionId, text: &str) {
		match serde_json::from_str::<Action>(text) {
			Ok(action) => {
				self.dispatch(session, action).await;
			}
			Err(e) => {
				let request_id = self.next_request_id();
				log::warn!("rejecting unrecognised action: {e}");
				self.reply(session, Event::ActionError {
					request_id,
					error: format!("unrecognised action: {e}"),
				});
			}
		}
	}

	/// Dispatch one action, returning the request ID assigned to it.
	pub async fn dispatch(&self, session: SessionId, action: Action) -> u32 {
		let request_id = self.next_request_id();
		log::debug!("dispatching {action:?} as request {request_id}");
		match action {
			Action::StartScan { start, end } => self.start_scan(start, end),
			Action::StopScan => self.inner.scanner.stop(),
			Action::Connect { serial, node_id } => self.connect(session, request_id, serial, node_id),
			Action::Disconnect => self.disconnect(session, request_id),
			Action::GetNodeId => self.get_node_id(session, request_id).await,
			Action::SetNodeId { id } => self.set_node_id(session, request_id, id).await,
			Action::UpdateParam { param_id, value } => {
				self.update_param(session, request_id, param_id, value).await
			}
			Action::ReadParam { param_id } => self.read_param(session, request_id, param_id).await,
			Action::SaveToFlash => self.save_to_flash(session, request_id).await,
			Action::LoadFromFlash => {
				self.command(session, request_id, "loadFromFlash", objects::command::LOAD, false).await
			}
			Action::LoadDefaults => {
				self.command(session, request_id, "loadDefaults", objects::command::DEFAULTS, false).await
			}
			Action::ResetDevice => {
				self.command(session, request_id, "resetDevice", objects::command::RESET, true).await
			}
			Action::ListErrors => self.list_errors(session, request_id).await,
			Action::StartSpotValues { param_ids, interval_ms } => {
				self.start_spot_values(session, request_id, param_ids, interval_ms)
			}
			Action::StopSpotValues => self.stop_spot_values(),
			Action::StartCanIoInterval {
				can_id,
				pot,
				pot2,
				canio,
				cruisespeed,
				regenpreset,
				interval,
				use_crc,
			} => self.start_canio(
				session,
				request_id,
				can_id,
				ControlState {
					pot,
					pot2,
					flags: canio,
					counter: 0,
					cruise_speed: cruisespeed,
					regen_preset: regenpreset,
					use_crc,
				},
				interval,
			),
			Action::StopCanIoInterval => self.stop_canio(session, request_id),
			Action::UpdateCanIoFlags { pot, pot2, canio, cruisespeed, regenpreset } => {
				self.update_canio(session, request_id, pot, pot2, canio, cruisespeed, regenpreset)
			}
			Action::SendCanMessage { can_id, data } => {
				self.send_can_message(session, request_id, can_id, data).await
			}
			Action::StartCanInterval { interval_id, can_id, data, interval } => {
				self.start_can_interval(session, request_id, interval_id, can_id, data, interval)
			}
			Action::StopCanInterval { interval_id } => {
				self.stop_can_interval(session, request_id, interval_id)
			}
			Action::SetDeviceName { serial, name, node_id } => {
				self.set_device_name(session, request_id, serial, name, node_id)
			}
			Action::RenameDevice { serial, name } => {
				self.rename_device(session, request_id, serial, name)
			}
			Action::DeleteDevice { serial } => self.delete_device(session, request_id, serial),
		}
		request_id
	}

	/// Start a firmware update of the connected node (or an explicit one).
	///
	/// The image arrives out of band (an HTTP upload in the full system).
	/// Progress is published as `otaProgress`/`otaSuccess`/`otaError` events.
	pub fn start_firmware_update(&self, node: Option<NodeId>, image: Vec<u8>) -> Result<(), String> {
		if let Some(error) = self.bus_fault() {
			return Err(error);
		}
		let node = match node.or_else(|| self.connected().map(|c| c.node)) {
			Some(node) => node,
			None => return Err("not connected".into()),
		};
		let mut ota = self.inner.ota.lock().unwrap();
		if ota.as_ref().is_some_and(|task| !task.handle.is_finished()) {
			return Err("a firmware update is already running".into());
		}

		let cancel = CancelToken::new();
		let (events_tx, mut events_rx) = mpsc::channel(16);
		let forwarder = self.clone();
		tokio::spawn(async move {
			while let Some(event) = events_rx.recv().await {
				forwarder.broadcast(match event {
					OtaEvent::Progress { percent } => Event::OtaProgress { percent },
					OtaEvent::Success => Event::OtaSuccess,
					OtaEvent::Error { reason } => Event::OtaError { reason },
				});
			}
		});

		let updater = self.inner.updater.clone();
		let token = cancel.clone();
		let handle = tokio::spawn(async move {
			let _ = updater.run(node, &image, DEFAULT_PAGE_SIZE, &events_tx, &token).await;
		});
		*ota = Some(OtaTask { cancel, handle });
		Ok(())
	}

	/// Cancel a running firmware update.
	pub fn cancel_firmware_update(&self) {
		if let Some(task) = &*self.inner.ota.lock().unwrap() {
			task.cancel.cancel();
		}
	}

	/// Re-arm raw periodic jobs persisted in the store.
	pub fn rearm_persisted_jobs(&self) {
		for key in self.inner.store.keys_with_prefix("periodic.") {
			let Some(job_id) = key.strip_prefix("periodic.").map(str::to_owned) else {
				continue;
			};
			let Some(job) = self
				.inner
				.store
				.get(&key)
				.and_then(|value| serde_json::from_value::<PersistedJob>(value).ok())
			else {
				log::warn!("dropping malformed persisted job {key:?}");
				continue;
			};
			match self.schedule_raw(&job_id, job.can_id, &job.data, job.interval) {
				Ok(()) => log::info!("re-armed persisted periodic job {job_id:?}"),
				Err(e) => log::warn!("failed to re-arm persisted job {job_id:?}: {e}"),
			}
		}
	}

	fn next_request_id(&self) -> u32 {
		self.inner.next_request.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
	}

	fn connected(&self) -> Option<Connection> {
		self.inner.connection.lock().unwrap().clone()
	}

	/// The persistent bus-off status, as an error message.
	fn bus_fault(&self) -> Option<String> {
		(*self.inner.bus_status.borrow() == BusStatus::BusOff)
			.then(|| "CAN controller is bus-off, reconfigure the driver".to_string())
	}

	/// Deliver an event to one session.
	fn reply(&self, session: SessionId, event: Event) {
		let sessions = self.inner.sessions.lock().unwrap();
		if let Some(sender) = sessions.get(&session) {
			if sender.try_send(event).is_err() {
				log::warn!("session {session} is not draining its event queue");
			}
		}
	}

	/// Deliver an event to every session.
	fn broadcast(&self, event: Event) {
		let sessions = self.inner.sessions.lock().unwrap();
		for (id, sender) in sessions.iter() {
			if sender.try_send(event.clone()).is_err() {
				log::warn!("session {id} is not draining its event queue");
			}
		}
	}

	/// The target node for an SDO-backed action.
	///
	/// The error is the failure message the caller wraps in its own
	/// action-specific `*Error` event.
	fn sdo_target(&self) -> Result<NodeId, String> {
		if let Some(error) = self.bus_fault() {
			return Err(error);
		}
		self.connected()
			.map(|connection| connection.node)
			.ok_or_else(|| "not connected".to_string())
	}

	/// Refresh the catalog entry of the connected device.
	fn touch_connected_device(&self) {
		let Some(connection) = self.connected() else { return };
		let Some(serial) = connection.serial else { return };
		let mut device = store::load_device(self.inner.store.as_ref(), &serial)
			.unwrap_or(SavedDevice {
				serial: serial.clone(),
				name: None,
				node_id: None,
				last_seen: None,
			});
		device.node_id = Some(connection.node.as_u8());
		device.last_seen = Some(unix_millis());
		if let Err(e) = store::save_device(self.inner.store.as_ref(), &device) {
			log::warn!("failed to update device catalog: {e}");
		}
	}

	fn start_scan(&self, start: Option<u8>, end: Option<u8>) {
		let (default_start, default_end) = store::scan_range(self.inner.store.as_ref());
		let range = ScanRange::new(start.unwrap_or(default_start), end.unwrap_or(default_end));
		self.inner.scanner.start(range, self.inner.scan_events.clone());
	}

	fn connect(&self, session: SessionId, request_id: u32, serial: Option<String>, node_id: u8) {
		let node = match NodeId::new(node_id) {
			Ok(node) => node,
			Err(e) => {
				self.reply(session, Event::ActionError { request_id, error: e.to_string() });
				return;
			}
		};
		self.inner.control.open_for_node(node.as_u8());
		*self.inner.connection.lock().unwrap() = Some(Connection {
			node,
			serial: serial.clone(),
		});
		self.touch_connected_device();
		log::info!("session {session} connected to node {node}");
		self.reply(session, Event::Connected { request_id, node_id, serial });
	}

	fn disconnect(&self, session: SessionId, request_id: u32) {
		self.stop_spot_values();
		*self.inner.connection.lock().unwrap() = None;
		// Back to wide filters so a follow-up scan hears everyone.
		self.inner.control.open_for_scan();
		self.reply(session, Event::Disconnected { request_id });
	}

	async fn get_node_id(&self, session: SessionId, request_id: u32) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ActionError { request_id, error });
				return;
			}
		};
		match self.inner.client.read_expedited(node, objects::NODE_ID, EXPEDITED_TIMEOUT).await {
			Ok(value) => {
				self.touch_connected_device();
				self.reply(session, Event::NodeIdInfo { request_id, node_id: value });
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	async fn set_node_id(&self, session: SessionId, request_id: u32, id: u8) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ActionError { request_id, error });
				return;
			}
		};
		if NodeId::new(id).is_err() {
			self.reply(session, Event::ActionError {
				request_id,
				error: format!("invalid node ID: {id}"),
			});
			return;
		}
		match self.inner.client
			.write_expedited(node, objects::NODE_ID, id.into(), 1, EXPEDITED_TIMEOUT)
			.await
		{
			Ok(()) => self.reply(session, Event::NodeIdSet { request_id, node_id: id }),
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	async fn update_param(&self, session: SessionId, request_id: u32, param_id: u8, value: u32) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ParamUpdateError { request_id, param_id, error });
				return;
			}
		};
		match self.inner.client
			.write_expedited(node, objects::param(param_id), value, 4, EXPEDITED_TIMEOUT)
			.await
		{
			Ok(()) => {
				self.touch_connected_device();
				self.reply(session, Event::ParamUpdateSuccess { request_id, param_id });
			}
			Err(e) => self.reply(session, Event::ParamUpdateError {
				request_id,
				param_id,
				error: e.to_string(),
			}),
		}
	}

	async fn read_param(&self, session: SessionId, request_id: u32, param_id: u8) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ParamReadError { request_id, param_id, error });
				return;
			}
		};
		match self.inner.client
			.read_expedited(node, objects::param(param_id), EXPEDITED_TIMEOUT)
			.await
		{
			Ok(value) => {
				self.touch_connected_device();
				self.reply(session, Event::ParamValue { request_id, param_id, value });
			}
			Err(e) => self.reply(session, Event::ParamReadError {
				request_id,
				param_id,
				error: e.to_string(),
			}),
		}
	}

	async fn save_to_flash(&self, session: SessionId, request_id: u32) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::SaveToFlashError { request_id, error });
				return;
			}
		};
		match self.inner.client
			.write_expedited(node, objects::command::SAVE, objects::command::MAGIC, 4, SEGMENT_TIMEOUT)
			.await
		{
			Ok(()) => self.reply(session, Event::SaveToFlashSuccess { request_id }),
			Err(e) => self.reply(session, Event::SaveToFlashError {
				request_id,
				error: e.to_string(),
			}),
		}
	}

	async fn command(
		&self,
		session: SessionId,
		request_id: u32,
		name: &str,
		object: crate::ObjectIndex,
		timeout_is_success: bool,
	) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::CommandError {
					request_id,
					command: name.into(),
					error,
				});
				return;
			}
		};
		let result = self.inner.client
			.write_expedited(node, object, objects::command::MAGIC, 4, SEGMENT_TIMEOUT)
			.await;
		match result {
			Ok(()) => self.reply(session, Event::CommandSuccess {
				request_id,
				command: name.into(),
			}),
			// A device that reboots on the command never acks the write.
			Err(SdoError::Timeout) if timeout_is_success => {
				self.reply(session, Event::CommandSuccess {
					request_id,
					command: name.into(),
				})
			}
			Err(e) => self.reply(session, Event::CommandError {
				request_id,
				command: name.into(),
				error: e.to_string(),
			}),
		}
	}

	async fn list_errors(&self, session: SessionId, request_id: u32) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ListErrorsError { request_id, error });
				return;
			}
		};
		match self.inner.client.read_segmented(node, objects::ERROR_LOG, SEGMENT_TIMEOUT).await {
			Ok(bytes) => {
				let errors = String::from_utf8_lossy(&bytes)
					.lines()
					.filter(|line| !line.is_empty())
					.map(str::to_owned)
					.collect();
				self.reply(session, Event::ListErrorsSuccess { request_id, errors });
			}
			Err(e) => self.reply(session, Event::ListErrorsError {
				request_id,
				error: e.to_string(),
			}),
		}
	}

	fn start_spot_values(
		&self,
		session: SessionId,
		request_id: u32,
		param_ids: Vec<u8>,
		interval_ms: u64,
	) {
		let node = match self.sdo_target() {
			Ok(node) => node,
			Err(error) => {
				self.reply(session, Event::ActionError { request_id, error });
				return;
			}
		};
		let interval = Duration::from_millis(interval_ms.clamp(SPOT_MIN_MS, SPOT_MAX_MS));

		let mut spot = self.inner.spot.lock().unwrap();
		if let Some(task) = spot.take() {
			task.cancel.cancel();
		}
		let cancel = CancelToken::new();
		tokio::spawn(spot_loop(self.clone(), node, param_ids, interval, cancel.clone()));
		*spot = Some(SpotTask { cancel });
	}

	fn stop_spot_values(&self) {
		if let Some(task) = self.inner.spot.lock().unwrap().take() {
			task.cancel.cancel();
		}
	}

	fn start_canio(
		&self,
		session: SessionId,
		request_id: u32,
		can_id: Option<u16>,
		state: ControlState,
		interval: u64,
	) {
		let can_id = match CanId::new(can_id.unwrap_or(objects::DEFAULT_CONTROL_ID)) {
			Ok(id) => id,
			Err(e) => {
				self.reply(session, Event::ActionError { request_id, error: e.to_string() });
				return;
			}
		};
		let state = Arc::new(Mutex::new(state));
		match self.inner.scheduler.start(CANIO_JOB, can_id, JobKind::Control(state.clone()), interval) {
			Ok(()) => {
				*self.inner.canio_state.lock().unwrap() = Some(state);
				self.broadcast(Event::CanIoIntervalStatus { active: true });
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn stop_canio(&self, session: SessionId, request_id: u32) {
		match self.inner.scheduler.stop(CANIO_JOB) {
			Ok(()) => {
				*self.inner.canio_state.lock().unwrap() = None;
				self.broadcast(Event::CanIoIntervalStatus { active: false });
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn update_canio(
		&self,
		session: SessionId,
		request_id: u32,
		pot: Option<u16>,
		pot2: Option<u16>,
		canio: Option<u8>,
		cruisespeed: Option<u16>,
		regenpreset: Option<u8>,
	) {
		let canio_state = self.inner.canio_state.lock().unwrap();
		let Some(state) = canio_state.as_ref() else {
			self.reply(session, Event::ActionError {
				request_id,
				error: "control frame interval is not running".into(),
			});
			return;
		};
		let mut state = state.lock().unwrap();
		if let Some(pot) = pot {
			state.pot = pot;
		}
		if let Some(pot2) = pot2 {
			state.pot2 = pot2;
		}
		if let Some(flags) = canio {
			state.flags = flags;
		}
		if let Some(cruise_speed) = cruisespeed {
			state.cruise_speed = cruise_speed;
		}
		if let Some(regen_preset) = regenpreset {
			state.regen_preset = regen_preset;
		}
		drop(state);
		// Takes effect on the next tick.
		self.reply(session, Event::CanIoIntervalStatus { active: true });
	}

	async fn send_can_message(&self, session: SessionId, request_id: u32, can_id: u16, data: Vec<u8>) {
		if let Some(error) = self.bus_fault() {
			self.reply(session, Event::ActionError { request_id, error });
			return;
		}
		let frame = match CanId::new(can_id)
			.map_err(|e| e.to_string())
			.and_then(|id| CanFrame::new(id, &data).map_err(|e| e.to_string()))
		{
			Ok(frame) => frame,
			Err(error) => {
				self.reply(session, Event::ActionError {
					request_id,
					error: format!("invalid frame: {error}"),
				});
				return;
			}
		};
		match self.inner.tx.send(frame).await {
			Ok(()) => self.reply(session, Event::CanMessageSent { request_id }),
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn schedule_raw(&self, interval_id: &str, can_id: u16, data: &[u8], interval: u64) -> Result<(), String> {
		let id = CanId::new(can_id).map_err(|e| e.to_string())?;
		let data = CanData::new(data).map_err(|e| e.to_string())?;
		self.inner
			.scheduler
			.start(&raw_job_id(interval_id), id, JobKind::Raw(data), interval)
			.map_err(|e| e.to_string())
	}

	fn start_can_interval(
		&self,
		session: SessionId,
		request_id: u32,
		interval_id: String,
		can_id: u16,
		data: Vec<u8>,
		interval: u64,
	) {
		match self.schedule_raw(&interval_id, can_id, &data, interval) {
			Ok(()) => {
				let job = PersistedJob { can_id, data, interval };
				if let Err(e) = serde_json::to_value(&job)
					.map_err(store::StoreError::from)
					.and_then(|value| self.inner.store.set(&store::keys::periodic(&interval_id), value))
				{
					log::warn!("failed to persist periodic job {interval_id:?}: {e}");
				}
				self.broadcast(Event::CanIntervalStatus { interval_id, active: true });
			}
			Err(error) => self.reply(session, Event::ActionError { request_id, error }),
		}
	}

	fn stop_can_interval(&self, session: SessionId, request_id: u32, interval_id: String) {
		match self.inner.scheduler.stop(&raw_job_id(&interval_id)) {
			Ok(()) => {
				if let Err(e) = self.inner.store.remove(&store::keys::periodic(&interval_id)) {
					log::warn!("failed to drop persisted job {interval_id:?}: {e}");
				}
				self.broadcast(Event::CanIntervalStatus { interval_id, active: false });
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn set_device_name(
		&self,
		session: SessionId,
		request_id: u32,
		serial: String,
		name: String,
		node_id: Option<u8>,
	) {
		let mut device = store::load_device(self.inner.store.as_ref(), &serial).unwrap_or(SavedDevice {
			serial: serial.clone(),
			name: None,
			node_id: None,
			last_seen: None,
		});
		device.name = Some(name.clone());
		if node_id.is_some() {
			device.node_id = node_id;
		}
		match store::save_device(self.inner.store.as_ref(), &device) {
			Ok(()) => {
				self.reply(session, Event::DeviceNameSet { request_id, serial, name });
				self.broadcast_catalog();
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn rename_device(&self, session: SessionId, request_id: u32, serial: String, name: String) {
		let Some(mut device) = store::load_device(self.inner.store.as_ref(), &serial) else {
			self.reply(session, Event::ActionError {
				request_id,
				error: format!("unknown device {serial:?}"),
			});
			return;
		};
		device.name = Some(name.clone());
		match store::save_device(self.inner.store.as_ref(), &device) {
			Ok(()) => {
				self.reply(session, Event::DeviceRenamed { request_id, serial, name });
				self.broadcast_catalog();
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn delete_device(&self, session: SessionId, request_id: u32, serial: String) {
		match store::delete_device(self.inner.store.as_ref(), &serial) {
			Ok(()) => {
				self.reply(session, Event::DeviceDeleted { request_id, serial });
				self.broadcast_catalog();
			}
			Err(e) => self.reply(session, Event::ActionError { request_id, error: e.to_string() }),
		}
	}

	fn broadcast_catalog(&self) {
		let devices = store::saved_devices(self.inner.store.as_ref());
		self.broadcast(Event::SavedDevices { devices });
	}
}

impl std::fmt::Debug for Broker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Broker")
			.field("sessions", &self.inner.sessions.lock().unwrap().len())
			.finish_non_exhaustive()
	}
}

fn raw_job_id(interval_id: &str) -> String {
	format!("raw:{interval_id}")
}

fn unix_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis() as u64)
		.unwrap_or(0)
}

/// Forward scanner events to all sessions, updating the device catalog.
async fn forward_scan_events(broker: Broker, mut events: mpsc::Receiver<ScanEvent>) {
	while let Some(event) = events.recv().await {
		match event {
			ScanEvent::Status { active } => broker.broadcast(Event::ScanStatus { active }),
			ScanEvent::Discovered { node, serial } => {
				let serial = format!("{serial:08X}");
				let last_seen = unix_millis();
				let store = broker.inner.store.as_ref();
				let mut device = store::load_device(store, &serial).unwrap_or(SavedDevice {
					serial: serial.clone(),
					name: None,
					node_id: None,
					last_seen: None,
				});
				device.node_id = Some(node.as_u8());
				device.last_seen = Some(last_seen);
				if let Err(e) = store::save_device(store, &device) {
					log::warn!("failed to record discovered device: {e}");
				}
				broker.broadcast(Event::DeviceDiscovered {
					node_id: node.as_u8(),
					serial,
					last_seen,
				});
			}
		}
	}
}

/// One spot-value streaming task.
async fn spot_loop(
	broker: Broker,
	node: NodeId,
	param_ids: Vec<u8>,
	period: Duration,
	cancel: CancelToken,
) {
	broker.broadcast(Event::SpotValuesStatus { active: true });
	let mut ticker = tokio::time::interval(period);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}
		let mut values = Vec::with_capacity(param_ids.len());
		for &param_id in &param_ids {
			if cancel.is_cancelled() {
				break;
			}
			let value = broker
				.inner
				.client
				.read_expedited(node, objects::param(param_id), EXPEDITED_TIMEOUT)
				.await
				.ok();
			values.push(SpotValue { param_id, value });
		}
		if cancel.is_cancelled() {
			break;
		}
		broker.broadcast(Event::SpotValues {
			timestamp: unix_millis(),
			values,
		});
	}
	broker.broadcast(Event::SpotValuesStatus { active: false });
}

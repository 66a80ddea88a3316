//! A scripted OpenInverter node for integration tests.
//!
//! Runs on its own thread with an accept-all controller on the shared
//! in-memory bus and answers SDO traffic from a small object dictionary:
//! identity, parameters, a segmented error log and the firmware update
//! objects. Behaviors (response delay, forced page-CRC failures) are
//! configurable per node.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use can_bus::mem::MemBus;
use can_bus::{CanController, CanFrame, DriverConfig, FrameFilter};
use openinverter_gateway::control::crc32_words;
use openinverter_gateway::store::MemoryStore;
use openinverter_gateway::Core;

/// A running gateway on a fresh in-memory bus.
pub fn rig() -> (MemBus, Core, Arc<MemoryStore>) {
	let bus = MemBus::new();
	let controller = bus.controller();
	let store = Arc::new(MemoryStore::new());
	let core = Core::new(Box::new(controller), DriverConfig::new(5, 4), store.clone());
	(bus, core, store)
}

/// Attach a monitor hearing every frame on the bus.
pub fn monitor(bus: &MemBus) -> can_bus::mem::MemController {
	let mut controller = bus.controller();
	controller
		.start(&DriverConfig::new(5, 4), &[FrameFilter::ACCEPT_ALL])
		.unwrap();
	controller
}

/// Collect frames with a given CAN ID from a monitor for a while.
pub async fn collect_frames(
	mut monitor: can_bus::mem::MemController,
	id: u16,
	window: Duration,
) -> Vec<CanFrame> {
	tokio::task::spawn_blocking(move || {
		let deadline = std::time::Instant::now() + window;
		let mut frames = Vec::new();
		while std::time::Instant::now() < deadline {
			if let Ok(Some(frame)) = monitor.recv(Duration::from_millis(10)) {
				if frame.id().as_u16() == id {
					frames.push(frame);
				}
			}
		}
		frames
	})
	.await
	.unwrap()
}

/// Objects of the simulated device.
const OBJ_SERIAL: (u16, u8) = (0x5000, 0);
const OBJ_NODE_ID: (u16, u8) = (0x5000, 1);
const OBJ_ERROR_LOG: (u16, u8) = (0x5001, 0);
const PARAM_INDEX: u16 = 0x2100;
const COMMAND_INDEX: u16 = 0x5002;
const OBJ_FW_ENTRY: (u16, u8) = (0x5070, 0);
const OBJ_FW_CRC: (u16, u8) = (0x5070, 1);
const FW_DATA_ID: u16 = 0x7DD;
const FW_UPDATE_MAGIC: u32 = 0xDEAD_BEEF;
const FW_CHALLENGE_MAGIC: u32 = 0x33CC_33CC;

const ABORT_OBJECT_MISSING: u32 = 0x0602_0000;
const ABORT_CRC: u32 = 0x0504_0004;

/// Configuration of one simulated node.
pub struct SimNode {
	pub node: u8,
	pub serial: u32,
	/// Sleep before answering any SDO request.
	pub delay: Duration,
	pub params: HashMap<u8, u32>,
	pub error_log: &'static str,
	/// Forced `PageCrcMismatch` answers: page index -> times to reject.
	pub fail_crc: HashMap<usize, u32>,
}

impl SimNode {
	pub fn new(node: u8, serial: u32) -> Self {
		Self {
			node,
			serial,
			delay: Duration::ZERO,
			params: HashMap::new(),
			error_log: "",
			fail_crc: HashMap::new(),
		}
	}
}

/// Handle of a running simulated node.
pub struct SimHandle {
	stop: Arc<AtomicBool>,
	thread: Option<std::thread::JoinHandle<()>>,
	/// Pages the node accepted, in order.
	pub flash: Arc<Mutex<Vec<u8>>>,
	/// Live parameter storage of the node.
	pub params: Arc<Mutex<HashMap<u8, u32>>>,
}

impl SimHandle {
	pub fn stop(mut self) {
		self.stop.store(true, Ordering::SeqCst);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for SimHandle {
	fn drop(&mut self) {
		self.stop.store(true, Ordering::SeqCst);
	}
}

struct UploadState {
	data: Vec<u8>,
	offset: usize,
	toggle: bool,
}

pub fn spawn_node(bus: &MemBus, config: SimNode) -> SimHandle {
	let mut controller = bus.controller();
	controller
		.start(&DriverConfig::new(5, 4), &[FrameFilter::ACCEPT_ALL])
		.unwrap();

	let stop = Arc::new(AtomicBool::new(false));
	let flash = Arc::new(Mutex::new(Vec::new()));
	let params = Arc::new(Mutex::new(config.params.clone()));

	let thread = {
		let stop = stop.clone();
		let flash = flash.clone();
		let params = params.clone();
		std::thread::spawn(move || {
			run_node(controller, config, stop, flash, params);
		})
	};

	SimHandle {
		stop,
		thread: Some(thread),
		flash,
		params,
	}
}

fn run_node(
	mut controller: can_bus::mem::MemController,
	config: SimNode,
	stop: Arc<AtomicBool>,
	flash: Arc<Mutex<Vec<u8>>>,
	params: Arc<Mutex<HashMap<u8, u32>>>,
) {
	let request_id = 0x600 | u16::from(config.node);
	let response_id = 0x580 | u16::from(config.node);
	let mut node_id_object = u32::from(config.node);
	let mut upload: Option<UploadState> = None;
	let mut fail_crc = config.fail_crc.clone();
	let mut in_update = false;
	let mut page_buf: Vec<u8> = Vec::new();
	let mut page_index = 0usize;

	while !stop.load(Ordering::SeqCst) {
		let frame = match controller.recv(Duration::from_millis(5)) {
			Ok(Some(frame)) => frame,
			Ok(None) => continue,
			Err(_) => continue,
		};
		let id = frame.id().as_u16();

		if id == FW_DATA_ID && in_update {
			page_buf.extend_from_slice(frame.data());
			continue;
		}
		if id != request_id || frame.data().len() != 8 {
			continue;
		}
		let data: [u8; 8] = frame.data().try_into().unwrap();
		let index = u16::from_le_bytes([data[1], data[2]]);
		let subindex = data[3];
		let object = (index, subindex);

		let response: Option<[u8; 8]> = match data[0] >> 5 {
			// Upload initiate.
			2 => {
				if object == OBJ_SERIAL {
					Some(expedited(index, subindex, config.serial, 4))
				} else if object == OBJ_NODE_ID {
					Some(expedited(index, subindex, node_id_object, 1))
				} else if object == OBJ_ERROR_LOG && !config.error_log.is_empty() {
					let bytes = config.error_log.as_bytes().to_vec();
					let len = bytes.len() as u32;
					upload = Some(UploadState { data: bytes, offset: 0, toggle: false });
					Some(segmented_initiate(index, subindex, len))
				} else if object == OBJ_FW_ENTRY && in_update {
					Some(expedited(index, subindex, FW_CHALLENGE_MAGIC, 4))
				} else if index == PARAM_INDEX {
					match params.lock().unwrap().get(&subindex) {
						Some(&value) => Some(expedited(index, subindex, value, 4)),
						None => Some(abort(index, subindex, ABORT_OBJECT_MISSING)),
					}
				} else {
					Some(abort(index, subindex, ABORT_OBJECT_MISSING))
				}
			}
			// Download initiate (expedited).
			1 => {
				let n = if data[0] & 0x01 != 0 { (data[0] >> 2 & 0x03) as usize } else { 0 };
				let len = 4 - n;
				let mut bytes = [0u8; 4];
				bytes[..len].copy_from_slice(&data[4..4 + len]);
				let value = u32::from_le_bytes(bytes);

				if index == PARAM_INDEX {
					params.lock().unwrap().insert(subindex, value);
					Some(download_ack(index, subindex))
				} else if object == OBJ_NODE_ID {
					node_id_object = value;
					Some(download_ack(index, subindex))
				} else if index == COMMAND_INDEX {
					Some(download_ack(index, subindex))
				} else if object == OBJ_FW_ENTRY {
					if value == FW_UPDATE_MAGIC {
						in_update = true;
						page_buf.clear();
						page_index = 0;
					}
					Some(download_ack(index, subindex))
				} else if object == OBJ_FW_CRC && in_update {
					let times = fail_crc.get_mut(&page_index);
					if let Some(times) = times.filter(|times| **times > 0) {
						*times -= 1;
						page_buf.clear();
						Some(abort(index, subindex, ABORT_CRC))
					} else if page_crc(&page_buf) == value {
						flash.lock().unwrap().extend_from_slice(&page_buf);
						page_buf.clear();
						page_index += 1;
						Some(download_ack(index, subindex))
					} else {
						page_buf.clear();
						Some(abort(index, subindex, ABORT_CRC))
					}
				} else {
					Some(abort(index, subindex, ABORT_OBJECT_MISSING))
				}
			}
			// Segment upload request.
			3 => match upload.take() {
				Some(mut state) => {
					let remaining = &state.data[state.offset..];
					let take = remaining.len().min(7);
					let complete = state.offset + take >= state.data.len();
					let mut payload = [0u8; 8];
					payload[0] = u8::from(state.toggle) << 4 | ((7 - take) as u8) << 1 | u8::from(complete);
					payload[1..1 + take].copy_from_slice(&remaining[..take]);
					state.offset += take;
					state.toggle = !state.toggle;
					if !complete {
						upload = Some(state);
					}
					Some(payload)
				}
				None => Some(abort(index, subindex, ABORT_OBJECT_MISSING)),
			},
			// Abort from the client: drop any transfer state.
			4 => {
				upload = None;
				None
			}
			_ => None,
		};

		if let Some(payload) = response {
			if !config.delay.is_zero() {
				std::thread::sleep(config.delay);
			}
			let frame = CanFrame::new(can_bus::CanId::new(response_id).unwrap(), &payload).unwrap();
			let _ = controller.send(&frame);
		}
	}
}

fn expedited(index: u16, subindex: u8, value: u32, len: usize) -> [u8; 8] {
	let n = (4 - len) as u8;
	let index = index.to_le_bytes();
	let value = value.to_le_bytes();
	let mut payload = [0u8; 8];
	payload[0] = 0x43 | n << 2;
	payload[1] = index[0];
	payload[2] = index[1];
	payload[3] = subindex;
	payload[4..4 + len].copy_from_slice(&value[..len]);
	payload
}

fn segmented_initiate(index: u16, subindex: u8, len: u32) -> [u8; 8] {
	let index = index.to_le_bytes();
	let len = len.to_le_bytes();
	[0x41, index[0], index[1], subindex, len[0], len[1], len[2], len[3]]
}

fn download_ack(index: u16, subindex: u8) -> [u8; 8] {
	let index = index.to_le_bytes();
	[0x60, index[0], index[1], subindex, 0, 0, 0, 0]
}

fn abort(index: u16, subindex: u8, code: u32) -> [u8; 8] {
	let index = index.to_le_bytes();
	let code = code.to_le_bytes();
	[0x80, index[0], index[1], subindex, code[0], code[1], code[2], code[3]]
}

fn page_crc(page: &[u8]) -> u32 {
	let words: Vec<u32> = page
		.chunks_exact(4)
		.map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
		.collect();
	crc32_words(&words)
}

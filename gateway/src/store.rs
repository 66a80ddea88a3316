//! The durable key/value configuration store.
//!
//! Holds the WiFi credentials, CAN pin/baud configuration, scanner range,
//! the device catalog and persisted periodic jobs. Writes are atomic per key
//! and serialized behind a single writer.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of keys a store accepts.
pub const MAX_KEYS: usize = 512;

/// The recognised configuration keys.
pub mod keys {
	/// WiFi network name.
	pub const WIFI_SSID: &str = "wifi.ssid";

	/// WiFi passphrase.
	pub const WIFI_PSK: &str = "wifi.psk";

	/// CAN bit rate in bits per second.
	pub const CAN_BAUD: &str = "can.baud";

	/// CAN RX pin.
	pub const CAN_RX_PIN: &str = "can.rxPin";

	/// CAN TX pin.
	pub const CAN_TX_PIN: &str = "can.txPin";

	/// Transceiver enable pin.
	pub const CAN_ENABLE_PIN: &str = "can.enablePin";

	/// First node ID of the default scan range.
	pub const SCAN_START: &str = "scan.start";

	/// Last node ID of the default scan range.
	pub const SCAN_END: &str = "scan.end";

	/// Key of a device catalog entry.
	pub fn device(serial: &str) -> String {
		format!("devices.{serial}")
	}

	/// Key of a persisted periodic job.
	pub fn periodic(job_id: &str) -> String {
		format!("periodic.{job_id}")
	}
}

/// Error writing to the store.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub enum StoreError {
	/// The store reached its key capacity.
	#[error("configuration store is full")]
	Full,

	/// Persisting the store failed.
	#[error("failed to persist configuration store: {0}")]
	Io(#[from] std::io::Error),

	/// Encoding the store failed.
	#[error("failed to encode configuration store: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Durable key/value store with atomic single-key writes.
///
/// No multi-key transactions; every mutation is visible (and persisted)
/// before the call returns.
pub trait Store: Send + Sync {
	/// Read a key.
	fn get(&self, key: &str) -> Option<Value>;

	/// Write a key.
	fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

	/// Remove a key. Removing an absent key is not an error.
	fn remove(&self, key: &str) -> Result<(), StoreError>;

	/// All keys starting with `prefix`, in lexical order.
	fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

/// A volatile store for tests and diskless operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
	map: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
	/// Create an empty store.
	pub fn new() -> Self {
		Self::default()
	}
}

impl Store for MemoryStore {
	fn get(&self, key: &str) -> Option<Value> {
		self.map.lock().unwrap().get(key).cloned()
	}

	fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
		let mut map = self.map.lock().unwrap();
		if !map.contains_key(key) && map.len() >= MAX_KEYS {
			return Err(StoreError::Full);
		}
		map.insert(key.into(), value);
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StoreError> {
		self.map.lock().unwrap().remove(key);
		Ok(())
	}

	fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
		self.map
			.lock()
			.unwrap()
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, _)| key.clone())
			.collect()
	}
}

/// A store persisted as one JSON file.
///
/// Every write rewrites the file through a rename, so a crash mid-write
/// leaves the previous content intact.
#[derive(Debug)]
pub struct FileStore {
	path: PathBuf,
	map: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
	/// Open a store, loading existing content when the file exists.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();
		let map = match std::fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes)?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
			Err(e) => return Err(e.into()),
		};
		Ok(Self {
			path,
			map: Mutex::new(map),
		})
	}

	fn persist(&self, map: &BTreeMap<String, Value>) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec_pretty(map)?;
		let tmp = self.path.with_extension("tmp");
		std::fs::write(&tmp, bytes)?;
		std::fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

impl Store for FileStore {
	fn get(&self, key: &str) -> Option<Value> {
		self.map.lock().unwrap().get(key).cloned()
	}

	fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
		let mut map = self.map.lock().unwrap();
		if !map.contains_key(key) && map.len() >= MAX_KEYS {
			return Err(StoreError::Full);
		}
		map.insert(key.into(), value);
		self.persist(&map)
	}

	fn remove(&self, key: &str) -> Result<(), StoreError> {
		let mut map = self.map.lock().unwrap();
		if map.remove(key).is_some() {
			self.persist(&map)?;
		}
		Ok(())
	}

	fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
		self.map
			.lock()
			.unwrap()
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, _)| key.clone())
			.collect()
	}
}

/// A device catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDevice {
	/// Serial of the device, in hex.
	pub serial: String,

	/// Display name chosen by the user.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,

	/// The node ID the device was last seen on.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub node_id: Option<u8>,

	/// Unix milliseconds of the last successful exchange.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_seen: Option<u64>,
}

/// Load one device catalog entry.
pub fn load_device(store: &dyn Store, serial: &str) -> Option<SavedDevice> {
	let value = store.get(&keys::device(serial))?;
	serde_json::from_value(value).ok()
}

/// Insert or update a device catalog entry.
pub fn save_device(store: &dyn Store, device: &SavedDevice) -> Result<(), StoreError> {
	let value = serde_json::to_value(device)?;
	store.set(&keys::device(&device.serial), value)
}

/// Remove a device catalog entry.
pub fn delete_device(store: &dyn Store, serial: &str) -> Result<(), StoreError> {
	store.remove(&keys::device(serial))
}

/// All device catalog entries.
pub fn saved_devices(store: &dyn Store) -> Vec<SavedDevice> {
	store
		.keys_with_prefix("devices.")
		.into_iter()
		.filter_map(|key| store.get(&key))
		.filter_map(|value| serde_json::from_value(value).ok())
		.collect()
}

/// The configured default scan range.
pub fn scan_range(store: &dyn Store) -> (u8, u8) {
	let read = |key: &str| store.get(key).and_then(|value| value.as_u64()).map(|value| value as u8);
	(read(keys::SCAN_START).unwrap_or(1), read(keys::SCAN_END).unwrap_or(32))
}

use serde::Deserialize;

/// An inbound client action.
///
/// The wire form is a tagged JSON object: `{"action": "...", ...}` with the
/// variant payload inlined. Unknown tags fail deserialization and are
/// answered with an `actionError` event instead of being silently ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
	/// Start a node scan over an ID range.
	StartScan {
		/// First node ID to probe; the stored default when absent.
		start: Option<u8>,
		/// Last node ID to probe; the stored default when absent.
		end: Option<u8>,
	},

	/// Stop the running scan.
	StopScan,

	/// Bind the session to a node and narrow the acceptance filters to it.
	Connect {
		/// Serial of the device, when known from a previous scan.
		serial: Option<String>,
		/// The node to connect to.
		node_id: u8,
	},

	/// Release the node binding.
	Disconnect,

	/// Read the connected node's own node-ID object.
	GetNodeId,

	/// Write the connected node's node-ID object.
	SetNodeId {
		/// The new node ID.
		id: u8,
	},

	/// Write a parameter value.
	UpdateParam {
		/// The parameter number.
		param_id: u8,
		/// The raw parameter value.
		value: u32,
	},

	/// Read a parameter value.
	ReadParam {
		/// The parameter number.
		param_id: u8,
	},

	/// Persist the parameter set to flash on the device.
	SaveToFlash,

	/// Reload the parameter set from flash on the device.
	LoadFromFlash,

	/// Reset all parameters to defaults on the device.
	LoadDefaults,

	/// Reboot the device.
	ResetDevice,

	/// Read the device error log.
	ListErrors,

	/// Periodically read a set of parameters and stream the values.
	StartSpotValues {
		/// The parameters to read on every cycle.
		param_ids: Vec<u8>,
		/// The read cycle in milliseconds, clamped to `[100, 10000]`.
		interval_ms: u64,
	},

	/// Stop streaming spot values.
	StopSpotValues,

	/// Start the periodic control frame.
	StartCanIoInterval {
		/// CAN ID of the frame; the standard control ID when absent.
		can_id: Option<u16>,
		/// Primary throttle potentiometer.
		pot: u16,
		/// Secondary throttle potentiometer.
		pot2: u16,
		/// Discrete IO flags.
		canio: u8,
		/// Cruise speed target.
		cruisespeed: u16,
		/// Regen preset.
		regenpreset: u8,
		/// Emission period in milliseconds.
		interval: u64,
		/// Whether to fill in the CRC byte.
		use_crc: bool,
	},

	/// Stop the periodic control frame.
	StopCanIoInterval,

	/// Mutate the live control-frame state.
	UpdateCanIoFlags {
		/// New primary throttle value, if changed.
		pot: Option<u16>,
		/// New secondary throttle value, if changed.
		pot2: Option<u16>,
		/// New discrete flags, if changed.
		canio: Option<u8>,
		/// New cruise speed, if changed.
		cruisespeed: Option<u16>,
		/// New regen preset, if changed.
		regenpreset: Option<u8>,
	},

	/// Put a single raw frame on the bus.
	SendCanMessage {
		/// The CAN ID of the frame.
		can_id: u16,
		/// Up to 8 payload bytes.
		data: Vec<u8>,
	},

	/// Start a raw periodic frame.
	StartCanInterval {
		/// Client-chosen key of the interval.
		interval_id: String,
		/// The CAN ID of the frame.
		can_id: u16,
		/// Up to 8 payload bytes.
		data: Vec<u8>,
		/// Emission period in milliseconds.
		interval: u64,
	},

	/// Stop a raw periodic frame.
	StopCanInterval {
		/// The key used when starting the interval.
		interval_id: String,
	},

	/// Name (or rename) a device in the catalog.
	SetDeviceName {
		/// Serial of the device.
		serial: String,
		/// Display name.
		name: String,
		/// Node ID to remember for the device.
		node_id: Option<u8>,
	},

	/// Rename a device in the catalog.
	RenameDevice {
		/// Serial of the device.
		serial: String,
		/// New display name.
		name: String,
	},

	/// Delete a device from the catalog.
	DeleteDevice {
		/// Serial of the device.
		serial: String,
	},
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::{assert, let_assert};

	#[test]
	fn actions_parse_from_tagged_json() {
		let_assert!(
			Ok(action) = serde_json::from_str::<Action>(r#"{"action": "startScan", "start": 1, "end": 8}"#)
		);
		assert!(action == Action::StartScan { start: Some(1), end: Some(8) });

		let_assert!(
			Ok(action) = serde_json::from_str::<Action>(r#"{"action": "updateParam", "paramId": 17, "value": 3000}"#)
		);
		assert!(action == Action::UpdateParam { param_id: 17, value: 3000 });

		let_assert!(Ok(action) = serde_json::from_str::<Action>(r#"{"action": "stopScan"}"#));
		assert!(action == Action::StopScan);
	}

	#[test]
	fn canio_fields_use_the_wire_spelling() {
		let json = r#"{
			"action": "startCanIoInterval",
			"canId": 63,
			"pot": 2048,
			"pot2": 1024,
			"canio": 10,
			"cruisespeed": 4660,
			"regenpreset": 32,
			"interval": 100,
			"useCrc": true
		}"#;
		let_assert!(Ok(Action::StartCanIoInterval { cruisespeed, use_crc, .. }) = serde_json::from_str::<Action>(json));
		assert!(cruisespeed == 4660);
		assert!(use_crc);
	}

	#[test]
	fn unknown_actions_fail_to_parse() {
		assert!(serde_json::from_str::<Action>(r#"{"action": "formatFlash"}"#).is_err());
	}
}

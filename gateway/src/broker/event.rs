use serde::Serialize;

use crate::store::SavedDevice;

/// An outbound event for the client surface.
///
/// The wire form is `{"event": "...", "data": {...}}`. Events triggered by a
/// client action carry the correlating `requestId`; spontaneous stream events
/// (scan results, spot values, OTA progress) do not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
	/// A scan started or finished.
	ScanStatus {
		/// Whether a scan is running.
		active: bool,
	},

	/// The scanner found a responding node.
	DeviceDiscovered {
		/// The node that answered the identity probe.
		node_id: u8,
		/// Serial of the device, in hex.
		serial: String,
		/// Unix milliseconds of the probe.
		last_seen: u64,
	},

	/// The session is bound to a node.
	Connected {
		/// Correlates with the `connect` action.
		request_id: u32,
		/// The bound node.
		node_id: u8,
		/// Serial of the device, when known.
		serial: Option<String>,
	},

	/// The node binding was released.
	Disconnected {
		/// Correlates with the `disconnect` action.
		request_id: u32,
	},

	/// Result of a `getNodeId` action.
	NodeIdInfo {
		/// Correlates with the action.
		request_id: u32,
		/// The node ID the device reports for itself.
		node_id: u32,
	},

	/// Result of a `setNodeId` action.
	NodeIdSet {
		/// Correlates with the action.
		request_id: u32,
		/// The node ID that was written.
		node_id: u8,
	},

	/// Result of a `readParam` action.
	ParamValue {
		/// Correlates with the action.
		request_id: u32,
		/// The parameter number.
		param_id: u8,
		/// The raw value read from the device.
		value: u32,
	},

	/// Reading a parameter failed.
	ParamReadError {
		/// Correlates with the action.
		request_id: u32,
		/// The parameter number.
		param_id: u8,
		/// Human-readable failure description.
		error: String,
	},

	/// A parameter write was accepted.
	ParamUpdateSuccess {
		/// Correlates with the action.
		request_id: u32,
		/// The parameter number.
		param_id: u8,
	},

	/// A parameter write failed.
	ParamUpdateError {
		/// Correlates with the action.
		request_id: u32,
		/// The parameter number.
		param_id: u8,
		/// Human-readable failure description.
		error: String,
	},

	/// The device persisted its parameters.
	SaveToFlashSuccess {
		/// Correlates with the action.
		request_id: u32,
	},

	/// Persisting parameters failed.
	SaveToFlashError {
		/// Correlates with the action.
		request_id: u32,
		/// Human-readable failure description.
		error: String,
	},

	/// A flash/defaults/reset trigger was accepted.
	CommandSuccess {
		/// Correlates with the action.
		request_id: u32,
		/// The action tag that triggered the command.
		command: String,
	},

	/// A flash/defaults/reset trigger failed.
	CommandError {
		/// Correlates with the action.
		request_id: u32,
		/// The action tag that triggered the command.
		command: String,
		/// Human-readable failure description.
		error: String,
	},

	/// One cycle of streamed spot values.
	SpotValues {
		/// Unix milliseconds of the read cycle.
		timestamp: u64,
		/// One entry per requested parameter.
		values: Vec<SpotValue>,
	},

	/// Spot-value streaming started or stopped.
	SpotValuesStatus {
		/// Whether streaming is running.
		active: bool,
	},

	/// A raw frame was queued for transmission.
	CanMessageSent {
		/// Correlates with the action.
		request_id: u32,
	},

	/// The periodic control frame started or stopped.
	CanIoIntervalStatus {
		/// Whether the control frame is being emitted.
		active: bool,
	},

	/// A raw periodic frame started or stopped.
	CanIntervalStatus {
		/// The client-chosen key of the interval.
		interval_id: String,
		/// Whether the interval is running.
		active: bool,
	},

	/// Firmware streaming progress.
	OtaProgress {
		/// Whole percent of the image acknowledged.
		percent: u8,
	},

	/// The firmware update completed.
	OtaSuccess,

	/// The firmware update failed.
	OtaError {
		/// Short failure reason, e.g. `"Crc"`.
		reason: String,
	},

	/// The device error log.
	ListErrorsSuccess {
		/// Correlates with the action.
		request_id: u32,
		/// One entry per logged error.
		errors: Vec<String>,
	},

	/// Reading the error log failed.
	ListErrorsError {
		/// Correlates with the action.
		request_id: u32,
		/// Human-readable failure description.
		error: String,
	},

	/// A device name was stored.
	DeviceNameSet {
		/// Correlates with the action.
		request_id: u32,
		/// Serial of the device.
		serial: String,
		/// The stored name.
		name: String,
	},

	/// A device was renamed.
	DeviceRenamed {
		/// Correlates with the action.
		request_id: u32,
		/// Serial of the device.
		serial: String,
		/// The new name.
		name: String,
	},

	/// A device was removed from the catalog.
	DeviceDeleted {
		/// Correlates with the action.
		request_id: u32,
		/// Serial of the device.
		serial: String,
	},

	/// The current device catalog.
	SavedDevices {
		/// All known devices.
		devices: Vec<SavedDevice>,
	},

	/// The action could not be carried out (or parsed).
	ActionError {
		/// Correlates with the action.
		request_id: u32,
		/// Human-readable failure description.
		error: String,
	},
}

/// One streamed parameter reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotValue {
	/// The parameter number.
	pub param_id: u8,

	/// The value, absent when the read failed this cycle.
	pub value: Option<u32>,
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::{assert, let_assert};

	#[test]
	fn events_serialize_tagged_with_data() {
		let event = Event::ScanStatus { active: false };
		let_assert!(Ok(json) = serde_json::to_value(&event));
		assert!(json == serde_json::json!({"event": "scanStatus", "data": {"active": false}}));
	}

	#[test]
	fn unit_events_have_no_data() {
		let_assert!(Ok(json) = serde_json::to_value(Event::OtaSuccess));
		assert!(json == serde_json::json!({"event": "otaSuccess"}));
	}

	#[test]
	fn field_names_are_camel_case() {
		let event = Event::ParamUpdateError {
			request_id: 7,
			param_id: 17,
			error: "timeout".into(),
		};
		let_assert!(Ok(json) = serde_json::to_value(&event));
		assert!(json["data"]["requestId"] == 7);
		assert!(json["data"]["paramId"] == 17);
	}
}

use can_bus::{CanData, CanFrame};

use super::{check_server_command, ClientCommand, SdoError, ServerCommand};
use crate::{NodeId, ObjectIndex};

/// Make an SDO initiate upload request.
pub(crate) fn make_initiate_upload_request(node: NodeId, object: ObjectIndex) -> CanFrame {
	let index = object.index.to_le_bytes();
	CanFrame::from_array(node.request_id(), [
		u8::from(ClientCommand::InitiateUpload) << 5,
		index[0],
		index[1],
		object.subindex,
		0, 0, 0, 0,
	])
}

/// Make an SDO upload segment request.
pub(crate) fn make_segment_upload_request(node: NodeId, toggle: bool) -> CanFrame {
	CanFrame::from_array(node.request_id(), [
		u8::from(ClientCommand::SegmentUpload) << 5 | u8::from(toggle) << 4,
		0, 0, 0,
		0, 0, 0, 0,
	])
}

/// An SDO initiate upload response.
pub(crate) enum InitiateUploadResponse {
	/// An expedited response containing the actual data.
	Expedited(CanData),

	/// A segmented response containing the length of the data.
	Segmented(u32),
}

impl InitiateUploadResponse {
	/// Parse an initiate upload response from a CAN frame.
	pub(crate) fn parse(frame: &CanFrame) -> Result<Self, SdoError> {
		let data = check_server_command(frame, ServerCommand::InitiateUpload)?;

		let n = data[0] >> 2 & 0x03;
		let expedited = data[0] & 0x02 != 0;
		let size_set = data[0] & 0x01 != 0;

		if expedited {
			let len = match size_set {
				true => 4 - n as usize,
				false => 4,
			};
			let data = CanData::new(&data[4..][..len]).unwrap();
			Ok(InitiateUploadResponse::Expedited(data))
		} else if !size_set {
			Err(SdoError::NoExpeditedOrSizeFlag)
		} else {
			let len = u32::from_le_bytes(data[4..8].try_into().unwrap());
			Ok(InitiateUploadResponse::Segmented(len))
		}
	}
}

/// Parse an SDO segment upload response.
///
/// Returns whether this was the final segment and the segment data.
pub(crate) fn parse_segment_upload_response(
	frame: &CanFrame,
	expected_toggle: bool,
) -> Result<(bool, CanData), SdoError> {
	let data = check_server_command(frame, ServerCommand::SegmentUpload)?;

	let toggle = data[0] & 0x10 != 0;
	let n = data[0] >> 1 & 0x07;
	let complete = data[0] & 0x01 != 0;
	let len = 7 - n as usize;

	if toggle != expected_toggle {
		return Err(SdoError::InvalidToggleFlag);
	}

	let data = CanData::new(&data[1..][..len]).unwrap();
	Ok((complete, data))
}

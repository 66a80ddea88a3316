use can_bus::CanFrame;

use super::{check_server_command, ClientCommand, SdoError, ServerCommand};
use crate::{NodeId, ObjectIndex};

/// Make an SDO expedited download request carrying 1 to 4 data bytes.
pub(crate) fn make_expedited_download_request(
	node: NodeId,
	object: ObjectIndex,
	data: &[u8],
) -> CanFrame {
	debug_assert!(!data.is_empty() && data.len() <= 4);
	let n = 4 - data.len() as u8;
	let index = object.index.to_le_bytes();
	let mut payload = [0u8; 8];
	// 0x03 sets the expedited and size flags.
	payload[0] = u8::from(ClientCommand::InitiateDownload) << 5 | n << 2 | 0x03;
	payload[1] = index[0];
	payload[2] = index[1];
	payload[3] = object.subindex;
	payload[4..4 + data.len()].copy_from_slice(data);
	CanFrame::from_array(node.request_id(), payload)
}

/// Parse the server acknowledgement of an expedited download.
pub(crate) fn parse_download_response(frame: &CanFrame) -> Result<(), SdoError> {
	check_server_command(frame, ServerCommand::InitiateDownload)?;
	Ok(())
}

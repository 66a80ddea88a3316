//! Service Data Object (SDO) types and the per-node transactor.

use can_bus::CanFrame;

use crate::{NodeId, ObjectIndex};

mod client;
mod download;
mod error;
mod upload;

pub use client::{SdoClient, EXPEDITED_TIMEOUT, SEGMENT_TIMEOUT};
pub use error::*;

pub(crate) use download::{make_expedited_download_request, parse_download_response};
pub(crate) use upload::{
	make_initiate_upload_request,
	make_segment_upload_request,
	parse_segment_upload_response,
	InitiateUploadResponse,
};

/// SDO command that can be sent by a client.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[derive(num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
enum ClientCommand {
	/// Download a segment to the server.
	SegmentDownload = 0,

	/// Initiate a download to the server.
	InitiateDownload = 1,

	/// Initiate an upload from the server.
	InitiateUpload = 2,

	/// Request the server to upload a segment.
	SegmentUpload = 3,

	/// Tell the server we are aborting the transfer.
	AbortTransfer = 4,
}

/// SDO command that can be sent by a server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[derive(num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
enum ServerCommand {
	/// The server is uploading a segment.
	SegmentUpload = 0,

	/// The server has downloaded the segment.
	SegmentDownload = 1,

	/// The server accepts the upload request.
	InitiateUpload = 2,

	/// The server accepts the download request.
	InitiateDownload = 3,

	/// The server is aborting the transfer.
	AbortTransfer = 4,
}

/// The reason for aborting a transfer.
///
/// The subset of CiA 301 table 22 the OpenInverter firmware family emits.
/// Codes outside this set are preserved numerically.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[derive(num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u32)]
pub enum AbortReason {
	/// Toggle bit not alternated.
	ToggleBitNotAlternated = 0x0503_0000,

	/// SDO protocol timed out.
	SdoProtocolTimedOut = 0x0504_0000,

	/// Client/server command specifier not valid or unknown.
	InvalidCommandSpecifier = 0x0504_0001,

	/// CRC error.
	CrcError = 0x0504_0004,

	/// Unsupported access to an object.
	UnsupportedObjectAccess = 0x0601_0000,

	/// Attempt to read a write only object.
	ReadFromWriteOnlyObject = 0x0601_0001,

	/// Attempt to write a read only object.
	WriteToReadOnlyObject = 0x0601_0002,

	/// Object does not exist in the object dictionary.
	ObjectDoesNotExist = 0x0602_0000,

	/// Sub-index does not exist.
	SubIndexDoesNotExist = 0x0609_0011,

	/// Invalid value for parameter.
	ObjectValueInvalid = 0x0609_0030,

	/// General error.
	GeneralError = 0x0800_0000,

	/// No data available.
	NoDataAvailable = 0x0800_0024,
}

impl std::fmt::Display for AbortReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::ToggleBitNotAlternated => write!(f, "toggle bit not alternated"),
			Self::SdoProtocolTimedOut => write!(f, "SDO protocol timed out"),
			Self::InvalidCommandSpecifier => write!(f, "invalid or unknown SDO command"),
			Self::CrcError => write!(f, "CRC error"),
			Self::UnsupportedObjectAccess => write!(f, "unsupported access to an object"),
			Self::ReadFromWriteOnlyObject => write!(f, "attempt to read a write only object"),
			Self::WriteToReadOnlyObject => write!(f, "attempt to write a read only object"),
			Self::ObjectDoesNotExist => write!(f, "object does not exist in the object dictionary"),
			Self::SubIndexDoesNotExist => write!(f, "sub-index does not exist"),
			Self::ObjectValueInvalid => write!(f, "invalid value for parameter"),
			Self::GeneralError => write!(f, "general error"),
			Self::NoDataAvailable => write!(f, "no data available"),
		}
	}
}

impl std::fmt::Display for ServerCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::SegmentDownload => write!(f, "download-segment"),
			Self::InitiateDownload => write!(f, "initiate-download"),
			Self::InitiateUpload => write!(f, "initiate-upload"),
			Self::SegmentUpload => write!(f, "upload-segment"),
			Self::AbortTransfer => write!(f, "abort-transfer"),
		}
	}
}

/// Extract the server command and data from an SDO response frame.
fn get_server_command(frame: &CanFrame) -> Result<(ServerCommand, [u8; 8]), SdoError> {
	let data: [u8; 8] = frame
		.data()
		.try_into()
		.map_err(|_| MalformedResponse::WrongFrameSize(frame.data().len()))?;

	let command = ServerCommand::try_from(data[0] >> 5)
		.map_err(|e| MalformedResponse::InvalidServerCommand(e.number))?;
	Ok((command, data))
}

/// Check that the response carries the expected server command.
///
/// Has special handling for [`ServerCommand::AbortTransfer`] to return a
/// [`TransferAborted`] error with the decoded abort code.
fn check_server_command(frame: &CanFrame, expected: ServerCommand) -> Result<[u8; 8], SdoError> {
	let (command, data) = get_server_command(frame)?;
	if command == expected {
		Ok(data)
	} else if command == ServerCommand::AbortTransfer {
		let code = u32::from_le_bytes(data[4..8].try_into().unwrap());
		let reason = AbortReason::try_from(code).map_err(|e| e.number);
		Err(SdoError::TransferAborted(TransferAborted { reason }))
	} else {
		Err(UnexpectedResponse { expected, actual: command }.into())
	}
}

/// The object index addressed by an 8-byte SDO initiate or abort frame.
fn object_of(data: &[u8; 8]) -> ObjectIndex {
	ObjectIndex {
		index: u16::from_le_bytes([data[1], data[2]]),
		subindex: data[3],
	}
}

/// Make an abort frame terminating the transfer of `object` on `node`.
pub(crate) fn make_abort_frame(node: NodeId, object: ObjectIndex, reason: AbortReason) -> CanFrame {
	let code = u32::from(reason).to_le_bytes();
	let index = object.index.to_le_bytes();
	CanFrame::from_array(node.request_id(), [
		u8::from(ClientCommand::AbortTransfer) << 5,
		index[0],
		index[1],
		object.subindex,
		code[0],
		code[1],
		code[2],
		code[3],
	])
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::{assert, let_assert};

	#[test]
	fn abort_response_carries_little_endian_code() {
		// S2: abort 0x06010002 for object 0x5000:0.
		let frame = CanFrame::new(
			can_bus::CanId::new(0x581).unwrap(),
			&[0x80, 0x00, 0x50, 0x00, 0x02, 0x00, 0x01, 0x06],
		)
		.unwrap();
		let_assert!(
			Err(SdoError::TransferAborted(aborted)) =
				check_server_command(&frame, ServerCommand::InitiateUpload)
		);
		assert!(aborted.code() == 0x0601_0002);
		let_assert!(Ok(reason) = aborted.reason);
		assert!(reason == AbortReason::WriteToReadOnlyObject);
	}

	#[test]
	fn abort_frame_layout() {
		let node = NodeId::new(1).unwrap();
		let object = ObjectIndex::new(0x5000, 2);
		let frame = make_abort_frame(node, object, AbortReason::GeneralError);
		assert!(frame.id().as_u16() == 0x601);
		assert!(frame.data() == &[0x80, 0x00, 0x50, 0x02, 0x00, 0x00, 0x00, 0x08]);
	}

	#[test]
	fn short_frames_are_malformed() {
		let frame = CanFrame::new(can_bus::CanId::new(0x581).unwrap(), &[0x80, 0x00]).unwrap();
		let_assert!(Err(SdoError::MalformedResponse(_)) = get_server_command(&frame).map(|_| ()));
	}
}

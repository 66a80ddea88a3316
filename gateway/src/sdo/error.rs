use can_bus::DriverError;

/// Error that can occur during an SDO transfer.
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("{0}")]
pub enum SdoError {
	/// Queueing a CAN frame for transmission failed.
	#[error("failed to queue CAN frame: {0}")]
	SendFailed(DriverError),

	/// A timeout occurred while waiting for a response frame.
	#[error("timeout while waiting for response")]
	Timeout,

	/// The transfer was aborted by the SDO server.
	TransferAborted(#[from] TransferAborted),

	/// The response does not follow the SDO response format.
	MalformedResponse(#[from] MalformedResponse),

	/// Received an SDO response with an unexpected server command.
	UnexpectedResponse(#[from] UnexpectedResponse),

	/// The flags on the message are not valid.
	#[error("invalid flags in server response: neither the expedited nor the size flag is set")]
	NoExpeditedOrSizeFlag,

	/// The toggle flag is not in the expected state.
	#[error("invalid toggle flag in server response")]
	InvalidToggleFlag,

	/// Received a different amount of data than advertised by the server.
	WrongDataCount(#[from] WrongDataCount),

	/// The requested write length is not valid for an expedited download.
	InvalidValueLength(#[from] InvalidValueLength),

	/// The transactor is shut down.
	#[error("the SDO transactor is shut down")]
	Closed,

	/// The operation was cancelled.
	#[error("the SDO transfer was cancelled")]
	Cancelled,
}

/// The transfer was aborted by the SDO server.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub struct TransferAborted {
	/// The reason from the server for aborting the transfer.
	///
	/// `Err` preserves codes outside the known [`super::AbortReason`] set.
	pub reason: Result<super::AbortReason, u32>,
}

impl TransferAborted {
	/// The numeric abort code.
	pub fn code(&self) -> u32 {
		match self.reason {
			Ok(reason) => reason.into(),
			Err(code) => code,
		}
	}
}

impl std::fmt::Display for TransferAborted {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.reason {
			Ok(reason) => write!(f, "SDO transfer aborted by server: {reason}"),
			Err(code) => write!(f, "SDO transfer aborted by server with unknown reason code: 0x{code:08X}"),
		}
	}
}

/// The response does not follow the correct format for an SDO response.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub enum MalformedResponse {
	/// The CAN frame does not have the correct length of 8 data bytes.
	#[error("wrong frame size: expected 8 bytes, got {0}")]
	WrongFrameSize(usize),

	/// The server command is not valid.
	#[error("invalid server command: 0x{0:02X}")]
	InvalidServerCommand(u8),
}

/// Received an SDO response with an unexpected server command.
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("unexpected response: expected {expected}, got {actual}")]
pub struct UnexpectedResponse {
	/// The expected server command.
	pub(super) expected: super::ServerCommand,

	/// The actual server command.
	pub(super) actual: super::ServerCommand,
}

/// Received a different amount of data than advertised by the server.
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("received wrong amount of data from server, expected {expected} bytes, got {actual}")]
pub struct WrongDataCount {
	/// The expected amount of data as advertised by the server.
	pub(super) expected: usize,

	/// The actual amount of data received from the server.
	pub(super) actual: usize,
}

/// The requested write length is not valid for an expedited download.
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("invalid expedited write length: {len}, must be 1, 2 or 4")]
pub struct InvalidValueLength {
	/// The rejected length.
	pub len: usize,
}

/// The CAN identifier is not a valid 11-bit identifier.
#[derive(Debug, Clone)]
pub struct InvalidId {
	pub(crate) id: u32,
}

impl std::error::Error for InvalidId {}

impl std::fmt::Display for InvalidId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "invalid CAN ID: 0x{:X}, maximum valid value is 0x7FF", self.id)
	}
}

/// The data does not fit in a CAN frame.
#[derive(Debug, Clone)]
pub struct TryIntoCanDataError {
	pub(crate) len: usize,
}

impl std::error::Error for TryIntoCanDataError {}

impl std::fmt::Display for TryIntoCanDataError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data too large for CAN frame, expected at most 8 bytes, got {}", self.len)
	}
}

/// Error reported by the driver facade or a CAN controller.
#[derive(Debug, Clone, Eq, PartialEq)]
#[derive(thiserror::Error)]
pub enum DriverError {
	/// The controller entered the bus-off state.
	#[error("CAN controller entered bus-off")]
	BusOff,

	/// The transmit queue or hardware mailboxes are saturated.
	#[error("CAN transmit queue is full")]
	QueueFull,

	/// The driver is closed or was never opened.
	#[error("CAN driver is closed")]
	DriverClosed,
}

use crate::error::TryIntoCanDataError;
use crate::CanId;

/// The payload of a CAN frame: 0 to 8 data bytes.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct CanData {
	data: [u8; 8],
	len: u8,
}

impl CanData {
	/// Create a payload from a slice of at most 8 bytes.
	pub fn new(data: &[u8]) -> Result<Self, TryIntoCanDataError> {
		if data.len() > 8 {
			return Err(TryIntoCanDataError { len: data.len() });
		}
		let mut buffer = [0u8; 8];
		buffer[..data.len()].copy_from_slice(data);
		Ok(Self {
			data: buffer,
			len: data.len() as u8,
		})
	}

	/// Get the payload as a byte slice.
	pub fn as_slice(&self) -> &[u8] {
		&self.data[..self.len as usize]
	}

	/// Get the number of data bytes.
	pub fn len(&self) -> usize {
		self.len as usize
	}

	/// Check if the payload is empty.
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl TryFrom<&[u8]> for CanData {
	type Error = TryIntoCanDataError;

	fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
		Self::new(data)
	}
}

impl From<[u8; 8]> for CanData {
	fn from(data: [u8; 8]) -> Self {
		Self { data, len: 8 }
	}
}

impl std::ops::Deref for CanData {
	type Target = [u8];

	fn deref(&self) -> &Self::Target {
		self.as_slice()
	}
}

impl std::fmt::Debug for CanData {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:02X?}", self.as_slice())
	}
}

/// A classic CAN data frame with an 11-bit identifier.
///
/// Immutable after construction.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct CanFrame {
	id: CanId,
	data: CanData,
}

impl CanFrame {
	/// Create a new frame.
	pub fn new(id: impl Into<CanId>, data: &[u8]) -> Result<Self, TryIntoCanDataError> {
		Ok(Self {
			id: id.into(),
			data: CanData::new(data)?,
		})
	}

	/// Create a new frame from a full 8-byte payload.
	pub fn from_array(id: impl Into<CanId>, data: [u8; 8]) -> Self {
		Self {
			id: id.into(),
			data: data.into(),
		}
	}

	/// The frame identifier.
	pub fn id(&self) -> CanId {
		self.id
	}

	/// The frame payload.
	pub fn data(&self) -> &[u8] {
		self.data.as_slice()
	}
}

impl std::fmt::Debug for CanFrame {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CanFrame")
			.field("id", &format_args!("{}", self.id))
			.field("data", &format_args!("{:02X?}", self.data()))
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::{assert, let_assert};

	#[test]
	fn can_frame_is_copy() {
		let_assert!(Ok(frame) = CanFrame::new(1u8, &[1, 2, 3, 4]));
		let copy = frame;
		assert!(copy.id() == CanId::from_u8(1));
		assert!(copy.data() == &[1, 2, 3, 4]);
	}

	#[test]
	fn oversized_data_is_rejected() {
		assert!(CanFrame::new(1u8, &[0; 9]).is_err());
		let_assert!(Ok(frame) = CanFrame::new(1u8, &[0; 8]));
		assert!(frame.data().len() == 8);
	}
}

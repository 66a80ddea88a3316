use std::time::Duration;

use crate::{CanFrame, CanId, DriverError, FrameFilter};

/// Supported CAN bit rates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BitRate {
	/// 20 kbit/s
	K20,
	/// 50 kbit/s
	K50,
	/// 100 kbit/s
	K100,
	/// 125 kbit/s
	K125,
	/// 250 kbit/s
	K250,
	/// 500 kbit/s
	K500,
	/// 800 kbit/s
	K800,
	/// 1 Mbit/s
	M1,
}

impl BitRate {
	/// The bit rate in bits per second.
	pub const fn bit_per_sec(self) -> u32 {
		match self {
			Self::K20 => 20_000,
			Self::K50 => 50_000,
			Self::K100 => 100_000,
			Self::K125 => 125_000,
			Self::K250 => 250_000,
			Self::K500 => 500_000,
			Self::K800 => 800_000,
			Self::M1 => 1_000_000,
		}
	}

	/// Look up a bit rate by its value in bits per second.
	pub fn from_bit_per_sec(bit_per_sec: u32) -> Option<Self> {
		match bit_per_sec {
			20_000 => Some(Self::K20),
			50_000 => Some(Self::K50),
			100_000 => Some(Self::K100),
			125_000 => Some(Self::K125),
			250_000 => Some(Self::K250),
			500_000 => Some(Self::K500),
			800_000 => Some(Self::K800),
			1_000_000 => Some(Self::M1),
			_ => None,
		}
	}
}

impl std::fmt::Display for BitRate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.bit_per_sec())
	}
}

/// Pin assignment and bit rate for the CAN controller.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DriverConfig {
	/// The bus bit rate.
	pub bit_rate: BitRate,

	/// GPIO pin connected to the transceiver TX line.
	pub tx_pin: u8,

	/// GPIO pin connected to the transceiver RX line.
	pub rx_pin: u8,

	/// Optional GPIO pin that enables the transceiver.
	///
	/// Asserted before every controller (re)start.
	pub enable_pin: Option<u8>,
}

impl DriverConfig {
	/// A configuration with the default OpenInverter bit rate of 500 kbit/s.
	pub fn new(tx_pin: u8, rx_pin: u8) -> Self {
		Self {
			bit_rate: BitRate::K500,
			tx_pin,
			rx_pin,
			enable_pin: None,
		}
	}
}

/// A CAN controller owned exclusively by the driver facade.
///
/// The interface is blocking: the driver pump runs on a dedicated thread and
/// is the only caller once the facade is handed to it.
pub trait CanController: Send {
	/// Start the controller with the given configuration and acceptance filters.
	///
	/// The transceiver enable pin (if configured) is asserted before the
	/// controller starts listening.
	fn start(&mut self, config: &DriverConfig, filters: &[FrameFilter]) -> Result<(), DriverError>;

	/// Stop the controller.
	///
	/// Pending hardware TX mailboxes are aborted.
	fn stop(&mut self);

	/// Put one frame on the wire.
	fn send(&mut self, frame: &CanFrame) -> Result<(), DriverError>;

	/// Receive one frame, waiting at most `timeout`.
	fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, DriverError>;

	/// Attempt to recover the controller from bus-off.
	fn restart(&mut self) -> Result<(), DriverError>;
}

/// The acceptance-filter mode the driver is opened in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpenMode {
	/// Accept every frame on the bus. Used while scanning for nodes.
	Scan,

	/// Accept only the SDO responses and periodic broadcasts of one node.
	///
	/// Reduces interrupt load during normal operation.
	Node(u8),
}

/// Facade over the CAN controller: open modes, reconfiguration, I/O.
///
/// Switching open modes stops and restarts the controller; callers must make
/// sure no TX is pending across the switch.
pub struct CanDriver {
	controller: Box<dyn CanController>,
	config: DriverConfig,
	mode: Option<OpenMode>,
}

impl CanDriver {
	/// Create a driver over a controller. The driver starts closed.
	pub fn new(controller: Box<dyn CanController>, config: DriverConfig) -> Self {
		Self {
			controller,
			config,
			mode: None,
		}
	}

	/// Replace the driver configuration.
	///
	/// If the driver is open, the controller is restarted with the new
	/// configuration and the current filter mode.
	pub fn configure(&mut self, config: DriverConfig) -> Result<(), DriverError> {
		self.config = config;
		if let Some(mode) = self.mode {
			self.reopen(mode)?;
		}
		Ok(())
	}

	/// Open the driver accepting all frames.
	pub fn open_for_scan(&mut self) -> Result<(), DriverError> {
		self.reopen(OpenMode::Scan)
	}

	/// Open the driver accepting only traffic of the given node.
	pub fn open_for_node(&mut self, node: u8) -> Result<(), DriverError> {
		self.reopen(OpenMode::Node(node))
	}

	/// Stop the controller and close the driver.
	pub fn close(&mut self) {
		if self.mode.take().is_some() {
			self.controller.stop();
		}
	}

	/// Put one frame on the wire.
	pub fn send(&mut self, frame: &CanFrame) -> Result<(), DriverError> {
		if self.mode.is_none() {
			return Err(DriverError::DriverClosed);
		}
		self.controller.send(frame)
	}

	/// Receive one frame, waiting at most `timeout`.
	pub fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, DriverError> {
		if self.mode.is_none() {
			return Err(DriverError::DriverClosed);
		}
		self.controller.recv(timeout)
	}

	/// Attempt to recover the controller from bus-off.
	pub fn restart(&mut self) -> Result<(), DriverError> {
		if self.mode.is_none() {
			return Err(DriverError::DriverClosed);
		}
		self.controller.restart()
	}

	/// The current open mode, or `None` when closed.
	pub fn mode(&self) -> Option<OpenMode> {
		self.mode
	}

	fn reopen(&mut self, mode: OpenMode) -> Result<(), DriverError> {
		if self.mode.take().is_some() {
			self.controller.stop();
		}
		let filters = filters_for(mode);
		log::debug!("starting CAN controller");
		log::debug!("├─ bit rate: {} bit/s", self.config.bit_rate);
		log::debug!("├─ pins: tx = {}, rx = {}, enable = {:?}", self.config.tx_pin, self.config.rx_pin, self.config.enable_pin);
		log::debug!("└─ mode: {mode:?}");
		self.controller.start(&self.config, &filters)?;
		self.mode = Some(mode);
		Ok(())
	}
}

impl std::fmt::Debug for CanDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CanDriver")
			.field("config", &self.config)
			.field("mode", &self.mode)
			.finish_non_exhaustive()
	}
}

/// The acceptance filters installed for an open mode.
fn filters_for(mode: OpenMode) -> Vec<FrameFilter> {
	match mode {
		OpenMode::Scan => vec![FrameFilter::ACCEPT_ALL],
		OpenMode::Node(node) => {
			let node = u16::from(node);
			vec![
				// SDO responses of the node.
				FrameFilter::new(CanId::new(0x580 | node).unwrap()).match_id_value(),
				// Periodic value broadcasts of the node.
				FrameFilter::new(CanId::new(0x180 | node).unwrap()).match_id_value(),
				FrameFilter::new(CanId::new(0x280 | node).unwrap()).match_id_value(),
			]
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::filter::accepted_by;
	use assert2::assert;

	#[test]
	fn node_mode_filters_pass_sdo_and_broadcast() {
		let filters = filters_for(OpenMode::Node(5));
		assert!(accepted_by(&filters, CanId::new(0x585).unwrap()));
		assert!(accepted_by(&filters, CanId::new(0x185).unwrap()));
		assert!(!accepted_by(&filters, CanId::new(0x586).unwrap()));
		assert!(!accepted_by(&filters, CanId::new(0x605).unwrap()));
	}

	#[test]
	fn bit_rate_round_trips() {
		for rate in [
			BitRate::K20,
			BitRate::K50,
			BitRate::K100,
			BitRate::K125,
			BitRate::K250,
			BitRate::K500,
			BitRate::K800,
			BitRate::M1,
		] {
			assert!(BitRate::from_bit_per_sec(rate.bit_per_sec()) == Some(rate));
		}
		assert!(BitRate::from_bit_per_sec(123).is_none());
	}
}

//! CAN transport for the OpenInverter gateway.
//!
//! This crate owns everything between the protocol layer and the wire: the
//! frame and identifier types, the driver facade over a pluggable
//! [`CanController`], software acceptance filters, the bounded TX queue with
//! its single-consumer pump thread, and the RX router that hands received
//! frames to their consumers.
//!
//! The pump thread is the only owner of the controller. All transmission
//! goes through the [`TxQueue`]; reconfiguration requests travel over the
//! [`DriverControl`] handle and execute between pump iterations, so no other
//! context ever touches the hardware handle.

mod driver;
mod error;
mod filter;
mod frame;
mod id;
pub mod mem;
mod pump;
mod queue;

pub use driver::{BitRate, CanController, CanDriver, DriverConfig, OpenMode};
pub use error::{DriverError, InvalidId, TryIntoCanDataError};
pub use filter::{accepted_by, FrameFilter};
pub use frame::{CanData, CanFrame};
pub use id::{CanId, MAX_CAN_ID};
pub use pump::{spawn_pump, BusStatus, DriverControl, PumpHandle, TickSource};
pub use queue::{RxRouter, TxQueue, RAW_QUEUE_DEPTH, SDO_QUEUE_DEPTH, TX_QUEUE_DEPTH};

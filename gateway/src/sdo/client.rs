use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use can_bus::{CanFrame, RxRouter, TxQueue};
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;

use super::{
	make_abort_frame,
	make_expedited_download_request,
	make_initiate_upload_request,
	make_segment_upload_request,
	object_of,
	parse_download_response,
	parse_segment_upload_response,
	AbortReason,
	InitiateUploadResponse,
	InvalidValueLength,
	SdoError,
	WrongDataCount,
};
use crate::{CancelToken, NodeId, ObjectIndex};

/// Default timeout for expedited transfers.
pub const EXPEDITED_TIMEOUT: Duration = Duration::from_millis(50);

/// Default timeout for each segment of a segmented transfer.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimum gap between consecutive transactions to the same node.
///
/// Slow firmwares overrun when requests arrive back to back.
const NODE_SPACING: Duration = Duration::from_millis(2);

/// The per-node SDO request/response transactor.
///
/// Transactions to the same node serialize on a per-node slot; transactions
/// to different nodes proceed in parallel. At most one request is in flight
/// per node at any time.
#[derive(Clone)]
pub struct SdoClient {
	tx: TxQueue,
	router: RxRouter,
	slots: Arc<Mutex<HashMap<u8, Arc<tokio::sync::Mutex<NodeSlot>>>>>,
}

/// The exclusive in-flight state of one node.
struct NodeSlot {
	rx: mpsc::Receiver<CanFrame>,
	last_finished: Option<Instant>,
}

impl NodeSlot {
	/// Enforce the inter-transaction spacing for this node.
	async fn pace(&mut self) {
		if let Some(last) = self.last_finished {
			let since = last.elapsed();
			if since < NODE_SPACING {
				tokio::time::sleep(NODE_SPACING - since).await;
			}
		}
	}

	/// Drain leftover response frames of a prior aborted transaction.
	///
	/// Nothing queued before this point may satisfy the new request.
	fn clear_responses(&mut self) {
		let mut drained = 0usize;
		while self.rx.try_recv().is_ok() {
			drained += 1;
		}
		if drained > 0 {
			log::debug!("dropped {drained} stale SDO response frame(s)");
		}
	}
}

impl SdoClient {
	/// Create a new transactor over the TX queue and RX router.
	pub fn new(tx: TxQueue, router: RxRouter) -> Self {
		Self {
			tx,
			router,
			slots: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Read an object expecting an expedited response.
	///
	/// When the server answers with a segmented transfer instead, the
	/// transactor transparently performs the segmented upload and returns
	/// the first (up to) four bytes little-endian.
	pub async fn read_expedited(
		&self,
		node: NodeId,
		object: ObjectIndex,
		timeout: Duration,
	) -> Result<u32, SdoError> {
		self.read_expedited_cancel(node, object, timeout, &CancelToken::new()).await
	}

	/// [`Self::read_expedited`] with a cancellation token.
	pub async fn read_expedited_cancel(
		&self,
		node: NodeId,
		object: ObjectIndex,
		timeout: Duration,
		cancel: &CancelToken,
	) -> Result<u32, SdoError> {
		let mut slot = self.lock_node(node).await;
		slot.pace().await;
		slot.clear_responses();
		log::debug!("sending initiate upload request");
		log::debug!("├─ node: {node}");
		log::debug!("├─ object: {object:?}");
		log::debug!("└─ timeout: {timeout:?}");
		self.send(make_initiate_upload_request(node, object)).await?;

		let mut segmented = false;
		let result = {
			let segmented = &mut segmented;
			let slot = &mut slot;
			async move {
				let frame = recv_initiate(slot, object, Instant::now() + timeout, cancel).await?;
				match InitiateUploadResponse::parse(&frame)? {
					InitiateUploadResponse::Expedited(data) => {
						log::debug!("received expedited upload response: {data:?}");
						Ok(value_from_le(&data))
					}
					InitiateUploadResponse::Segmented(len) => {
						// The server insists on a segmented transfer.
						*segmented = true;
						log::debug!("upgrading to segmented upload, length {len}");
						let data = self.segment_loop(slot, node, len, timeout, cancel).await?;
						Ok(value_from_le(&data))
					}
				}
			}
			.await
		};
		self.finish(&mut slot, node, object, result, segmented).await
	}

	/// Read an object as a segmented upload, returning all data bytes.
	pub async fn read_segmented(
		&self,
		node: NodeId,
		object: ObjectIndex,
		timeout: Duration,
	) -> Result<Vec<u8>, SdoError> {
		self.read_segmented_cancel(node, object, timeout, &CancelToken::new()).await
	}

	/// [`Self::read_segmented`] with a cancellation token.
	pub async fn read_segmented_cancel(
		&self,
		node: NodeId,
		object: ObjectIndex,
		timeout: Duration,
		cancel: &CancelToken,
	) -> Result<Vec<u8>, SdoError> {
		let mut slot = self.lock_node(node).await;
		slot.pace().await;
		slot.clear_responses();
		log::debug!("sending initiate upload request (segmented)");
		log::debug!("├─ node: {node}");
		log::debug!("├─ object: {object:?}");
		log::debug!("└─ timeout: {timeout:?}");
		self.send(make_initiate_upload_request(node, object)).await?;

		let result = {
			let slot = &mut slot;
			async move {
				let frame = recv_initiate(slot, object, Instant::now() + timeout, cancel).await?;
				match InitiateUploadResponse::parse(&frame)? {
					InitiateUploadResponse::Expedited(data) => Ok(data.as_slice().to_vec()),
					InitiateUploadResponse::Segmented(len) => {
						self.segment_loop(slot, node, len, timeout, cancel).await
					}
				}
			}
			.await
		};
		self.finish(&mut slot, node, object, result, true).await
	}

	/// Write a value of 1, 2 or 4 bytes as an expedited download.
	pub async fn write_expedited(
		&self,
		node: NodeId,
		object: ObjectIndex,
		value: u32,
		byte_len: usize,
		timeout: Duration,
	) -> Result<(), SdoError> {
		self.write_expedited_cancel(node, object, value, byte_len, timeout, &CancelToken::new()).await
	}

	/// [`Self::write_expedited`] with a cancellation token.
	pub async fn write_expedited_cancel(
		&self,
		node: NodeId,
		object: ObjectIndex,
		value: u32,
		byte_len: usize,
		timeout: Duration,
		cancel: &CancelToken,
	) -> Result<(), SdoError> {
		if !matches!(byte_len, 1 | 2 | 4) {
			return Err(InvalidValueLength { len: byte_len }.into());
		}
		let bytes = value.to_le_bytes();

		let mut slot = self.lock_node(node).await;
		slot.pace().await;
		slot.clear_responses();
		log::debug!("sending expedited download request");
		log::debug!("├─ node: {node}");
		log::debug!("├─ object: {object:?}");
		log::debug!("├─ data: {:02X?}", &bytes[..byte_len]);
		log::debug!("└─ timeout: {timeout:?}");
		self.send(make_expedited_download_request(node, object, &bytes[..byte_len])).await?;

		let result = {
			let slot = &mut slot;
			async move {
				let frame = recv_initiate(slot, object, Instant::now() + timeout, cancel).await?;
				parse_download_response(&frame)
			}
			.await
		};
		self.finish(&mut slot, node, object, result, false).await
	}

	/// Queue one frame, mapping queue failures to [`SdoError::SendFailed`].
	async fn send(&self, frame: CanFrame) -> Result<(), SdoError> {
		self.tx.send(frame).await.map_err(SdoError::SendFailed)
	}

	/// Acquire the exclusive slot of a node, creating it on first use.
	async fn lock_node(&self, node: NodeId) -> OwnedMutexGuard<NodeSlot> {
		let slot = {
			let mut slots = self.slots.lock().unwrap();
			slots
				.entry(node.as_u8())
				.or_insert_with(|| {
					Arc::new(tokio::sync::Mutex::new(NodeSlot {
						rx: self.router.register_node(node.as_u8()),
						last_finished: None,
					}))
				})
				.clone()
		};
		slot.lock_owned().await
	}

	/// Fetch all segments of a segmented upload.
	async fn segment_loop(
		&self,
		slot: &mut NodeSlot,
		node: NodeId,
		len: u32,
		timeout: Duration,
		cancel: &CancelToken,
	) -> Result<Vec<u8>, SdoError> {
		let len = len as usize;
		let mut data = Vec::with_capacity(len);
		let mut toggle = false;
		loop {
			self.send(make_segment_upload_request(node, toggle)).await?;
			// Each segment gets its own timeout window.
			let frame = recv_frame(slot, Instant::now() + timeout, cancel).await?;
			let (complete, segment) = parse_segment_upload_response(&frame, toggle)?;
			log::debug!("received upload segment: {segment:?}, complete: {complete}");

			if data.len() + segment.len() > len {
				return Err(WrongDataCount {
					expected: len,
					actual: data.len() + segment.len(),
				}
				.into());
			}
			data.extend_from_slice(&segment);

			if complete {
				break;
			}
			toggle = !toggle;
		}
		if data.len() != len {
			return Err(WrongDataCount {
				expected: len,
				actual: data.len(),
			}
			.into());
		}
		Ok(data)
	}

	/// Close out a transaction: stamp the slot and send the cleanup abort
	/// where the protocol requires one.
	async fn finish<T>(
		&self,
		slot: &mut NodeSlot,
		node: NodeId,
		object: ObjectIndex,
		result: Result<T, SdoError>,
		abort_on_timeout: bool,
	) -> Result<T, SdoError> {
		slot.last_finished = Some(Instant::now());
		if let Err(e) = &result {
			let reason = match e {
				SdoError::Cancelled => Some(AbortReason::GeneralError),
				SdoError::Timeout if abort_on_timeout => Some(AbortReason::SdoProtocolTimedOut),
				SdoError::InvalidToggleFlag => Some(AbortReason::ToggleBitNotAlternated),
				SdoError::WrongDataCount(_)
				| SdoError::NoExpeditedOrSizeFlag
				| SdoError::UnexpectedResponse(_)
				| SdoError::MalformedResponse(_) => Some(AbortReason::GeneralError),
				_ => None,
			};
			if let Some(reason) = reason {
				let _ = self.send(make_abort_frame(node, object, reason)).await;
			}
		}
		result
	}
}

impl std::fmt::Debug for SdoClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SdoClient").finish_non_exhaustive()
	}
}

/// Receive the next frame of this node's slot, honoring deadline and cancel.
async fn recv_frame(
	slot: &mut NodeSlot,
	deadline: Instant,
	cancel: &CancelToken,
) -> Result<CanFrame, SdoError> {
	tokio::select! {
		_ = cancel.cancelled() => Err(SdoError::Cancelled),
		result = tokio::time::timeout_at(deadline.into(), slot.rx.recv()) => match result {
			Err(_) => Err(SdoError::Timeout),
			Ok(None) => Err(SdoError::Closed),
			Ok(Some(frame)) => Ok(frame),
		},
	}
}

/// Receive the initiate (or abort) response for `object`.
///
/// Frames for a different object are discarded, not buffered: the exclusive
/// per-node slot guarantees they can only be leftovers.
async fn recv_initiate(
	slot: &mut NodeSlot,
	object: ObjectIndex,
	deadline: Instant,
	cancel: &CancelToken,
) -> Result<CanFrame, SdoError> {
	loop {
		let frame = recv_frame(slot, deadline, cancel).await?;
		match <[u8; 8]>::try_from(frame.data()) {
			Ok(data) if object_of(&data) == object => return Ok(frame),
			_ => log::trace!("discarding uncorrelated SDO frame {frame:?}"),
		}
	}
}

/// Interpret up to four little-endian bytes as a value.
fn value_from_le(data: &[u8]) -> u32 {
	let mut bytes = [0u8; 4];
	let len = data.len().min(4);
	bytes[..len].copy_from_slice(&data[..len]);
	u32::from_le_bytes(bytes)
}

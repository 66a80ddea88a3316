//! The firmware update engine.
//!
//! Streams a binary image onto the bus as CRC-32 protected pages. Each page
//! goes out as 8-byte chunks on the firmware data CAN ID, paced by a
//! [`JobKind::FirmwareChunk`] scheduler job; the page checksum is then
//! submitted as an expedited SDO write. The target acknowledges the write
//! (page accepted) or aborts with the CRC error code (retransmit, bounded).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use can_bus::{CanData, CanId};
use tokio::sync::{mpsc, Notify};

use crate::control::crc32_words;
use crate::scheduler::{JobKind, ScheduleError, Scheduler};
use crate::sdo::{SdoClient, SdoError, EXPEDITED_TIMEOUT};
use crate::{objects, CancelToken, NodeId};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Cadence of the chunk streaming job.
pub const CHUNK_PERIOD_MS: u64 = 10;

/// How long to wait for the page acknowledgement.
pub const PAGE_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Retransmissions of one page before the update fails.
const PAGE_RETRIES: u32 = 3;

/// Emit a progress event at least every this many bytes.
const PROGRESS_BYTES: usize = 64 * 1024;

/// Emit a progress event at least this often.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// The SDO abort code the target reports a page checksum mismatch with.
const CRC_MISMATCH_CODE: u32 = 0x0504_0004;

/// States of the update state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpdateState {
	/// No update running.
	Idle,

	/// Entering update mode and verifying the challenge word.
	Handshake,

	/// Chunks of the current page are going out on the bus.
	Streaming,

	/// Waiting for the target to confirm the page checksum.
	AwaitAck,

	/// Instructing the target to flash and reboot.
	Commit,

	/// The update completed.
	Done,

	/// The update failed.
	Failed,
}

/// Events published while an update runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
	/// Rough percentage of the image streamed so far.
	Progress {
		/// Whole percent of bytes acknowledged by the target.
		percent: u8,
	},

	/// The target accepted the whole image and the commit was issued.
	Success,

	/// The update failed.
	Error {
		/// Short failure reason, e.g. `"Crc"`.
		reason: String,
	},
}

/// Why a firmware update failed.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub enum UpdateError {
	/// The image is empty.
	#[error("firmware image is empty")]
	EmptyImage,

	/// The target answered the handshake with the wrong challenge word.
	#[error("handshake failed: target answered 0x{answer:08X}")]
	BadChallenge {
		/// The word the target answered with.
		answer: u32,
	},

	/// A page failed checksum verification on every retransmission.
	#[error("page {page} failed CRC verification")]
	PageCrc {
		/// Zero-based index of the failing page.
		page: usize,
	},

	/// The streaming job stopped draining the page cursor.
	#[error("firmware streaming stalled")]
	Stalled,

	/// The streaming job could not be scheduled.
	#[error(transparent)]
	Schedule(#[from] ScheduleError),

	/// An SDO exchange with the target failed.
	#[error(transparent)]
	Sdo(#[from] SdoError),

	/// The update was cancelled.
	#[error("firmware update cancelled")]
	Cancelled,
}

impl UpdateError {
	/// The short reason published in the `otaError` event.
	fn reason(&self) -> String {
		match self {
			Self::PageCrc { .. } => "Crc".into(),
			Self::BadChallenge { .. } => "Handshake".into(),
			Self::Cancelled => "Cancelled".into(),
			other => other.to_string(),
		}
	}
}

/// Cursor over the page currently being streamed.
///
/// The scheduler takes one 8-byte chunk per tick; when the page is drained
/// the engine is woken through the paired [`Notify`].
pub struct ChunkCursor {
	data: Vec<u8>,
	offset: usize,
	done: Arc<Notify>,
}

impl ChunkCursor {
	/// Create an empty cursor and the notifier signalling page completion.
	pub fn new() -> (Arc<Mutex<Self>>, Arc<Notify>) {
		let done = Arc::new(Notify::new());
		let cursor = Arc::new(Mutex::new(Self {
			data: Vec::new(),
			offset: 0,
			done: done.clone(),
		}));
		(cursor, done)
	}

	/// Load the next page. The cursor must be drained (or fresh).
	pub fn load(&mut self, page: Vec<u8>) {
		debug_assert!(self.offset >= self.data.len());
		self.data = page;
		self.offset = 0;
	}

	/// Take the next chunk, or `None` when the page is drained.
	pub(crate) fn next_chunk(&mut self) -> Option<CanData> {
		if self.offset >= self.data.len() {
			return None;
		}
		let chunk = &self.data[self.offset..(self.offset + 8).min(self.data.len())];
		self.offset += 8;
		let chunk = CanData::new(chunk).unwrap();
		if self.offset >= self.data.len() {
			// Last chunk handed out: wake the engine.
			self.done.notify_one();
		}
		Some(chunk)
	}
}

impl std::fmt::Debug for ChunkCursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChunkCursor")
			.field("len", &self.data.len())
			.field("offset", &self.offset)
			.finish()
	}
}

/// The firmware update engine.
#[derive(Clone, Debug)]
pub struct FirmwareUpdater {
	client: SdoClient,
	scheduler: Scheduler,
}

impl FirmwareUpdater {
	/// Create an engine over the transactor and scheduler.
	pub fn new(client: SdoClient, scheduler: Scheduler) -> Self {
		Self { client, scheduler }
	}

	/// Run a complete update of `node` with `image`.
	///
	/// Publishes [`OtaEvent`]s on `events`; the final event is always either
	/// `Success` or `Error`. The scheduler and transactor are left clean on
	/// every exit path.
	pub async fn run(
		&self,
		node: NodeId,
		image: &[u8],
		page_size: usize,
		events: &mpsc::Sender<OtaEvent>,
		cancel: &CancelToken,
	) -> Result<(), UpdateError> {
		let result = self.run_inner(node, image, page_size, events, cancel).await;
		// Unconditional cleanup; the job may or may not still exist.
		let _ = self.scheduler.stop(&job_id(node));
		match &result {
			Ok(()) => {
				log::info!("firmware update of node {node} done");
				let _ = events.send(OtaEvent::Success).await;
			}
			Err(e) => {
				log::error!("firmware update of node {node} failed: {e}");
				let _ = events.send(OtaEvent::Error { reason: e.reason() }).await;
			}
		}
		result
	}

	async fn run_inner(
		&self,
		node: NodeId,
		image: &[u8],
		page_size: usize,
		events: &mpsc::Sender<OtaEvent>,
		cancel: &CancelToken,
	) -> Result<(), UpdateError> {
		if image.is_empty() {
			return Err(UpdateError::EmptyImage);
		}

		log::debug!("update state: {:?}", UpdateState::Handshake);
		self.client
			.write_expedited_cancel(node, objects::firmware::ENTRY, objects::firmware::UPDATE_MAGIC, 4, EXPEDITED_TIMEOUT, cancel)
			.await
			.map_err(map_sdo)?;
		let answer = self.client
			.read_expedited_cancel(node, objects::firmware::ENTRY, EXPEDITED_TIMEOUT, cancel)
			.await
			.map_err(map_sdo)?;
		if answer != objects::firmware::CHALLENGE_MAGIC {
			return Err(UpdateError::BadChallenge { answer });
		}

		let (cursor, page_done) = ChunkCursor::new();
		let data_id = CanId::new(objects::firmware::DATA_ID).unwrap();
		let job = job_id(node);
		self.scheduler.start(&job, data_id, JobKind::FirmwareChunk(cursor.clone()), CHUNK_PERIOD_MS)?;

		let total = image.len();
		let mut sent = 0usize;
		let mut progress_bytes = 0usize;
		let mut progress_at = Instant::now();

		for (page_index, page) in image.chunks(page_size).enumerate() {
			// Pages go out padded to whole chunks; the checksum covers the
			// padding, matching what the target writes to flash.
			let padded = pad_page(page);
			let crc = page_crc(&padded);
			let stream_window = stream_window(padded.len());

			let mut attempt = 0;
			loop {
				log::debug!("update state: {:?} (page {page_index}, attempt {attempt})", UpdateState::Streaming);
				cursor.lock().unwrap().load(padded.clone());
				tokio::select! {
					_ = cancel.cancelled() => return Err(UpdateError::Cancelled),
					drained = tokio::time::timeout(stream_window, page_done.notified()) => {
						drained.map_err(|_| UpdateError::Stalled)?;
					}
				}

				log::debug!("update state: {:?} (page {page_index})", UpdateState::AwaitAck);
				match self.client
					.write_expedited_cancel(node, objects::firmware::PAGE_CRC, crc, 4, PAGE_ACK_TIMEOUT, cancel)
					.await
				{
					Ok(()) => break,
					Err(SdoError::TransferAborted(aborted)) if aborted.code() == CRC_MISMATCH_CODE => {
						attempt += 1;
						if attempt >= PAGE_RETRIES {
							return Err(UpdateError::PageCrc { page: page_index });
						}
						log::warn!("page {page_index} checksum rejected, retransmitting (attempt {attempt})");
					}
					Err(e) => return Err(map_sdo(e)),
				}
			}

			sent += page.len();
			if sent - progress_bytes >= PROGRESS_BYTES
				|| progress_at.elapsed() >= PROGRESS_INTERVAL
				|| sent == total
			{
				let percent = (sent * 100 / total) as u8;
				let _ = events.send(OtaEvent::Progress { percent }).await;
				progress_bytes = sent;
				progress_at = Instant::now();
			}
		}

		self.scheduler.stop(&job).ok();

		log::debug!("update state: {:?}", UpdateState::Commit);
		match self.client
			.write_expedited_cancel(node, objects::firmware::ENTRY, objects::firmware::COMMIT_MAGIC, 4, PAGE_ACK_TIMEOUT, cancel)
			.await
		{
			// A target that reboots straight into the new image never acks.
			Ok(()) | Err(SdoError::Timeout) => {
				log::debug!("update state: {:?}", UpdateState::Done);
				Ok(())
			}
			Err(e) => Err(map_sdo(e)),
		}
	}
}

fn map_sdo(e: SdoError) -> UpdateError {
	match e {
		SdoError::Cancelled => UpdateError::Cancelled,
		other => UpdateError::Sdo(other),
	}
}

fn job_id(node: NodeId) -> String {
	format!("fw:{node}")
}

/// Pad a page with the flash erase value to a whole number of chunks.
fn pad_page(page: &[u8]) -> Vec<u8> {
	let mut padded = page.to_vec();
	while padded.len() % 8 != 0 {
		padded.push(0xFF);
	}
	padded
}

/// Checksum of a padded page, little-endian words through the shared CRC.
fn page_crc(padded: &[u8]) -> u32 {
	let words: Vec<u32> = padded
		.chunks_exact(4)
		.map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
		.collect();
	crc32_words(&words)
}

/// How long a page may take to stream before the engine calls it stalled.
fn stream_window(padded_len: usize) -> Duration {
	let chunks = (padded_len / 8) as u64;
	Duration::from_millis(chunks * CHUNK_PERIOD_MS * 2 + 500)
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::assert;

	#[test]
	fn cursor_chunks_and_pads() {
		let (cursor, _done) = ChunkCursor::new();
		let mut cursor = Arc::try_unwrap(cursor).unwrap().into_inner().unwrap();

		cursor.load(pad_page(&[1, 2, 3, 4, 5, 6, 7, 8, 9]));
		let first = cursor.next_chunk().unwrap();
		assert!(first.as_slice() == &[1, 2, 3, 4, 5, 6, 7, 8]);
		let second = cursor.next_chunk().unwrap();
		assert!(second.as_slice() == &[9, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
		assert!(cursor.next_chunk().is_none());
	}

	#[test]
	fn page_crc_matches_word_crc() {
		let page = pad_page(&[0, 0, 0, 0]);
		assert!(page_crc(&page) == crc32_words(&[0, 0xFFFF_FFFF]));
	}
}

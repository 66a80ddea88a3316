//! Keyed periodic frame emitters driven from the pump tick.
//!
//! The job table is shared between the pump thread (which calls
//! [`TickSource::poll`] on every iteration) and the cooperative tasks that
//! start, mutate and stop jobs. A late-running job emits once and re-anchors;
//! it never bursts to catch up and never delays other jobs beyond one tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use can_bus::{CanData, CanFrame, CanId, TickSource};

use crate::control::ControlState;
use crate::firmware::ChunkCursor;

/// The lowest accepted job period in milliseconds.
pub const MIN_PERIOD_MS: u64 = 10;

/// The highest accepted job period in milliseconds.
pub const MAX_PERIOD_MS: u64 = 10_000;

/// What a periodic job puts on the bus.
pub enum JobKind {
	/// A fixed raw payload.
	Raw(CanData),

	/// The control frame, rebuilt from the shared state on every emission.
	///
	/// The rolling counter in the state advances with each emission.
	Control(Arc<Mutex<ControlState>>),

	/// One 8-byte chunk of the current firmware page per tick.
	FirmwareChunk(Arc<Mutex<ChunkCursor>>),
}

impl std::fmt::Debug for JobKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Raw(data) => f.debug_tuple("Raw").field(data).finish(),
			Self::Control(_) => f.debug_tuple("Control").finish(),
			Self::FirmwareChunk(_) => f.debug_tuple("FirmwareChunk").finish(),
		}
	}
}

struct PeriodicJob {
	can_id: CanId,
	kind: JobKind,
	period: Duration,
	deadline: Instant,
	enabled: bool,
}

impl PeriodicJob {
	/// Build the frame for one emission, or `None` when there is nothing
	/// to emit (an exhausted firmware cursor).
	fn build_frame(&self) -> Option<CanFrame> {
		match &self.kind {
			JobKind::Raw(data) => Some(CanFrame::new(self.can_id, data).unwrap()),
			JobKind::Control(state) => {
				let mut state = state.lock().unwrap();
				let frame = CanFrame::new(self.can_id, &state.pack()).unwrap();
				state.step_counter();
				Some(frame)
			}
			JobKind::FirmwareChunk(cursor) => {
				let chunk = cursor.lock().unwrap().next_chunk()?;
				Some(CanFrame::new(self.can_id, &chunk).unwrap())
			}
		}
	}
}

/// Error starting, mutating or stopping a periodic job.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub enum ScheduleError {
	/// A job with this ID is already enabled.
	#[error("periodic job {0:?} is already running")]
	AlreadyRunning(String),

	/// No job with this ID exists.
	#[error("unknown periodic job {0:?}")]
	UnknownJob(String),

	/// The period is outside the accepted range.
	#[error("period of {period_ms} ms is out of range, valid range is {MIN_PERIOD_MS} to {MAX_PERIOD_MS} ms")]
	RateOutOfRange {
		/// The rejected period.
		period_ms: u64,
	},
}

fn check_period(period_ms: u64) -> Result<Duration, ScheduleError> {
	if (MIN_PERIOD_MS..=MAX_PERIOD_MS).contains(&period_ms) {
		Ok(Duration::from_millis(period_ms))
	} else {
		Err(ScheduleError::RateOutOfRange { period_ms })
	}
}

/// The keyed table of periodic jobs.
///
/// Cheap to clone; all clones share one table behind a map-level mutex.
#[derive(Clone)]
pub struct Scheduler {
	jobs: Arc<Mutex<HashMap<String, PeriodicJob>>>,
}

impl Scheduler {
	/// Create an empty scheduler.
	pub fn new() -> Self {
		Self {
			jobs: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Start a new periodic job. The first emission happens on the next tick.
	pub fn start(&self, job_id: &str, can_id: CanId, kind: JobKind, period_ms: u64) -> Result<(), ScheduleError> {
		let period = check_period(period_ms)?;
		let mut jobs = self.jobs.lock().unwrap();
		if jobs.get(job_id).is_some_and(|job| job.enabled) {
			return Err(ScheduleError::AlreadyRunning(job_id.into()));
		}
		log::debug!("starting periodic job {job_id:?} on {can_id} every {period_ms} ms");
		jobs.insert(job_id.into(), PeriodicJob {
			can_id,
			kind,
			period,
			deadline: Instant::now(),
			enabled: true,
		});
		Ok(())
	}

	/// Change the period of a job.
	pub fn set_period(&self, job_id: &str, period_ms: u64) -> Result<(), ScheduleError> {
		let period = check_period(period_ms)?;
		let mut jobs = self.jobs.lock().unwrap();
		let job = jobs.get_mut(job_id).ok_or_else(|| ScheduleError::UnknownJob(job_id.into()))?;
		job.period = period;
		Ok(())
	}

	/// Replace the payload of a raw job.
	pub fn set_raw_data(&self, job_id: &str, data: CanData) -> Result<(), ScheduleError> {
		let mut jobs = self.jobs.lock().unwrap();
		match jobs.get_mut(job_id) {
			Some(job @ PeriodicJob { kind: JobKind::Raw(_), .. }) => {
				job.kind = JobKind::Raw(data);
				Ok(())
			}
			_ => Err(ScheduleError::UnknownJob(job_id.into())),
		}
	}

	/// Stop and remove a job.
	pub fn stop(&self, job_id: &str) -> Result<(), ScheduleError> {
		let mut jobs = self.jobs.lock().unwrap();
		if jobs.remove(job_id).is_none() {
			return Err(ScheduleError::UnknownJob(job_id.into()));
		}
		log::debug!("stopped periodic job {job_id:?}");
		Ok(())
	}

	/// Stop every job, or only those whose ID starts with `pattern`.
	pub fn stop_all(&self, pattern: Option<&str>) {
		let mut jobs = self.jobs.lock().unwrap();
		match pattern {
			None => jobs.clear(),
			Some(prefix) => jobs.retain(|id, _| !id.starts_with(prefix)),
		}
	}

	/// Whether a job with this ID is currently enabled.
	pub fn is_running(&self, job_id: &str) -> bool {
		self.jobs.lock().unwrap().get(job_id).is_some_and(|job| job.enabled)
	}
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

impl TickSource for Scheduler {
	fn poll(&mut self, now: Instant, out: &mut Vec<CanFrame>) {
		let mut jobs = self.jobs.lock().unwrap();
		for job in jobs.values_mut().filter(|job| job.enabled) {
			if job.deadline > now {
				continue;
			}
			if let Some(frame) = job.build_frame() {
				out.push(frame);
			}
			job.deadline += job.period;
			if job.deadline <= now {
				// Late: emit once and re-anchor, no catch-up burst.
				job.deadline = now + job.period;
			}
		}
	}
}

impl std::fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scheduler")
			.field("jobs", &self.jobs.lock().unwrap().len())
			.finish()
	}
}

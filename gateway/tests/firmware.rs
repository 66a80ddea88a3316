//! Firmware update engine against the simulated node.

mod util;

use assert2::{assert, let_assert};
use openinverter_gateway::firmware::{FirmwareUpdater, OtaEvent, UpdateError};
use openinverter_gateway::{CancelToken, NodeId};
use tokio::sync::mpsc;
use util::{rig, spawn_node, SimNode};

fn image() -> Vec<u8> {
	(0..1024u32).map(|i| (i % 251) as u8).collect()
}

fn drain(events: &mut mpsc::Receiver<OtaEvent>) -> Vec<OtaEvent> {
	let mut out = Vec::new();
	while let Ok(event) = events.try_recv() {
		out.push(event);
	}
	out
}

#[tokio::test]
async fn page_crc_mismatch_is_retransmitted() {
	let (bus, core, _store) = rig();
	let mut sim = SimNode::new(1, 1);
	// The first acknowledgement of page 0 reports a checksum mismatch.
	sim.fail_crc.insert(0, 1);
	let sim = spawn_node(&bus, sim);

	let updater = FirmwareUpdater::new(core.sdo().clone(), core.scheduler().clone());
	let (tx, mut rx) = mpsc::channel(64);
	let image = image();
	updater
		.run(NodeId::new(1).unwrap(), &image, 256, &tx, &CancelToken::new())
		.await
		.unwrap();

	// The retransmitted page made it to flash intact.
	assert!(sim.flash.lock().unwrap().as_slice() == image.as_slice());

	let events = drain(&mut rx);
	assert!(events.last() == Some(&OtaEvent::Success));
	assert!(events.contains(&OtaEvent::Progress { percent: 100 }));

	core.shutdown();
}

#[tokio::test]
async fn three_consecutive_mismatches_fail_the_update() {
	let (bus, core, _store) = rig();
	let mut sim = SimNode::new(1, 1);
	sim.fail_crc.insert(0, 3);
	let sim = spawn_node(&bus, sim);

	let updater = FirmwareUpdater::new(core.sdo().clone(), core.scheduler().clone());
	let (tx, mut rx) = mpsc::channel(64);
	let result = updater
		.run(NodeId::new(1).unwrap(), &image(), 256, &tx, &CancelToken::new())
		.await;

	let_assert!(Err(UpdateError::PageCrc { page: 0 }) = result);
	assert!(sim.flash.lock().unwrap().is_empty());

	let events = drain(&mut rx);
	assert!(events.last() == Some(&OtaEvent::Error { reason: "Crc".into() }));
	// Failure leaves the scheduler clean.
	assert!(!core.scheduler().is_running("fw:1"));

	core.shutdown();
}

#[tokio::test]
async fn cancel_stops_the_update() {
	let (bus, core, _store) = rig();
	let _sim = spawn_node(&bus, SimNode::new(1, 1));

	let updater = FirmwareUpdater::new(core.sdo().clone(), core.scheduler().clone());
	let (tx, mut rx) = mpsc::channel(64);
	let cancel = CancelToken::new();
	let task = {
		let updater = updater.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			updater.run(NodeId::new(1).unwrap(), &image(), 256, &tx, &cancel).await
		})
	};
	tokio::time::sleep(std::time::Duration::from_millis(100)).await;
	cancel.cancel();

	let_assert!(Err(UpdateError::Cancelled) = task.await.unwrap());
	let events = drain(&mut rx);
	assert!(events.last() == Some(&OtaEvent::Error { reason: "Cancelled".into() }));
	assert!(!core.scheduler().is_running("fw:1"));

	core.shutdown();
}

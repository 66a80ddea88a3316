//! SDO transactor behavior against a simulated inverter node.

mod util;

use std::time::{Duration, Instant};

use assert2::{assert, let_assert};
use openinverter_gateway::sdo::SdoError;
use openinverter_gateway::{objects, CancelToken, NodeId};
use util::{rig, spawn_node, SimNode};

const TIMEOUT: Duration = Duration::from_millis(200);

fn node(id: u8) -> NodeId {
	NodeId::new(id).unwrap()
}

#[tokio::test]
async fn expedited_read_returns_the_value() {
	let (bus, core, _store) = rig();
	let _sim = spawn_node(&bus, SimNode::new(1, 0x2A));

	let value = core.sdo().read_expedited(node(1), objects::SERIAL_NUMBER, TIMEOUT).await.unwrap();
	assert!(value == 0x2A);

	core.shutdown();
}

#[tokio::test]
async fn missing_object_aborts_the_transfer() {
	let (bus, core, _store) = rig();
	let _sim = spawn_node(&bus, SimNode::new(1, 0x2A));

	let result = core.sdo().read_expedited(node(1), objects::param(99), TIMEOUT).await;
	let_assert!(Err(SdoError::TransferAborted(aborted)) = result);
	assert!(aborted.code() == 0x0602_0000);

	core.shutdown();
}

#[tokio::test]
async fn silent_node_times_out() {
	let (_bus, core, _store) = rig();

	let result = core.sdo().read_expedited(node(9), objects::SERIAL_NUMBER, Duration::from_millis(50)).await;
	let_assert!(Err(SdoError::Timeout) = result);

	core.shutdown();
}

#[tokio::test]
async fn segmented_read_reassembles_the_error_log() {
	let (bus, core, _store) = rig();
	let mut sim = SimNode::new(1, 0x2A);
	sim.error_log = "overvoltage\nundervoltage";
	let _sim = spawn_node(&bus, sim);

	let bytes = core.sdo().read_segmented(node(1), objects::ERROR_LOG, TIMEOUT).await.unwrap();
	assert!(bytes == b"overvoltage\nundervoltage");

	core.shutdown();
}

#[tokio::test]
async fn write_then_read_round_trips() {
	let (bus, core, _store) = rig();
	let mut sim = SimNode::new(1, 0x2A);
	sim.params.insert(17, 0);
	let sim = spawn_node(&bus, sim);

	core.sdo().write_expedited(node(1), objects::param(17), 3000, 4, TIMEOUT).await.unwrap();
	assert!(sim.params.lock().unwrap()[&17] == 3000);

	let value = core.sdo().read_expedited(node(1), objects::param(17), TIMEOUT).await.unwrap();
	assert!(value == 3000);

	core.shutdown();
}

#[tokio::test]
async fn invalid_write_length_is_rejected() {
	let (_bus, core, _store) = rig();

	let result = core.sdo().write_expedited(node(1), objects::param(1), 1, 3, TIMEOUT).await;
	let_assert!(Err(SdoError::InvalidValueLength(_)) = result);

	core.shutdown();
}

#[tokio::test]
async fn requests_to_different_nodes_run_in_parallel() {
	let (bus, core, _store) = rig();
	let mut slow = SimNode::new(1, 1);
	slow.delay = Duration::from_millis(60);
	let _slow = spawn_node(&bus, slow);
	let _fast = spawn_node(&bus, SimNode::new(2, 2));

	let client = core.sdo().clone();
	let slow_read = {
		let client = client.clone();
		async move {
			let started = Instant::now();
			let result = client.read_expedited(node(1), objects::SERIAL_NUMBER, TIMEOUT).await;
			(result, started.elapsed())
		}
	};
	let fast_read = {
		let client = client.clone();
		async move {
			let started = Instant::now();
			let result = client.read_expedited(node(2), objects::SERIAL_NUMBER, TIMEOUT).await;
			(result, started.elapsed())
		}
	};

	let ((slow_result, slow_elapsed), (fast_result, fast_elapsed)) = tokio::join!(slow_read, fast_read);
	assert!(slow_result.unwrap() == 1);
	assert!(fast_result.unwrap() == 2);
	// The pending request to node 1 must not delay node 2.
	assert!(fast_elapsed < Duration::from_millis(50));
	assert!(slow_elapsed >= Duration::from_millis(60));

	core.shutdown();
}

#[tokio::test]
async fn cancelled_transfer_does_not_poison_the_next_one() {
	let (bus, core, _store) = rig();
	let mut sim = SimNode::new(1, 0xBEEF);
	sim.delay = Duration::from_millis(50);
	sim.params.insert(17, 3000);
	let _sim = spawn_node(&bus, sim);

	let cancel = CancelToken::new();
	let client = core.sdo().clone();
	let pending = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			client
				.read_expedited_cancel(node(1), objects::SERIAL_NUMBER, Duration::from_millis(500), &cancel)
				.await
		})
	};
	tokio::time::sleep(Duration::from_millis(10)).await;
	cancel.cancel();
	let_assert!(Err(SdoError::Cancelled) = pending.await.unwrap());

	// The stale serial response arrives mid-transaction and must not be
	// taken as the answer for a different object.
	let value = client.read_expedited(node(1), objects::param(17), Duration::from_millis(500)).await.unwrap();
	assert!(value == 3000);

	core.shutdown();
}

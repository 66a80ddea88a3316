//! Broker action dispatch end to end.

mod util;

use std::time::Duration;

use assert2::{assert, let_assert};
use openinverter_gateway::broker::{Action, Event};
use openinverter_gateway::store::{keys, Store};
use tokio::sync::mpsc;
use util::{collect_frames, monitor, rig, spawn_node, SimNode};

/// Receive events until one matches, skipping interleaved stream events.
async fn recv_matching(
	events: &mut mpsc::Receiver<Event>,
	mut predicate: impl FnMut(&Event) -> bool,
) -> Event {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	loop {
		let event = tokio::time::timeout_at(deadline, events.recv())
			.await
			.expect("timed out waiting for an event")
			.expect("event stream closed");
		if predicate(&event) {
			return event;
		}
	}
}

fn sim() -> SimNode {
	let mut sim = SimNode::new(1, 0xBEEF);
	sim.params.insert(17, 1500);
	sim.error_log = "overvoltage\nundervoltage";
	sim
}

#[tokio::test]
async fn parameter_actions_require_a_connection() {
	let (_bus, core, _store) = rig();
	let (session, mut events) = core.broker().register_session();

	core.broker().dispatch(session, Action::UpdateParam { param_id: 17, value: 1 }).await;
	let event = recv_matching(&mut events, |e| matches!(e, Event::ParamUpdateError { .. })).await;
	let_assert!(Event::ParamUpdateError { param_id: 17, error, .. } = event);
	assert!(error.contains("not connected"));

	core.shutdown();
}

#[tokio::test]
async fn connect_and_parameter_flow() {
	let (bus, core, _store) = rig();
	let sim_handle = spawn_node(&bus, sim());
	let (session, mut events) = core.broker().register_session();

	core.broker().dispatch(session, Action::Connect { serial: None, node_id: 1 }).await;
	let_assert!(
		Event::Connected { node_id: 1, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::Connected { .. })).await
	);

	core.broker().dispatch(session, Action::UpdateParam { param_id: 17, value: 3000 }).await;
	let_assert!(
		Event::ParamUpdateSuccess { param_id: 17, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::ParamUpdateSuccess { .. })).await
	);
	assert!(sim_handle.params.lock().unwrap()[&17] == 3000);

	core.broker().dispatch(session, Action::ReadParam { param_id: 17 }).await;
	let_assert!(
		Event::ParamValue { value: 3000, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::ParamValue { .. })).await
	);

	core.broker().dispatch(session, Action::ListErrors).await;
	let_assert!(
		Event::ListErrorsSuccess { errors, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::ListErrorsSuccess { .. })).await
	);
	assert!(errors == ["overvoltage", "undervoltage"]);

	core.broker().dispatch(session, Action::SaveToFlash).await;
	recv_matching(&mut events, |e| matches!(e, Event::SaveToFlashSuccess { .. })).await;

	core.broker().dispatch(session, Action::GetNodeId).await;
	let_assert!(
		Event::NodeIdInfo { node_id: 1, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::NodeIdInfo { .. })).await
	);

	core.broker().dispatch(session, Action::Disconnect).await;
	recv_matching(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;

	core.shutdown();
}

#[tokio::test]
async fn spot_values_stream_until_stopped() {
	let (bus, core, _store) = rig();
	let _sim = spawn_node(&bus, sim());
	let (session, mut events) = core.broker().register_session();

	core.broker().dispatch(session, Action::Connect { serial: None, node_id: 1 }).await;
	recv_matching(&mut events, |e| matches!(e, Event::Connected { .. })).await;

	core.broker()
		.dispatch(session, Action::StartSpotValues { param_ids: vec![17], interval_ms: 100 })
		.await;
	recv_matching(&mut events, |e| e == &Event::SpotValuesStatus { active: true }).await;

	let_assert!(
		Event::SpotValues { values, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::SpotValues { .. })).await
	);
	assert!(values.len() == 1);
	assert!(values[0].param_id == 17);
	assert!(values[0].value == Some(1500));

	core.broker().dispatch(session, Action::StopSpotValues).await;
	recv_matching(&mut events, |e| e == &Event::SpotValuesStatus { active: false }).await;

	core.shutdown();
}

#[tokio::test]
async fn control_frame_interval_emits_packed_frames() {
	let (bus, core, _store) = rig();
	let watch = monitor(&bus);
	let (session, mut events) = core.broker().register_session();

	core.broker()
		.dispatch(session, Action::StartCanIoInterval {
			can_id: None,
			pot: 0x800,
			pot2: 0x400,
			canio: 0x0A,
			cruisespeed: 0x1234,
			regenpreset: 0x20,
			interval: 20,
			use_crc: true,
		})
		.await;
	recv_matching(&mut events, |e| e == &Event::CanIoIntervalStatus { active: true }).await;

	let frames = collect_frames(watch, 0x3F, Duration::from_millis(150)).await;
	assert!(frames.len() >= 2);
	// First emission carries counter 0 and the S3 field values.
	assert!(frames[0].data()[..3] == [0x00, 0x08, 0x40]);
	assert!(frames[0].data()[3] >> 6 == 0);
	assert!(frames[1].data()[3] >> 6 == 1);

	core.broker()
		.dispatch(session, Action::UpdateCanIoFlags {
			pot: Some(0x900),
			pot2: None,
			canio: None,
			cruisespeed: None,
			regenpreset: None,
		})
		.await;
	recv_matching(&mut events, |e| e == &Event::CanIoIntervalStatus { active: true }).await;

	let watch = monitor(&bus);
	let frames = collect_frames(watch, 0x3F, Duration::from_millis(100)).await;
	assert!(!frames.is_empty());
	assert!(frames.iter().all(|frame| frame.data()[1] & 0x0F == 0x09));

	core.broker().dispatch(session, Action::StopCanIoInterval).await;
	recv_matching(&mut events, |e| e == &Event::CanIoIntervalStatus { active: false }).await;

	core.shutdown();
}

#[tokio::test]
async fn raw_intervals_are_persisted_while_running() {
	let (bus, core, store) = rig();
	let watch = monitor(&bus);
	let (session, mut events) = core.broker().register_session();

	core.broker()
		.dispatch(session, Action::StartCanInterval {
			interval_id: "x".into(),
			can_id: 0x123,
			data: vec![1, 2, 3],
			interval: 50,
		})
		.await;
	let_assert!(
		Event::CanIntervalStatus { active: true, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::CanIntervalStatus { .. })).await
	);
	assert!(store.get(&keys::periodic("x")).is_some());

	let frames = collect_frames(watch, 0x123, Duration::from_millis(150)).await;
	assert!(frames.len() >= 2);
	assert!(frames[0].data() == &[1, 2, 3]);

	core.broker().dispatch(session, Action::StopCanInterval { interval_id: "x".into() }).await;
	let_assert!(
		Event::CanIntervalStatus { active: false, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::CanIntervalStatus { .. })).await
	);
	assert!(store.get(&keys::periodic("x")).is_none());

	core.shutdown();
}

#[tokio::test]
async fn single_frames_and_invalid_ids() {
	let (bus, core, _store) = rig();
	let watch = monitor(&bus);
	let (session, mut events) = core.broker().register_session();

	core.broker()
		.dispatch(session, Action::SendCanMessage { can_id: 0x100, data: vec![0xAA, 0xBB] })
		.await;
	recv_matching(&mut events, |e| matches!(e, Event::CanMessageSent { .. })).await;
	let frames = collect_frames(watch, 0x100, Duration::from_millis(100)).await;
	assert!(frames.len() == 1);
	assert!(frames[0].data() == &[0xAA, 0xBB]);

	// 0x800 is out of the 11-bit range.
	core.broker()
		.dispatch(session, Action::SendCanMessage { can_id: 0x800, data: vec![] })
		.await;
	let_assert!(
		Event::ActionError { error, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::ActionError { .. })).await
	);
	assert!(error.contains("invalid frame"));

	core.shutdown();
}

#[tokio::test]
async fn device_catalog_actions() {
	let (_bus, core, _store) = rig();
	let (session, mut events) = core.broker().register_session();

	core.broker()
		.dispatch(session, Action::SetDeviceName {
			serial: "0000BEEF".into(),
			name: "garage inverter".into(),
			node_id: Some(1),
		})
		.await;
	recv_matching(&mut events, |e| matches!(e, Event::DeviceNameSet { .. })).await;
	let_assert!(
		Event::SavedDevices { devices } =
			recv_matching(&mut events, |e| matches!(e, Event::SavedDevices { .. })).await
	);
	assert!(devices.len() == 1);
	assert!(devices[0].name.as_deref() == Some("garage inverter"));

	core.broker()
		.dispatch(session, Action::RenameDevice { serial: "0000BEEF".into(), name: "shed inverter".into() })
		.await;
	let_assert!(
		Event::DeviceRenamed { name, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::DeviceRenamed { .. })).await
	);
	assert!(name == "shed inverter");
	recv_matching(&mut events, |e| matches!(e, Event::SavedDevices { .. })).await;

	core.broker()
		.dispatch(session, Action::RenameDevice { serial: "missing".into(), name: "x".into() })
		.await;
	recv_matching(&mut events, |e| matches!(e, Event::ActionError { .. })).await;

	core.broker().dispatch(session, Action::DeleteDevice { serial: "0000BEEF".into() }).await;
	recv_matching(&mut events, |e| matches!(e, Event::DeviceDeleted { .. })).await;
	let_assert!(
		Event::SavedDevices { devices } =
			recv_matching(&mut events, |e| matches!(e, Event::SavedDevices { .. })).await
	);
	assert!(devices.is_empty());

	core.shutdown();
}

#[tokio::test]
async fn unknown_actions_get_an_error_event() {
	let (_bus, core, _store) = rig();
	let (session, mut events) = core.broker().register_session();

	core.broker().dispatch_json(session, r#"{"action": "formatFlash"}"#).await;
	let_assert!(
		Event::ActionError { error, .. } =
			recv_matching(&mut events, |e| matches!(e, Event::ActionError { .. })).await
	);
	assert!(error.contains("unrecognised action"));

	core.shutdown();
}

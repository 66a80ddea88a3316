//! Scanner behavior through the broker surface.

mod util;

use std::time::Duration;

use assert2::{assert, let_assert};
use openinverter_gateway::broker::{Action, Event};
use tokio::sync::mpsc;
use util::{rig, spawn_node, SimNode};

async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
	tokio::time::timeout(Duration::from_secs(2), events.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("event stream closed")
}

#[tokio::test]
async fn scan_reports_only_responding_nodes() {
	let (bus, core, _store) = rig();
	let _sim = spawn_node(&bus, SimNode::new(2, 0x1234));

	let (session, mut events) = core.broker().register_session();
	core.broker().dispatch(session, Action::StartScan { start: Some(1), end: Some(3) }).await;

	let mut seen = Vec::new();
	loop {
		let event = next_event(&mut events).await;
		let done = event == Event::ScanStatus { active: false };
		seen.push(event);
		if done {
			break;
		}
	}

	assert!(seen.first() == Some(&Event::ScanStatus { active: true }));
	let discovered: Vec<_> = seen
		.iter()
		.filter_map(|event| match event {
			Event::DeviceDiscovered { node_id, serial, .. } => Some((*node_id, serial.clone())),
			_ => None,
		})
		.collect();
	assert!(discovered == [(2, "00001234".to_string())]);

	core.shutdown();
}

#[tokio::test]
async fn stop_scan_terminates_early() {
	let (_bus, core, _store) = rig();

	let (session, mut events) = core.broker().register_session();
	core.broker().dispatch(session, Action::StartScan { start: Some(1), end: Some(120) }).await;
	let_assert!(Event::ScanStatus { active: true } = next_event(&mut events).await);

	core.broker().dispatch(session, Action::StopScan).await;
	let_assert!(Event::ScanStatus { active: false } = next_event(&mut events).await);

	core.shutdown();
}

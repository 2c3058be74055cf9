//! The publication protocol against a live (and a stalled) worker.

mod common;

use std::{thread, time::Duration};

use common::{chain, device, function, module, name, pipeline, zone_with_workers};
use weir_cp::{ControlPlane, Worker};

#[test]
fn stalled_worker_pins_its_generation() {
	let (zone, cp) = zone_with_workers(1);
	let cp2 = ControlPlane::attach(&zone).unwrap();
	let mut worker = Worker::new(&cp, 0);

	// Phase one: a controller thread installs the initial configuration
	// while this thread pumps the worker's advertisement.
	let controller = thread::spawn(move || {
		let agent = cp2.agent("ctrl").unwrap();
		agent.update_modules(&[module("balancer", "b0")]).unwrap();
		agent
			.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
			.unwrap();
		agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
		agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
		agent
			.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
			.unwrap();
		(cp2, agent)
	});

	loop {
		let snap = worker.enter();
		let number = snap.number();
		drop(snap);
		if number == 5 {
			break;
		}
		thread::sleep(Duration::from_millis(1));
	}
	let (cp2, agent) = controller.join().unwrap();

	// Phase two: pin the worker on generation five and start an update.
	let snapshot = worker.enter();
	assert_eq!(snapshot.number(), 5);
	let free_before = cp.ctx().free_bytes();

	let mutator = thread::spawn(move || {
		agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
		cp2
	});

	// The new generation publishes immediately; the mutator then blocks
	// in the quiescence wait behind our stalled advertisement.
	thread::sleep(Duration::from_millis(50));
	assert_eq!(cp.generation_number(), 6);
	assert!(!mutator.is_finished(), "mutator must wait for the worker");

	// The pinned snapshot stays fully intact underneath the wait.
	assert_eq!(snapshot.number(), 5);
	assert!(
		snapshot
			.config_gen()
			.lookup_pipeline_ref(&name("p0"))
			.is_some()
	);
	let dev = snapshot.ectx().device(0).expect("device subtree");
	assert_eq!(
		dev.input()
			.map_slot(0)
			.unwrap()
			.pipeline()
			.name()
			.as_str(),
		"p0"
	);

	// Releasing the worker unblocks the mutator within bounded steps.
	drop(snapshot);
	let snapshot = worker.enter();
	assert_eq!(snapshot.number(), 6);
	let _cp2 = mutator.join().unwrap();

	// The retired generation returned its memory: a structurally
	// identical swap nets out to zero.
	drop(snapshot);
	assert_eq!(cp.ctx().free_bytes(), free_before);
}

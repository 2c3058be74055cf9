//! Counter identity across configuration updates.

mod common;

use core::sync::atomic::Ordering::Relaxed;

use common::{chain, device, function, module, name, pipeline, zone};
use weir_cp::counter::CounterPath;

/// Installs the canonical b0/f0/p0 stack on device 01:00.0.
fn stack(agent: &weir_cp::Agent) {
	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
		.unwrap();
}

fn module_path() -> CounterPath {
	CounterPath::module(
		name("01:00.0"),
		name("p0"),
		name("f0"),
		name("c0"),
		name("balancer"),
		name("b0"),
	)
}

#[test]
fn counters_survive_structurally_identical_updates() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	stack(&agent);

	// A worker bumps b0's receive counter out-of-band.
	cp.with_active(|g| {
		let storage = g.lookup_storage_ref(module_path()).expect("module path bound");
		storage.values_by_name(&name("rx_packets")).unwrap()[0].fetch_add(42, Relaxed);
	});

	// Re-installing the same pipeline structure spawns fresh storages
	// that carry the numeric identity forward.
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	cp.with_active(|g| {
		let storage = g.lookup_storage_ref(module_path()).expect("path survives");
		assert_eq!(
			storage.values_by_name(&name("rx_packets")).unwrap()[0].load(Relaxed),
			42
		);
	});

	// Same through a module replacement with identical declarations.
	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	cp.with_active(|g| {
		let storage = g.lookup_storage_ref(module_path()).expect("path survives");
		assert_eq!(
			storage.values_by_name(&name("rx_packets")).unwrap()[0].load(Relaxed),
			42
		);
	});
}

#[test]
fn every_path_flavor_gets_exactly_one_storage() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	stack(&agent);

	cp.with_active(|g| {
		let dev = name("01:00.0");
		assert!(g.lookup_storage_ref(CounterPath::device(dev)).is_some());

		let pl = g
			.lookup_storage_ref(CounterPath::pipeline(dev, name("p0")))
			.expect("pipeline path bound");
		// The canonical pipeline counters, histogram included.
		assert_eq!(pl.values_by_name(&name("input")).unwrap().len(), 1);
		assert_eq!(pl.values_by_name(&name("input_hist")).unwrap().len(), 8);

		assert!(
			g.lookup_storage_ref(CounterPath::function(dev, name("p0"), name("f0")))
				.is_some()
		);
		assert!(
			g.lookup_storage_ref(CounterPath::chain(dev, name("p0"), name("f0"), name("c0")))
				.is_some()
		);
		assert!(g.lookup_storage_ref(module_path()).is_some());

		// No storage for paths that do not exist in the generation.
		assert!(
			g.lookup_storage_ref(CounterPath::pipeline(dev, name("ghost")))
				.is_none()
		);
	});
}

#[test]
fn device_counters_keep_values_across_device_updates() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	stack(&agent);

	let path = CounterPath::device(name("01:00.0"));
	cp.with_active(|g| {
		let storage = g.lookup_storage_ref(path).unwrap();
		storage.values_by_name(&name("rx")).unwrap()[0].store(7, Relaxed);
	});

	agent
		.update_devices(&[device("01:00.0", &[("p0", 2)], &[("dummy", 1)])])
		.unwrap();
	cp.with_active(|g| {
		let storage = g.lookup_storage_ref(path).unwrap();
		assert_eq!(storage.values_by_name(&name("rx")).unwrap()[0].load(Relaxed), 7);
	});
}

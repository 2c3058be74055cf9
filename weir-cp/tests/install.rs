//! Build-and-install scenarios over a fresh zone.

mod common;

use common::{chain, device, function, module, name, pipeline, zone};
use weir_cp::Error;

#[test]
fn minimal_config_builds_and_installs() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	assert_eq!(cp.generation_number(), 0);

	// Module first; it lands at slot zero of a grown registry.
	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	assert_eq!(cp.generation_number(), 1);
	cp.with_active(|g| {
		assert!(g.module_capacity() >= 1);
		let m = g
			.lookup_module_ref(&name("balancer"), &name("b0"))
			.expect("b0 registered");
		assert_eq!(m.name().as_str(), "b0");
		let first = g.get_module(0).expect("slot zero occupied");
		// SAFETY: Registered modules are live while the lock is held.
		assert_eq!(unsafe { first.as_ref() }.name().as_str(), "b0");
	});

	agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	assert_eq!(cp.generation_number(), 3);

	// A device referencing an absent pipeline must not install.
	let err = agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
		.unwrap_err();
	assert!(matches!(err, Error::NotFound { .. }));
	assert_eq!(cp.generation_number(), 3, "failed install leaves the generation");

	agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
		.unwrap();
	assert_eq!(cp.generation_number(), 5);

	cp.with_active(|g| {
		let ectx = g.ectx_ref().expect("installed generation carries its ectx");
		let dev = ectx.device(0).expect("device subtree at slot zero");
		assert_eq!(dev.device().name().as_str(), "01:00.0");

		// The input weight map resolves straight to p0's subtree.
		let pl = dev.input().map_slot(0).expect("input map populated");
		assert_eq!(pl.pipeline().name().as_str(), "p0");
		assert_eq!(pl.function_count(), 1);

		// Any hash lands on the single output pipeline.
		let out = dev.output().select_pipeline(0xDEAD_BEEF).unwrap();
		assert_eq!(out.pipeline().name().as_str(), "dummy");
	});
}

#[test]
fn try_exclusive_reports_contention() {
	let (_zone, cp) = zone();

	let held = cp.try_exclusive().unwrap();
	assert!(matches!(cp.try_exclusive(), Err(Error::LockContention)));
	drop(held);
	assert!(cp.try_exclusive().is_ok());
}

#[test]
fn generation_number_counts_installs() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	agent.update_modules(&[module("nat64", "n0")]).unwrap();
	agent.update_functions(&[function("f0", vec![])]).unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	assert_eq!(cp.generation_number(), 4);
}

#[test]
fn weight_expansion_orders_the_chain_map() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	agent
		.update_functions(&[function(
			"f0",
			vec![
				chain("c0", &[("balancer", "b0")], 3),
				chain("c1", &[("balancer", "b0")], 1),
			],
		)])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("p0", 1)])])
		.unwrap();

	cp.with_active(|g| {
		let f = g
			.ectx_ref()
			.unwrap()
			.device(0)
			.unwrap()
			.input()
			.map_slot(0)
			.unwrap()
			.function(0)
			.expect("stage zero");

		assert_eq!(f.chain_map_size(), 4);
		let weight_sum: u64 = f.function().chains().iter().map(|s| s.weight).sum();
		assert_eq!(weight_sum, f.chain_map_size());

		let names: Vec<String> = (0..4)
			.map(|k| f.map_slot(k).unwrap().chain().name().as_str().to_string())
			.collect();
		assert_eq!(names, ["c0", "c0", "c0", "c1"].map(str::to_string));

		// Selection is a single modulo into the map.
		assert_eq!(f.select_chain(5).unwrap().chain().name().as_str(), "c0");
		assert_eq!(f.select_chain(7).unwrap().chain().name().as_str(), "c1");
	});
}

#[test]
fn empty_function_is_installable() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_functions(&[function("f_empty", vec![])]).unwrap();
	agent
		.update_pipelines(&[pipeline("p0", &["f_empty"])])
		.unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("p0", 1)])])
		.unwrap();

	cp.with_active(|g| {
		let f = g
			.ectx_ref()
			.unwrap()
			.device(0)
			.unwrap()
			.input()
			.map_slot(0)
			.unwrap()
			.function(0)
			.unwrap();
		assert_eq!(f.chain_map_size(), 0);
		assert!(f.select_chain(0).is_none());
	});
}

#[test]
fn module_cross_indices_match_by_name() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	let mut b0 = module("balancer", "b0");
	b0.devices = vec!["02:00.0".into(), "01:00.0".into(), "03:00.0".into()];
	agent.update_modules(&[b0]).unwrap();
	agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
	agent
		.update_devices(&[
			device("01:00.0", &[("p0", 1)], &[("dummy", 1)]),
			device("02:00.0", &[("p0", 1)], &[("dummy", 1)]),
		])
		.unwrap();

	cp.with_active(|g| {
		let ectx = g.ectx_ref().unwrap();
		let m = ectx
			.device(0)
			.unwrap()
			.input()
			.map_slot(0)
			.unwrap()
			.function(0)
			.unwrap()
			.chain(0)
			.unwrap()
			.module(0)
			.expect("module node");

		// Declared devices: 02:00.0 sits at generation slot 1, 01:00.0 at
		// slot 0, and 03:00.0 is absent.
		assert_eq!(m.mc_index(), &[1, 0, -1]);
		// Generation devices: slot 0 is 01:00.0 (declared slot 1), slot 1
		// is 02:00.0 (declared slot 0).
		assert_eq!(m.cm_index(), &[1, 0]);
		assert_eq!(m.device_slot(0), 1);
		assert_eq!(m.device_slot(1), 0);

		// Walking back up recovers the generation that was installed.
		assert_eq!(m.gen_ectx().number(), g.number());
		assert_eq!(m.gen_ectx().config_gen(), cp.active());
	});
}

//! Referential integrity, deletion semantics and soft retirement.

mod common;

use common::{chain, device, function, module, name, pipeline, zone};
use weir_cp::{Error, drain_diags};

#[test]
fn delete_respects_back_references() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	let installed = cp.generation_number();

	// b0 is reachable through p0 -> f0 -> c0, so the delete is refused
	// and the active generation is untouched.
	let err = agent.delete_module("balancer", "b0").unwrap_err();
	assert!(matches!(err, Error::InUse { .. }));
	assert_eq!(cp.generation_number(), installed);

	// Dropping the pipeline severs the only packet-time route to b0;
	// the function may keep its dangling-by-name chain reference.
	agent.delete_pipeline("p0").unwrap();
	agent.delete_module("balancer", "b0").unwrap();

	cp.with_active(|g| {
		assert!(g.lookup_module_ref(&name("balancer"), &name("b0")).is_none());
		assert!(g.lookup_pipeline_ref(&name("p0")).is_none());
		assert!(g.lookup_function_ref(&name("f0")).is_some());
	});
}

#[test]
fn deleted_module_lands_on_the_agents_unused_list() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	assert_eq!(agent.unused_count(), 0);

	agent.delete_module("balancer", "b0").unwrap();

	// Not returned to the allocator: observable on the unused list until
	// the owning agent tears down.
	assert_eq!(agent.unused_count(), 1);
	assert!(agent.unused_contains("balancer", "b0"));

	agent.detach().unwrap();
}

#[test]
fn detach_is_refused_while_modules_are_live() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	agent.update_modules(&[module("balancer", "b0")]).unwrap();

	let err = agent.detach().unwrap_err();
	assert!(matches!(err, Error::InUse { .. }));

	// The record persists; re-attach, clear the module, then tear down.
	let agent = cp.agent("agent-a").unwrap();
	agent.delete_module("balancer", "b0").unwrap();
	agent.detach().unwrap();
}

#[test]
fn deletes_of_missing_keys_fail() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	assert!(matches!(
		agent.delete_pipeline("ghost"),
		Err(Error::Duplicate { .. })
	));
	assert!(matches!(
		agent.delete_function("ghost"),
		Err(Error::Duplicate { .. })
	));
	assert!(matches!(
		agent.delete_module("balancer", "ghost"),
		Err(Error::Duplicate { .. })
	));
	assert_eq!(cp.generation_number(), 0);
}

#[test]
fn dangling_references_abort_the_whole_generation() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	// Pipelines validate their functions at build time.
	let err = agent
		.update_pipelines(&[pipeline("p0", &["missing"])])
		.unwrap_err();
	assert!(matches!(err, Error::NotFound { .. }));
	assert_eq!(cp.generation_number(), 0);

	// Chain-to-module references resolve at execution-context build; a
	// miss aborts the install of an otherwise valid mutation.
	agent.update_functions(&[function("f0", vec![])]).unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
		.unwrap();
	let installed = cp.generation_number();

	let err = agent
		.update_functions(&[function(
			"f0",
			vec![chain("c0", &[("balancer", "ghost")], 1)],
		)])
		.unwrap_err();
	assert!(matches!(err, Error::NotFound { .. }));
	assert_eq!(cp.generation_number(), installed);
	cp.with_active(|g| {
		// The failed step left the previous function version in place.
		let f = g.lookup_function_ref(&name("f0")).unwrap();
		assert_eq!(f.chains().len(), 0);
	});
}

#[test]
fn failures_push_structured_diagnostics() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();
	drop(drain_diags());

	let _ = agent.update_modules(&[module("firewall", "fw0")]);
	let diags = drain_diags();
	assert_eq!(diags.len(), 1);
	assert_eq!(diags[0].op, "update_modules");
	assert!(diags[0].detail.contains("firewall"));
}

#[test]
fn zero_weights_are_rejected() {
	let (_zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	let err = agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 0)])])
		.unwrap_err();
	assert!(matches!(err, Error::InvalidWeight { .. }));

	agent.update_functions(&[function("f0", vec![])]).unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	let err = agent
		.update_devices(&[device("01:00.0", &[("p0", 0)], &[("p0", 1)])])
		.unwrap_err();
	assert!(matches!(err, Error::InvalidWeight { .. }));
}

//! Offset-pointer validity across two mappings of one zone.

mod common;

use core::sync::atomic::Ordering::Relaxed;

use common::{ZONE_LEN, chain, device, function, module, name, pipeline, zone};
use weir_cp::{ControlPlane, counter::CounterPath};

#[test]
fn zone_reads_identically_through_a_second_mapping() {
	let (zone, cp) = zone();
	let agent = cp.agent("agent-a").unwrap();

	agent.update_modules(&[module("balancer", "b0")]).unwrap();
	agent
		.update_functions(&[function("f0", vec![chain("c0", &[("balancer", "b0")], 1)])])
		.unwrap();
	agent.update_pipelines(&[pipeline("p0", &["f0"])]).unwrap();
	agent.update_pipelines(&[pipeline("dummy", &[])]).unwrap();
	agent
		.update_devices(&[device("01:00.0", &[("p0", 1)], &[("dummy", 1)])])
		.unwrap();

	let rx_path = CounterPath::device(name("01:00.0"));
	cp.with_active(|g| {
		g.lookup_storage_ref(rx_path).unwrap().values_by_name(&name("rx")).unwrap()[0]
			.store(7, Relaxed);
	});

	// Map the same object again; the kernel places it elsewhere.
	let second = zone.remap().unwrap();
	assert_ne!(zone.base(), second.base());
	// SAFETY: The second mapping outlives the handle.
	let cp2 = unsafe { ControlPlane::attach_raw(second.base()) }.unwrap();

	assert_eq!(cp2.generation_number(), cp.generation_number());

	let lo = second.base().as_ptr() as usize;
	let hi = lo + ZONE_LEN;

	cp2.with_active(|g| {
		// Every structure reached through the second mapping resolves
		// inside that mapping.
		let m = g
			.lookup_module_ref(&name("balancer"), &name("b0"))
			.expect("module resolves through the new base");
		let addr = core::ptr::from_ref(m) as usize;
		assert!((lo..hi).contains(&addr), "descriptor inside the remap");

		let ectx = g.ectx_ref().unwrap();
		let pl = ectx
			.device(0)
			.unwrap()
			.input()
			.map_slot(0)
			.expect("weight map resolves through the new base");
		assert_eq!(pl.pipeline().name().as_str(), "p0");
		let addr = core::ptr::from_ref(pl) as usize;
		assert!((lo..hi).contains(&addr), "ectx node inside the remap");

		// Counter values written through the first mapping are visible.
		let storage = g.lookup_storage_ref(rx_path).unwrap();
		assert_eq!(storage.values_by_name(&name("rx")).unwrap()[0].load(Relaxed), 7);
	});

	// Writes through the second mapping land in the first.
	cp2.with_active(|g| {
		g.lookup_storage_ref(rx_path).unwrap().values_by_name(&name("rx")).unwrap()[0]
			.fetch_add(1, Relaxed);
	});
	cp.with_active(|g| {
		assert_eq!(
			g.lookup_storage_ref(rx_path).unwrap().values_by_name(&name("rx")).unwrap()[0]
				.load(Relaxed),
			8
		);
	});
}

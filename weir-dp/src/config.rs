//! The dataplane zone header and its flat tables.

use core::{
	ptr::NonNull,
	sync::atomic::{
		AtomicU64,
		Ordering::{AcqRel, Acquire},
	},
};

use weir_shm::{MemCtx, Name, OffsetPtr, ShmError, round_up};
use weir_sync::SpinWait;

/// One packet-handler record in the dataplane module table.
///
/// The control plane stores this record's index (`dp_module_index`) in its
/// module descriptors; the dataplane resolves the index back to the
/// handler entry points at packet time.
#[repr(C)]
pub struct DpModule {
	/// Handler type name, e.g. `balancer`.
	pub type_name:  Name,
	/// Opaque handler identifier owned by the dataplane.
	pub handler_id: u64,
}

/// One device record in the dataplane device table.
#[repr(C)]
pub struct DpDevice {
	/// Device name, e.g. a PCI address.
	pub name:        Name,
	/// Receive/transmit queue pairs the device exposes.
	pub queue_count: u64,
}

/// The dataplane zone header.
///
/// Resides in the shared arena; reachable from the control-plane header
/// through an offset pointer. The tables are immutable after
/// [`DpConfig::init`]; the worker generation counters are written by their
/// owning workers and read by the mutator during the quiescence wait.
#[repr(C)]
pub struct DpConfig {
	/// Entries in the module table.
	module_count: u64,
	/// Entries in the device table.
	device_count: u64,
	/// Worker threads advertising generations.
	worker_count: u64,
	/// The module table.
	modules:      OffsetPtr<DpModule>,
	/// The device table.
	devices:      OffsetPtr<DpDevice>,
	/// Per-worker advertised generation numbers.
	worker_gens:  OffsetPtr<AtomicU64>,
}

impl DpConfig {
	/// Allocates and initializes a dataplane header in the arena.
	///
	/// `modules` and `devices` become the flat tables; handler ids and
	/// queue counts are assigned from the table order. Worker counters
	/// start at generation zero.
	pub fn init(
		ctx: &MemCtx,
		modules: &[Name],
		devices: &[Name],
		workers: u64,
	) -> Result<NonNull<Self>, ShmError> {
		let this = ctx.alloc(size_of::<Self>() as u64)?.cast::<Self>();

		// SAFETY: Fresh arena allocation; null offset pointers are
		// SAFETY: position-independent.
		unsafe {
			this.as_ptr().write(Self {
				module_count: modules.len() as u64,
				device_count: devices.len() as u64,
				worker_count: workers,
				modules:      OffsetPtr::null(),
				devices:      OffsetPtr::null(),
				worker_gens:  OffsetPtr::null(),
			});
		}

		if !modules.is_empty() {
			let table = ctx
				.alloc(round_up((modules.len() * size_of::<DpModule>()) as u64))?
				.cast::<DpModule>();
			for (i, ty) in modules.iter().enumerate() {
				// SAFETY: The table allocation holds `modules.len()` records.
				unsafe {
					table.as_ptr().add(i).write(DpModule {
						type_name:  *ty,
						handler_id: i as u64,
					});
				}
			}
			// SAFETY: `this` was just written above.
			unsafe { (*this.as_ptr()).modules.store(Some(table)) };
		}

		if !devices.is_empty() {
			let table = ctx
				.alloc(round_up((devices.len() * size_of::<DpDevice>()) as u64))?
				.cast::<DpDevice>();
			for (i, name) in devices.iter().enumerate() {
				// SAFETY: The table allocation holds `devices.len()` records.
				unsafe {
					table.as_ptr().add(i).write(DpDevice {
						name:        *name,
						queue_count: 1,
					});
				}
			}
			// SAFETY: As above.
			unsafe { (*this.as_ptr()).devices.store(Some(table)) };
		}

		if workers > 0 {
			let gens = ctx
				.alloc_zeroed(round_up(workers * size_of::<AtomicU64>() as u64))?
				.cast::<AtomicU64>();
			// SAFETY: As above; an all-zero `AtomicU64` is initialized.
			unsafe { (*this.as_ptr()).worker_gens.store(Some(gens)) };
		}

		log::debug!(
			"dataplane header initialized: {} modules, {} devices, {workers} workers",
			modules.len(),
			devices.len()
		);
		Ok(this)
	}

	/// The module table.
	#[must_use]
	pub fn modules(&self) -> &[DpModule] {
		match self.modules.load() {
			None => &[],
			// SAFETY: `init` sized the table to `module_count` records and
			// SAFETY: it is immutable afterwards.
			Some(p) => unsafe {
				core::slice::from_raw_parts(p.as_ptr(), self.module_count as usize)
			},
		}
	}

	/// The device table.
	#[must_use]
	pub fn devices(&self) -> &[DpDevice] {
		match self.devices.load() {
			None => &[],
			// SAFETY: As for `modules`.
			Some(p) => unsafe {
				core::slice::from_raw_parts(p.as_ptr(), self.device_count as usize)
			},
		}
	}

	/// Resolves a handler type name to its `dp_module_index`.
	#[must_use]
	pub fn lookup_module(&self, type_name: &Name) -> Option<u64> {
		self.modules()
			.iter()
			.position(|m| m.type_name == *type_name)
			.map(|i| i as u64)
	}

	/// Resolves a device name to its `dp_device_index`.
	#[must_use]
	pub fn lookup_device(&self, name: &Name) -> Option<u64> {
		self.devices()
			.iter()
			.position(|d| d.name == *name)
			.map(|i| i as u64)
	}

	/// Number of worker threads.
	#[must_use]
	pub fn worker_count(&self) -> u64 {
		self.worker_count
	}

	/// The generation last advertised by `worker`.
	#[must_use]
	pub fn worker_gen(&self, worker: u64) -> u64 {
		assert!(worker < self.worker_count, "worker index out of range");
		// SAFETY: `init` sized the counter array to `worker_count`.
		let gens = unsafe {
			core::slice::from_raw_parts(
				self.worker_gens.load().expect("worker counters missing").as_ptr(),
				self.worker_count as usize,
			)
		};
		gens[worker as usize].load(Acquire)
	}

	/// Worker-side monotonic advertisement of the generation in use.
	///
	/// A worker calls this once per packet batch after loading the active
	/// generation; advertising `g` asserts that all of its processing
	/// against generations `< g` has finished.
	pub fn advertise(&self, worker: u64, gen_num: u64) {
		assert!(worker < self.worker_count, "worker index out of range");
		// SAFETY: As for `worker_gen`.
		let gens = unsafe {
			core::slice::from_raw_parts(
				self.worker_gens.load().expect("worker counters missing").as_ptr(),
				self.worker_count as usize,
			)
		};
		gens[worker as usize].fetch_max(gen_num, AcqRel);
	}

	/// Blocks until every worker has advertised a generation `>= gen_num`.
	///
	/// Deliberately unbounded: returning early would permit retiring
	/// memory still in use. A wedged worker wedges configuration updates,
	/// which operators detect externally.
	pub fn wait_for_gen(&self, gen_num: u64) {
		for worker in 0..self.worker_count {
			if self.worker_gen(worker) >= gen_num {
				continue;
			}
			log::debug!("waiting for worker {worker} to reach generation {gen_num}");
			let mut wait = SpinWait::new();
			while self.worker_gen(worker) < gen_num {
				wait.wait();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use weir_shm::{BlockAlloc, ShmZone};

	/// Builds a scratch arena with a context at the mapping base.
	fn scratch() -> (ShmZone, NonNull<MemCtx>) {
		let zone = ShmZone::anon(1 << 16).unwrap();
		let base = zone.base();

		let alloc = base.cast::<BlockAlloc>();
		let heap_off = round_up((size_of::<BlockAlloc>() + size_of::<MemCtx>()) as u64);

		// SAFETY: Fresh zone; the ranges are disjoint and in-bounds.
		let ctx = unsafe {
			let ctx = NonNull::new_unchecked(
				base.as_ptr().add(size_of::<BlockAlloc>()).cast::<MemCtx>(),
			);
			let heap = NonNull::new_unchecked(base.as_ptr().add(heap_off as usize));
			BlockAlloc::init(alloc, heap, (1 << 16) - heap_off);
			MemCtx::init(ctx, alloc, "test");
			ctx
		};
		(zone, ctx)
	}

	fn names(names: &[&str]) -> Vec<Name> {
		names.iter().map(|n| Name::new(n).unwrap()).collect()
	}

	#[test]
	fn tables_resolve_by_name() {
		let (_zone, ctx) = scratch();
		// SAFETY: `scratch` initialized the context.
		let ctx = unsafe { ctx.as_ref() };

		let dp = DpConfig::init(
			ctx,
			&names(&["balancer", "nat64"]),
			&names(&["01:00.0"]),
			2,
		)
		.unwrap();
		// SAFETY: Freshly initialized header.
		let dp = unsafe { dp.as_ref() };

		assert_eq!(dp.lookup_module(&Name::new("nat64").unwrap()), Some(1));
		assert_eq!(dp.lookup_module(&Name::new("firewall").unwrap()), None);
		assert_eq!(dp.lookup_device(&Name::new("01:00.0").unwrap()), Some(0));
		assert_eq!(dp.modules()[0].handler_id, 0);
	}

	#[test]
	fn wait_for_gen_observes_stragglers() {
		let (_zone, ctx) = scratch();
		// SAFETY: `scratch` initialized the context.
		let ctx = unsafe { ctx.as_ref() };

		let dp = DpConfig::init(ctx, &[], &[], 2).unwrap();
		let dp_addr = dp.as_ptr() as usize;
		// SAFETY: Freshly initialized header.
		let dp = unsafe { dp.as_ref() };

		dp.advertise(0, 3);
		assert_eq!(dp.worker_gen(0), 3);

		let t = std::thread::spawn(move || {
			std::thread::sleep(std::time::Duration::from_millis(20));
			// SAFETY: The zone outlives this thread; the test joins below.
			let dp = unsafe { &*(dp_addr as *const DpConfig) };
			dp.advertise(1, 3);
		});

		dp.wait_for_gen(3);
		t.join().unwrap();
		assert!(dp.worker_gen(1) >= 3);
	}

	#[test]
	fn advertisement_is_monotonic() {
		let (_zone, ctx) = scratch();
		// SAFETY: `scratch` initialized the context.
		let ctx = unsafe { ctx.as_ref() };

		let dp = DpConfig::init(ctx, &[], &[], 1).unwrap();
		// SAFETY: Freshly initialized header.
		let dp = unsafe { dp.as_ref() };

		dp.advertise(0, 5);
		dp.advertise(0, 2);
		assert_eq!(dp.worker_gen(0), 5);
	}
}

//! Shared scratch-arena plumbing for unit tests.

use core::ptr::NonNull;

use weir_shm::{BlockAlloc, MemCtx, ShmZone, round_up};

use crate::registry::Registry;

/// Scratch zone size; comfortably larger than any single test needs.
const SCRATCH_LEN: usize = 1 << 20;

/// An anonymous zone with an allocator, a context and one registry.
pub(crate) struct Scratch {
	/// Keeps the mapping alive.
	_zone:    ShmZone,
	/// The context at the mapping base.
	ctx:      NonNull<MemCtx>,
	/// A freshly initialized registry in the arena.
	registry: NonNull<Registry>,
}

impl Scratch {
	/// Maps and lays out a fresh scratch arena.
	pub(crate) fn new() -> Self {
		let zone = ShmZone::anon(SCRATCH_LEN).expect("scratch zone");
		let base = zone.base();

		let alloc = base.cast::<BlockAlloc>();
		let heap_off = round_up((size_of::<BlockAlloc>() + size_of::<MemCtx>()) as u64);

		// SAFETY: Fresh zone; header, context and heap ranges are
		// SAFETY: disjoint and in bounds.
		let (ctx, registry) = unsafe {
			let ctx = NonNull::new_unchecked(
				base.as_ptr().add(size_of::<BlockAlloc>()).cast::<MemCtx>(),
			);
			let heap = NonNull::new_unchecked(base.as_ptr().add(heap_off as usize));
			BlockAlloc::init(alloc, heap, SCRATCH_LEN as u64 - heap_off);
			MemCtx::init(ctx, alloc, "scratch");

			let registry = ctx
				.as_ref()
				.alloc(size_of::<Registry>() as u64)
				.expect("scratch registry")
				.cast::<Registry>();
			Registry::init(registry);
			(ctx, registry)
		};

		Self {
			_zone: zone,
			ctx,
			registry,
		}
	}

	/// The scratch memory context.
	pub(crate) fn ctx(&self) -> &MemCtx {
		// SAFETY: Initialized in `new`; the mapping lives as long as self.
		unsafe { self.ctx.as_ref() }
	}

	/// The scratch registry.
	pub(crate) fn registry(&self) -> NonNull<Registry> {
		self.registry
	}
}

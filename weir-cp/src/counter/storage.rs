//! Counter storage: numeric backing for declared counter registries.

use core::{ptr::NonNull, sync::atomic::AtomicU64};

use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::{
	counter::{CounterPath, CounterRegistry},
	error::Error,
	registry::{Embedded, RegistryItem},
};

/// A reference-counted block of 64-bit value cells.
///
/// Cells are the unit of numeric identity: when a storage spawned for a
/// new generation finds a matching declaration in the previous
/// generation's storage, it references the *same* cell block, so the
/// accumulated values carry forward and the block outlives whichever
/// generation drops it last.
#[repr(C)]
struct CounterCells {
	/// Storages referencing this block.
	refcount:    u64,
	/// Number of value cells in the tail.
	cardinality: u64,
	// Tail: `[AtomicU64; cardinality]`, zero-initialized.
}

impl CounterCells {
	/// Allocation size for a block of `cardinality` cells.
	fn alloc_size(cardinality: u64) -> u64 {
		round_up(size_of::<Self>() as u64 + cardinality * size_of::<AtomicU64>() as u64)
	}

	/// Allocates a zeroed block.
	fn alloc(ctx: &MemCtx, cardinality: u64) -> Result<NonNull<Self>, Error> {
		let p = ctx
			.alloc_zeroed(Self::alloc_size(cardinality))
			.map_err(|_| Error::CounterSpawnFailed)?
			.cast::<Self>();
		// SAFETY: Fresh allocation; the zeroed tail is a valid cell array.
		unsafe {
			p.as_ptr().write(Self {
				refcount: 1,
				cardinality,
			});
		}
		Ok(p)
	}

	/// First value cell of the tail.
	fn values_ptr(this: NonNull<Self>) -> NonNull<AtomicU64> {
		// SAFETY: The tail starts right past the header; the allocation
		// SAFETY: covers it.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<AtomicU64>()) }
	}

	/// Bumps the block's reference count.
	fn addref(this: NonNull<Self>) {
		// SAFETY: Serialized by the zone writer lock.
		unsafe { (*this.as_ptr()).refcount += 1 };
	}

	/// Drops one reference, freeing the block on the last.
	fn unref(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Serialized by the zone writer lock.
		let count = unsafe {
			debug_assert!((*this.as_ptr()).refcount > 0);
			(*this.as_ptr()).refcount -= 1;
			(*this.as_ptr()).refcount
		};
		if count == 0 {
			// SAFETY: Last reference; nothing can observe the block now.
			let cardinality = unsafe { (*this.as_ptr()).cardinality };
			ctx.free(this.cast(), Self::alloc_size(cardinality));
		}
	}
}

/// One declared counter's binding inside a [`CounterStorage`].
#[repr(C)]
pub struct StorageSlot {
	/// Counter name, copied from the declaration.
	pub name:        Name,
	/// Value-cell count, copied from the declaration.
	pub cardinality: u64,
	/// The backing cell block.
	cells:           OffsetPtr<CounterCells>,
}

/// Numeric backing for one (path, declared registry) pair.
///
/// Registered in the generation's counter-storage registry under its
/// [`CounterPath`]; the execution context node for the path holds a
/// borrowed pointer for packet-time access.
#[repr(C)]
pub struct CounterStorage {
	/// Registry header.
	item:       RegistryItem,
	/// The key this storage is registered under.
	path:       CounterPath,
	/// Slots in the tail.
	slot_count: u64,
	/// Total bytes of the one-shot allocation.
	alloc_size: u64,
	// Tail: `[StorageSlot; slot_count]`.
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for CounterStorage {}

impl CounterStorage {
	/// Materializes backing for `decls` under `path`.
	///
	/// When `old` is supplied, declarations that match one of its slots
	/// by name and cardinality reference the old slot's cell block, so
	/// the counter's accumulated values survive the configuration update.
	/// Everything else gets fresh zeroed cells. On failure every fresh
	/// allocation is released before the error is returned.
	pub fn spawn(
		ctx: &MemCtx,
		path: CounterPath,
		old: Option<NonNull<Self>>,
		decls: &CounterRegistry,
	) -> Result<NonNull<Self>, Error> {
		let count = decls.decls().len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<StorageSlot>() as u64);
		let this = ctx
			.alloc(size)
			.map_err(|_| Error::CounterSpawnFailed)?
			.cast::<Self>();

		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				path,
				slot_count: count,
				alloc_size: size,
			});
		}

		for (i, decl) in decls.decls().iter().enumerate() {
			// SAFETY: The tail holds `count` slots; `i < count`.
			let slot = unsafe { Self::slots_ptr(this).as_ptr().add(i) };
			// SAFETY: In-bounds placement; the null cell pointer is
			// SAFETY: position-independent.
			unsafe {
				slot.write(StorageSlot {
					name:        decl.name,
					cardinality: decl.cardinality,
					cells:       OffsetPtr::null(),
				});
			}

			// SAFETY: `old`, when present, is a live storage of the
			// SAFETY: previous generation, immutable under the lock.
			let carried =
				old.and_then(|o| unsafe { o.as_ref() }.matching_cells(&decl.name, decl.cardinality));

			let cells = match carried {
				Some(c) => {
					CounterCells::addref(c);
					c
				}
				None => match CounterCells::alloc(ctx, decl.cardinality) {
					Ok(c) => c,
					Err(err) => {
						// SAFETY: Exactly the first `i` slots hold cells.
						unsafe { Self::free_first(this, i as u64, ctx) };
						return Err(err);
					}
				},
			};

			// SAFETY: `slot` was placed above.
			unsafe { (*slot).cells.store(Some(cells)) };
		}

		Ok(this)
	}

	/// Releases the storage and unreferences every cell block.
	///
	/// # Safety
	/// `this` must be a live storage with no remaining references, and
	/// the caller must hold the zone writer lock.
	pub unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		let count = unsafe { (*this.as_ptr()).slot_count };
		// SAFETY: All `count` slots hold cells in a fully built storage.
		unsafe { Self::free_first(this, count, ctx) };
	}

	/// Releases the first `n` slots' cell references and the storage
	/// allocation itself. Unwind helper for [`Self::spawn`].
	///
	/// # Safety
	/// Exactly the first `n` tail slots must hold live cell references.
	unsafe fn free_first(this: NonNull<Self>, n: u64, ctx: &MemCtx) {
		for i in 0..n as usize {
			// SAFETY: `i < n` slots are placed and hold cells.
			let slot = unsafe { &*Self::slots_ptr(this).as_ptr().add(i) };
			if let Some(cells) = slot.cells.load() {
				CounterCells::unref(cells, ctx);
			}
		}
		// SAFETY: The storage was allocated with `alloc_size` bytes.
		unsafe { ctx.free(this.cast(), (*this.as_ptr()).alloc_size) };
	}

	/// First tail slot.
	fn slots_ptr(this: NonNull<Self>) -> NonNull<StorageSlot> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<StorageSlot>()) }
	}

	/// The storage's slots.
	#[must_use]
	pub fn slots(&self) -> &[StorageSlot] {
		let this = NonNull::from(self);
		// SAFETY: A live storage's tail holds `slot_count` placed slots.
		unsafe {
			core::slice::from_raw_parts(Self::slots_ptr(this).as_ptr(), self.slot_count as usize)
		}
	}

	/// The path this storage is keyed under.
	#[must_use]
	pub fn path(&self) -> CounterPath {
		self.path
	}

	/// Index of the slot named `name`.
	#[must_use]
	pub fn find(&self, name: &Name) -> Option<u64> {
		self.slots()
			.iter()
			.position(|s| s.name == *name)
			.map(|i| i as u64)
	}

	/// The value cells of slot `slot`.
	#[must_use]
	pub fn values(&self, slot: u64) -> Option<&[AtomicU64]> {
		let s = self.slots().get(slot as usize)?;
		let cells = s.cells.load()?;
		// SAFETY: The block's tail holds `cardinality` cells and lives at
		// SAFETY: least as long as this storage's reference to it.
		Some(unsafe {
			core::slice::from_raw_parts(
				CounterCells::values_ptr(cells).as_ptr(),
				s.cardinality as usize,
			)
		})
	}

	/// The value cells of the slot named `name`.
	#[must_use]
	pub fn values_by_name(&self, name: &Name) -> Option<&[AtomicU64]> {
		self.values(self.find(name)?)
	}

	/// The cell block matching a declaration, by name and cardinality.
	fn matching_cells(&self, name: &Name, cardinality: u64) -> Option<NonNull<CounterCells>> {
		self.slots()
			.iter()
			.find(|s| s.name == *name && s.cardinality == cardinality)
			.and_then(|s| s.cells.load())
	}

	/// A registry predicate matching this key.
	#[must_use]
	pub fn path_pred(path: CounterPath) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in a counter-storage registry head storages.
			unsafe { Self::from_item(item).as_ref() }.path == path
		}
	}
}

#[cfg(test)]
mod tests {
	use core::sync::atomic::Ordering::Relaxed;

	use super::*;
	use crate::testutil::Scratch;

	fn name(s: &str) -> Name {
		Name::new(s).unwrap()
	}

	fn decls(ctx: &MemCtx, list: &[(&str, u64)]) -> NonNull<CounterRegistry> {
		let reg = ctx
			.alloc(size_of::<CounterRegistry>() as u64)
			.unwrap()
			.cast::<CounterRegistry>();
		// SAFETY: Fresh allocation.
		unsafe { reg.as_ptr().write(CounterRegistry::empty()) };
		for (n, card) in list {
			// SAFETY: Just placed, unaliased in this test.
			unsafe { &mut *reg.as_ptr() }
				.register(ctx, name(n), *card)
				.unwrap();
		}
		reg
	}

	#[test]
	fn spawn_fresh_zeroes_values() {
		let s = Scratch::new();
		let ctx = s.ctx();
		let reg = decls(ctx, &[("rx", 1), ("hist", 8)]);

		let path = CounterPath::device(name("eth0"));
		// SAFETY: `reg` is live.
		let storage = CounterStorage::spawn(ctx, path, None, unsafe { reg.as_ref() }).unwrap();
		// SAFETY: Freshly spawned.
		let storage = unsafe { storage.as_ref() };

		assert_eq!(storage.slots().len(), 2);
		assert_eq!(storage.values_by_name(&name("hist")).unwrap().len(), 8);
		assert_eq!(
			storage.values_by_name(&name("rx")).unwrap()[0].load(Relaxed),
			0
		);
	}

	#[test]
	fn respawn_preserves_matching_declarations_only() {
		let s = Scratch::new();
		let ctx = s.ctx();
		let path = CounterPath::pipeline(name("eth0"), name("p0"));

		let old_decls = decls(ctx, &[("rx", 1), ("hist", 8)]);
		// SAFETY: `old_decls` is live.
		let old = CounterStorage::spawn(ctx, path, None, unsafe { old_decls.as_ref() }).unwrap();
		// SAFETY: Freshly spawned; shared read access below.
		unsafe { old.as_ref() }.values_by_name(&name("rx")).unwrap()[0].fetch_add(42, Relaxed);

		// `rx` keeps its declaration, `hist` changes cardinality.
		let new_decls = decls(ctx, &[("rx", 1), ("hist", 4)]);
		let new =
			// SAFETY: Both storages and the registry are live.
			CounterStorage::spawn(ctx, path, Some(old), unsafe { new_decls.as_ref() }).unwrap();
		// SAFETY: Freshly spawned.
		let new_ref = unsafe { new.as_ref() };

		assert_eq!(
			new_ref.values_by_name(&name("rx")).unwrap()[0].load(Relaxed),
			42,
			"matching declaration carries its value forward"
		);
		assert_eq!(new_ref.values_by_name(&name("hist")).unwrap().len(), 4);
		assert_eq!(
			new_ref.values_by_name(&name("hist")).unwrap()[0].load(Relaxed),
			0,
			"changed cardinality starts fresh"
		);

		// The shared cell block survives the old storage's release.
		// SAFETY: `old` holds no registry references in this test.
		unsafe { CounterStorage::free(old, ctx) };
		assert_eq!(
			new_ref.values_by_name(&name("rx")).unwrap()[0].load(Relaxed),
			42
		);
	}
}

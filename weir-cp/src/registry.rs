//! The name-keyed, reference-counted registry.
//!
//! A registry is an arena-resident dynamic array of offset pointers to
//! [`RegistryItem`]s: embedded headers carried as the first field of
//! every registered entity. Registries are the unit of copy-on-write
//! between configuration generations: [`Registry::copy_into`] produces a
//! same-capacity registry whose slots reference the same items with their
//! reference counts bumped, and entities are immutable once built, so two
//! generations never alias a mutable object.
//!
//! Lookups are linear scans: registries hold at most a few hundred
//! entries, and the packet path never touches them (it goes through the
//! pre-resolved execution context instead).

use core::ptr::NonNull;

use weir_shm::{MemCtx, OffsetPtr, round_up, slot, slot_mut};

use crate::error::{EntityKind, Error};

/// The embedded header of every registry-resident entity.
///
/// Must be the first field of a `#[repr(C)]` descriptor (see
/// [`Embedded`]). Reference counts are manipulated only by mutators under
/// the zone writer lock; workers never touch them.
#[repr(C)]
pub struct RegistryItem {
	/// Number of registries (and transient owners) referencing the item.
	refcount: u64,
	/// The item's slot index in its registry.
	///
	/// Stable for the item's lifetime within a registry, and preserved by
	/// [`Registry::copy_into`].
	index:    u64,
}

static_assertions::assert_eq_size!(RegistryItem, [u64; 2]);

impl RegistryItem {
	/// A fresh header: one reference (the builder's), slot not yet
	/// assigned.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			refcount: 1,
			index:    0,
		}
	}

	/// Current reference count.
	#[must_use]
	pub fn refcount(&self) -> u64 {
		self.refcount
	}

	/// Current slot index.
	#[must_use]
	pub fn index(&self) -> u64 {
		self.index
	}
}

/// Implemented by entity descriptors that embed a [`RegistryItem`] as
/// their first field.
///
/// # Safety
/// The implementing type must be `#[repr(C)]` with a [`RegistryItem`] as
/// its very first field, so that the descriptor and its header are
/// mutually castable.
pub unsafe trait Embedded: Sized {
	/// Recovers the descriptor from its embedded header.
	#[must_use]
	fn from_item(item: NonNull<RegistryItem>) -> NonNull<Self> {
		item.cast()
	}

	/// The descriptor's embedded header.
	#[must_use]
	fn item(this: NonNull<Self>) -> NonNull<RegistryItem> {
		this.cast()
	}
}

/// Size in bytes of one slot cell.
const SLOT_SIZE: u64 = size_of::<OffsetPtr<RegistryItem>>() as u64;

/// An arena-resident dynamic array of item references.
#[repr(C)]
pub struct Registry {
	/// The slot array, or null while the capacity is zero.
	slots:    OffsetPtr<OffsetPtr<RegistryItem>>,
	/// Allocated slot count. Grows double-or-one; never shrinks.
	capacity: u64,
}

impl Registry {
	/// Initializes an empty registry in place.
	///
	/// # Safety
	/// `this` must point at writable arena memory.
	pub unsafe fn init(this: NonNull<Self>) {
		// SAFETY: Null offset pointers are position-independent.
		unsafe {
			this.as_ptr().write(Self {
				slots:    OffsetPtr::null(),
				capacity: 0,
			});
		}
	}

	/// Allocated slot count; slots past the live entries are null.
	#[must_use]
	pub fn capacity(&self) -> u64 {
		self.capacity
	}

	/// The item at `index`, if the slot is live.
	#[must_use]
	pub fn get(&self, index: u64) -> Option<NonNull<RegistryItem>> {
		if index >= self.capacity {
			return None;
		}
		let base = self.slots.load()?;
		// SAFETY: `index` is within the allocated slot array.
		unsafe { slot(base, index as usize) }.load()
	}

	/// Scans for the first live item matching `pred`.
	#[must_use]
	pub fn lookup(&self, mut pred: impl FnMut(NonNull<RegistryItem>) -> bool) -> Option<u64> {
		let base = self.slots.load()?;
		for i in 0..self.capacity as usize {
			// SAFETY: `i` is within the allocated slot array.
			if let Some(item) = unsafe { slot(base, i) }.load() {
				if pred(item) {
					return Some(i as u64);
				}
			}
		}
		None
	}

	/// Iterates the live slots in index order.
	pub fn iter(&self) -> impl Iterator<Item = (u64, NonNull<RegistryItem>)> + '_ {
		(0..self.capacity).filter_map(move |i| self.get(i).map(|item| (i, item)))
	}

	/// Places `item` at the first null slot, growing when full.
	///
	/// Sets the item's slot index; the item's reference count is the
	/// builder's concern (a fresh [`RegistryItem`] already counts its one
	/// owner).
	pub fn insert(&mut self, ctx: &MemCtx, item: NonNull<RegistryItem>) -> Result<u64, Error> {
		if let Some(base) = self.slots.load() {
			for i in 0..self.capacity as usize {
				// SAFETY: `i` is within the allocated slot array, and
				// SAFETY: mutation is serialized by the zone writer lock.
				let cell = unsafe { slot_mut(base, i) };
				if cell.is_null() {
					cell.store(Some(item));
					// SAFETY: The item is live; see lock argument above.
					unsafe { (*item.as_ptr()).index = i as u64 };
					return Ok(i as u64);
				}
			}
		}

		let at = self.capacity;
		self.grow(ctx)?;
		let base = self.slots.load().expect("registry has slots after growth");
		// SAFETY: `at` is within the freshly grown slot array.
		unsafe { slot_mut(base, at as usize) }.store(Some(item));
		// SAFETY: As above.
		unsafe { (*item.as_ptr()).index = at };
		Ok(at)
	}

	/// Replaces (or deletes) the item matching `pred`.
	///
	/// With a slot present, the old item is unreferenced (`free` runs on
	/// the last reference) and the slot takes `new`, or becomes null when
	/// `new` is `None`. With no slot present, a non-null `new` behaves
	/// like [`Self::insert`]; a delete of a missing key fails. Replacement
	/// of an existing key never reallocates.
	///
	/// `kind` and `name` only flavor the failure record.
	pub fn replace(
		&mut self,
		ctx: &MemCtx,
		pred: impl FnMut(NonNull<RegistryItem>) -> bool,
		new: Option<NonNull<RegistryItem>>,
		free: &mut dyn FnMut(NonNull<RegistryItem>),
		kind: EntityKind,
		name: &str,
	) -> Result<(), Error> {
		if let Some(index) = self.lookup(pred) {
			let base = self.slots.load().expect("lookup hit implies slots");
			// SAFETY: `index` came from `lookup` and is in bounds; the
			// SAFETY: zone writer lock serializes mutation.
			let cell = unsafe { slot_mut(base, index as usize) };
			let old = cell.load().expect("lookup hit implies a live slot");

			cell.store(new);
			if let Some(n) = new {
				// SAFETY: The new item is live and ours to index.
				unsafe { (*n.as_ptr()).index = index };
			}
			Self::unref(old, free);
			return Ok(());
		}

		match new {
			Some(n) => self.insert(ctx, n).map(|_| ()),
			None => Err(Error::Duplicate {
				kind,
				name: name.to_owned(),
			}),
		}
	}

	/// Copies this registry into the freshly initialized `dst`: identical
	/// capacity, same items, reference counts bumped. Items keep their
	/// slot numbers.
	pub fn copy_into(&self, ctx: &MemCtx, dst: &mut Self) -> Result<(), Error> {
		debug_assert_eq!(dst.capacity, 0, "copy target must be empty");
		if self.capacity == 0 {
			return Ok(());
		}

		let new_base = ctx
			.alloc(round_up(self.capacity * SLOT_SIZE))?
			.cast::<OffsetPtr<RegistryItem>>();
		for i in 0..self.capacity as usize {
			// SAFETY: The fresh array holds `capacity` cells.
			unsafe { new_base.as_ptr().add(i).write(OffsetPtr::null()) };
		}

		let src_base = self.slots.load().expect("non-zero capacity implies slots");
		for i in 0..self.capacity as usize {
			// SAFETY: `i` is in bounds for both arrays.
			if let Some(item) = unsafe { slot(src_base, i) }.load() {
				// SAFETY: As above.
				unsafe { slot_mut(new_base, i) }.store(Some(item));
				Self::addref(item);
			}
		}

		dst.slots.store(Some(new_base));
		dst.capacity = self.capacity;
		Ok(())
	}

	/// Unreferences every live slot (running `free` on last references)
	/// and releases the slot array.
	pub fn destroy(&mut self, ctx: &MemCtx, free: &mut dyn FnMut(NonNull<RegistryItem>)) {
		if let Some(base) = self.slots.load() {
			for i in 0..self.capacity as usize {
				// SAFETY: `i` is within the allocated slot array.
				let cell = unsafe { slot_mut(base, i) };
				if let Some(item) = cell.load() {
					cell.store(None);
					Self::unref(item, free);
				}
			}
			ctx.free(base.cast(), round_up(self.capacity * SLOT_SIZE));
		}
		self.slots.store(None);
		self.capacity = 0;
	}

	/// Bumps an item's reference count.
	pub fn addref(item: NonNull<RegistryItem>) {
		// SAFETY: Reference counts are only manipulated under the zone
		// SAFETY: writer lock; the item is live.
		unsafe { (*item.as_ptr()).refcount += 1 };
	}

	/// Drops one reference, running `free` when the count reaches zero.
	pub fn unref(item: NonNull<RegistryItem>, free: &mut dyn FnMut(NonNull<RegistryItem>)) {
		// SAFETY: As for `addref`.
		let count = unsafe {
			debug_assert!((*item.as_ptr()).refcount > 0, "unref of a dead item");
			(*item.as_ptr()).refcount -= 1;
			(*item.as_ptr()).refcount
		};
		if count == 0 {
			free(item);
		}
	}

	/// Doubles the slot array (or allocates one slot from empty).
	fn grow(&mut self, ctx: &MemCtx) -> Result<(), Error> {
		let new_cap = if self.capacity == 0 {
			1
		} else {
			self.capacity * 2
		};

		let new_base = ctx
			.alloc(round_up(new_cap * SLOT_SIZE))?
			.cast::<OffsetPtr<RegistryItem>>();
		for i in 0..new_cap as usize {
			// SAFETY: The fresh array holds `new_cap` cells.
			unsafe { new_base.as_ptr().add(i).write(OffsetPtr::null()) };
		}

		if let Some(old_base) = self.slots.load() {
			for i in 0..self.capacity as usize {
				// SAFETY: `i` is in bounds for both arrays; offsets are
				// SAFETY: re-encoded for the new cells by store().
				let target = unsafe { slot(old_base, i) }.load();
				// SAFETY: As above.
				unsafe { slot_mut(new_base, i) }.store(target);
			}
			ctx.free(old_base.cast(), round_up(self.capacity * SLOT_SIZE));
		}

		log::debug!("registry grew from {} to {new_cap} slots", self.capacity);
		self.slots.store(Some(new_base));
		self.capacity = new_cap;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil::Scratch;

	/// A minimal registered entity for registry tests.
	#[repr(C)]
	struct Probe {
		item:  RegistryItem,
		value: u64,
	}

	// SAFETY: `Probe` is repr(C) with the header first.
	unsafe impl Embedded for Probe {}

	fn probe(ctx: &MemCtx, value: u64) -> NonNull<Probe> {
		let p = ctx.alloc(size_of::<Probe>() as u64).unwrap().cast::<Probe>();
		// SAFETY: Fresh allocation.
		unsafe {
			p.as_ptr().write(Probe {
				item: RegistryItem::new(),
				value,
			});
		}
		p
	}

	fn value_pred(value: u64) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Every item in these tests heads a `Probe`.
			unsafe { Probe::from_item(item).as_ref() }.value == value
		}
	}

	#[test]
	fn growth_is_one_two_then_doubling() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		assert_eq!(reg.capacity(), 0);
		for (i, expect) in [(0, 1), (1, 2), (2, 4), (3, 4), (4, 8)] {
			let idx = reg.insert(ctx, Probe::item(probe(ctx, i))).unwrap();
			assert_eq!(idx, i);
			assert_eq!(reg.capacity(), expect);
		}
	}

	#[test]
	fn upsert_then_lookup_returns_item() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		let a = probe(ctx, 7);
		reg.insert(ctx, Probe::item(a)).unwrap();

		let idx = reg.lookup(value_pred(7)).unwrap();
		assert_eq!(reg.get(idx), Some(Probe::item(a)));
		assert!(reg.lookup(value_pred(9)).is_none());
	}

	#[test]
	fn replace_existing_key_keeps_slot_and_frees_old() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		let old = probe(ctx, 1);
		let idx = reg.insert(ctx, Probe::item(old)).unwrap();

		let replacement = probe(ctx, 1);
		let mut freed = 0;
		reg.replace(
			ctx,
			value_pred(1),
			Some(Probe::item(replacement)),
			&mut |item| {
				assert_eq!(item, Probe::item(old));
				freed += 1;
			},
			EntityKind::Module,
			"probe",
		)
		.unwrap();

		assert_eq!(freed, 1, "old item dropped its last reference");
		assert_eq!(reg.get(idx), Some(Probe::item(replacement)));
		// SAFETY: The replacement is live.
		assert_eq!(unsafe { Probe::item(replacement).as_ref() }.index(), idx);
	}

	#[test]
	fn delete_of_missing_key_fails() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		let r = reg.replace(
			ctx,
			value_pred(5),
			None,
			&mut |_| panic!("nothing to free"),
			EntityKind::Pipeline,
			"ghost",
		);
		assert!(matches!(r, Err(Error::Duplicate { .. })));
	}

	#[test]
	fn delete_then_lookup_misses_and_slot_is_reused() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		reg.insert(ctx, Probe::item(probe(ctx, 1))).unwrap();
		let idx = reg.insert(ctx, Probe::item(probe(ctx, 2))).unwrap();
		reg.insert(ctx, Probe::item(probe(ctx, 3))).unwrap();

		let mut freed = 0;
		reg.replace(ctx, value_pred(2), None, &mut |_| freed += 1, EntityKind::Module, "2")
			.unwrap();
		assert_eq!(freed, 1);
		assert!(reg.lookup(value_pred(2)).is_none());

		// First-null-slot placement lands in the vacated slot.
		let again = reg.insert(ctx, Probe::item(probe(ctx, 4))).unwrap();
		assert_eq!(again, idx);
	}

	#[test]
	fn copy_shares_items_and_bumps_refcounts() {
		let s = Scratch::new();
		let (ctx, reg) = (s.ctx(), s.registry());
		// SAFETY: Single-threaded test scratch.
		let reg = unsafe { &mut *reg.as_ptr() };

		let a = probe(ctx, 1);
		let idx = reg.insert(ctx, Probe::item(a)).unwrap();

		let copy_ptr = ctx.alloc(size_of::<Registry>() as u64).unwrap().cast::<Registry>();
		// SAFETY: Fresh allocation.
		unsafe { Registry::init(copy_ptr) };
		// SAFETY: Just initialized, unaliased.
		let copy = unsafe { &mut *copy_ptr.as_ptr() };

		reg.copy_into(ctx, copy).unwrap();
		assert_eq!(copy.capacity(), reg.capacity());
		assert_eq!(copy.get(idx), Some(Probe::item(a)));
		// SAFETY: The item is live.
		assert_eq!(unsafe { Probe::item(a).as_ref() }.refcount(), 2);

		// Dropping one registry keeps the shared item alive.
		let mut freed = 0;
		copy.destroy(ctx, &mut |_| freed += 1);
		assert_eq!(freed, 0);
		// SAFETY: As above.
		assert_eq!(unsafe { Probe::item(a).as_ref() }.refcount(), 1);

		reg.destroy(ctx, &mut |_| freed += 1);
		assert_eq!(freed, 1);
	}
}

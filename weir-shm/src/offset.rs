//! Self-relative offset pointers.
//!
//! An offset pointer is a single machine word stored at some address `S`
//! inside the shared arena. Reading it resolves `S + offset`; writing it to
//! point at absolute address `T` stores `T - S`. The null encoding is
//! offset `0`, the value that resolves to `S` itself. Because every
//! resolution is relative to the word's own address, the whole arena can be
//! mapped at any base address in any process with no fix-up pass.
//!
//! Offset pointers are meaningful only at the arena location they were
//! written to. They must never be moved, copied or swapped bytewise; a
//! non-null value is re-encoded for its new location by loading it from the
//! old cell and storing it into the new one.

use core::{
	fmt,
	marker::PhantomData,
	ptr::NonNull,
	sync::atomic::{AtomicI64, Ordering},
};

use static_assertions::assert_eq_size;

/// A self-relative pointer to a `T` inside the shared arena.
///
/// The type is deliberately neither `Clone` nor `Copy`: duplicating the
/// raw offset re-bases it to wherever the copy lands, which is never what
/// is wanted. Use [`OffsetPtr::load`] + [`OffsetPtr::store`] to transfer a
/// target between cells.
#[repr(transparent)]
pub struct OffsetPtr<T> {
	/// Signed byte distance from this cell to the target, or 0 for null.
	off: i64,
	/// Variance marker; the cell behaves like a raw pointer to `T`.
	_ty: PhantomData<*mut T>,
}

assert_eq_size!(OffsetPtr<u8>, u64);

impl<T> OffsetPtr<T> {
	/// A null (self-referencing) offset pointer.
	///
	/// Null is the only value that may be written bytewise, e.g. as part
	/// of a containing struct's placement write.
	#[must_use]
	pub const fn null() -> Self {
		Self {
			off: 0,
			_ty: PhantomData,
		}
	}

	/// Whether the cell currently encodes null.
	#[must_use]
	pub fn is_null(&self) -> bool {
		self.off == 0
	}

	/// Resolves the cell to an absolute pointer in the caller's mapping.
	#[must_use]
	pub fn load(&self) -> Option<NonNull<T>> {
		if self.off == 0 {
			return None;
		}

		let addr = core::ptr::from_ref(self) as usize;
		let target = addr.wrapping_add(self.off as usize);

		// SAFETY: A non-null offset was stored from a live arena pointer
		// SAFETY: relative to this cell's address; resolving it from the
		// SAFETY: same cell therefore yields that pointer back (possibly
		// SAFETY: under a different mapping base, which cancels out).
		Some(unsafe { NonNull::new_unchecked(target as *mut T) })
	}

	/// Resolves the cell `idx` elements past the target.
	///
	/// Convenience for arena arrays of plain `T`; returns `None` if the
	/// cell is null.
	#[must_use]
	pub fn load_at(&self, idx: usize) -> Option<NonNull<T>> {
		let base = self.load()?;
		// SAFETY: The caller indexes within the array the cell points at;
		// SAFETY: the arena never borders the address-space ends.
		Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(idx)) })
	}

	/// Points the cell at `target` (or null).
	pub fn store(&mut self, target: Option<NonNull<T>>) {
		let addr = core::ptr::from_ref(&*self) as usize;
		self.off = match target {
			None => 0,
			Some(p) => (p.as_ptr() as usize).wrapping_sub(addr) as i64,
		};
	}

	/// Raw signed offset, for diagnostics only.
	#[must_use]
	pub fn raw_offset(&self) -> i64 {
		self.off
	}
}

impl<T> fmt::Debug for OffsetPtr<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.off == 0 {
			f.write_str("OffsetPtr(null)")
		} else {
			write!(f, "OffsetPtr({:+})", self.off)
		}
	}
}

/// A self-relative pointer with atomic load/store semantics.
///
/// Same encoding contract as [`OffsetPtr`]; used for the zone's active
/// generation cell, which a mutator publishes with `Release` while workers
/// read it with `Acquire`.
#[repr(transparent)]
pub struct AtomicOffsetPtr<T> {
	/// Signed byte distance from this cell to the target, or 0 for null.
	off: AtomicI64,
	/// Variance marker; the cell behaves like a raw pointer to `T`.
	_ty: PhantomData<*mut T>,
}

assert_eq_size!(AtomicOffsetPtr<u8>, u64);

impl<T> AtomicOffsetPtr<T> {
	/// A null (self-referencing) atomic offset pointer.
	#[must_use]
	pub const fn null() -> Self {
		Self {
			off: AtomicI64::new(0),
			_ty: PhantomData,
		}
	}

	/// Resolves the cell to an absolute pointer in the caller's mapping.
	#[must_use]
	pub fn load(&self, order: Ordering) -> Option<NonNull<T>> {
		let off = self.off.load(order);
		if off == 0 {
			return None;
		}

		let addr = core::ptr::from_ref(self) as usize;
		let target = addr.wrapping_add(off as usize);

		// SAFETY: Same argument as `OffsetPtr::load`; the offset was
		// SAFETY: encoded relative to this cell.
		Some(unsafe { NonNull::new_unchecked(target as *mut T) })
	}

	/// Points the cell at `target` (or null).
	pub fn store(&self, target: Option<NonNull<T>>, order: Ordering) {
		let addr = core::ptr::from_ref(self) as usize;
		let off = match target {
			None => 0,
			Some(p) => (p.as_ptr() as usize).wrapping_sub(addr) as i64,
		};
		self.off.store(off, order);
	}
}

impl<T> fmt::Debug for AtomicOffsetPtr<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "AtomicOffsetPtr({:+})", self.off.load(Ordering::Relaxed))
	}
}

/// Returns a shared reference to the `idx`th cell of an arena array of
/// offset pointers.
///
/// # Safety
/// `base` must point at a live arena array of at least `idx + 1`
/// [`OffsetPtr`] cells, and no mutable reference to the cell may exist for
/// the duration of the returned borrow.
#[must_use]
pub unsafe fn slot<'a, T>(base: NonNull<OffsetPtr<T>>, idx: usize) -> &'a OffsetPtr<T> {
	// SAFETY: Bounds and aliasing are offloaded to the caller.
	unsafe { &*base.as_ptr().add(idx) }
}

/// Returns a mutable reference to the `idx`th cell of an arena array of
/// offset pointers.
///
/// # Safety
/// `base` must point at a live arena array of at least `idx + 1`
/// [`OffsetPtr`] cells, and the cell must not be aliased for the duration
/// of the returned borrow. Arena mutation is serialized by the zone's
/// writer lock.
#[must_use]
pub unsafe fn slot_mut<'a, T>(base: NonNull<OffsetPtr<T>>, idx: usize) -> &'a mut OffsetPtr<T> {
	// SAFETY: Bounds and aliasing are offloaded to the caller.
	unsafe { &mut *base.as_ptr().add(idx) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_roundtrip() {
		let p = OffsetPtr::<u64>::null();
		assert!(p.is_null());
		assert!(p.load().is_none());
	}

	#[test]
	fn store_load_resolves() {
		let mut value = 7_u64;
		let mut cell = OffsetPtr::<u64>::null();
		cell.store(Some(NonNull::from(&mut value)));
		assert!(!cell.is_null());

		let got = cell.load().unwrap();
		// SAFETY: `got` resolves back to `value` above.
		assert_eq!(unsafe { *got.as_ptr() }, 7);
	}

	#[test]
	fn both_directions_resolve() {
		// Targets on either side of the cell exercise the signed encoding.
		let mut values = [11_u64, 0, 22];
		let lo = NonNull::from(&mut values[0]);
		let hi = NonNull::from(&mut values[2]);

		let mut cell = OffsetPtr::<u64>::null();
		// SAFETY: `values[1]` is a live u64 we treat as the cell's storage.
		let cell_in_place = unsafe { &mut *core::ptr::from_mut(&mut values[1]).cast::<OffsetPtr<u64>>() };
		cell_in_place.store(Some(lo));
		assert!(cell_in_place.raw_offset() < 0);
		assert_eq!(cell_in_place.load(), Some(lo));
		cell_in_place.store(Some(hi));
		assert!(cell_in_place.raw_offset() > 0);
		assert_eq!(cell_in_place.load(), Some(hi));
		cell.store(None);
		assert!(cell.is_null());
	}

	#[test]
	fn atomic_store_load() {
		let mut value = 3_u32;
		let cell = AtomicOffsetPtr::<u32>::null();
		assert!(cell.load(Ordering::Acquire).is_none());
		cell.store(Some(NonNull::from(&mut value)), Ordering::Release);
		assert_eq!(
			cell.load(Ordering::Acquire),
			Some(NonNull::from(&mut value))
		);
	}
}

//! The counter binder.
//!
//! Every configurable entity declares a [`CounterRegistry`]: a typed
//! list of counter declarations with fixed cardinalities. For each
//! (device, pipeline, function, chain, module) path present in an
//! installed generation, the binder maintains exactly one
//! [`CounterStorage`], addressed by its [`CounterPath`]. Storages are
//! spawned at install time from the previous generation's storage for the
//! same path, so numeric identity survives configuration updates for
//! counters whose declarations still match.

mod path;
mod storage;

pub use path::{CounterPath, PathFlavor};
pub use storage::{CounterStorage, StorageSlot};

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::error::Error;

/// Initial declaration-array capacity.
const DECL_CAP: u64 = 4;

/// One counter declaration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct CounterDecl {
	/// Counter name, unique within its registry.
	pub name:        Name,
	/// Number of 64-bit value cells the counter occupies.
	pub cardinality: u64,
}

/// An entity's declared counters.
///
/// Embedded in every entity descriptor; builders register the entity's
/// canonical counters right after placement. The declaration array holds
/// plain data, so growth may move it bytewise.
#[repr(C)]
pub struct CounterRegistry {
	/// The declaration array, or null while empty.
	decls:       OffsetPtr<CounterDecl>,
	/// Registered declarations.
	count:       u64,
	/// Allocated declaration slots.
	capacity:    u64,
	/// Running total of cardinalities.
	value_count: u64,
}

impl CounterRegistry {
	/// An empty registry, safe to place bytewise.
	#[must_use]
	pub const fn empty() -> Self {
		Self {
			decls:       OffsetPtr::null(),
			count:       0,
			capacity:    0,
			value_count: 0,
		}
	}

	/// Registers a counter declaration.
	pub fn register(&mut self, ctx: &MemCtx, name: Name, cardinality: u64) -> Result<(), Error> {
		debug_assert!(cardinality > 0, "zero-cardinality counter");
		debug_assert!(
			self.find(&name).is_none(),
			"duplicate counter declaration {name}"
		);

		if self.count == self.capacity {
			let new_cap = if self.capacity == 0 {
				DECL_CAP
			} else {
				self.capacity * 2
			};
			let new = ctx
				.alloc(round_up(new_cap * size_of::<CounterDecl>() as u64))?
				.cast::<CounterDecl>();

			if let Some(old) = self.decls.load() {
				// SAFETY: Declarations are plain data; both arrays are
				// SAFETY: live and do not overlap.
				unsafe {
					core::ptr::copy_nonoverlapping(
						old.as_ptr(),
						new.as_ptr(),
						self.count as usize,
					);
				}
				ctx.free(
					old.cast(),
					round_up(self.capacity * size_of::<CounterDecl>() as u64),
				);
			}

			self.decls.store(Some(new));
			self.capacity = new_cap;
		}

		let base = self.decls.load().expect("declaration array present");
		// SAFETY: `count < capacity` after the growth above.
		unsafe {
			base.as_ptr()
				.add(self.count as usize)
				.write(CounterDecl { name, cardinality });
		}
		self.count += 1;
		self.value_count += cardinality;
		Ok(())
	}

	/// The registered declarations.
	#[must_use]
	pub fn decls(&self) -> &[CounterDecl] {
		match self.decls.load() {
			None => &[],
			// SAFETY: The array holds `count` initialized declarations.
			Some(p) => unsafe { core::slice::from_raw_parts(p.as_ptr(), self.count as usize) },
		}
	}

	/// Index of the declaration named `name`.
	#[must_use]
	pub fn find(&self, name: &Name) -> Option<u64> {
		self.decls()
			.iter()
			.position(|d| d.name == *name)
			.map(|i| i as u64)
	}

	/// Total value cells across all declarations.
	#[must_use]
	pub fn value_count(&self) -> u64 {
		self.value_count
	}

	/// Releases the declaration array.
	pub fn destroy(&mut self, ctx: &MemCtx) {
		if let Some(p) = self.decls.load() {
			ctx.free(
				p.cast(),
				round_up(self.capacity * size_of::<CounterDecl>() as u64),
			);
		}
		self.decls.store(None);
		self.count = 0;
		self.capacity = 0;
		self.value_count = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil::Scratch;

	fn name(s: &str) -> Name {
		Name::new(s).unwrap()
	}

	#[test]
	fn register_and_find() {
		let s = Scratch::new();
		let ctx = s.ctx();

		let reg_ptr = ctx
			.alloc(size_of::<CounterRegistry>() as u64)
			.unwrap()
			.cast::<CounterRegistry>();
		// SAFETY: Fresh allocation; `empty()` is position-independent.
		unsafe { reg_ptr.as_ptr().write(CounterRegistry::empty()) };
		// SAFETY: Just placed, unaliased.
		let reg = unsafe { &mut *reg_ptr.as_ptr() };

		reg.register(ctx, name("input"), 1).unwrap();
		reg.register(ctx, name("output"), 1).unwrap();
		reg.register(ctx, name("input_hist"), 8).unwrap();

		assert_eq!(reg.decls().len(), 3);
		assert_eq!(reg.find(&name("output")), Some(1));
		assert_eq!(reg.find(&name("drop")), None);
		assert_eq!(reg.value_count(), 10);

		// Growth past the initial capacity keeps earlier declarations.
		for i in 0..8 {
			reg.register(ctx, name(&format!("extra{i}")), 1).unwrap();
		}
		assert_eq!(reg.find(&name("input")), Some(0));
		assert_eq!(reg.decls().len(), 11);

		reg.destroy(ctx);
		assert!(reg.decls().is_empty());
	}
}

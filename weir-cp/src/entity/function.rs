//! Functions: weighted selection among chains.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::{
	config::FunctionConfig,
	counter::CounterRegistry,
	entity::Chain,
	error::{EntityKind, Error},
	registry::{Embedded, RegistryItem},
};

/// One (chain, weight) pair in a function's tail.
#[repr(C)]
pub struct ChainSlot {
	/// The owned chain descriptor.
	chain:      OffsetPtr<Chain>,
	/// Positive selection weight.
	pub weight: u64,
}

impl ChainSlot {
	/// The slot's chain.
	#[must_use]
	pub fn chain(&self) -> NonNull<Chain> {
		self.chain.load().expect("chain slots are always populated")
	}
}

/// A weighted selection among chains.
///
/// Chains are built and owned inline: they live and die with the
/// function. The total weight is recorded as `chain_map_size`; the
/// execution context expands it into the flat chain map a worker indexes
/// with a single modulo.
#[repr(C)]
pub struct Function {
	/// Registry header.
	item:           RegistryItem,
	/// Function name.
	name:           Name,
	/// Declared counters.
	counters:       CounterRegistry,
	/// Chains in the tail.
	chain_count:    u64,
	/// Sum of the chain weights.
	chain_map_size: u64,
	/// Total bytes of the one-shot allocation.
	alloc_size:     u64,
	// Tail: `[ChainSlot; chain_count]`.
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for Function {}

impl Function {
	/// Builds a function and its chains from a config.
	///
	/// An empty function (zero chains) is legal and yields a zero
	/// `chain_map_size`; zero weights are rejected.
	pub fn build(ctx: &MemCtx, cfg: &FunctionConfig) -> Result<NonNull<Self>, Error> {
		let name = Name::new(&cfg.name)?;

		for chain in &cfg.chains {
			if chain.weight == 0 {
				return Err(Error::InvalidWeight {
					kind: EntityKind::Function,
					name: cfg.name.clone(),
				});
			}
		}

		let count = cfg.chains.len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<ChainSlot>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				name,
				counters: CounterRegistry::empty(),
				chain_count: count,
				chain_map_size: 0,
				alloc_size: size,
			});
		}

		let mut built = 0_u64;
		let result = (|| {
			// SAFETY: Just placed; unaliased until returned.
			unsafe { &mut (*this.as_ptr()).counters }
				.register(ctx, Name::new("selected").expect("static name"), 1)?;

			for (i, chain_cfg) in cfg.chains.iter().enumerate() {
				let chain = Chain::build(ctx, chain_cfg)?;
				// SAFETY: The tail holds `count` slots; `i < count`.
				unsafe {
					let slot = Self::slots_ptr(this).as_ptr().add(i);
					slot.write(ChainSlot {
						chain:  OffsetPtr::null(),
						weight: chain_cfg.weight,
					});
					(*slot).chain.store(Some(chain));
					(*this.as_ptr()).chain_map_size += chain_cfg.weight;
				}
				built += 1;
			}
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: Exactly `built` chains were attached; nothing else
			// SAFETY: references the descriptor yet.
			unsafe { Self::free_first(this, built, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the function and its chains.
	///
	/// # Safety
	/// `this` must be a live function whose reference count reached zero,
	/// under the zone writer lock.
	pub unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		let count = unsafe { (*this.as_ptr()).chain_count };
		// SAFETY: A fully built function owns `chain_count` chains.
		unsafe { Self::free_first(this, count, ctx) };
	}

	/// Frees the first `n` owned chains, the counter registry, and the
	/// descriptor itself. Unwind helper for [`Self::build`].
	///
	/// # Safety
	/// Exactly the first `n` tail slots must hold live chains.
	unsafe fn free_first(this: NonNull<Self>, n: u64, ctx: &MemCtx) {
		for i in 0..n as usize {
			// SAFETY: Slot `i` was attached per the caller contract.
			let chain = unsafe { (*Self::slots_ptr(this).as_ptr().add(i)).chain.load() };
			if let Some(chain) = chain {
				// SAFETY: The function exclusively owns its chains.
				unsafe { Chain::free(chain, ctx) };
			}
		}
		// SAFETY: Offloaded to the caller.
		unsafe {
			(*this.as_ptr()).counters.destroy(ctx);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// First tail slot.
	fn slots_ptr(this: NonNull<Self>) -> NonNull<ChainSlot> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<ChainSlot>()) }
	}

	/// The function's (chain, weight) slots.
	#[must_use]
	pub fn chains(&self) -> &[ChainSlot] {
		let this = NonNull::from(self);
		// SAFETY: A live function's tail holds `chain_count` slots.
		unsafe {
			core::slice::from_raw_parts(Self::slots_ptr(this).as_ptr(), self.chain_count as usize)
		}
	}

	/// The function's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// Sum of the chain weights; the length of the expanded chain map.
	#[must_use]
	pub fn chain_map_size(&self) -> u64 {
		self.chain_map_size
	}

	/// The function's declared counters.
	#[must_use]
	pub fn counters(&self) -> &CounterRegistry {
		&self.counters
	}

	/// A registry predicate matching a function by name.
	#[must_use]
	pub fn name_pred(name: Name) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in the function registry head functions.
			unsafe { Self::from_item(item).as_ref() }.name == name
		}
	}
}

//! Chains: ordered module references within a function.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, round_up};

use crate::{
	config::ChainConfig,
	counter::CounterRegistry,
	error::Error,
};

/// A (module type, module name) reference inside a chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct ModuleRef {
	/// Handler type of the referenced module.
	pub module_type: Name,
	/// Name of the referenced module.
	pub name:        Name,
}

/// An ordered sequence of module references.
///
/// Chains are owned by their function (built and freed with it) and are
/// not registered in any generation registry, so they carry no registry
/// header. Module resolution is deferred: the references are copied by
/// (type, name) here and resolved when the execution context is built.
#[repr(C)]
pub struct Chain {
	/// Chain name, unique within its function.
	name:         Name,
	/// Declared counters.
	counters:     CounterRegistry,
	/// Module references in the tail.
	module_count: u64,
	/// Total bytes of the one-shot allocation.
	alloc_size:   u64,
	// Tail: `[ModuleRef; module_count]`.
}

impl Chain {
	/// Builds a chain descriptor from its config.
	pub fn build(ctx: &MemCtx, cfg: &ChainConfig) -> Result<NonNull<Self>, Error> {
		let name = Name::new(&cfg.name)?;

		let mut refs = Vec::with_capacity(cfg.modules.len());
		for (ty, n) in &cfg.modules {
			refs.push(ModuleRef {
				module_type: Name::new(ty)?,
				name:        Name::new(n)?,
			});
		}

		let count = refs.len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<ModuleRef>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation; the empty counter registry is
		// SAFETY: position-independent.
		unsafe {
			this.as_ptr().write(Self {
				name,
				counters: CounterRegistry::empty(),
				module_count: count,
				alloc_size: size,
			});
			for (i, r) in refs.iter().enumerate() {
				Self::refs_ptr(this).as_ptr().add(i).write(*r);
			}
		}

		// SAFETY: Just placed; unaliased until returned.
		if let Err(err) = unsafe { &mut (*this.as_ptr()).counters }
			.register(ctx, Name::new("selected").expect("static name"), 1)
		{
			// SAFETY: Fully placed above; nothing else references it.
			unsafe { Self::free(this, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the descriptor.
	///
	/// # Safety
	/// `this` must be a live chain that nothing references anymore.
	pub unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			(*this.as_ptr()).counters.destroy(ctx);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// First module reference of the tail.
	fn refs_ptr(this: NonNull<Self>) -> NonNull<ModuleRef> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<ModuleRef>()) }
	}

	/// The chain's module references.
	#[must_use]
	pub fn module_refs(&self) -> &[ModuleRef] {
		let this = NonNull::from(self);
		// SAFETY: A live chain's tail holds `module_count` references.
		unsafe {
			core::slice::from_raw_parts(Self::refs_ptr(this).as_ptr(), self.module_count as usize)
		}
	}

	/// The chain's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// The chain's declared counters.
	#[must_use]
	pub fn counters(&self) -> &CounterRegistry {
		&self.counters
	}
}

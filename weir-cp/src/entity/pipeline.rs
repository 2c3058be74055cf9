//! Pipelines: ordered sequences of functions.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, round_up};

use crate::{
	config::PipelineConfig,
	counter::CounterRegistry,
	entity::Function,
	error::{EntityKind, Error},
	registry::{Embedded, Registry, RegistryItem},
};

/// Bucket count of the canonical input histogram counter.
const INPUT_HIST_BUCKETS: u64 = 8;

/// An ordered sequence of function names.
///
/// Function references are stored by name; the execution context resolves
/// them to concrete function instances. Validation happens against the
/// generation under assembly, which already contains any functions
/// updated in the same step.
#[repr(C)]
pub struct Pipeline {
	/// Registry header.
	item:           RegistryItem,
	/// Pipeline name.
	name:           Name,
	/// Declared counters.
	counters:       CounterRegistry,
	/// Function names in the tail.
	function_count: u64,
	/// Total bytes of the one-shot allocation.
	alloc_size:     u64,
	// Tail: `[Name; function_count]`.
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for Pipeline {}

impl Pipeline {
	/// Builds a pipeline, validating every function name against
	/// `functions` (the new generation's function registry).
	pub fn build(
		ctx: &MemCtx,
		functions: &Registry,
		cfg: &PipelineConfig,
	) -> Result<NonNull<Self>, Error> {
		let name = Name::new(&cfg.name)?;

		let mut resolved = Vec::with_capacity(cfg.functions.len());
		for fname in &cfg.functions {
			let fname = Name::new(fname)?;
			if functions.lookup(Function::name_pred(fname)).is_none() {
				return Err(Error::NotFound {
					kind: EntityKind::Function,
					name: fname.as_str().to_owned(),
				});
			}
			resolved.push(fname);
		}

		let count = resolved.len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<Name>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				name,
				counters: CounterRegistry::empty(),
				function_count: count,
				alloc_size: size,
			});
			for (i, fname) in resolved.iter().enumerate() {
				Self::names_ptr(this).as_ptr().add(i).write(*fname);
			}
		}

		let result = (|| {
			// SAFETY: Just placed; unaliased until returned.
			let counters = unsafe { &mut (*this.as_ptr()).counters };
			counters.register(ctx, Name::new("input").expect("static name"), 1)?;
			counters.register(ctx, Name::new("output").expect("static name"), 1)?;
			counters.register(ctx, Name::new("drop").expect("static name"), 1)?;
			counters.register(
				ctx,
				Name::new("input_hist").expect("static name"),
				INPUT_HIST_BUCKETS,
			)
		})();

		if let Err(err) = result {
			// SAFETY: Fully placed above; nothing else references it.
			unsafe { Self::free(this, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the descriptor.
	///
	/// # Safety
	/// `this` must be a live pipeline whose reference count reached zero,
	/// under the zone writer lock.
	pub unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			(*this.as_ptr()).counters.destroy(ctx);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// First tail name.
	fn names_ptr(this: NonNull<Self>) -> NonNull<Name> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<Name>()) }
	}

	/// The pipeline's function names, in stage order.
	#[must_use]
	pub fn functions(&self) -> &[Name] {
		let this = NonNull::from(self);
		// SAFETY: A live pipeline's tail holds `function_count` names.
		unsafe {
			core::slice::from_raw_parts(Self::names_ptr(this).as_ptr(), self.function_count as usize)
		}
	}

	/// The pipeline's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// The pipeline's declared counters.
	#[must_use]
	pub fn counters(&self) -> &CounterRegistry {
		&self.counters
	}

	/// A registry predicate matching a pipeline by name.
	#[must_use]
	pub fn name_pred(name: Name) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in the pipeline registry head pipelines.
			unsafe { Self::from_item(item).as_ref() }.name == name
		}
	}
}

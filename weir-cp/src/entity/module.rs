//! Control-plane modules: named instances of dataplane packet handlers.

use core::ptr::NonNull;

use weir_dp::DpDirectory;
use weir_shm::{BlockAlloc, MemCtx, Name, OffsetPtr, round_up};

use crate::{
	agent::AgentRec,
	config::ModuleConfig,
	counter::CounterRegistry,
	error::{EntityKind, Error},
	registry::{Embedded, RegistryItem},
};

/// Default sub-arena size when the config does not specify one.
const DEFAULT_SUB_ARENA: u64 = 16 * 1024;

/// A named instance of a dataplane packet handler.
///
/// The module owns a *sub-arena*: a region carved out of the parent arena
/// with its own allocator, holding the handler's configuration blob and
/// whatever state the handler builds from it. Dataplane code may hold
/// pointers into the sub-arena while the registry has already forgotten
/// the module, which is why removal soft-retires the module onto its
/// owning agent's unused list instead of freeing it; the agent releases
/// it during its own teardown.
#[repr(C)]
pub struct Module {
	/// Registry header.
	item:            RegistryItem,
	/// Dataplane handler type.
	module_type:     Name,
	/// Module instance name.
	name:            Name,
	/// Index of the handler in the dataplane module table.
	dp_module_index: u64,
	/// Declared counters.
	counters:        CounterRegistry,
	/// The sub-arena region (allocator state at its base).
	sub_region:      OffsetPtr<u8>,
	/// Sub-arena region size in bytes.
	sub_size:        u64,
	/// Allocation context over the sub-arena.
	sub_ctx:         MemCtx,
	/// Handler configuration blob, inside the sub-arena.
	data:            OffsetPtr<u8>,
	/// Blob length in bytes.
	data_len:        u64,
	/// Intrusive link for the owning agent's unused list.
	unused_next:     OffsetPtr<Module>,
	/// The agent that created this module.
	owner:           OffsetPtr<AgentRec>,
	/// Device-affinity names in the tail.
	device_count:    u64,
	/// Total bytes of the descriptor allocation.
	alloc_size:      u64,
	// Tail: `[Name; device_count]`.
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for Module {}

impl Module {
	/// Builds a module descriptor, resolving its handler type through the
	/// dataplane directory and materializing its sub-arena.
	pub fn build(
		ctx: &MemCtx,
		dir: &DpDirectory,
		owner: NonNull<AgentRec>,
		cfg: &ModuleConfig,
	) -> Result<NonNull<Self>, Error> {
		let module_type = Name::new(&cfg.module_type)?;
		let name = Name::new(&cfg.name)?;

		let dp_module_index = dir.module(&module_type).ok_or_else(|| Error::NotFound {
			kind: EntityKind::DpModule,
			name: cfg.module_type.clone(),
		})?;

		let mut devices = Vec::with_capacity(cfg.devices.len());
		for dev in &cfg.devices {
			devices.push(Name::new(dev)?);
		}

		let count = devices.len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<Name>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation; null pointers, the empty counter
		// SAFETY: registry and the detached context are all
		// SAFETY: position-independent.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				module_type,
				name,
				dp_module_index,
				counters: CounterRegistry::empty(),
				sub_region: OffsetPtr::null(),
				sub_size: 0,
				sub_ctx: MemCtx::empty(),
				data: OffsetPtr::null(),
				data_len: 0,
				unused_next: OffsetPtr::null(),
				owner: OffsetPtr::null(),
				device_count: count,
				alloc_size: size,
			});
			(*this.as_ptr()).owner.store(Some(owner));
			for (i, dev) in devices.iter().enumerate() {
				Self::devices_ptr(this).as_ptr().add(i).write(*dev);
			}
		}

		let result = (|| {
			// Carve the sub-arena out of the parent context and hang the
			// module's own allocator off its base.
			let sub_size = round_up(if cfg.arena_size == 0 {
				DEFAULT_SUB_ARENA
			} else {
				cfg.arena_size
			});
			let region = ctx.alloc(sub_size)?;
			// SAFETY: Just placed above; region is fresh and big enough
			// SAFETY: for the allocator header by construction.
			unsafe {
				(*this.as_ptr()).sub_region.store(Some(region));
				(*this.as_ptr()).sub_size = sub_size;

				let sub_alloc = region.cast::<BlockAlloc>();
				let heap_off = round_up(size_of::<BlockAlloc>() as u64);
				let heap = NonNull::new_unchecked(region.as_ptr().add(heap_off as usize));
				BlockAlloc::init(sub_alloc, heap, sub_size.saturating_sub(heap_off));

				MemCtx::init(
					NonNull::new_unchecked(&raw mut (*this.as_ptr()).sub_ctx),
					sub_alloc,
					name.as_str(),
				);
			}

			if !cfg.data.is_empty() {
				// SAFETY: The sub context was initialized above.
				let sub_ctx = unsafe { &(*this.as_ptr()).sub_ctx };
				let blob = sub_ctx.alloc(cfg.data.len() as u64)?;
				// SAFETY: The blob allocation holds `data.len()` bytes.
				unsafe {
					core::ptr::copy_nonoverlapping(
						cfg.data.as_ptr(),
						blob.as_ptr(),
						cfg.data.len(),
					);
					(*this.as_ptr()).data.store(Some(blob));
					(*this.as_ptr()).data_len = cfg.data.len() as u64;
				}
			}

			// SAFETY: Just placed; unaliased until returned.
			let counters = unsafe { &mut (*this.as_ptr()).counters };
			counters.register(ctx, Name::new("rx_packets").expect("static name"), 1)?;
			counters.register(ctx, Name::new("tx_packets").expect("static name"), 1)?;
			counters.register(ctx, Name::new("drops").expect("static name"), 1)
		})();

		if let Err(err) = result {
			// SAFETY: Nothing references the half-built descriptor.
			unsafe { Self::destroy(this, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the module, its sub-arena and its descriptor.
	///
	/// The core never calls this on registry removal; modules are
	/// soft-retired to their owning agent (see [`AgentRec`]); the agent
	/// calls this during teardown. Builders also call it to unwind a
	/// never-registered descriptor.
	///
	/// # Safety
	/// `this` must be live and unreferenced: off every registry, off the
	/// unused list, and past quiescence of every generation that knew it.
	pub unsafe fn destroy(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller. Freeing the sub-region releases
		// SAFETY: the blob and all handler state with it.
		unsafe {
			(*this.as_ptr()).counters.destroy(ctx);
			if let Some(region) = (*this.as_ptr()).sub_region.load() {
				ctx.free(region, (*this.as_ptr()).sub_size);
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// First device name of the tail.
	fn devices_ptr(this: NonNull<Self>) -> NonNull<Name> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<Name>()) }
	}

	/// The module's declared device affinities.
	#[must_use]
	pub fn devices(&self) -> &[Name] {
		let this = NonNull::from(self);
		// SAFETY: A live module's tail holds `device_count` names.
		unsafe {
			core::slice::from_raw_parts(Self::devices_ptr(this).as_ptr(), self.device_count as usize)
		}
	}

	/// The handler configuration blob.
	#[must_use]
	pub fn data(&self) -> &[u8] {
		match self.data.load() {
			None => &[],
			// SAFETY: The blob was copied in whole at build time.
			Some(p) => unsafe { core::slice::from_raw_parts(p.as_ptr(), self.data_len as usize) },
		}
	}

	/// The module's handler type.
	#[must_use]
	pub fn module_type(&self) -> Name {
		self.module_type
	}

	/// The module's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// Index of the handler in the dataplane module table.
	#[must_use]
	pub fn dp_module_index(&self) -> u64 {
		self.dp_module_index
	}

	/// The module's declared counters.
	#[must_use]
	pub fn counters(&self) -> &CounterRegistry {
		&self.counters
	}

	/// The module's sub-arena context.
	#[must_use]
	pub fn sub_ctx(&self) -> &MemCtx {
		&self.sub_ctx
	}

	/// The owning agent.
	#[must_use]
	pub fn owner(&self) -> Option<NonNull<AgentRec>> {
		self.owner.load()
	}

	/// Links the module ahead of `next` on an unused list.
	pub(crate) fn set_unused_next(this: NonNull<Self>, next: Option<NonNull<Self>>) {
		// SAFETY: Serialized by the zone writer lock.
		unsafe { (*this.as_ptr()).unused_next.store(next) };
	}

	/// The next module on the unused list.
	pub(crate) fn unused_next(this: NonNull<Self>) -> Option<NonNull<Self>> {
		// SAFETY: Serialized by the zone writer lock.
		unsafe { (*this.as_ptr()).unused_next.load() }
	}

	/// A registry predicate matching a module by (type, name).
	#[must_use]
	pub fn key_pred(
		module_type: Name,
		name: Name,
	) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in the module registry head modules.
			let m = unsafe { Self::from_item(item).as_ref() };
			m.module_type == module_type && m.name == name
		}
	}
}

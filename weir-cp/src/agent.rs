//! Arena-resident agent records and module soft-retirement.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::{
	entity::Module,
	error::Error,
	registry::{Embedded, RegistryItem},
};

/// The arena record of an attached controller.
///
/// Agents own the modules they create. When a module drops off every
/// generation, the core does not return it to the allocator (its
/// sub-arena may still be referenced by dataplane handler state) but
/// links it onto the owning agent's intrusive *unused list*. The agent
/// drains the list during its own teardown, which is the only place
/// module memory is actually reclaimed.
#[repr(C)]
pub struct AgentRec {
	/// Registry header.
	item:         RegistryItem,
	/// Agent name.
	name:         Name,
	/// Head of the intrusive unused-module list.
	unused_head:  OffsetPtr<Module>,
	/// Modules currently on the unused list.
	unused_count: u64,
	/// Total bytes of the record allocation.
	alloc_size:   u64,
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for AgentRec {}

impl AgentRec {
	/// Allocates a record for a newly attached agent.
	pub(crate) fn create(ctx: &MemCtx, name: Name) -> Result<NonNull<Self>, Error> {
		let size = round_up(size_of::<Self>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				name,
				unused_head: OffsetPtr::null(),
				unused_count: 0,
				alloc_size: size,
			});
		}
		Ok(this)
	}

	/// Soft-retires `module` onto the agent's unused list.
	///
	/// Called by the module registry's free callback when a module's last
	/// registry reference drops; the module keeps its sub-arena.
	pub(crate) fn push_unused(this: NonNull<Self>, module: NonNull<Module>) {
		// SAFETY: Serialized by the zone writer lock.
		unsafe {
			Module::set_unused_next(module, (*this.as_ptr()).unused_head.load());
			(*this.as_ptr()).unused_head.store(Some(module));
			(*this.as_ptr()).unused_count += 1;
		}
	}

	/// Destroys every module on the unused list.
	///
	/// # Safety
	/// Must run under the zone writer lock, after every generation that
	/// referenced the listed modules has been retired.
	pub(crate) unsafe fn drain_unused(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Serialized by the writer lock per the caller contract.
		let mut cur = unsafe { (*this.as_ptr()).unused_head.load() };
		while let Some(module) = cur {
			cur = Module::unused_next(module);
			// SAFETY: Modules on the unused list dropped their last
			// SAFETY: registry reference and the caller guarantees
			// SAFETY: quiescence.
			unsafe { Module::destroy(module, ctx) };
		}
		// SAFETY: As above.
		unsafe {
			(*this.as_ptr()).unused_head.store(None);
			(*this.as_ptr()).unused_count = 0;
		}
	}

	/// Releases the record itself.
	///
	/// # Safety
	/// The unused list must have been drained and the record dropped from
	/// the agent registry.
	pub(crate) unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			debug_assert_eq!((*this.as_ptr()).unused_count, 0, "undrained unused list");
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The agent's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// Modules awaiting reclamation on the unused list.
	#[must_use]
	pub fn unused_count(&self) -> u64 {
		self.unused_count
	}

	/// Iterates the unused list (diagnostics and tests).
	pub(crate) fn unused_iter(this: NonNull<Self>) -> impl Iterator<Item = NonNull<Module>> {
		// SAFETY: Serialized by the zone writer lock.
		let head = unsafe { (*this.as_ptr()).unused_head.load() };
		core::iter::successors(head, |m| Module::unused_next(*m))
	}

	/// A registry predicate matching an agent by name.
	#[must_use]
	pub fn name_pred(name: Name) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in the agent registry head agent records.
			unsafe { Self::from_item(item).as_ref() }.name == name
		}
	}
}

/// The module registry's free callback: soft-retire to the owning agent.
pub(crate) fn retire_module(item: NonNull<RegistryItem>) {
	let module = Module::from_item(item);
	// SAFETY: Items in the module registry head modules; serialized by
	// SAFETY: the zone writer lock.
	match unsafe { module.as_ref() }.owner() {
		Some(agent) => AgentRec::push_unused(agent, module),
		None => {
			// SAFETY: As above.
			let m = unsafe { module.as_ref() };
			log::warn!(
				"module {}:{} has no owning agent; leaking its sub-arena",
				m.module_type(),
				m.name()
			);
		}
	}
}

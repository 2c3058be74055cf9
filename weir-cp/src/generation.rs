//! Configuration generations.
//!
//! A generation is an immutable snapshot of the configuration tree: one
//! registry per entity kind, the counter-storage registry, and a
//! monotonically increasing number. Generations are only ever obtained by
//! *spawning* from the current one (registries are copied by reference
//! with their items' counts bumped), then mutated in place and installed.
//! Entities themselves are immutable post-build, so generations share
//! them freely and never alias a mutable object.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::{
	agent,
	counter::{CounterPath, CounterStorage},
	ectx::GenEctx,
	entity::{Device, Function, Module, Pipeline},
	error::{EntityKind, Error},
	registry::{Embedded, Registry},
};

/// One configuration generation.
#[repr(C)]
pub struct ConfigGen {
	/// Generation number; increases by one per install.
	number:     u64,
	/// Modules, keyed by (type, name).
	modules:    Registry,
	/// Functions, keyed by name.
	functions:  Registry,
	/// Pipelines, keyed by name.
	pipelines:  Registry,
	/// Devices, keyed by name.
	devices:    Registry,
	/// Counter storages, keyed by path.
	storages:   Registry,
	/// The generation's execution context, once built.
	ectx:       OffsetPtr<GenEctx>,
	/// Total bytes of the generation allocation.
	alloc_size: u64,
}

impl ConfigGen {
	/// Allocates the empty generation zero. Zone-initialization only.
	pub(crate) fn bootstrap(ctx: &MemCtx) -> Result<NonNull<Self>, Error> {
		Self::alloc_empty(ctx, 0)
	}

	/// Spawns a mutable successor: number bumped, every entity registry
	/// copied by reference, counter storages keyed afresh at install.
	pub(crate) fn spawn(this: NonNull<Self>, ctx: &MemCtx) -> Result<NonNull<Self>, Error> {
		// SAFETY: The source generation is live and immutable under the
		// SAFETY: zone writer lock.
		let src = unsafe { this.as_ref() };
		let new = Self::alloc_empty(ctx, src.number + 1)?;

		let result = (|| {
			// SAFETY: `new` is fresh and unaliased.
			let dst = unsafe { &mut *new.as_ptr() };
			src.modules.copy_into(ctx, &mut dst.modules)?;
			src.functions.copy_into(ctx, &mut dst.functions)?;
			src.pipelines.copy_into(ctx, &mut dst.pipelines)?;
			src.devices.copy_into(ctx, &mut dst.devices)
		})();

		if let Err(err) = result {
			// SAFETY: Partially copied registries unref cleanly; nothing
			// SAFETY: else references the new generation.
			unsafe { Self::free(new, ctx) };
			return Err(err);
		}
		Ok(new)
	}

	/// Allocates a generation shell with empty registries.
	fn alloc_empty(ctx: &MemCtx, number: u64) -> Result<NonNull<Self>, Error> {
		let size = round_up(size_of::<Self>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation; registries are initialized in place
		// SAFETY: right after the shell is written.
		unsafe {
			(&raw mut (*this.as_ptr()).number).write(number);
			(&raw mut (*this.as_ptr()).ectx).write(OffsetPtr::null());
			(&raw mut (*this.as_ptr()).alloc_size).write(size);
			Registry::init(NonNull::new_unchecked(&raw mut (*this.as_ptr()).modules));
			Registry::init(NonNull::new_unchecked(&raw mut (*this.as_ptr()).functions));
			Registry::init(NonNull::new_unchecked(&raw mut (*this.as_ptr()).pipelines));
			Registry::init(NonNull::new_unchecked(&raw mut (*this.as_ptr()).devices));
			Registry::init(NonNull::new_unchecked(&raw mut (*this.as_ptr()).storages));
		}
		Ok(this)
	}

	/// Destroys the generation: its execution context, its counter
	/// storages, and one reference on every registry slot.
	///
	/// # Safety
	/// `this` must no longer be the active generation, and every worker
	/// must have advertised a generation past it (or it must never have
	/// been published). Runs under the zone writer lock.
	pub(crate) unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Per the caller contract nothing reads the generation
		// SAFETY: anymore; teardown order is ectx (borrows everything),
		// SAFETY: then storages, then entities.
		unsafe {
			if let Some(ectx) = (*this.as_ptr()).ectx.load() {
				GenEctx::free(ectx, ctx);
				(*this.as_ptr()).ectx.store(None);
			}
			(*this.as_ptr()).storages.destroy(ctx, &mut |item| {
				// SAFETY: Storage items head counter storages; the last
				// SAFETY: reference just dropped.
				unsafe { CounterStorage::free(CounterStorage::from_item(item), ctx) };
			});
			(*this.as_ptr()).devices.destroy(ctx, &mut |item| {
				// SAFETY: Device items head devices.
				unsafe { Device::free(Device::from_item(item), ctx) };
			});
			(*this.as_ptr()).pipelines.destroy(ctx, &mut |item| {
				// SAFETY: Pipeline items head pipelines.
				unsafe { Pipeline::free(Pipeline::from_item(item), ctx) };
			});
			(*this.as_ptr()).functions.destroy(ctx, &mut |item| {
				// SAFETY: Function items head functions.
				unsafe { Function::free(Function::from_item(item), ctx) };
			});
			(*this.as_ptr()).modules.destroy(ctx, &mut agent::retire_module);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The generation number.
	#[must_use]
	pub fn number(&self) -> u64 {
		self.number
	}

	/// The generation's execution context, once installed.
	#[must_use]
	pub fn ectx(&self) -> Option<NonNull<GenEctx>> {
		self.ectx.load()
	}

	/// Attaches the freshly built execution context.
	pub(crate) fn set_ectx(this: NonNull<Self>, ectx: NonNull<GenEctx>) {
		// SAFETY: Serialized by the zone writer lock; pre-publication.
		unsafe { (*this.as_ptr()).ectx.store(Some(ectx)) };
	}

	/// Looks up a module by (type, name).
	#[must_use]
	pub fn lookup_module(&self, module_type: &Name, name: &Name) -> Option<NonNull<Module>> {
		let idx = self.modules.lookup(Module::key_pred(*module_type, *name))?;
		self.modules.get(idx).map(Module::from_item)
	}

	/// Looks up a function by name.
	#[must_use]
	pub fn lookup_function(&self, name: &Name) -> Option<NonNull<Function>> {
		let idx = self.functions.lookup(Function::name_pred(*name))?;
		self.functions.get(idx).map(Function::from_item)
	}

	/// Looks up a pipeline by name.
	#[must_use]
	pub fn lookup_pipeline(&self, name: &Name) -> Option<NonNull<Pipeline>> {
		let idx = self.pipelines.lookup(Pipeline::name_pred(*name))?;
		self.pipelines.get(idx).map(Pipeline::from_item)
	}

	/// Looks up a device by name.
	#[must_use]
	pub fn lookup_device(&self, name: &Name) -> Option<NonNull<Device>> {
		let idx = self.devices.lookup(Device::name_pred(*name))?;
		self.devices.get(idx).map(Device::from_item)
	}

	/// Looks up a counter storage by path.
	#[must_use]
	pub fn lookup_storage(&self, path: CounterPath) -> Option<NonNull<CounterStorage>> {
		let idx = self.storages.lookup(CounterStorage::path_pred(path))?;
		self.storages.get(idx).map(CounterStorage::from_item)
	}

	/// Looks up a module and borrows it for inspection.
	#[must_use]
	pub fn lookup_module_ref(&self, module_type: &Name, name: &Name) -> Option<&Module> {
		// SAFETY: Registered entities share the generation's lifetime.
		self.lookup_module(module_type, name)
			.map(|p| unsafe { p.as_ref() })
	}

	/// Looks up a function and borrows it for inspection.
	#[must_use]
	pub fn lookup_function_ref(&self, name: &Name) -> Option<&Function> {
		// SAFETY: As for `lookup_module_ref`.
		self.lookup_function(name).map(|p| unsafe { p.as_ref() })
	}

	/// Looks up a pipeline and borrows it for inspection.
	#[must_use]
	pub fn lookup_pipeline_ref(&self, name: &Name) -> Option<&Pipeline> {
		// SAFETY: As for `lookup_module_ref`.
		self.lookup_pipeline(name).map(|p| unsafe { p.as_ref() })
	}

	/// Looks up a device and borrows it for inspection.
	#[must_use]
	pub fn lookup_device_ref(&self, name: &Name) -> Option<&Device> {
		// SAFETY: As for `lookup_module_ref`.
		self.lookup_device(name).map(|p| unsafe { p.as_ref() })
	}

	/// Looks up a counter storage and borrows it for inspection.
	#[must_use]
	pub fn lookup_storage_ref(&self, path: CounterPath) -> Option<&CounterStorage> {
		// SAFETY: As for `lookup_module_ref`.
		self.lookup_storage(path).map(|p| unsafe { p.as_ref() })
	}

	/// The execution context, borrowed for inspection.
	#[must_use]
	pub fn ectx_ref(&self) -> Option<&GenEctx> {
		// SAFETY: The context shares the generation's lifetime.
		self.ectx.load().map(|p| unsafe { p.as_ref() })
	}

	/// The module at registry slot `index`.
	#[must_use]
	pub fn get_module(&self, index: u64) -> Option<NonNull<Module>> {
		self.modules.get(index).map(Module::from_item)
	}

	/// The device at registry slot `index`.
	#[must_use]
	pub fn get_device(&self, index: u64) -> Option<NonNull<Device>> {
		self.devices.get(index).map(Device::from_item)
	}

	/// Allocated device slots; slots beyond the live entries are null.
	#[must_use]
	pub fn device_capacity(&self) -> u64 {
		self.devices.capacity()
	}

	/// Allocated module slots; slots beyond the live entries are null.
	#[must_use]
	pub fn module_capacity(&self) -> u64 {
		self.modules.capacity()
	}

	/// The function registry (builders validate references against it).
	#[must_use]
	pub fn function_registry(&self) -> &Registry {
		&self.functions
	}

	/// The pipeline registry.
	#[must_use]
	pub fn pipeline_registry(&self) -> &Registry {
		&self.pipelines
	}

	/// The counter-storage registry, for install-time spawning.
	pub(crate) fn storages_mut(&mut self) -> &mut Registry {
		&mut self.storages
	}

	/// Inserts or replaces a module under its (type, name) key.
	pub(crate) fn upsert_module(
		&mut self,
		ctx: &MemCtx,
		module: NonNull<Module>,
	) -> Result<(), Error> {
		// SAFETY: The freshly built module is live.
		let (ty, name) = {
			let m = unsafe { module.as_ref() };
			(m.module_type(), m.name())
		};
		self.modules.replace(
			ctx,
			Module::key_pred(ty, name),
			Some(Module::item(module)),
			&mut agent::retire_module,
			EntityKind::Module,
			name.as_str(),
		)
	}

	/// Deletes a module, refusing while any chain references it.
	pub(crate) fn delete_module(
		&mut self,
		ctx: &MemCtx,
		module_type: &Name,
		name: &Name,
	) -> Result<(), Error> {
		if let Some(holder) = self.module_user(module_type, name) {
			return Err(Error::InUse {
				kind:   EntityKind::Module,
				name:   name.as_str().to_owned(),
				holder,
			});
		}
		self.modules.replace(
			ctx,
			Module::key_pred(*module_type, *name),
			None,
			&mut agent::retire_module,
			EntityKind::Module,
			name.as_str(),
		)
	}

	/// Inserts or replaces a function under its name.
	pub(crate) fn upsert_function(
		&mut self,
		ctx: &MemCtx,
		function: NonNull<Function>,
	) -> Result<(), Error> {
		// SAFETY: The freshly built function is live.
		let name = unsafe { function.as_ref() }.name();
		self.functions.replace(
			ctx,
			Function::name_pred(name),
			Some(Function::item(function)),
			&mut |item| {
				// SAFETY: Function items head functions.
				unsafe { Function::free(Function::from_item(item), ctx) };
			},
			EntityKind::Function,
			name.as_str(),
		)
	}

	/// Deletes a function, refusing while any pipeline references it.
	pub(crate) fn delete_function(&mut self, ctx: &MemCtx, name: &Name) -> Result<(), Error> {
		if let Some(holder) = self.function_user(name) {
			return Err(Error::InUse {
				kind:   EntityKind::Function,
				name:   name.as_str().to_owned(),
				holder,
			});
		}
		self.functions.replace(
			ctx,
			Function::name_pred(*name),
			None,
			&mut |item| {
				// SAFETY: Function items head functions.
				unsafe { Function::free(Function::from_item(item), ctx) };
			},
			EntityKind::Function,
			name.as_str(),
		)
	}

	/// Inserts or replaces a pipeline under its name.
	pub(crate) fn upsert_pipeline(
		&mut self,
		ctx: &MemCtx,
		pipeline: NonNull<Pipeline>,
	) -> Result<(), Error> {
		// SAFETY: The freshly built pipeline is live.
		let name = unsafe { pipeline.as_ref() }.name();
		self.pipelines.replace(
			ctx,
			Pipeline::name_pred(name),
			Some(Pipeline::item(pipeline)),
			&mut |item| {
				// SAFETY: Pipeline items head pipelines.
				unsafe { Pipeline::free(Pipeline::from_item(item), ctx) };
			},
			EntityKind::Pipeline,
			name.as_str(),
		)
	}

	/// Deletes a pipeline, refusing while any device references it.
	pub(crate) fn delete_pipeline(&mut self, ctx: &MemCtx, name: &Name) -> Result<(), Error> {
		if let Some(holder) = self.pipeline_user(name) {
			return Err(Error::InUse {
				kind:   EntityKind::Pipeline,
				name:   name.as_str().to_owned(),
				holder,
			});
		}
		self.pipelines.replace(
			ctx,
			Pipeline::name_pred(*name),
			None,
			&mut |item| {
				// SAFETY: Pipeline items head pipelines.
				unsafe { Pipeline::free(Pipeline::from_item(item), ctx) };
			},
			EntityKind::Pipeline,
			name.as_str(),
		)
	}

	/// Inserts or replaces a device under its name.
	pub(crate) fn upsert_device(
		&mut self,
		ctx: &MemCtx,
		device: NonNull<Device>,
	) -> Result<(), Error> {
		// SAFETY: The freshly built device is live.
		let name = unsafe { device.as_ref() }.name();
		self.devices.replace(
			ctx,
			Device::name_pred(name),
			Some(Device::item(device)),
			&mut |item| {
				// SAFETY: Device items head devices.
				unsafe { Device::free(Device::from_item(item), ctx) };
			},
			EntityKind::Device,
			name.as_str(),
		)
	}

	/// The name of a pipeline that (through its functions' chains)
	/// references the module, if any.
	///
	/// A function that references the module but is itself unreferenced
	/// by every pipeline does not block the delete; its chains resolve
	/// nothing at packet time.
	fn module_user(&self, module_type: &Name, name: &Name) -> Option<String> {
		for (_, item) in self.pipelines.iter() {
			// SAFETY: Pipeline items head pipelines.
			let pipeline = unsafe { Pipeline::from_item(item).as_ref() };
			for fname in pipeline.functions() {
				let Some(function) = self.lookup_function(fname) else {
					continue;
				};
				// SAFETY: Registered functions are live.
				let function = unsafe { function.as_ref() };
				for slot in function.chains() {
					// SAFETY: Chain slots are always populated.
					let chain = unsafe { slot.chain().as_ref() };
					let hit = chain
						.module_refs()
						.iter()
						.any(|r| r.module_type == *module_type && r.name == *name);
					if hit {
						return Some(pipeline.name().as_str().to_owned());
					}
				}
			}
		}
		None
	}

	/// The name of a pipeline referencing the function, if any.
	fn function_user(&self, name: &Name) -> Option<String> {
		for (_, item) in self.pipelines.iter() {
			// SAFETY: Pipeline items head pipelines.
			let pipeline = unsafe { Pipeline::from_item(item).as_ref() };
			if pipeline.functions().contains(name) {
				return Some(pipeline.name().as_str().to_owned());
			}
		}
		None
	}

	/// The name of a device referencing the pipeline, if any.
	fn pipeline_user(&self, name: &Name) -> Option<String> {
		for (_, item) in self.devices.iter() {
			// SAFETY: Device items head devices.
			let device = unsafe { Device::from_item(item).as_ref() };
			let referenced = device
				.input()
				.pipelines()
				.iter()
				.chain(device.output().pipelines())
				.any(|slot| slot.name == *name);
			if referenced {
				return Some(device.name().as_str().to_owned());
			}
		}
		None
	}
}

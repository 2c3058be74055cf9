//! Execution contexts: the dataplane-facing projection of a generation.
//!
//! The configuration tree is name-keyed and reference-shared across
//! generations; the execution context is index-keyed, pre-resolved and
//! fully materialized, so a worker performs only array indexing at packet
//! time, never a name lookup. It is a parallel tree
//! `DeviceEctx -> DeviceEntryEctx -> PipelineEctx -> FunctionEctx ->
//! ChainEctx -> ModuleEctx`, each node pointing at its config descriptor
//! and carrying the counter storage spawned for its path, and it holds
//! the flattened weight maps for both function-to-chain and
//! device-entry-to-pipeline selection.
//!
//! The tree is built once per generation, as the last step of install,
//! in two passes: pass one creates every device subtree, pass two fills
//! the module cross-indices, which need the full device set.

use core::ptr::NonNull;

use weir_shm::{MemCtx, Name, OffsetPtr, round_up, slot, slot_mut};

use crate::{
	counter::{CounterPath, CounterRegistry, CounterStorage},
	entity::{Chain, Device, DeviceEntry, Function, Module, ModuleRef, Pipeline},
	error::{EntityKind, Error},
	generation::ConfigGen,
	registry::Embedded,
};

/// Allocates a null-initialized arena array of `len` offset pointers.
fn alloc_ptr_array<T>(ctx: &MemCtx, len: u64) -> Result<Option<NonNull<OffsetPtr<T>>>, Error> {
	if len == 0 {
		return Ok(None);
	}
	let base = ctx
		.alloc(round_up(len * size_of::<OffsetPtr<T>>() as u64))?
		.cast::<OffsetPtr<T>>();
	for i in 0..len as usize {
		// SAFETY: The fresh array holds `len` cells.
		unsafe { base.as_ptr().add(i).write(OffsetPtr::null()) };
	}
	Ok(Some(base))
}

/// Frees an array allocated by [`alloc_ptr_array`].
fn free_ptr_array<T>(ctx: &MemCtx, base: Option<NonNull<OffsetPtr<T>>>, len: u64) {
	if let Some(base) = base {
		ctx.free(base.cast(), round_up(len * size_of::<OffsetPtr<T>>() as u64));
	}
}

/// Reads the `idx`th element of an ectx pointer array as a reference.
///
/// # Safety
/// `base` must hold at least `idx + 1` cells of a live, fully linked
/// array.
unsafe fn array_ref<'a, T>(base: NonNull<OffsetPtr<T>>, idx: u64) -> Option<&'a T> {
	// SAFETY: Offloaded to the caller.
	unsafe { slot(base, idx as usize).load().map(|p| p.as_ref()) }
}

/// The root of a generation's execution context.
#[repr(C)]
pub struct GenEctx {
	/// The generation number this context was built from.
	number:          u64,
	/// The owning generation.
	owner:           OffsetPtr<ConfigGen>,
	/// Device array length (the generation's device registry capacity;
	/// slots without a device are null).
	device_capacity: u64,
	/// Per-device subtrees, indexed by device registry slot.
	devices:         OffsetPtr<OffsetPtr<DeviceEctx>>,
	/// Total bytes of the root allocation.
	alloc_size:      u64,
}

impl GenEctx {
	/// Builds the execution context for `new_gen`.
	///
	/// `old_gen` is the generation being replaced; its counter-storage
	/// registry seeds value carry-over. On failure the partial tree and
	/// every fresh allocation are released (storages already registered
	/// in `new_gen` stay there and die with it).
	pub(crate) fn build(
		ctx: &MemCtx,
		counter_ctx: &MemCtx,
		new_gen: NonNull<ConfigGen>,
		old_gen: Option<NonNull<ConfigGen>>,
	) -> Result<NonNull<Self>, Error> {
		// SAFETY: The new generation is live and privately owned by the
		// SAFETY: installing mutator.
		let device_capacity = unsafe { new_gen.as_ref() }.device_capacity();

		let size = round_up(size_of::<Self>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				number: new_gen.as_ref().number(),
				owner: OffsetPtr::null(),
				device_capacity,
				devices: OffsetPtr::null(),
				alloc_size: size,
			});
			(*this.as_ptr()).owner.store(Some(new_gen));
		}

		let build = Build {
			ctx,
			counter_ctx,
			new_gen,
			old_gen,
		};

		let result = (|| {
			let devices = alloc_ptr_array::<DeviceEctx>(ctx, device_capacity)?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).devices.store(devices) };

			let Some(devices) = devices else {
				return Ok(());
			};

			for idx in 0..device_capacity {
				// SAFETY: As above.
				let Some(device) = (unsafe { new_gen.as_ref() }.get_device(idx)) else {
					continue;
				};
				let dectx = build.device(this, device)?;
				// SAFETY: `idx` is within the device array.
				unsafe { slot_mut(devices, idx as usize) }.store(Some(dectx));
			}

			// Pass two: the module cross-indices need every device
			// subtree in place.
			// SAFETY: The tree built above is fully linked.
			unsafe { fill_cross_indices(this, new_gen) };
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The partial tree is fully owned by this builder.
			unsafe { Self::free(this, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the tree. Counter storages are not touched here; the
	/// generation's storage registry owns them.
	///
	/// # Safety
	/// Every worker must have advertised past the owning generation (or
	/// the context must never have been published).
	pub(crate) unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			let cap = (*this.as_ptr()).device_capacity;
			if let Some(devices) = (*this.as_ptr()).devices.load() {
				for i in 0..cap as usize {
					if let Some(d) = slot(devices, i).load() {
						DeviceEctx::free(d, ctx);
					}
				}
				free_ptr_array(ctx, Some(devices), cap);
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The generation number this context was built from.
	#[must_use]
	pub fn number(&self) -> u64 {
		self.number
	}

	/// The owning generation.
	#[must_use]
	pub fn config_gen(&self) -> NonNull<ConfigGen> {
		self.owner.load().expect("ectx always links its generation")
	}

	/// Device array length.
	#[must_use]
	pub fn device_capacity(&self) -> u64 {
		self.device_capacity
	}

	/// The subtree for the device at registry slot `idx`.
	#[must_use]
	pub fn device(&self, idx: u64) -> Option<&DeviceEctx> {
		if idx >= self.device_capacity {
			return None;
		}
		let base = self.devices.load()?;
		// SAFETY: `idx` is in bounds of a live, fully linked array.
		unsafe { array_ref(base, idx) }
	}
}

/// Per-device execution context.
#[repr(C)]
pub struct DeviceEctx {
	/// The config descriptor.
	device:     OffsetPtr<Device>,
	/// Counter storage for the (device) path.
	storage:    OffsetPtr<CounterStorage>,
	/// Backlink to the root.
	owner:      OffsetPtr<GenEctx>,
	/// Input-direction entry.
	input:      OffsetPtr<DeviceEntryEctx>,
	/// Output-direction entry.
	output:     OffsetPtr<DeviceEntryEctx>,
	/// Total bytes of the node allocation.
	alloc_size: u64,
}

impl DeviceEctx {
	/// Releases the subtree.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			if let Some(e) = (*this.as_ptr()).input.load() {
				DeviceEntryEctx::free(e, ctx);
			}
			if let Some(e) = (*this.as_ptr()).output.load() {
				DeviceEntryEctx::free(e, ctx);
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The device config descriptor.
	#[must_use]
	pub fn device(&self) -> &Device {
		// SAFETY: Built nodes always link their descriptor, which lives
		// SAFETY: at least as long as the generation.
		unsafe { self.device.load().expect("device ectx descriptor").as_ref() }
	}

	/// Counter storage for the (device) path.
	#[must_use]
	pub fn storage(&self) -> &CounterStorage {
		// SAFETY: As for `device`.
		unsafe { self.storage.load().expect("device ectx storage").as_ref() }
	}

	/// The input-direction entry.
	#[must_use]
	pub fn input(&self) -> &DeviceEntryEctx {
		// SAFETY: As for `device`.
		unsafe { self.input.load().expect("device ectx input").as_ref() }
	}

	/// The output-direction entry.
	#[must_use]
	pub fn output(&self) -> &DeviceEntryEctx {
		// SAFETY: As for `device`.
		unsafe { self.output.load().expect("device ectx output").as_ref() }
	}

	/// The root context.
	#[must_use]
	pub fn gen_ectx(&self) -> &GenEctx {
		// SAFETY: As for `device`.
		unsafe { self.owner.load().expect("device ectx owner").as_ref() }
	}
}

/// Per-direction device entry context with the expanded pipeline map.
#[repr(C)]
pub struct DeviceEntryEctx {
	/// The config entry.
	entry:             OffsetPtr<DeviceEntry>,
	/// Child pipeline contexts, one per configured pair.
	pipeline_count:    u64,
	/// Expanded map length (sum of weights).
	pipeline_map_size: u64,
	/// Child array.
	pipelines:         OffsetPtr<OffsetPtr<PipelineEctx>>,
	/// The expanded weight map.
	pipeline_map:      OffsetPtr<OffsetPtr<PipelineEctx>>,
	/// Total bytes of the node allocation.
	alloc_size:        u64,
}

impl DeviceEntryEctx {
	/// Releases the subtree.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller. The map aliases the children,
		// SAFETY: so only the child array owns subtrees.
		unsafe {
			let count = (*this.as_ptr()).pipeline_count;
			let map_size = (*this.as_ptr()).pipeline_map_size;
			if let Some(children) = (*this.as_ptr()).pipelines.load() {
				for i in 0..count as usize {
					if let Some(p) = slot(children, i).load() {
						PipelineEctx::free(p, ctx);
					}
				}
				free_ptr_array(ctx, Some(children), count);
			}
			free_ptr_array(ctx, (*this.as_ptr()).pipeline_map.load(), map_size);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The config entry.
	#[must_use]
	pub fn entry(&self) -> &DeviceEntry {
		// SAFETY: Built nodes always link their descriptor.
		unsafe { self.entry.load().expect("entry ectx descriptor").as_ref() }
	}

	/// Expanded map length.
	#[must_use]
	pub fn pipeline_map_size(&self) -> u64 {
		self.pipeline_map_size
	}

	/// Child count.
	#[must_use]
	pub fn pipeline_count(&self) -> u64 {
		self.pipeline_count
	}

	/// The `idx`th child pipeline context.
	#[must_use]
	pub fn pipeline(&self, idx: u64) -> Option<&PipelineEctx> {
		if idx >= self.pipeline_count {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.pipelines.load()?, idx) }
	}

	/// The `k`th slot of the expanded map.
	#[must_use]
	pub fn map_slot(&self, k: u64) -> Option<&PipelineEctx> {
		if k >= self.pipeline_map_size {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.pipeline_map.load()?, k) }
	}

	/// Packet-time selection: `pipeline_map[hash mod map_size]`.
	#[must_use]
	pub fn select_pipeline(&self, hash: u64) -> Option<&PipelineEctx> {
		if self.pipeline_map_size == 0 {
			return None;
		}
		self.map_slot(hash % self.pipeline_map_size)
	}
}

/// Per-(entry, pipeline) execution context.
#[repr(C)]
pub struct PipelineEctx {
	/// The config descriptor.
	pipeline:       OffsetPtr<Pipeline>,
	/// Counter storage for the (device, pipeline) path.
	storage:        OffsetPtr<CounterStorage>,
	/// Stage count.
	function_count: u64,
	/// Per-stage function contexts.
	functions:      OffsetPtr<OffsetPtr<FunctionEctx>>,
	/// Total bytes of the node allocation.
	alloc_size:     u64,
}

impl PipelineEctx {
	/// Releases the subtree.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			let count = (*this.as_ptr()).function_count;
			if let Some(children) = (*this.as_ptr()).functions.load() {
				for i in 0..count as usize {
					if let Some(f) = slot(children, i).load() {
						FunctionEctx::free(f, ctx);
					}
				}
				free_ptr_array(ctx, Some(children), count);
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The pipeline config descriptor.
	#[must_use]
	pub fn pipeline(&self) -> &Pipeline {
		// SAFETY: Built nodes always link their descriptor.
		unsafe { self.pipeline.load().expect("pipeline ectx descriptor").as_ref() }
	}

	/// Counter storage for this path.
	#[must_use]
	pub fn storage(&self) -> &CounterStorage {
		// SAFETY: As for `pipeline`.
		unsafe { self.storage.load().expect("pipeline ectx storage").as_ref() }
	}

	/// Stage count.
	#[must_use]
	pub fn function_count(&self) -> u64 {
		self.function_count
	}

	/// The `idx`th stage's function context.
	#[must_use]
	pub fn function(&self, idx: u64) -> Option<&FunctionEctx> {
		if idx >= self.function_count {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.functions.load()?, idx) }
	}
}

/// Per-(pipeline stage, function) execution context with the expanded
/// chain map.
#[repr(C)]
pub struct FunctionEctx {
	/// The config descriptor.
	function:       OffsetPtr<Function>,
	/// Counter storage for the (device, pipeline, function) path.
	storage:        OffsetPtr<CounterStorage>,
	/// Chain count.
	chain_count:    u64,
	/// Expanded map length (sum of weights).
	chain_map_size: u64,
	/// Child array.
	chains:         OffsetPtr<OffsetPtr<ChainEctx>>,
	/// The expanded weight map.
	chain_map:      OffsetPtr<OffsetPtr<ChainEctx>>,
	/// Total bytes of the node allocation.
	alloc_size:     u64,
}

impl FunctionEctx {
	/// Releases the subtree.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller. The map aliases the children.
		unsafe {
			let count = (*this.as_ptr()).chain_count;
			let map_size = (*this.as_ptr()).chain_map_size;
			if let Some(children) = (*this.as_ptr()).chains.load() {
				for i in 0..count as usize {
					if let Some(c) = slot(children, i).load() {
						ChainEctx::free(c, ctx);
					}
				}
				free_ptr_array(ctx, Some(children), count);
			}
			free_ptr_array(ctx, (*this.as_ptr()).chain_map.load(), map_size);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The function config descriptor.
	#[must_use]
	pub fn function(&self) -> &Function {
		// SAFETY: Built nodes always link their descriptor.
		unsafe { self.function.load().expect("function ectx descriptor").as_ref() }
	}

	/// Counter storage for this path.
	#[must_use]
	pub fn storage(&self) -> &CounterStorage {
		// SAFETY: As for `function`.
		unsafe { self.storage.load().expect("function ectx storage").as_ref() }
	}

	/// Chain count.
	#[must_use]
	pub fn chain_count(&self) -> u64 {
		self.chain_count
	}

	/// Expanded map length.
	#[must_use]
	pub fn chain_map_size(&self) -> u64 {
		self.chain_map_size
	}

	/// The `idx`th child chain context.
	#[must_use]
	pub fn chain(&self, idx: u64) -> Option<&ChainEctx> {
		if idx >= self.chain_count {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.chains.load()?, idx) }
	}

	/// The `k`th slot of the expanded map.
	#[must_use]
	pub fn map_slot(&self, k: u64) -> Option<&ChainEctx> {
		if k >= self.chain_map_size {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.chain_map.load()?, k) }
	}

	/// Packet-time selection: `chain_map[hash mod map_size]`.
	#[must_use]
	pub fn select_chain(&self, hash: u64) -> Option<&ChainEctx> {
		if self.chain_map_size == 0 {
			return None;
		}
		self.map_slot(hash % self.chain_map_size)
	}
}

/// Per-(function, chain) execution context.
#[repr(C)]
pub struct ChainEctx {
	/// The config descriptor.
	chain:        OffsetPtr<Chain>,
	/// Counter storage for the (device, pipeline, function, chain) path.
	storage:      OffsetPtr<CounterStorage>,
	/// Module count.
	module_count: u64,
	/// Per-reference module contexts.
	modules:      OffsetPtr<OffsetPtr<ModuleEctx>>,
	/// Total bytes of the node allocation.
	alloc_size:   u64,
}

impl ChainEctx {
	/// Releases the subtree.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			let count = (*this.as_ptr()).module_count;
			if let Some(children) = (*this.as_ptr()).modules.load() {
				for i in 0..count as usize {
					if let Some(m) = slot(children, i).load() {
						ModuleEctx::free(m, ctx);
					}
				}
				free_ptr_array(ctx, Some(children), count);
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The chain config descriptor.
	#[must_use]
	pub fn chain(&self) -> &Chain {
		// SAFETY: Built nodes always link their descriptor.
		unsafe { self.chain.load().expect("chain ectx descriptor").as_ref() }
	}

	/// Counter storage for this path.
	#[must_use]
	pub fn storage(&self) -> &CounterStorage {
		// SAFETY: As for `chain`.
		unsafe { self.storage.load().expect("chain ectx storage").as_ref() }
	}

	/// Module count.
	#[must_use]
	pub fn module_count(&self) -> u64 {
		self.module_count
	}

	/// The `idx`th module context.
	#[must_use]
	pub fn module(&self, idx: u64) -> Option<&ModuleEctx> {
		if idx >= self.module_count {
			return None;
		}
		// SAFETY: In bounds of a live, fully linked array.
		unsafe { array_ref(self.modules.load()?, idx) }
	}
}

/// Per-(chain slot, module) execution context with the device
/// cross-indices.
#[repr(C)]
pub struct ModuleEctx {
	/// The resolved config descriptor.
	module:     OffsetPtr<Module>,
	/// Counter storage for the full module path.
	storage:    OffsetPtr<CounterStorage>,
	/// Backlink to the root.
	owner:      OffsetPtr<GenEctx>,
	/// Length of `mc_index` (the module's declared device count).
	mc_len:     u64,
	/// Length of `cm_index` (the generation's device capacity).
	cm_len:     u64,
	/// Declared-device slot to generation device index, `-1` when the
	/// device is absent from the generation.
	mc_index:   OffsetPtr<i64>,
	/// Generation device index to declared-device slot, `0` when the
	/// module does not declare the device.
	cm_index:   OffsetPtr<u64>,
	/// Total bytes of the node allocation.
	alloc_size: u64,
}

impl ModuleEctx {
	/// Releases the node.
	///
	/// # Safety
	/// As for [`GenEctx::free`]; tolerates a partially linked node.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe {
			let mc_len = (*this.as_ptr()).mc_len;
			let cm_len = (*this.as_ptr()).cm_len;
			if let Some(mc) = (*this.as_ptr()).mc_index.load() {
				ctx.free(mc.cast(), round_up(mc_len * size_of::<i64>() as u64));
			}
			if let Some(cm) = (*this.as_ptr()).cm_index.load() {
				ctx.free(cm.cast(), round_up(cm_len * size_of::<u64>() as u64));
			}
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The module config descriptor.
	#[must_use]
	pub fn module(&self) -> &Module {
		// SAFETY: Built nodes always link their descriptor.
		unsafe { self.module.load().expect("module ectx descriptor").as_ref() }
	}

	/// Counter storage for this path.
	#[must_use]
	pub fn storage(&self) -> &CounterStorage {
		// SAFETY: As for `module`.
		unsafe { self.storage.load().expect("module ectx storage").as_ref() }
	}

	/// The root context.
	#[must_use]
	pub fn gen_ectx(&self) -> &GenEctx {
		// SAFETY: As for `module`.
		unsafe { self.owner.load().expect("module ectx owner").as_ref() }
	}

	/// Declared-device slot to generation device index, or `-1`.
	#[must_use]
	pub fn mc_index(&self) -> &[i64] {
		match self.mc_index.load() {
			None => &[],
			// SAFETY: The array holds `mc_len` elements.
			Some(p) => unsafe { core::slice::from_raw_parts(p.as_ptr(), self.mc_len as usize) },
		}
	}

	/// Generation device index to declared-device slot, or `0`.
	#[must_use]
	pub fn cm_index(&self) -> &[u64] {
		match self.cm_index.load() {
			None => &[],
			// SAFETY: The array holds `cm_len` elements.
			Some(p) => unsafe { core::slice::from_raw_parts(p.as_ptr(), self.cm_len as usize) },
		}
	}

	/// O(1) packet-time translation from a generation device index to the
	/// module's own per-device slot.
	#[must_use]
	pub fn device_slot(&self, device_index: u64) -> u64 {
		self.cm_index().get(device_index as usize).copied().unwrap_or(0)
	}
}

/// Shared state of one execution-context build.
struct Build<'a> {
	/// Node and array allocations.
	ctx:         &'a MemCtx,
	/// Counter storage allocations.
	counter_ctx: &'a MemCtx,
	/// The generation under install.
	new_gen:     NonNull<ConfigGen>,
	/// The generation being replaced, for counter carry-over.
	old_gen:     Option<NonNull<ConfigGen>>,
}

impl Build<'_> {
	/// Resolves (or spawns) the counter storage for `path`.
	///
	/// A path that already appears in the new generation (a pipeline
	/// listed twice in one entry, a module referenced twice in one chain)
	/// resolves to the registered storage; the registry keeps the single
	/// owning reference either way.
	fn storage(
		&self,
		path: CounterPath,
		decls: &CounterRegistry,
	) -> Result<NonNull<CounterStorage>, Error> {
		// SAFETY: The new generation is privately owned by the installing
		// SAFETY: mutator; borrows here are short-lived and disjoint.
		let gen_mut = unsafe { &mut *self.new_gen.as_ptr() };
		if let Some(existing) = gen_mut.lookup_storage(path) {
			return Ok(existing);
		}

		let old = self
			.old_gen
			// SAFETY: The replaced generation stays live until install
			// SAFETY: completes.
			.and_then(|g| unsafe { g.as_ref() }.lookup_storage(path));

		let storage = CounterStorage::spawn(self.counter_ctx, path, old, decls)?;
		if let Err(err) = gen_mut
			.storages_mut()
			.insert(self.ctx, CounterStorage::item(storage))
		{
			// SAFETY: The storage was never registered.
			unsafe { CounterStorage::free(storage, self.counter_ctx) };
			return Err(err);
		}
		Ok(storage)
	}

	/// Builds one device subtree.
	fn device(
		&self,
		root: NonNull<GenEctx>,
		device: NonNull<Device>,
	) -> Result<NonNull<DeviceEctx>, Error> {
		// SAFETY: Entity descriptors are immutable and outlive the build.
		let dev = unsafe { device.as_ref() };
		let dev_name = dev.name();
		let storage = self.storage(CounterPath::device(dev_name), dev.counters())?;

		let size = round_up(size_of::<DeviceEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<DeviceEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(DeviceEctx {
				device:     OffsetPtr::null(),
				storage:    OffsetPtr::null(),
				owner:      OffsetPtr::null(),
				input:      OffsetPtr::null(),
				output:     OffsetPtr::null(),
				alloc_size: size,
			});
			(*this.as_ptr()).device.store(Some(device));
			(*this.as_ptr()).storage.store(Some(storage));
			(*this.as_ptr()).owner.store(Some(root));
		}

		let result = (|| {
			let input = self.entry(dev_name, dev.input())?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).input.store(Some(input)) };
			let output = self.entry(dev_name, dev.output())?;
			// SAFETY: As above.
			unsafe { (*this.as_ptr()).output.store(Some(output)) };
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { DeviceEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}

	/// Builds one device-entry subtree with its expanded pipeline map.
	fn entry(
		&self,
		dev_name: Name,
		entry: &DeviceEntry,
	) -> Result<NonNull<DeviceEntryEctx>, Error> {
		let count = entry.pipelines().len() as u64;
		let map_size = entry.pipeline_map_size();

		let size = round_up(size_of::<DeviceEntryEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<DeviceEntryEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(DeviceEntryEctx {
				entry:             OffsetPtr::null(),
				pipeline_count:    count,
				pipeline_map_size: map_size,
				pipelines:         OffsetPtr::null(),
				pipeline_map:      OffsetPtr::null(),
				alloc_size:        size,
			});
			(*this.as_ptr()).entry.store(Some(NonNull::from(entry)));
		}

		let result = (|| {
			let children = alloc_ptr_array::<PipelineEctx>(self.ctx, count)?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).pipelines.store(children) };
			let map = alloc_ptr_array::<PipelineEctx>(self.ctx, map_size)?;
			// SAFETY: As above.
			unsafe { (*this.as_ptr()).pipeline_map.store(map) };

			let mut k = 0_u64;
			for (i, pslot) in entry.pipelines().iter().enumerate() {
				// SAFETY: The new generation is live; the pipeline was
				// SAFETY: validated at device build time.
				let pipeline = unsafe { self.new_gen.as_ref() }
					.lookup_pipeline(&pslot.name)
					.ok_or_else(|| Error::NotFound {
						kind: EntityKind::Pipeline,
						name: pslot.name.as_str().to_owned(),
					})?;

				let pectx = self.pipeline(dev_name, pipeline)?;
				let children = children.expect("children array exists for count > 0");
				// SAFETY: `i < count` cells.
				unsafe { slot_mut(children, i) }.store(Some(pectx));

				let map = map.expect("map array exists for positive weights");
				for _ in 0..pslot.weight {
					// SAFETY: `k` stays below the summed weights.
					unsafe { slot_mut(map, k as usize) }.store(Some(pectx));
					k += 1;
				}
			}
			debug_assert_eq!(k, map_size, "weight map fully populated");
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { DeviceEntryEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}

	/// Builds one pipeline subtree.
	fn pipeline(
		&self,
		dev_name: Name,
		pipeline: NonNull<Pipeline>,
	) -> Result<NonNull<PipelineEctx>, Error> {
		// SAFETY: Entity descriptors are immutable and outlive the build.
		let pl = unsafe { pipeline.as_ref() };
		let pl_name = pl.name();
		let storage = self.storage(CounterPath::pipeline(dev_name, pl_name), pl.counters())?;

		let count = pl.functions().len() as u64;
		let size = round_up(size_of::<PipelineEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<PipelineEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(PipelineEctx {
				pipeline:       OffsetPtr::null(),
				storage:        OffsetPtr::null(),
				function_count: count,
				functions:      OffsetPtr::null(),
				alloc_size:     size,
			});
			(*this.as_ptr()).pipeline.store(Some(pipeline));
			(*this.as_ptr()).storage.store(Some(storage));
		}

		let result = (|| {
			let children = alloc_ptr_array::<FunctionEctx>(self.ctx, count)?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).functions.store(children) };

			for (i, fname) in pl.functions().iter().enumerate() {
				// SAFETY: The new generation is live; the function was
				// SAFETY: validated at pipeline build time.
				let function = unsafe { self.new_gen.as_ref() }
					.lookup_function(fname)
					.ok_or_else(|| Error::NotFound {
						kind: EntityKind::Function,
						name: fname.as_str().to_owned(),
					})?;

				let fectx = self.function(dev_name, pl_name, function)?;
				let children = children.expect("children array exists for count > 0");
				// SAFETY: `i < count` cells.
				unsafe { slot_mut(children, i) }.store(Some(fectx));
			}
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { PipelineEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}

	/// Builds one function subtree with its expanded chain map.
	fn function(
		&self,
		dev_name: Name,
		pl_name: Name,
		function: NonNull<Function>,
	) -> Result<NonNull<FunctionEctx>, Error> {
		// SAFETY: Entity descriptors are immutable and outlive the build.
		let f = unsafe { function.as_ref() };
		let f_name = f.name();
		let storage =
			self.storage(CounterPath::function(dev_name, pl_name, f_name), f.counters())?;

		let count = f.chains().len() as u64;
		let map_size = f.chain_map_size();
		let size = round_up(size_of::<FunctionEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<FunctionEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(FunctionEctx {
				function:       OffsetPtr::null(),
				storage:        OffsetPtr::null(),
				chain_count:    count,
				chain_map_size: map_size,
				chains:         OffsetPtr::null(),
				chain_map:      OffsetPtr::null(),
				alloc_size:     size,
			});
			(*this.as_ptr()).function.store(Some(function));
			(*this.as_ptr()).storage.store(Some(storage));
		}

		let result = (|| {
			let children = alloc_ptr_array::<ChainEctx>(self.ctx, count)?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).chains.store(children) };
			let map = alloc_ptr_array::<ChainEctx>(self.ctx, map_size)?;
			// SAFETY: As above.
			unsafe { (*this.as_ptr()).chain_map.store(map) };

			let mut k = 0_u64;
			for (i, cslot) in f.chains().iter().enumerate() {
				let cectx = self.chain(dev_name, pl_name, f_name, cslot.chain())?;
				let children = children.expect("children array exists for count > 0");
				// SAFETY: `i < count` cells.
				unsafe { slot_mut(children, i) }.store(Some(cectx));

				let map = map.expect("map array exists for positive weights");
				for _ in 0..cslot.weight {
					// SAFETY: `k` stays below the summed weights.
					unsafe { slot_mut(map, k as usize) }.store(Some(cectx));
					k += 1;
				}
			}
			debug_assert_eq!(k, map_size, "weight map fully populated");
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { FunctionEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}

	/// Builds one chain subtree, resolving its module references.
	fn chain(
		&self,
		dev_name: Name,
		pl_name: Name,
		f_name: Name,
		chain: NonNull<Chain>,
	) -> Result<NonNull<ChainEctx>, Error> {
		// SAFETY: Entity descriptors are immutable and outlive the build.
		let c = unsafe { chain.as_ref() };
		let c_name = c.name();
		let storage =
			self.storage(CounterPath::chain(dev_name, pl_name, f_name, c_name), c.counters())?;

		let count = c.module_refs().len() as u64;
		let size = round_up(size_of::<ChainEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<ChainEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(ChainEctx {
				chain:        OffsetPtr::null(),
				storage:      OffsetPtr::null(),
				module_count: count,
				modules:      OffsetPtr::null(),
				alloc_size:   size,
			});
			(*this.as_ptr()).chain.store(Some(chain));
			(*this.as_ptr()).storage.store(Some(storage));
		}

		let result = (|| {
			let children = alloc_ptr_array::<ModuleEctx>(self.ctx, count)?;
			// SAFETY: Just placed above.
			unsafe { (*this.as_ptr()).modules.store(children) };

			for (i, mref) in c.module_refs().iter().enumerate() {
				let mectx = self.module(dev_name, pl_name, f_name, c_name, mref)?;
				let children = children.expect("children array exists for count > 0");
				// SAFETY: `i < count` cells.
				unsafe { slot_mut(children, i) }.store(Some(mectx));
			}
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { ChainEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}

	/// Builds one module node. This is where deferred chain-to-module
	/// resolution happens; a miss is a fatal build error.
	fn module(
		&self,
		dev_name: Name,
		pl_name: Name,
		f_name: Name,
		c_name: Name,
		mref: &ModuleRef,
	) -> Result<NonNull<ModuleEctx>, Error> {
		// SAFETY: The new generation is live.
		let module = unsafe { self.new_gen.as_ref() }
			.lookup_module(&mref.module_type, &mref.name)
			.ok_or_else(|| Error::NotFound {
				kind: EntityKind::Module,
				name: format!("{}:{}", mref.module_type, mref.name),
			})?;

		// SAFETY: Entity descriptors are immutable and outlive the build.
		let m = unsafe { module.as_ref() };
		let storage = self.storage(
			CounterPath::module(dev_name, pl_name, f_name, c_name, m.module_type(), m.name()),
			m.counters(),
		)?;

		let mc_len = m.devices().len() as u64;
		// SAFETY: As above.
		let cm_len = unsafe { self.new_gen.as_ref() }.device_capacity();

		let size = round_up(size_of::<ModuleEctx>() as u64);
		let this = self.ctx.alloc(size)?.cast::<ModuleEctx>();
		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(ModuleEctx {
				module:     OffsetPtr::null(),
				storage:    OffsetPtr::null(),
				owner:      OffsetPtr::null(),
				mc_len,
				cm_len,
				mc_index:   OffsetPtr::null(),
				cm_index:   OffsetPtr::null(),
				alloc_size: size,
			});
			(*this.as_ptr()).module.store(Some(module));
			(*this.as_ptr()).storage.store(Some(storage));
		}

		let result = (|| {
			if mc_len > 0 {
				let mc = self.ctx.alloc(round_up(mc_len * size_of::<i64>() as u64))?.cast::<i64>();
				for i in 0..mc_len as usize {
					// SAFETY: The array holds `mc_len` elements.
					unsafe { mc.as_ptr().add(i).write(-1) };
				}
				// SAFETY: Just placed above.
				unsafe { (*this.as_ptr()).mc_index.store(Some(mc)) };
			}
			if cm_len > 0 {
				let cm = self
					.ctx
					.alloc_zeroed(round_up(cm_len * size_of::<u64>() as u64))?
					.cast::<u64>();
				// SAFETY: As above.
				unsafe { (*this.as_ptr()).cm_index.store(Some(cm)) };
			}
			Ok(())
		})();

		if let Err(err) = result {
			// SAFETY: The node owns whatever was linked so far.
			unsafe { ModuleEctx::free(this, self.ctx) };
			return Err(err);
		}
		Ok(this)
	}
}

/// Pass two: fills every module node's cross-indices by O(M*D) name
/// cross-match against the generation's device set.
///
/// # Safety
/// The tree under `root` must be fully built and linked.
unsafe fn fill_cross_indices(root: NonNull<GenEctx>, new_gen: NonNull<ConfigGen>) {
	// SAFETY: The tree is fully linked per the caller contract; shared
	// SAFETY: references stay disjoint from the raw index writes below.
	unsafe {
		let r = root.as_ref();
		for d in 0..r.device_capacity() {
			let Some(dectx) = r.device(d) else { continue };
			for entry in [dectx.input(), dectx.output()] {
				for p in 0..entry.pipeline_count() {
					let Some(pectx) = entry.pipeline(p) else { continue };
					for f in 0..pectx.function_count() {
						let Some(fectx) = pectx.function(f) else { continue };
						for c in 0..fectx.chain_count() {
							let Some(cectx) = fectx.chain(c) else { continue };
							for m in 0..cectx.module_count() {
								let Some(mectx) = cectx.module(m) else { continue };
								fill_module_indices(NonNull::from(mectx), new_gen);
							}
						}
					}
				}
			}
		}
	}
}

/// Cross-matches one module's declared devices against the generation.
///
/// # Safety
/// `mectx` must be a fully built module node of a tree over `new_gen`.
unsafe fn fill_module_indices(mectx: NonNull<ModuleEctx>, new_gen: NonNull<ConfigGen>) {
	// SAFETY: Per the caller contract.
	unsafe {
		let me = mectx.as_ref();
		let declared = me.module().devices();
		let gen_ref = new_gen.as_ref();

		if let Some(mc) = (*mectx.as_ptr()).mc_index.load() {
			for (m_idx, dev_name) in declared.iter().enumerate() {
				let mut found: i64 = -1;
				for d_idx in 0..gen_ref.device_capacity() {
					if let Some(dev) = gen_ref.get_device(d_idx) {
						if dev.as_ref().name() == *dev_name {
							found = d_idx as i64;
							break;
						}
					}
				}
				mc.as_ptr().add(m_idx).write(found);
			}
		}

		if let Some(cm) = (*mectx.as_ptr()).cm_index.load() {
			for d_idx in 0..gen_ref.device_capacity() {
				let slot_value = gen_ref.get_device(d_idx).map_or(0, |dev| {
					declared
						.iter()
						.position(|n| *n == dev.as_ref().name())
						.map_or(0, |p| p as u64)
				});
				cm.as_ptr().add(d_idx as usize).write(slot_value);
			}
		}
	}
}

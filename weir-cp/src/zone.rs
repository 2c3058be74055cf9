//! The control-plane zone header and the publication protocol.
//!
//! A zone begins with the [`CpConfig`] header at the mapping base:
//! allocator state, memory contexts, the peer dataplane header, the
//! writer lock, the active-generation cell and the agent registry. All
//! other structures are reachable transitively through offset pointers
//! from the active generation.
//!
//! The install sequence runs under the writer lock: spawn a generation
//! from the active one, apply the mutations, build counter storages and
//! the execution context, atomically publish the generation pointer, wait
//! for every worker to advertise the new generation, then destroy the old
//! one. A failure before publication never mutates the active generation;
//! after publication the wait-then-free sequence always completes.

use core::{
	ptr::NonNull,
	sync::atomic::Ordering::{Acquire, Release},
};

use weir_dp::{DpConfig, DpDirectory};
use weir_shm::{
	AtomicOffsetPtr, BlockAlloc, MemCtx, Name, OffsetPtr, ShmError, ShmZone, round_up,
};
use weir_sync::PidLock;

use crate::{
	agent::AgentRec,
	config::{DeviceConfig, FunctionConfig, ModuleConfig, PipelineConfig},
	ectx::GenEctx,
	entity::{Device, Function, Module, Pipeline},
	error::{Diag, EntityKind, Error, push_diag},
	generation::ConfigGen,
	registry::{Embedded, Registry},
};

/// Marks a mapping as carrying a weir control-plane zone.
const ZONE_MAGIC: u64 = 0x5745_4952_435A_3031; // "WEIRCZ01"

/// The zone header, resident at the mapping base.
#[repr(C)]
pub struct CpConfig {
	/// Layout marker checked on attach.
	magic:       u64,
	/// Shared block allocator governing the bytes past the header.
	alloc:       BlockAlloc,
	/// The general allocation context.
	ctx:         MemCtx,
	/// The counter-storage allocation context.
	counter_ctx: MemCtx,
	/// The peer dataplane zone header.
	dp:          OffsetPtr<DpConfig>,
	/// The writer lock serializing all controllers.
	lock:        PidLock,
	/// Keeps the following cell naturally aligned.
	_pad:        [u8; 4],
	/// The active generation, atomically published.
	active:      AtomicOffsetPtr<ConfigGen>,
	/// Attached agents.
	agents:      Registry,
}

static_assertions::const_assert!(size_of::<CpConfig>() < 4096);

impl CpConfig {
	/// The active generation; the zone always carries one post-init.
	pub(crate) fn active_cell(&self) -> NonNull<ConfigGen> {
		self.active
			.load(Acquire)
			.expect("zone has an active generation")
	}

	/// The peer dataplane header, if linked.
	pub(crate) fn dp_ptr(&self) -> Option<NonNull<DpConfig>> {
		self.dp.load()
	}
}

/// A per-process handle onto a control-plane zone.
pub struct ControlPlane {
	/// The zone header in this process's mapping.
	cp: NonNull<CpConfig>,
}

// SAFETY: The handle is address-based; all shared mutation behind it is
// SAFETY: serialized by the zone's writer lock or published atomically.
unsafe impl Send for ControlPlane {}

impl ControlPlane {
	/// Lays out a fresh zone over `zone`: header, allocator, dataplane
	/// tables and the empty generation zero.
	///
	/// `dp_modules` and `dp_devices` describe the dataplane directory;
	/// `workers` is the number of advertising worker threads.
	pub fn init(
		zone: &ShmZone,
		dp_modules: &[&str],
		dp_devices: &[&str],
		workers: u64,
	) -> Result<Self, Error> {
		let base = zone.base();
		let len = zone.len() as u64;
		let header = round_up(size_of::<CpConfig>() as u64);
		if len <= header {
			return Err(Error::Zone(ShmError::InvalidLength(zone.len())));
		}

		let cp = base.cast::<CpConfig>();

		// SAFETY: The zone is fresh and exclusively ours during init; the
		// SAFETY: header and heap ranges are disjoint and in bounds.
		unsafe {
			let alloc = NonNull::new_unchecked(&raw mut (*cp.as_ptr()).alloc);
			let heap = NonNull::new_unchecked(base.as_ptr().add(header as usize));
			BlockAlloc::init(alloc, heap, len - header);
			MemCtx::init(
				NonNull::new_unchecked(&raw mut (*cp.as_ptr()).ctx),
				alloc,
				"cp",
			);
			MemCtx::init(
				NonNull::new_unchecked(&raw mut (*cp.as_ptr()).counter_ctx),
				alloc,
				"counters",
			);
			(&raw mut (*cp.as_ptr()).dp).write(OffsetPtr::null());
			(&raw mut (*cp.as_ptr()).lock).write(PidLock::new());
			(&raw mut (*cp.as_ptr())._pad).write([0; 4]);
			(&raw mut (*cp.as_ptr()).active).write(AtomicOffsetPtr::null());
			Registry::init(NonNull::new_unchecked(&raw mut (*cp.as_ptr()).agents));
		}

		// SAFETY: The contexts were initialized above.
		let ctx = unsafe { &(*cp.as_ptr()).ctx };

		let mut module_names = Vec::with_capacity(dp_modules.len());
		for m in dp_modules {
			module_names.push(Name::new(m)?);
		}
		let mut device_names = Vec::with_capacity(dp_devices.len());
		for d in dp_devices {
			device_names.push(Name::new(d)?);
		}

		let dp = DpConfig::init(ctx, &module_names, &device_names, workers)?;
		// SAFETY: Header placed above.
		unsafe { (*cp.as_ptr()).dp.store(Some(dp)) };

		// Generation zero: empty registries, empty execution context.
		let g0 = ConfigGen::bootstrap(ctx)?;
		// SAFETY: As above.
		let e0 = GenEctx::build(ctx, unsafe { &(*cp.as_ptr()).counter_ctx }, g0, None)?;
		ConfigGen::set_ectx(g0, e0);

		// SAFETY: As above. Publishing the magic last makes a concurrent
		// SAFETY: attach of a half-laid-out zone fail its header check.
		unsafe {
			(*cp.as_ptr()).active.store(Some(g0), Release);
			(&raw mut (*cp.as_ptr()).magic).write(ZONE_MAGIC);
		}

		log::debug!(
			"zone initialized: {} dataplane modules, {} devices, {workers} workers",
			dp_modules.len(),
			dp_devices.len()
		);
		Ok(Self { cp })
	}

	/// Attaches to a zone laid out by [`Self::init`] in this or another
	/// process.
	pub fn attach(zone: &ShmZone) -> Result<Self, Error> {
		// SAFETY: The mapping is live for at least the zone's lifetime;
		// SAFETY: the magic check rejects foreign content.
		unsafe { Self::attach_raw(zone.base()) }
	}

	/// Attaches to a zone at `base`.
	///
	/// # Safety
	/// `base` must be the base of a live mapping of a weir zone that
	/// outlives the returned handle.
	pub unsafe fn attach_raw(base: NonNull<u8>) -> Result<Self, Error> {
		let cp = base.cast::<CpConfig>();
		// SAFETY: Offloaded to the caller.
		if unsafe { (*cp.as_ptr()).magic } != ZONE_MAGIC {
			return Err(Error::BadZone);
		}
		Ok(Self { cp })
	}

	/// The zone header.
	fn cp(&self) -> &CpConfig {
		// SAFETY: The header is live for the handle's lifetime.
		unsafe { self.cp.as_ref() }
	}

	/// The zone header pointer, for sibling handles.
	pub(crate) fn zone_header(&self) -> NonNull<CpConfig> {
		self.cp
	}

	/// The peer dataplane zone header.
	#[must_use]
	pub fn dp(&self) -> &DpConfig {
		// SAFETY: `init` always links the dataplane header.
		unsafe { self.cp().dp.load().expect("zone dataplane header").as_ref() }
	}

	/// The writer lock.
	#[must_use]
	pub fn lock(&self) -> &PidLock {
		&self.cp().lock
	}

	/// A single attempt at exclusive zone access.
	///
	/// Blocking acquisition never surfaces contention; this is the
	/// one-shot variant for controllers that would rather back off.
	pub fn try_exclusive(&self) -> Result<weir_sync::PidGuard<'_>, Error> {
		self.cp().lock.try_guard().ok_or(Error::LockContention)
	}

	/// The general allocation context (diagnostics and tests).
	#[must_use]
	pub fn ctx(&self) -> &MemCtx {
		&self.cp().ctx
	}

	/// The active generation.
	///
	/// Mutators own retirement: the pointer is stable for callers holding
	/// the writer lock, and for workers advertising through
	/// [`crate::Worker`].
	#[must_use]
	pub fn active(&self) -> NonNull<ConfigGen> {
		self.cp()
			.active
			.load(Acquire)
			.expect("zone has an active generation")
	}

	/// Inspects the active generation under the writer lock.
	///
	/// Taking the lock pins the generation against concurrent retirement
	/// by other controllers; workers use [`crate::Worker`] instead and
	/// pin through their advertisement.
	pub fn with_active<R>(&self, f: impl FnOnce(&ConfigGen) -> R) -> R {
		let cp_ref = self.cp();
		let _guard = cp_ref.lock.guard();
		// SAFETY: Retirement happens only inside an install, which the
		// SAFETY: guard excludes.
		f(unsafe { cp_ref.active_cell().as_ref() })
	}

	/// The active generation's number.
	#[must_use]
	pub fn generation_number(&self) -> u64 {
		// SAFETY: Generations are retired only after quiescence; reading
		// SAFETY: the number of the freshly loaded pointer is safe in
		// SAFETY: every protocol state.
		unsafe { self.active().as_ref() }.number()
	}

	/// Attaches (creating on first use) the agent record named `name`
	/// and returns the agent-facing API handle.
	pub fn agent(&self, name: &str) -> Result<Agent, Error> {
		let name = Name::new(name)?;
		let cp_ref = self.cp();
		let _guard = cp_ref.lock.guard();
		let ctx = &cp_ref.ctx;

		// SAFETY: Agent registry mutation is serialized by the guard.
		let agents = unsafe { &mut (*self.cp.as_ptr()).agents };
		let rec = match agents.lookup(AgentRec::name_pred(name)) {
			Some(idx) => {
				let item = agents.get(idx).expect("lookup hit implies item");
				AgentRec::from_item(item)
			}
			None => {
				let rec = AgentRec::create(ctx, name)?;
				agents.insert(ctx, AgentRec::item(rec))?;
				rec
			}
		};

		Ok(Agent {
			cp: self.cp,
			rec,
			dir: DpDirectory::new(self.dp()),
		})
	}
}

/// An attached controller: the agent-facing mutation API.
///
/// Every update call applies all passed entities of one kind as a single
/// generation step. On failure the active generation is unchanged, a
/// structured record lands on the thread's diagnostic stack, and the
/// error is returned.
pub struct Agent {
	/// The zone header.
	cp:  NonNull<CpConfig>,
	/// This agent's arena record.
	rec: NonNull<AgentRec>,
	/// Process-local dataplane name directory.
	dir: DpDirectory,
}

// SAFETY: As for `ControlPlane`.
unsafe impl Send for Agent {}

impl Agent {
	/// Builds and upserts `cfgs` as one new generation.
	pub fn update_modules(&self, cfgs: &[ModuleConfig]) -> Result<(), Error> {
		let label = join_names(cfgs.iter().map(|c| format!("{}:{}", c.module_type, c.name)));
		self.run("update_modules", EntityKind::Module, label, || {
			install(self.cp, |gen_mut, ctx| {
				for cfg in cfgs {
					let module = Module::build(ctx, &self.dir, self.rec, cfg)?;
					if let Err(err) = gen_mut.upsert_module(ctx, module) {
						// SAFETY: The module was never registered.
						unsafe { Module::destroy(module, ctx) };
						return Err(err);
					}
				}
				Ok(())
			})
		})
	}

	/// Deletes one module, refusing while any chain references it.
	pub fn delete_module(&self, module_type: &str, name: &str) -> Result<(), Error> {
		let label = format!("{module_type}:{name}");
		self.run("delete_module", EntityKind::Module, label, || {
			let ty = Name::new(module_type)?;
			let name = Name::new(name)?;
			install(self.cp, |gen_mut, ctx| gen_mut.delete_module(ctx, &ty, &name))
		})
	}

	/// Builds and upserts `cfgs` as one new generation.
	pub fn update_functions(&self, cfgs: &[FunctionConfig]) -> Result<(), Error> {
		let label = join_names(cfgs.iter().map(|c| c.name.clone()));
		self.run("update_functions", EntityKind::Function, label, || {
			install(self.cp, |gen_mut, ctx| {
				for cfg in cfgs {
					let function = Function::build(ctx, cfg)?;
					if let Err(err) = gen_mut.upsert_function(ctx, function) {
						// SAFETY: The function was never registered.
						unsafe { Function::free(function, ctx) };
						return Err(err);
					}
				}
				Ok(())
			})
		})
	}

	/// Deletes one function, refusing while any pipeline references it.
	pub fn delete_function(&self, name: &str) -> Result<(), Error> {
		self.run("delete_function", EntityKind::Function, name.to_owned(), || {
			let name = Name::new(name)?;
			install(self.cp, |gen_mut, ctx| gen_mut.delete_function(ctx, &name))
		})
	}

	/// Builds and upserts `cfgs` as one new generation.
	pub fn update_pipelines(&self, cfgs: &[PipelineConfig]) -> Result<(), Error> {
		let label = join_names(cfgs.iter().map(|c| c.name.clone()));
		self.run("update_pipelines", EntityKind::Pipeline, label, || {
			install(self.cp, |gen_mut, ctx| {
				for cfg in cfgs {
					let pipeline = Pipeline::build(ctx, gen_mut.function_registry(), cfg)?;
					if let Err(err) = gen_mut.upsert_pipeline(ctx, pipeline) {
						// SAFETY: The pipeline was never registered.
						unsafe { Pipeline::free(pipeline, ctx) };
						return Err(err);
					}
				}
				Ok(())
			})
		})
	}

	/// Deletes one pipeline, refusing while any device references it.
	pub fn delete_pipeline(&self, name: &str) -> Result<(), Error> {
		self.run("delete_pipeline", EntityKind::Pipeline, name.to_owned(), || {
			let name = Name::new(name)?;
			install(self.cp, |gen_mut, ctx| gen_mut.delete_pipeline(ctx, &name))
		})
	}

	/// Builds and upserts `cfgs` as one new generation.
	pub fn update_devices(&self, cfgs: &[DeviceConfig]) -> Result<(), Error> {
		let label = join_names(cfgs.iter().map(|c| c.name.clone()));
		self.run("update_devices", EntityKind::Device, label, || {
			install(self.cp, |gen_mut, ctx| {
				for cfg in cfgs {
					let device = Device::build(ctx, &self.dir, gen_mut.pipeline_registry(), cfg)?;
					if let Err(err) = gen_mut.upsert_device(ctx, device) {
						// SAFETY: The device was never registered.
						unsafe { Device::free(device, ctx) };
						return Err(err);
					}
				}
				Ok(())
			})
		})
	}

	/// Modules awaiting reclamation on this agent's unused list.
	#[must_use]
	pub fn unused_count(&self) -> u64 {
		// SAFETY: The record is live while the agent registry holds it.
		let _guard = unsafe { self.cp.as_ref() }.lock.guard();
		// SAFETY: As above.
		unsafe { self.rec.as_ref() }.unused_count()
	}

	/// Whether a (type, name) module sits on the unused list.
	#[must_use]
	pub fn unused_contains(&self, module_type: &str, name: &str) -> bool {
		let (Ok(ty), Ok(name)) = (Name::new(module_type), Name::new(name)) else {
			return false;
		};
		// SAFETY: As for `unused_count`.
		let _guard = unsafe { self.cp.as_ref() }.lock.guard();
		AgentRec::unused_iter(self.rec).any(|m| {
			// SAFETY: Listed modules stay live until `detach`.
			let m = unsafe { m.as_ref() };
			m.module_type() == ty && m.name() == name
		})
	}

	/// Tears the agent down: reclaims every soft-retired module and drops
	/// the agent record.
	///
	/// Refused while the active generation still carries modules owned by
	/// this agent.
	pub fn detach(self) -> Result<(), Error> {
		// SAFETY: The header is live for the handle's lifetime.
		let cp_ref = unsafe { self.cp.as_ref() };
		let _guard = cp_ref.lock.guard();
		let ctx = &cp_ref.ctx;

		let name = {
			// SAFETY: The record is live while the agent registry holds it.
			unsafe { self.rec.as_ref() }.name()
		};

		// SAFETY: The active generation is stable under the lock.
		let active = unsafe {
			cp_ref
				.active
				.load(Acquire)
				.expect("zone has an active generation")
				.as_ref()
		};
		let mut owned = None;
		for idx in 0..active.module_capacity() {
			if let Some(m) = active.get_module(idx) {
				// SAFETY: Registered modules are live.
				let m = unsafe { m.as_ref() };
				if m.owner() == Some(self.rec) {
					owned = Some(format!("{}:{}", m.module_type(), m.name()));
					break;
				}
			}
		}
		if let Some(holder) = owned {
			return Err(Error::InUse {
				kind: EntityKind::Agent,
				name: name.as_str().to_owned(),
				holder,
			});
		}

		// SAFETY: The lock is held; listed modules dropped their last
		// SAFETY: registry reference before retirement, and retirement
		// SAFETY: followed a quiescence wait (or pre-publication unwind).
		unsafe { AgentRec::drain_unused(self.rec, ctx) };

		// SAFETY: Agent registry mutation is serialized by the guard.
		let agents = unsafe { &mut (*self.cp.as_ptr()).agents };
		agents.replace(
			ctx,
			AgentRec::name_pred(name),
			None,
			&mut |item| {
				// SAFETY: Agent items head agent records; the unused list
				// SAFETY: was drained above.
				unsafe { AgentRec::free(AgentRec::from_item(item), ctx) };
			},
			EntityKind::Agent,
			name.as_str(),
		)
	}

	/// Runs `f`, pushing a diagnostic record on failure.
	fn run(
		&self,
		op: &'static str,
		kind: EntityKind,
		name: String,
		f: impl FnOnce() -> Result<(), Error>,
	) -> Result<(), Error> {
		match f() {
			Ok(()) => Ok(()),
			Err(err) => {
				push_diag(Diag {
					op,
					kind,
					name,
					detail: err.to_string(),
				});
				Err(err)
			}
		}
	}
}

/// Joins entity names for a diagnostic label.
fn join_names(names: impl Iterator<Item = String>) -> String {
	names.collect::<Vec<_>>().join(",")
}

/// The install sequence (see the module docs).
fn install(
	cp: NonNull<CpConfig>,
	mutate: impl FnOnce(&mut ConfigGen, &MemCtx) -> Result<(), Error>,
) -> Result<(), Error> {
	// SAFETY: The header is live for every attached handle's lifetime.
	let cp_ref = unsafe { cp.as_ref() };
	let _guard = cp_ref.lock.guard();
	let ctx = &cp_ref.ctx;

	let old = cp_ref
		.active
		.load(Acquire)
		.expect("zone has an active generation");
	let new = ConfigGen::spawn(old, ctx)?;

	let result = (|| {
		// SAFETY: The spawned generation is private to this mutator.
		mutate(unsafe { &mut *new.as_ptr() }, ctx)?;
		let ectx = GenEctx::build(ctx, &cp_ref.counter_ctx, new, Some(old))?;
		ConfigGen::set_ectx(new, ectx);
		Ok(())
	})();

	if let Err(err) = result {
		// SAFETY: The new generation was never published.
		unsafe { ConfigGen::free(new, ctx) };
		return Err(err);
	}

	// Publish, wait for every worker to move past the old generation,
	// then retire it. No failure is recoverable past this point.
	cp_ref.active.store(Some(new), Release);
	// SAFETY: The new generation is published and thus live.
	let gen_num = unsafe { new.as_ref() }.number();
	if let Some(dp) = cp_ref.dp.load() {
		// SAFETY: The dataplane header is live for the zone's lifetime.
		unsafe { dp.as_ref() }.wait_for_gen(gen_num);
	}
	// SAFETY: Every worker advertised `>= gen_num`, so nothing reads the
	// SAFETY: old generation anymore.
	unsafe { ConfigGen::free(old, ctx) };

	log::debug!("generation {gen_num} installed");
	Ok(())
}

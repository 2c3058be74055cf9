//! Devices: packet sources/sinks with weighted pipeline selection.

use core::ptr::NonNull;

use weir_dp::DpDirectory;
use weir_shm::{MemCtx, Name, OffsetPtr, round_up};

use crate::{
	config::DeviceConfig,
	counter::CounterRegistry,
	entity::Pipeline,
	error::{EntityKind, Error},
	registry::{Embedded, Registry, RegistryItem},
};

/// One (pipeline name, weight) pair in a device entry's tail.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct PipelineSlot {
	/// The referenced pipeline's name.
	pub name:   Name,
	/// Positive selection weight.
	pub weight: u64,
}

/// One direction of a device: an ordered, weighted pipeline selection.
///
/// Weight expansion into the flat pipeline map is deferred to the
/// execution context; the entry stores the pairs and the map's final
/// length.
#[repr(C)]
pub struct DeviceEntry {
	/// Pipeline references in the tail.
	pipeline_count:    u64,
	/// Sum of the pipeline weights.
	pipeline_map_size: u64,
	/// Total bytes of the one-shot allocation.
	alloc_size:        u64,
	// Tail: `[PipelineSlot; pipeline_count]`.
}

impl DeviceEntry {
	/// Builds one entry, validating every pipeline name against
	/// `pipelines` (the new generation's pipeline registry).
	fn build(
		ctx: &MemCtx,
		pipelines: &Registry,
		device_name: &str,
		list: &[(String, u64)],
	) -> Result<NonNull<Self>, Error> {
		let mut slots = Vec::with_capacity(list.len());
		for (pname, weight) in list {
			if *weight == 0 {
				return Err(Error::InvalidWeight {
					kind: EntityKind::Device,
					name: device_name.to_owned(),
				});
			}
			let pname = Name::new(pname)?;
			if pipelines.lookup(Pipeline::name_pred(pname)).is_none() {
				return Err(Error::NotFound {
					kind: EntityKind::Pipeline,
					name: pname.as_str().to_owned(),
				});
			}
			slots.push(PipelineSlot {
				name:   pname,
				weight: *weight,
			});
		}

		let count = slots.len() as u64;
		let size = round_up(size_of::<Self>() as u64 + count * size_of::<PipelineSlot>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				pipeline_count: count,
				pipeline_map_size: slots.iter().map(|s| s.weight).sum(),
				alloc_size: size,
			});
			for (i, s) in slots.iter().enumerate() {
				Self::slots_ptr(this).as_ptr().add(i).write(*s);
			}
		}

		Ok(this)
	}

	/// Releases the entry.
	///
	/// # Safety
	/// `this` must be a live entry owned solely by the caller.
	unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller.
		unsafe { ctx.free(this.cast(), (*this.as_ptr()).alloc_size) };
	}

	/// First tail slot.
	fn slots_ptr(this: NonNull<Self>) -> NonNull<PipelineSlot> {
		// SAFETY: The tail starts right past the header.
		unsafe { NonNull::new_unchecked(this.as_ptr().add(1).cast::<PipelineSlot>()) }
	}

	/// The entry's (pipeline, weight) slots.
	#[must_use]
	pub fn pipelines(&self) -> &[PipelineSlot] {
		let this = NonNull::from(self);
		// SAFETY: A live entry's tail holds `pipeline_count` slots.
		unsafe {
			core::slice::from_raw_parts(Self::slots_ptr(this).as_ptr(), self.pipeline_count as usize)
		}
	}

	/// Sum of the pipeline weights; the length of the expanded map.
	#[must_use]
	pub fn pipeline_map_size(&self) -> u64 {
		self.pipeline_map_size
	}
}

/// A packet source/sink with separate input and output pipeline
/// selections.
#[repr(C)]
pub struct Device {
	/// Registry header.
	item:            RegistryItem,
	/// Device name.
	name:            Name,
	/// Index in the dataplane device table.
	dp_device_index: u64,
	/// Declared counters.
	counters:        CounterRegistry,
	/// Selection for received packets.
	input:           OffsetPtr<DeviceEntry>,
	/// Selection for transmitted packets.
	output:          OffsetPtr<DeviceEntry>,
	/// Total bytes of the descriptor allocation.
	alloc_size:      u64,
}

// SAFETY: repr(C) with the registry header first.
unsafe impl Embedded for Device {}

impl Device {
	/// Builds a device and its two entries.
	pub fn build(
		ctx: &MemCtx,
		dir: &DpDirectory,
		pipelines: &Registry,
		cfg: &DeviceConfig,
	) -> Result<NonNull<Self>, Error> {
		let name = Name::new(&cfg.name)?;

		let dp_device_index = dir.device(&name).ok_or_else(|| Error::NotFound {
			kind: EntityKind::DpDevice,
			name: cfg.name.clone(),
		})?;

		let size = round_up(size_of::<Self>() as u64);
		let this = ctx.alloc(size)?.cast::<Self>();

		// SAFETY: Fresh allocation.
		unsafe {
			this.as_ptr().write(Self {
				item: RegistryItem::new(),
				name,
				dp_device_index,
				counters: CounterRegistry::empty(),
				input: OffsetPtr::null(),
				output: OffsetPtr::null(),
				alloc_size: size,
			});
		}

		let result = (|| {
			let input = DeviceEntry::build(ctx, pipelines, &cfg.name, &cfg.input)?;
			// SAFETY: Just placed; unaliased until returned.
			unsafe { (*this.as_ptr()).input.store(Some(input)) };

			let output = DeviceEntry::build(ctx, pipelines, &cfg.name, &cfg.output)?;
			// SAFETY: As above.
			unsafe { (*this.as_ptr()).output.store(Some(output)) };

			// SAFETY: As above.
			let counters = unsafe { &mut (*this.as_ptr()).counters };
			counters.register(ctx, Name::new("rx").expect("static name"), 1)?;
			counters.register(ctx, Name::new("tx").expect("static name"), 1)
		})();

		if let Err(err) = result {
			// SAFETY: Nothing references the half-built descriptor; `free`
			// SAFETY: tolerates missing entries.
			unsafe { Self::free(this, ctx) };
			return Err(err);
		}

		Ok(this)
	}

	/// Releases the device and its entries.
	///
	/// # Safety
	/// `this` must be a live device whose reference count reached zero,
	/// under the zone writer lock.
	pub unsafe fn free(this: NonNull<Self>, ctx: &MemCtx) {
		// SAFETY: Offloaded to the caller; the device exclusively owns
		// SAFETY: its entries.
		unsafe {
			if let Some(entry) = (*this.as_ptr()).input.load() {
				DeviceEntry::free(entry, ctx);
			}
			if let Some(entry) = (*this.as_ptr()).output.load() {
				DeviceEntry::free(entry, ctx);
			}
			(*this.as_ptr()).counters.destroy(ctx);
			ctx.free(this.cast(), (*this.as_ptr()).alloc_size);
		}
	}

	/// The device's name.
	#[must_use]
	pub fn name(&self) -> Name {
		self.name
	}

	/// Index in the dataplane device table.
	#[must_use]
	pub fn dp_device_index(&self) -> u64 {
		self.dp_device_index
	}

	/// The input-direction entry.
	#[must_use]
	pub fn input(&self) -> &DeviceEntry {
		// SAFETY: A fully built device always carries both entries.
		unsafe { self.input.load().expect("device input entry").as_ref() }
	}

	/// The output-direction entry.
	#[must_use]
	pub fn output(&self) -> &DeviceEntry {
		// SAFETY: As for `input`.
		unsafe { self.output.load().expect("device output entry").as_ref() }
	}

	/// The device's declared counters.
	#[must_use]
	pub fn counters(&self) -> &CounterRegistry {
		&self.counters
	}

	/// A registry predicate matching a device by name.
	#[must_use]
	pub fn name_pred(name: Name) -> impl FnMut(NonNull<RegistryItem>) -> bool {
		move |item| {
			// SAFETY: Items in the device registry head devices.
			unsafe { Self::from_item(item).as_ref() }.name == name
		}
	}
}

//! The worker-side read path.
//!
//! Workers never coordinate with writers: once per packet batch a worker
//! loads the active generation pointer, advertises its number, and
//! indexes the execution context until the next batch. Advertising `g`
//! asserts that all of the worker's processing against generations `< g`
//! has finished, which is exactly the condition the mutator's quiescence
//! wait polls for.

use core::{marker::PhantomData, ptr::NonNull};

use crate::{
	ectx::GenEctx,
	generation::ConfigGen,
	zone::{ControlPlane, CpConfig},
};

/// One worker thread's handle onto the zone.
pub struct Worker {
	/// The zone header.
	cp:    NonNull<CpConfig>,
	/// This worker's index in the dataplane counter array.
	index: u64,
}

// SAFETY: The handle is address-based and owned by one worker thread;
// SAFETY: the only cell it writes is its own generation counter.
unsafe impl Send for Worker {}

impl Worker {
	/// Creates the handle for worker `index`.
	#[must_use]
	pub fn new(cp: &ControlPlane, index: u64) -> Self {
		assert!(
			index < cp.dp().worker_count(),
			"worker index out of range"
		);
		Self {
			cp: cp.zone_header(),
			index,
		}
	}

	/// Starts a batch: loads the active generation, advertises its
	/// number, and returns the snapshot to process against.
	///
	/// The returned snapshot borrows the handle mutably, so the worker
	/// cannot advertise past it while it is in use; that is what keeps
	/// the snapshot's memory from being retired underneath it.
	pub fn enter(&mut self) -> Snapshot<'_> {
		// SAFETY: The header is live for the handle's lifetime.
		let cp_ref = unsafe { self.cp.as_ref() };
		let gen_ptr = CpConfig::active_cell(cp_ref);
		// SAFETY: A published generation is live until quiescence, which
		// SAFETY: this worker's advertisement gates.
		let number = unsafe { gen_ptr.as_ref() }.number();

		if let Some(dp) = CpConfig::dp_ptr(cp_ref) {
			// SAFETY: The dataplane header is live for the zone's lifetime.
			unsafe { dp.as_ref() }.advertise(self.index, number);
		}

		Snapshot {
			gen_ptr,
			_worker: PhantomData,
		}
	}

	/// The worker's index.
	#[must_use]
	pub fn index(&self) -> u64 {
		self.index
	}
}

/// An internally consistent view of one published generation.
pub struct Snapshot<'a> {
	/// The generation this snapshot reads.
	gen_ptr: NonNull<ConfigGen>,
	/// Ties the snapshot to its worker's advertisement.
	_worker: PhantomData<&'a mut Worker>,
}

impl Snapshot<'_> {
	/// The generation number.
	#[must_use]
	pub fn number(&self) -> u64 {
		self.config_gen().number()
	}

	/// The configuration tree.
	#[must_use]
	pub fn config_gen(&self) -> &ConfigGen {
		// SAFETY: The generation outlives the snapshot; see `enter`.
		unsafe { self.gen_ptr.as_ref() }
	}

	/// The execution context.
	#[must_use]
	pub fn ectx(&self) -> &GenEctx {
		// SAFETY: Published generations always carry their context, which
		// SAFETY: shares their lifetime.
		unsafe {
			self.config_gen()
				.ectx()
				.expect("published generation has an execution context")
				.as_ref()
		}
	}
}

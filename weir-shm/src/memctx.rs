//! Memory contexts.

use core::ptr::NonNull;

use crate::{BlockAlloc, ShmError};

/// Byte length of a context's accounting label.
const LABEL_LEN: usize = 32;

/// A lightweight allocation handle pairing an arena allocator with an
/// accounting label.
///
/// The label is used only in diagnostics. Contexts live inside the arena
/// (they reference the allocator with an offset pointer) and are passed by
/// reference everywhere an allocation may occur. A module's *sub-arena* is
/// simply a context whose allocator governs a region that was itself
/// allocated from the parent context.
#[repr(C)]
pub struct MemCtx {
	/// The allocator this context draws from.
	alloc: crate::OffsetPtr<BlockAlloc>,
	/// NUL-padded ASCII accounting label.
	label: [u8; LABEL_LEN],
}

impl MemCtx {
	/// A detached context, safe to place bytewise as part of a containing
	/// descriptor's placement write. Allocations fail until
	/// [`MemCtx::init`] runs over the cell.
	#[must_use]
	pub const fn empty() -> Self {
		Self {
			alloc: crate::OffsetPtr::null(),
			label: [0; LABEL_LEN],
		}
	}

	/// Initializes a context in place.
	///
	/// # Safety
	/// `this` must point at writable arena memory in the same mapping as
	/// `alloc`.
	pub unsafe fn init(this: NonNull<Self>, alloc: NonNull<BlockAlloc>, label: &str) {
		let mut cell = [0_u8; LABEL_LEN];
		let bytes = label.as_bytes();
		let n = bytes.len().min(LABEL_LEN - 1);
		cell[..n].copy_from_slice(&bytes[..n]);

		// SAFETY: `this` is writable per the caller contract.
		unsafe {
			this.as_ptr().write(Self {
				alloc: crate::OffsetPtr::null(),
				label: cell,
			});
			(*this.as_ptr()).alloc.store(Some(alloc));
		}
	}

	/// The accounting label.
	#[must_use]
	pub fn label(&self) -> &str {
		let len = self.label.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
		// SAFETY: The label is written from ASCII input only.
		unsafe { core::str::from_utf8_unchecked(&self.label[..len]) }
	}

	/// Allocates `size` bytes from the context's allocator.
	pub fn alloc(&self, size: u64) -> Result<NonNull<u8>, ShmError> {
		let Some(alloc) = self.alloc.load() else {
			return Err(ShmError::OutOfArena);
		};

		// SAFETY: Arena mutation, including the allocator free list, is
		// SAFETY: serialized by the zone's writer lock; no other reference
		// SAFETY: to the allocator state is live in this process here.
		let r = unsafe { (*alloc.as_ptr()).alloc(size) };
		if r.is_err() {
			log::error!("allocation of {size} bytes failed in context {:?}", self.label());
		}
		r
	}

	/// Allocates `size` zeroed bytes.
	pub fn alloc_zeroed(&self, size: u64) -> Result<NonNull<u8>, ShmError> {
		let p = self.alloc(size)?;
		// SAFETY: The fresh allocation is at least `size` bytes and ours.
		unsafe { core::ptr::write_bytes(p.as_ptr(), 0, size as usize) };
		Ok(p)
	}

	/// Returns `size` bytes at `ptr` to the context's allocator.
	///
	/// `size` must match the value passed to the original allocation.
	pub fn free(&self, ptr: NonNull<u8>, size: u64) {
		if let Some(alloc) = self.alloc.load() {
			// SAFETY: Serialized by the zone's writer lock, as in `alloc`.
			unsafe { (*alloc.as_ptr()).free(ptr, size) };
		}
	}

	/// The allocator backing this context.
	#[must_use]
	pub fn allocator(&self) -> Option<NonNull<BlockAlloc>> {
		self.alloc.load()
	}

	/// Bytes currently free in the backing allocator (diagnostics).
	#[must_use]
	pub fn free_bytes(&self) -> u64 {
		// SAFETY: A plain read of the counter; the value is advisory and
		// SAFETY: only meaningful to callers serialized with mutators.
		self.alloc.load().map_or(0, |a| unsafe { (*a.as_ptr()).free_bytes() })
	}
}

//! The shared block allocator.
//!
//! The allocator governs the byte range of an arena that follows the zone
//! header. Its entire state (the head pointer and every free-block link)
//! is expressed with [`OffsetPtr`]s, so the one allocator instance is
//! shared by every process attached to the zone, whatever base address
//! each of them mapped it at.
//!
//! Callers pass the allocation size back on [`BlockAlloc::free`]; the
//! allocator keeps no per-allocation header. Mutation is serialized by the
//! zone's writer lock, never by the allocator itself.

use core::ptr::NonNull;

use crate::{OffsetPtr, ShmError};

/// Allocation granularity in bytes. Every block size and every request is
/// rounded up to a multiple of this, which also guarantees that a split
/// remainder can always hold a [`FreeBlock`] header.
pub const GRAIN: u64 = 16;

/// Rounds `size` up to the allocation granularity (at least one grain).
#[must_use]
pub const fn round_up(size: u64) -> u64 {
	let size = if size == 0 { 1 } else { size };
	(size + (GRAIN - 1)) & !(GRAIN - 1)
}

/// A node of the in-arena free list, written over the freed bytes.
#[repr(C)]
struct FreeBlock {
	/// Byte length of this free range, a multiple of [`GRAIN`].
	size: u64,
	/// Next free range in ascending address order.
	next: OffsetPtr<FreeBlock>,
}

static_assertions::const_assert_eq!(core::mem::size_of::<FreeBlock>() as u64, GRAIN);

/// First-fit free-list allocator state, resident in the arena it governs.
#[repr(C)]
pub struct BlockAlloc {
	/// Lowest-addressed free range, or null when exhausted.
	free_head:  OffsetPtr<FreeBlock>,
	/// Total governed bytes.
	arena_size: u64,
	/// Bytes currently free.
	free_bytes: u64,
}

impl BlockAlloc {
	/// Initializes allocator state in place over `heap_len` bytes starting
	/// at `heap_start`.
	///
	/// # Safety
	/// `this` must point at writable arena memory for the allocator state,
	/// and `[heap_start, heap_start + heap_len)` must be an unused,
	/// grain-aligned arena range that outlives the allocator. Call exactly
	/// once per zone, by the zone owner.
	pub unsafe fn init(this: NonNull<Self>, heap_start: NonNull<u8>, heap_len: u64) {
		let usable = heap_len & !(GRAIN - 1);

		// SAFETY: `this` is writable per the caller contract; null offset
		// SAFETY: pointers are position-independent and safe to place.
		unsafe {
			this.as_ptr().write(Self {
				free_head:  OffsetPtr::null(),
				arena_size: usable,
				free_bytes: 0,
			});
		}

		if usable >= GRAIN {
			let block = heap_start.cast::<FreeBlock>();
			// SAFETY: The range is unused and large enough for a header.
			unsafe {
				block.as_ptr().write(FreeBlock {
					size: usable,
					next: OffsetPtr::null(),
				});
				(*this.as_ptr()).free_head.store(Some(block));
				(*this.as_ptr()).free_bytes = usable;
			}
		}
	}

	/// Allocates `size` bytes, rounded up to the grain.
	///
	/// First fit; oversized blocks are split and the remainder stays on
	/// the free list.
	pub fn alloc(&mut self, size: u64) -> Result<NonNull<u8>, ShmError> {
		let want = round_up(size);

		let mut prev: Option<NonNull<FreeBlock>> = None;
		let mut cur = self.free_head.load();

		while let Some(block) = cur {
			// SAFETY: Free-list nodes are live headers inside the arena;
			// SAFETY: mutation is serialized by the zone writer lock.
			let (bsize, next) = unsafe { ((*block.as_ptr()).size, (*block.as_ptr()).next.load()) };

			if bsize >= want {
				let replacement = if bsize > want {
					// Both sizes are grain multiples, so the remainder can
					// hold a header.
					// SAFETY: The remainder lies inside the block being split.
					let tail = unsafe {
						NonNull::new_unchecked(
							block.as_ptr().cast::<u8>().add(want as usize).cast::<FreeBlock>(),
						)
					};
					// SAFETY: The remainder bytes are free and unaliased.
					unsafe {
						tail.as_ptr().write(FreeBlock {
							size: bsize - want,
							next: OffsetPtr::null(),
						});
						(*tail.as_ptr()).next.store(next);
					}
					Some(tail)
				} else {
					next
				};

				match prev {
					// SAFETY: `p` is the live predecessor node.
					Some(p) => unsafe { (*p.as_ptr()).next.store(replacement) },
					None => self.free_head.store(replacement),
				}

				self.free_bytes -= want;
				return Ok(block.cast());
			}

			prev = Some(block);
			cur = next;
		}

		log::error!(
			"arena exhausted: want {want} bytes, {} of {} free",
			self.free_bytes,
			self.arena_size
		);
		Err(ShmError::OutOfArena)
	}

	/// Returns `size` bytes at `ptr` to the free list.
	///
	/// `size` must be the value passed to the matching [`Self::alloc`];
	/// it is rounded the same way. Adjacent free ranges are coalesced.
	pub fn free(&mut self, ptr: NonNull<u8>, size: u64) {
		let size = round_up(size);
		let addr = ptr.as_ptr() as usize;

		// Find the insertion point: `prev` is the last free range below
		// `addr`, `next` the first above it.
		let mut prev: Option<NonNull<FreeBlock>> = None;
		let mut cur = self.free_head.load();
		while let Some(block) = cur {
			if block.as_ptr() as usize > addr {
				break;
			}
			prev = Some(block);
			// SAFETY: `block` is a live free-list node.
			cur = unsafe { (*block.as_ptr()).next.load() };
		}
		let next = cur;

		self.free_bytes += size;

		// Absorb the following range when it starts exactly at our end.
		let (merged_size, merged_next) = match next {
			Some(n) if addr + size as usize == n.as_ptr() as usize => {
				// SAFETY: `n` is a live free-list node.
				let (nsize, nnext) = unsafe { ((*n.as_ptr()).size, (*n.as_ptr()).next.load()) };
				(size + nsize, nnext)
			}
			other => (size, other),
		};

		// Grow the preceding range in place when it ends exactly at our
		// start; otherwise link a fresh header.
		if let Some(p) = prev {
			let paddr = p.as_ptr() as usize;
			// SAFETY: `p` is a live free-list node.
			let psize = unsafe { (*p.as_ptr()).size };
			if paddr + psize as usize == addr {
				// SAFETY: As above.
				unsafe {
					(*p.as_ptr()).size = psize + merged_size;
					(*p.as_ptr()).next.store(merged_next);
				}
				return;
			}
		}

		let block = ptr.cast::<FreeBlock>();
		// SAFETY: The freed bytes belong to the caller and are unaliased;
		// SAFETY: a grain is always large enough for the header.
		unsafe {
			block.as_ptr().write(FreeBlock {
				size: merged_size,
				next: OffsetPtr::null(),
			});
			(*block.as_ptr()).next.store(merged_next);
		}

		match prev {
			// SAFETY: `p` is the live predecessor node.
			Some(p) => unsafe { (*p.as_ptr()).next.store(Some(block)) },
			None => self.free_head.store(Some(block)),
		}
	}

	/// Bytes currently free.
	#[must_use]
	pub fn free_bytes(&self) -> u64 {
		self.free_bytes
	}

	/// Total governed bytes.
	#[must_use]
	pub fn arena_size(&self) -> u64 {
		self.arena_size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// A grain-aligned scratch arena for allocator tests.
	#[repr(C, align(16))]
	struct Scratch {
		heap:  [u8; 4096],
		state: core::mem::MaybeUninit<BlockAlloc>,
	}

	fn scratch() -> Box<Scratch> {
		let mut s = Box::new(Scratch {
			heap:  [0; 4096],
			state: core::mem::MaybeUninit::uninit(),
		});
		let state = NonNull::new(s.state.as_mut_ptr()).unwrap();
		let heap = NonNull::new(s.heap.as_mut_ptr()).unwrap();
		// SAFETY: Both ranges live inside the box and are unused.
		unsafe { BlockAlloc::init(state, heap, 4096) };
		s
	}

	fn state(s: &mut Scratch) -> &mut BlockAlloc {
		// SAFETY: `scratch()` initialized the state.
		unsafe { s.state.assume_init_mut() }
	}

	#[test]
	fn alloc_free_roundtrip() {
		let mut s = scratch();
		let a = state(&mut s);
		assert_eq!(a.free_bytes(), 4096);

		let p = a.alloc(100).unwrap();
		assert_eq!(a.free_bytes(), 4096 - round_up(100));
		a.free(p, 100);
		assert_eq!(a.free_bytes(), 4096);
	}

	#[test]
	fn coalescing_reassembles_neighbours() {
		let mut s = scratch();
		let a = state(&mut s);

		let x = a.alloc(512).unwrap();
		let y = a.alloc(512).unwrap();
		let _z = a.alloc(512).unwrap();

		a.free(y, 512);
		a.free(x, 512);

		// Freed neighbours must have merged: a request spanning both
		// succeeds without touching the tail block.
		let w = a.alloc(1024).unwrap();
		assert_eq!(w, x);
	}

	#[test]
	fn exhaustion_reports_out_of_arena() {
		let mut s = scratch();
		let a = state(&mut s);

		assert!(a.alloc(4096).is_ok());
		assert!(matches!(a.alloc(1), Err(ShmError::OutOfArena)));
	}

	#[test]
	fn split_remainder_stays_usable() {
		let mut s = scratch();
		let a = state(&mut s);

		let p = a.alloc(4096 - 16).unwrap();
		// Exactly one grain remains.
		assert_eq!(a.free_bytes(), 16);
		assert!(a.alloc(8).is_ok());
		assert!(a.alloc(1).is_err());
		a.free(p, 4096 - 16);
	}
}

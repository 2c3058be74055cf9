//! Shared-arena primitives for the weir router.
//!
//! Everything long-lived in weir lives inside a single shared byte arena
//! that cooperating processes map at (potentially) different base
//! addresses. This crate provides the pieces that make that possible:
//!
//! - [`OffsetPtr`] / [`AtomicOffsetPtr`]: self-relative pointers that stay
//!   valid across differing mappings of the same arena;
//! - [`BlockAlloc`]: the free-list block allocator whose state itself
//!   lives inside the arena, so every attached process shares one
//!   free-list instance;
//! - [`MemCtx`]: the accounting handle passed everywhere an allocation
//!   may occur;
//! - [`Name`]: fixed-size, NUL-padded ASCII entity names;
//! - [`ShmZone`]: the POSIX shared-memory mapping helper.

mod alloc;
mod memctx;
mod name;
mod offset;
mod zone;

pub use alloc::{BlockAlloc, GRAIN, round_up};
pub use memctx::MemCtx;
pub use name::{NAME_LEN, Name};
pub use offset::{AtomicOffsetPtr, OffsetPtr, slot, slot_mut};
pub use zone::{ShmMapping, ShmZone};

/// Errors surfaced by the shared-arena layer.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
	/// The block allocator was exhausted.
	#[error("shared arena exhausted")]
	OutOfArena,
	/// A name was empty, too long, or contained non-ASCII bytes.
	#[error("invalid name {0:?}")]
	InvalidName(String),
	/// A zone was created or opened with an unusable length.
	#[error("invalid zone length {0}")]
	InvalidLength(usize),
	/// The operating system rejected a mapping operation.
	#[error("zone mapping failed: {0}")]
	Os(#[from] nix::Error),
}

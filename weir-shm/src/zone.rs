//! POSIX shared-memory zone mapping.

use core::{num::NonZeroUsize, ptr::NonNull, sync::atomic::AtomicU64};
use std::{ffi::c_void, os::fd::OwnedFd};

use nix::{
	fcntl::OFlag,
	sys::{
		mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink},
		stat::Mode,
	},
	unistd::ftruncate,
};

use crate::ShmError;

/// A mapped shared-memory zone.
///
/// The zone is one contiguous byte region backed by a POSIX shared-memory
/// object; cooperating processes map the same object at (potentially)
/// different base addresses and talk through offset pointers. The creating
/// process zeroes and lays the zone out; openers attach to whatever the
/// owner published.
pub struct ShmZone {
	/// Mapping base in this process.
	base: NonNull<c_void>,
	/// Mapping length in bytes.
	len:  usize,
	/// The backing object, kept for remapping.
	fd:   OwnedFd,
	/// The shm object name, when still linked.
	name: Option<String>,
}

// SAFETY: The mapping is process-wide; the handle carries no thread
// SAFETY: affinity. Synchronization of the *contents* is the zone
// SAFETY: protocol's concern, not the mapping handle's.
unsafe impl Send for ShmZone {}

impl ShmZone {
	/// Creates and maps a fresh shared-memory object of `len` bytes.
	///
	/// Fails if an object with this name already exists.
	pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
		let fd = shm_open(
			name,
			OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
			Mode::S_IRUSR | Mode::S_IWUSR,
		)?;
		ftruncate(&fd, len as i64)?;
		let base = map(&fd, len)?;
		Ok(Self {
			base,
			len,
			fd,
			name: Some(name.to_owned()),
		})
	}

	/// Opens and maps an existing shared-memory object.
	pub fn open(name: &str, len: usize) -> Result<Self, ShmError> {
		let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)?;
		let base = map(&fd, len)?;
		Ok(Self {
			base,
			len,
			fd,
			name: Some(name.to_owned()),
		})
	}

	/// Creates an anonymous zone for in-process use (tests, tooling).
	///
	/// The backing object is unlinked immediately; it lives for as long as
	/// the zone (and any [`Self::remap`] of it) does.
	pub fn anon(len: usize) -> Result<Self, ShmError> {
		static SEQ: AtomicU64 = AtomicU64::new(0);
		let seq = SEQ.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
		let name = format!("/weir-anon-{}-{seq}", std::process::id());

		let mut zone = Self::create(&name, len)?;
		zone.unlink();
		Ok(zone)
	}

	/// Maps the zone's backing object a second time, at a new base.
	///
	/// Both mappings see the same bytes; used to exercise offset-pointer
	/// resolution across differing bases and by diagnostic tooling.
	pub fn remap(&self) -> Result<ShmMapping, ShmError> {
		let base = map(&self.fd, self.len)?;
		Ok(ShmMapping {
			base,
			len: self.len,
		})
	}

	/// Removes the zone's name from the namespace; existing mappings and
	/// descriptors stay alive.
	pub fn unlink(&mut self) {
		if let Some(name) = self.name.take() {
			if let Err(err) = shm_unlink(name.as_str()) {
				log::warn!("shm_unlink {name:?} failed: {err}");
			}
		}
	}

	/// Mapping base address in this process.
	#[must_use]
	pub fn base(&self) -> NonNull<u8> {
		self.base.cast()
	}

	/// Mapping length in bytes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Whether the mapping is empty (it never is for a live zone).
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl Drop for ShmZone {
	fn drop(&mut self) {
		// SAFETY: `base`/`len` describe a mapping we own and that no safe
		// SAFETY: reference can outlive (the handle is consumed).
		if let Err(err) = unsafe { munmap(self.base, self.len) } {
			log::warn!("munmap failed: {err}");
		}
	}
}

/// A secondary mapping of a zone's backing object.
pub struct ShmMapping {
	/// Mapping base in this process.
	base: NonNull<c_void>,
	/// Mapping length in bytes.
	len:  usize,
}

// SAFETY: Same argument as for `ShmZone`.
unsafe impl Send for ShmMapping {}

impl ShmMapping {
	/// Mapping base address in this process.
	#[must_use]
	pub fn base(&self) -> NonNull<u8> {
		self.base.cast()
	}

	/// Mapping length in bytes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Whether the mapping is empty.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl Drop for ShmMapping {
	fn drop(&mut self) {
		// SAFETY: As for `ShmZone`.
		if let Err(err) = unsafe { munmap(self.base, self.len) } {
			log::warn!("munmap failed: {err}");
		}
	}
}

/// Maps `len` bytes of `fd` shared and read-write.
fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<c_void>, ShmError> {
	let len_nz = NonZeroUsize::new(len).ok_or(ShmError::InvalidLength(len))?;
	// SAFETY: We map a file-backed region with no fixed address; the
	// SAFETY: kernel picks a free range, so no existing memory is clobbered.
	let base = unsafe {
		mmap(
			None,
			len_nz,
			ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
			MapFlags::MAP_SHARED,
			fd,
			0,
		)
	}?;
	Ok(base)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn anon_zone_is_shared_across_mappings() {
		let zone = ShmZone::anon(4096).unwrap();
		let other = zone.remap().unwrap();
		assert_ne!(zone.base(), other.base());

		// SAFETY: Both pointers alias the same fresh 4 KiB object.
		unsafe {
			zone.base().as_ptr().write(0xA5);
			assert_eq!(other.base().as_ptr().read(), 0xA5);
		}
	}
}

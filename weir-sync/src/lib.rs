//! Cross-process synchronization primitives for the weir router.
//!
//! The only shared-mutable control word in the configuration plane is the
//! writer lock cell provided here. It lives inside the shared arena and is
//! operated on by whichever processes have the zone mapped.

use core::sync::atomic::{
	AtomicU32,
	Ordering::{Acquire, Relaxed, Release},
};

/// Spin iterations before a waiter starts yielding its timeslice.
const SPIN_BEFORE_YIELD: u32 = 64;

/// A PID-valued advisory lock cell.
///
/// Zero means unlocked; any other value is the PID of the holder.
/// Acquisition is a compare-and-swap of `0 -> pid`; release swaps back.
/// The lock is advisory: double-locking from the same process or
/// unlocking without holding are logic errors in the caller, not runtime
/// failure modes, and are reported rather than "handled".
#[repr(transparent)]
pub struct PidLock(AtomicU32);

static_assertions::assert_eq_size!(PidLock, u32);

impl PidLock {
	/// A fresh, unlocked cell.
	#[must_use]
	pub const fn new() -> Self {
		Self(AtomicU32::new(0))
	}

	/// Acquires the lock, spinning until it is available.
	pub fn lock(&self) {
		let pid = std::process::id();
		let mut wait = SpinWait::new();
		while self
			.0
			.compare_exchange(0, pid, Acquire, Relaxed)
			.is_err()
		{
			wait.wait();
		}
	}

	/// A single acquisition attempt; `false` on contention.
	#[must_use]
	pub fn try_lock(&self) -> bool {
		let pid = std::process::id();
		self.0.compare_exchange(0, pid, Acquire, Relaxed).is_ok()
	}

	/// Acquires the lock and returns a guard that releases it on drop.
	pub fn guard(&self) -> PidGuard<'_> {
		self.lock();
		PidGuard(self)
	}

	/// A single acquisition attempt returning a releasing guard.
	#[must_use]
	pub fn try_guard(&self) -> Option<PidGuard<'_>> {
		self.try_lock().then(|| PidGuard(self))
	}

	/// Releases the lock.
	///
	/// Returns `false` (and leaves the cell untouched) when the calling
	/// process does not hold it.
	pub fn unlock(&self) -> bool {
		let pid = std::process::id();
		let ok = self
			.0
			.compare_exchange(pid, 0, Release, Relaxed)
			.is_ok();
		if !ok {
			log::warn!("pid {pid} released a lock it does not hold");
		}
		ok
	}

	/// PID of the current holder, if any.
	#[must_use]
	pub fn holder(&self) -> Option<u32> {
		match self.0.load(Relaxed) {
			0 => None,
			pid => Some(pid),
		}
	}
}

/// Releases its [`PidLock`] on drop.
pub struct PidGuard<'a>(&'a PidLock);

impl Drop for PidGuard<'_> {
	fn drop(&mut self) {
		self.0.unlock();
	}
}

/// Bounded-backoff spin helper shared by the lock and the quiescence wait.
///
/// Spins with the CPU hint for a while, then starts yielding the
/// timeslice. Never sleeps: waits in the configuration plane are expected
/// to be short, and the quiescence wait is deliberately unbounded.
pub struct SpinWait {
	/// Completed wait iterations.
	spins: u32,
}

impl SpinWait {
	/// A fresh backoff state.
	#[must_use]
	pub const fn new() -> Self {
		Self { spins: 0 }
	}

	/// Waits one step, escalating from spin hints to yields.
	pub fn wait(&mut self) {
		if self.spins < SPIN_BEFORE_YIELD {
			self.spins += 1;
			core::hint::spin_loop();
		} else {
			std::thread::yield_now();
		}
	}

	/// Resets the backoff to the spinning stage.
	pub fn reset(&mut self) {
		self.spins = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_cycle() {
		let lock = PidLock::new();
		assert_eq!(lock.holder(), None);

		lock.lock();
		assert_eq!(lock.holder(), Some(std::process::id()));
		assert!(!lock.try_lock());
		assert!(lock.unlock());
		assert_eq!(lock.holder(), None);
	}

	#[test]
	fn unlock_without_holding_is_rejected() {
		let lock = PidLock::new();
		assert!(!lock.unlock());
	}

	#[test]
	fn guard_releases_on_drop() {
		let lock = PidLock::new();
		{
			let _g = lock.guard();
			assert!(lock.try_guard().is_none());
		}
		assert!(lock.try_lock());
		assert!(lock.unlock());
	}

	#[test]
	fn contended_lock_is_eventually_acquired() {
		let lock = std::sync::Arc::new(PidLock::new());
		lock.lock();

		let other = std::sync::Arc::clone(&lock);
		let t = std::thread::spawn(move || {
			// Single-process test: fake a different holder by going
			// through the same cell; the CAS loop still exercises the
			// contended path.
			other.lock();
			other.unlock()
		});

		std::thread::sleep(std::time::Duration::from_millis(10));
		assert!(lock.unlock());
		assert!(t.join().unwrap());
	}
}

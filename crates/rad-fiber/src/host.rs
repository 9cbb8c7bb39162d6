//! Host thread identity for affinity checks.
//!
//! Resume operations take the host they run on as a parameter, so affinity can be exercised with simulated hosts.

use std::{
	fmt::{Debug, Display},
	num::NonZeroU64,
	sync::atomic::{AtomicU64, Ordering},
};

static NEXT_HOST: AtomicU64 = AtomicU64::new(1);

thread_local! {
	static CURRENT: HostId = HostId::fresh();
}

/// Identifies a host thread. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(NonZeroU64);

impl HostId {
	/// The identity of the calling OS thread.
	pub fn current() -> Self { CURRENT.with(|host| *host) }

	/// A new identity that no OS thread has.
	pub fn fresh() -> Self {
		match NonZeroU64::new(NEXT_HOST.fetch_add(1, Ordering::Relaxed)) {
			Some(id) => Self(id),
			None => panic!("host id counter wrapped"),
		}
	}

	pub fn get(self) -> u64 { self.0.get() }
}

impl Display for HostId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { write!(f, "host#{}", self.0) }
}

impl Debug for HostId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { <Self as Display>::fmt(self, f) }
}

/// Which host a suspended context may be resumed from.
///
/// A fiber that has never run is `Unbound`. A context suspended inside a resume call is bound to the host that made
/// the call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Affinity {
	#[default]
	Unbound,
	Bound(HostId),
}

impl Affinity {
	pub fn permits(self, host: HostId) -> bool {
		match self {
			Affinity::Unbound => true,
			Affinity::Bound(bound) => bound == host,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn current_is_stable_per_thread() {
		let here = HostId::current();
		assert_eq!(here, HostId::current());
		let there = std::thread::spawn(HostId::current).join().unwrap();
		assert_ne!(here, there);
	}

	#[test]
	fn fresh_hosts_are_distinct() {
		let a = HostId::fresh();
		let b = HostId::fresh();
		assert_ne!(a, b);
		assert_ne!(a, HostId::current());
	}

	#[test]
	fn bound_affinity_permits_only_its_host() {
		let host = HostId::fresh();
		assert!(Affinity::Bound(host).permits(host));
		assert!(!Affinity::Bound(host).permits(HostId::fresh()));
		assert!(Affinity::Unbound.permits(host));
	}
}

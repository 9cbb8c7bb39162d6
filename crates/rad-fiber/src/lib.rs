//! Stackful fibers with one-shot, owning handles.
//!
//! A [`Fiber`] names a suspended context. Resuming it consumes the handle, switches stacks, and returns a handle to
//! whichever context switched back. Contexts are either fibers created here, or the native stack of a thread that
//! resumed one.

use std::fmt::{Debug, Display};

pub use crate::{
	builder::Builder,
	fiber::{AffinityViolation, Fiber},
	host::{Affinity, HostId},
	stack::{DefaultAllocator, OwnedStack, Stack, StackAllocator, StackError, StackKind},
};

mod builder;
mod fiber;
mod host;
mod probe;
mod raw;
mod record;
mod stack;
mod trampoline;

pub enum Error {
	/// The stack allocator failed.
	Allocation(StackError),
	/// The stack cannot hold the fiber's record and still leave room to run.
	StackTooSmall { size: usize, required: usize },
	Affinity(AffinityViolation),
}

impl Error {
	/// The fiber a refused resume handed back, if any.
	pub fn into_fiber(self) -> Option<Fiber> {
		match self {
			Error::Affinity(violation) => Some(violation.into_fiber()),
			_ => None,
		}
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::Allocation(err) => write!(f, "failed to allocate fiber stack: {err}"),
			Error::StackTooSmall { size, required } => {
				write!(f, "fiber stack of {size} bytes is too small, need at least {required}")
			},
			Error::Affinity(violation) => write!(f, "{violation}"),
		}
	}
}

impl Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { <Self as Display>::fmt(self, f) }
}

impl std::error::Error for Error {}

impl From<StackError> for Error {
	fn from(err: StackError) -> Self { Error::Allocation(err) }
}

impl From<AffinityViolation> for Error {
	fn from(violation: AffinityViolation) -> Self { Error::Affinity(violation) }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
pub(crate) mod test_util {
	use std::{
		cell::{Cell, RefCell},
		ops::Deref,
		rc::Rc,
	};

	use tracing_subscriber::EnvFilter;

	use crate::{Stack, StackAllocator, StackError};

	pub fn init_tracing() {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::from_env("RADLOG"))
			.with_test_writer()
			.try_init();
	}

	pub struct HeapStack {
		_memory: Vec<u128>,
		stack: Stack,
	}

	impl Deref for HeapStack {
		type Target = Stack;

		fn deref(&self) -> &Stack { &self.stack }
	}

	/// Unguarded stacks from the global allocator, counting how many came back.
	pub struct HeapAllocator {
		size: usize,
		freed: Rc<Cell<usize>>,
	}

	impl HeapAllocator {
		pub fn new(size: usize, freed: &Rc<Cell<usize>>) -> Self {
			Self {
				size,
				freed: freed.clone(),
			}
		}
	}

	impl StackAllocator for HeapAllocator {
		type Stack = HeapStack;

		fn allocate(&mut self) -> Result<HeapStack, StackError> {
			let mut memory = vec![0u128; self.size / 16];
			let bottom = memory.as_mut_ptr();
			let stack = unsafe { Stack::new(bottom.add(memory.len()).cast(), bottom.cast()) };
			Ok(HeapStack { _memory: memory, stack })
		}

		fn deallocate(&mut self, stack: HeapStack) {
			self.freed.set(self.freed.get() + 1);
			drop(stack);
		}
	}

	/// Hands out guards that record when they are dropped.
	#[derive(Clone, Default)]
	pub struct Tracker {
		live: Rc<Cell<i32>>,
		dropped: Rc<RefCell<Vec<&'static str>>>,
	}

	impl Tracker {
		pub fn guard(&self, name: &'static str) -> Guard {
			self.live.set(self.live.get() + 1);
			Guard {
				tracker: self.clone(),
				name,
			}
		}

		pub fn live(&self) -> i32 { self.live.get() }

		pub fn dropped(&self) -> Vec<&'static str> { self.dropped.borrow().clone() }
	}

	pub struct Guard {
		tracker: Tracker,
		name: &'static str,
	}

	impl Drop for Guard {
		fn drop(&mut self) {
			self.tracker.live.set(self.tracker.live.get() - 1);
			self.tracker.dropped.borrow_mut().push(self.name);
		}
	}
}

//! Stack memory for fibers.

use std::{collections::BTreeMap, ops::Deref};

pub use context::stack::{FixedSizeStack, ProtectedFixedSizeStack, Stack, StackError};
use parking_lot::RwLock;
use tracing::trace;

/// Produces and releases the stacks fibers run on.
///
/// The allocator is moved onto the stack it produced and lives there until the fiber terminates, so it is handed
/// back its stack from a different one.
pub trait StackAllocator: 'static {
	type Stack: Deref<Target = Stack>;

	fn allocate(&mut self) -> Result<Self::Stack, StackError>;

	fn deallocate(&mut self, stack: Self::Stack) { drop(stack); }
}

/// Fixed-size stacks straight from the OS, optionally with a guard page below them.
#[derive(Clone, Copy, Debug)]
pub struct DefaultAllocator {
	size: usize,
	protected: bool,
}

impl Default for DefaultAllocator {
	fn default() -> Self { Self::new(Stack::default_size(), true) }
}

impl DefaultAllocator {
	pub fn new(size: usize, protected: bool) -> Self { Self { size, protected } }

	pub fn size(&self) -> usize { self.size }

	pub fn protected(&self) -> bool { self.protected }
}

pub enum OwnedStack {
	Protected(ProtectedFixedSizeStack),
	Fixed(FixedSizeStack),
}

impl Deref for OwnedStack {
	type Target = Stack;

	fn deref(&self) -> &Stack {
		match self {
			OwnedStack::Protected(stack) => stack,
			OwnedStack::Fixed(stack) => stack,
		}
	}
}

impl StackAllocator for DefaultAllocator {
	type Stack = OwnedStack;

	fn allocate(&mut self) -> Result<OwnedStack, StackError> {
		if self.protected {
			ProtectedFixedSizeStack::new(self.size).map(OwnedStack::Protected)
		} else {
			FixedSizeStack::new(self.size).map(OwnedStack::Fixed)
		}
	}
}

/// Every live fiber stack, bottom to top.
static FIBER_STACKS: RwLock<BTreeMap<usize, usize>> = RwLock::new(BTreeMap::new());

pub(crate) fn register(stack: &Stack) {
	let (bottom, top) = (stack.bottom() as usize, stack.top() as usize);
	trace!(bottom, top, "registering fiber stack");
	FIBER_STACKS.write().insert(bottom, top);
}

pub(crate) fn deregister(stack: &Stack) { FIBER_STACKS.write().remove(&(stack.bottom() as usize)); }

/// What kind of stack a context runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackKind {
	/// The stack an OS thread was started with. Tied to that thread.
	Native,
	/// A stack owned by a fiber. Can be resumed on any thread.
	Fiber,
}

impl StackKind {
	/// The kind of the stack the caller is running on.
	pub fn current() -> Self {
		let marker = 0u8;
		Self::of_addr(std::hint::black_box(&marker) as *const u8 as usize)
	}

	pub(crate) fn of_addr(addr: usize) -> Self {
		match FIBER_STACKS.read().range(..=addr).next_back() {
			Some((_, &top)) if addr < top => StackKind::Fiber,
			_ => StackKind::Native,
		}
	}

	pub fn is_migratable(self) -> bool { self == StackKind::Fiber }
}

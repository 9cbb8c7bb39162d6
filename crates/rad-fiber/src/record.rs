//! The control block a fiber keeps at the top of its own stack.

use std::{
	ffi::c_void,
	mem,
	ptr::NonNull,
};

use tracing::trace;

use crate::{
	fiber::Fiber,
	stack::{self, Stack, StackAllocator},
	Error,
	Result,
};

/// The record is placed at an address aligned down to this.
const RECORD_ALIGN: usize = 256;
/// Space left free between the record and the top of the stack the fiber runs on.
const RECORD_GAP: usize = 64;
/// Smallest stack we are willing to run a trampoline on.
const MIN_USABLE: usize = 1024;

/// The user callable. Called at most once, with the handle of whoever first resumed the fiber.
pub(crate) type Body = Box<dyn FnOnce(Fiber) -> Fiber>;

pub(crate) struct FiberRecord<S: StackAllocator> {
	stack: S::Stack,
	alloc: S,
	body: Option<Body>,
	name: Option<Box<str>>,
}

impl<S: StackAllocator> FiberRecord<S> {
	/// Allocates a stack and moves a record onto it.
	///
	/// Returns the record and the part of the stack below it, which is what the fiber actually runs on.
	pub fn place(mut alloc: S, body: Body, name: Option<Box<str>>) -> Result<(NonNull<Self>, Stack)> {
		let stack = alloc.allocate()?;
		let top = stack.top() as usize;
		let bottom = stack.bottom() as usize;

		let size = top - bottom;
		let required = mem::size_of::<Self>() + RECORD_ALIGN + RECORD_GAP + MIN_USABLE;
		if size < required {
			alloc.deallocate(stack);
			return Err(Error::StackTooSmall { size, required });
		}

		debug_assert!(mem::align_of::<Self>() <= RECORD_ALIGN);
		let storage = (top - mem::size_of::<Self>()) & !(RECORD_ALIGN - 1);
		let usable_top = storage - RECORD_GAP;

		stack::register(&stack);
		let record = storage as *mut Self;
		// SAFETY: `storage` is aligned, inside the stack, and nothing runs on the stack yet.
		unsafe {
			record.write(Self {
				stack,
				alloc,
				body: Some(body),
				name,
			});
			let usable = Stack::new(usable_top as *mut c_void, bottom as *mut c_void);
			Ok((NonNull::new_unchecked(record), usable))
		}
	}

	pub fn take_body(&mut self) -> Option<Body> { self.body.take() }

	pub fn name(&self) -> Option<&str> { self.name.as_deref() }

	/// Moves the record off its stack and gives the stack back to its allocator.
	///
	/// # Safety
	/// `record` must come from [`Self::place`], and nothing may be running on its stack anymore.
	pub unsafe fn deallocate(record: NonNull<Self>) {
		let Self {
			stack,
			mut alloc,
			body,
			name,
		} = record.as_ptr().read();
		trace!(fiber = name.as_deref(), "releasing fiber stack");

		drop(body);
		stack::deregister(&stack);
		alloc.deallocate(stack);
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::Cell, rc::Rc};

	use super::*;
	use crate::{stack::StackKind, test_util::HeapAllocator};

	#[test]
	fn record_sits_below_top_with_gap() {
		let freed = Rc::new(Cell::new(0));
		let alloc = HeapAllocator::new(16 * 1024, &freed);
		let (record, usable) = FiberRecord::place(alloc, Box::new(|f: Fiber| f), Some("placed".into())).unwrap();

		let addr = record.as_ptr() as usize;
		assert_eq!(addr % RECORD_ALIGN, 0);
		assert_eq!(usable.top() as usize + RECORD_GAP, addr);
		assert_eq!(StackKind::of_addr(addr), StackKind::Fiber);
		assert_eq!(unsafe { record.as_ref() }.name(), Some("placed"));

		unsafe { FiberRecord::deallocate(record) };
		assert_eq!(freed.get(), 1);
	}

	#[test]
	fn tiny_stack_is_rejected_and_returned() {
		let freed = Rc::new(Cell::new(0));
		match FiberRecord::place(HeapAllocator::new(512, &freed), Box::new(|f: Fiber| f), None) {
			Err(Error::StackTooSmall { size, required }) => {
				assert_eq!(size, 512);
				assert!(required > size);
			},
			Err(e) => panic!("unexpected error: {e}"),
			Ok(_) => panic!("tiny stack accepted"),
		}
		assert_eq!(freed.get(), 1);
	}
}

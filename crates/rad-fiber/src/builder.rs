use crate::{
	fiber::Fiber,
	stack::{DefaultAllocator, StackAllocator},
	Result,
};

/// Configures a fiber before creating it.
pub struct Builder<S = DefaultAllocator> {
	alloc: S,
	name: Option<String>,
}

impl Default for Builder {
	fn default() -> Self { Self::new() }
}

impl Builder {
	pub fn new() -> Self {
		Self {
			alloc: DefaultAllocator::default(),
			name: None,
		}
	}

	/// Raised to the platform minimum if smaller. Sizes above the platform maximum fail to build.
	pub fn stack_size(mut self, size: usize) -> Self {
		self.alloc = DefaultAllocator::new(size, self.alloc.protected());
		self
	}

	/// Whether to put a guard page below the stack. On by default.
	pub fn protected(mut self, protected: bool) -> Self {
		self.alloc = DefaultAllocator::new(self.alloc.size(), protected);
		self
	}
}

impl<S: StackAllocator> Builder<S> {
	/// Shows up in traces about the fiber.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn allocator<T: StackAllocator>(self, alloc: T) -> Builder<T> { Builder { alloc, name: self.name } }

	pub fn build<F>(self, f: F) -> Result<Fiber>
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		Fiber::create(self.alloc, Box::new(f), self.name.map(String::into_boxed_str))
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::Cell, rc::Rc};

	use super::*;
	use crate::{
		test_util::{init_tracing, HeapAllocator},
		Error,
	};

	#[test]
	fn settings_carry_over() {
		let builder = Builder::new().stack_size(128 * 1024).protected(false).name("worker");
		assert_eq!(builder.alloc.size(), 128 * 1024);
		assert!(!builder.alloc.protected());
		assert_eq!(builder.name.as_deref(), Some("worker"));

		let freed = Rc::new(Cell::new(0));
		let builder = builder.allocator(HeapAllocator::new(64 * 1024, &freed));
		assert_eq!(builder.name.as_deref(), Some("worker"));
	}

	#[test]
	fn unprotected_named_fiber_runs() {
		init_tracing();
		let ran = Rc::new(Cell::new(false));
		let r = ran.clone();
		let fiber = Builder::new()
			.name("unprotected")
			.protected(false)
			.stack_size(64 * 1024)
			.build(move |caller| {
				r.set(true);
				caller
			})
			.unwrap();

		assert!(fiber.resume().unwrap().is_empty());
		assert!(ran.get());
	}

	#[test]
	fn custom_allocator_gets_its_stack_back() {
		init_tracing();
		let freed = Rc::new(Cell::new(0));
		let fiber = Builder::new()
			.allocator(HeapAllocator::new(64 * 1024, &freed))
			.build(|caller| caller)
			.unwrap();
		assert_eq!(freed.get(), 0);

		assert!(fiber.resume().unwrap().is_empty());
		assert_eq!(freed.get(), 1);
	}

	#[test]
	fn tiny_stack_size_is_raised_to_minimum() {
		init_tracing();
		let ran = Rc::new(Cell::new(false));
		let r = ran.clone();
		let fiber = Builder::new()
			.stack_size(1)
			.build(move |caller| {
				r.set(true);
				caller
			})
			.unwrap();

		assert!(fiber.resume().unwrap().is_empty());
		assert!(ran.get());
	}

	#[test]
	fn too_small_stack_is_refused() {
		init_tracing();
		let freed = Rc::new(Cell::new(0));
		match Builder::new().allocator(HeapAllocator::new(256, &freed)).build(|caller| caller) {
			Err(Error::StackTooSmall { size, .. }) => assert_eq!(size, 256),
			other => panic!("expected a small stack to be refused, got {other:?}"),
		}
		assert_eq!(freed.get(), 1);
	}
}

//! The owning handle to a suspended context.

use std::{
	fmt::{Debug, Display},
	hash::{Hash, Hasher},
	marker::PhantomData,
	mem,
	ptr::NonNull,
};

use static_assertions::assert_not_impl_any;
use tracing::{span, trace, Level};

use crate::{
	builder::Builder,
	host::{Affinity, HostId},
	probe::{Answer, ProbeMessage, Query},
	raw::{ContextToken, Message, Transfer},
	record::{Body, FiberRecord},
	stack::{StackAllocator, StackKind},
	trampoline::{fiber_entry, protocol_violation, raise_unwind, unwind_on_top, user_on_top},
	Error,
	Result,
};

/// A suspended execution context: a fiber, or a thread that switched away into one.
///
/// Every switch consumes the handle it is called on and returns a handle to whichever context switches back next.
/// That handle is empty if the context that switched back has terminated.
///
/// Dropping a handle that is not empty unwinds the context it names, running the destructors of everything live on
/// its stack, and frees the stack. Dropping the handle of a thread that switched away aborts the process. So does a
/// panic escaping a fiber body.
///
/// Handles are neither `Send` nor `Sync`. A fiber body and what it captures need not be `Send`, and code on a fiber
/// stack may hold on to thread-locals of the thread that ran it. Which host a switch happens on is passed explicitly
/// instead: the `*_on` variants take a [`HostId`], and affinity checks go by that.
pub struct Fiber {
	token: Option<ContextToken>,
	_not_send: PhantomData<*mut ()>,
}

assert_not_impl_any!(Fiber: Send, Sync);

impl Default for Fiber {
	fn default() -> Self {
		Self {
			token: None,
			_not_send: PhantomData,
		}
	}
}

impl Fiber {
	/// Creates a fiber on a default stack. `f` does not run until the fiber is first resumed, and gets the handle of
	/// whoever resumed it. The handle `f` returns is where control goes once the fiber is done.
	pub fn new<F>(f: F) -> Result<Fiber>
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		Builder::new().build(f)
	}

	pub fn with_allocator<S, F>(alloc: S, f: F) -> Result<Fiber>
	where
		S: StackAllocator,
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		Builder::new().allocator(alloc).build(f)
	}

	pub fn builder() -> Builder { Builder::new() }

	pub(crate) fn create<S: StackAllocator>(alloc: S, body: Body, name: Option<Box<str>>) -> Result<Fiber> {
		let span = span!(Level::TRACE, "create fiber", name = name.as_deref());
		let _e = span.enter();

		let (record, usable) = FiberRecord::place(alloc, body, name)?;
		// SAFETY: the stack outlives the context, since the record owning it is only freed once the fiber has left it.
		unsafe {
			let token = ContextToken::create(&usable, fiber_entry::<S>);
			let Transfer { from, message } = token.jump_raw(record.as_ptr() as usize);
			match message {
				Message::Resume => {
					trace!(fiber = from.addr(), "created fiber");
					Ok(Fiber::from_token(from))
				},
				_ => protocol_violation("fiber did not park after bootstrap"),
			}
		}
	}

	pub(crate) fn from_token(token: ContextToken) -> Self {
		Self {
			token: Some(token),
			_not_send: PhantomData,
		}
	}

	pub(crate) fn into_token(mut self) -> Option<ContextToken> { self.token.take() }

	fn expect_token(self, op: &str) -> ContextToken {
		match self.into_token() {
			Some(token) => token,
			None => panic!("cannot {op} an empty fiber"),
		}
	}

	pub fn is_empty(&self) -> bool { self.token.is_none() }

	/// Moves the context out, leaving an empty handle behind.
	pub fn take(&mut self) -> Fiber { mem::take(self) }

	/// Switches to the context, if the calling thread is allowed to.
	pub fn resume(self) -> Result<Fiber> { self.resume_on(HostId::current()) }

	/// [`Self::resume`], as if called from `host`.
	pub fn resume_on(self, host: HostId) -> Result<Fiber> { Ok(self.checked(host)?.resume_from_any_thread_on(host)) }

	/// Switches to the context without checking which thread it was suspended on.
	pub fn resume_from_any_thread(self) -> Fiber { self.resume_from_any_thread_on(HostId::current()) }

	pub fn resume_from_any_thread_on(self, host: HostId) -> Fiber {
		let token = self.expect_token("resume");
		trace!(to = token.addr(), %host, "resume");
		// SAFETY: a handle that is not empty names a live, suspended context.
		unsafe { settle(token.jump(Message::Resume), host) }
	}

	/// Switches to the context and runs `f` on its stack before it continues.
	///
	/// `f` gets the handle of the context being left, and returns the handle the destination sees as the result of
	/// the switch it was suspended in. The context being left can be finished off from inside `f` by dropping its
	/// handle.
	pub fn resume_with<F>(self, f: F) -> Result<Fiber>
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		self.resume_with_on(HostId::current(), f)
	}

	pub fn resume_with_on<F>(self, host: HostId, f: F) -> Result<Fiber>
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		Ok(self.checked(host)?.resume_from_any_thread_with_on(host, f))
	}

	pub fn resume_from_any_thread_with<F>(self, f: F) -> Fiber
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		self.resume_from_any_thread_with_on(HostId::current(), f)
	}

	pub fn resume_from_any_thread_with_on<F>(self, host: HostId, f: F) -> Fiber
	where
		F: FnOnce(Fiber) -> Fiber + 'static,
	{
		let token = self.expect_token("resume");
		trace!(to = token.addr(), %host, "resume with on-top function");
		let mut slot = Some(f);
		// SAFETY: `slot` stays on this stack while we are suspended, and `user_on_top::<F>` takes it exactly once.
		unsafe {
			settle(
				token.jump_with_callback(&mut slot as *mut Option<F> as usize, user_on_top::<F>),
				host,
			)
		}
	}

	/// Whether [`Self::resume`] would go through on the calling thread. Does not run any of the context's code.
	pub fn can_resume(&mut self) -> bool { self.can_resume_on(HostId::current()) }

	pub fn can_resume_on(&mut self, host: HostId) -> bool { self.affinity().permits(host) }

	/// Whether the context runs on a stack that may be resumed by another thread.
	pub fn can_resume_from_any_thread(&mut self) -> bool { self.stack_kind().is_migratable() }

	pub fn affinity(&mut self) -> Affinity {
		match self.probe(Query::Affinity) {
			Answer::Affinity(affinity) => affinity,
			_ => protocol_violation("mismatched probe answer"),
		}
	}

	pub fn stack_kind(&mut self) -> StackKind {
		match self.probe(Query::StackKind) {
			Answer::StackKind(kind) => kind,
			_ => protocol_violation("mismatched probe answer"),
		}
	}

	fn probe(&mut self, query: Query) -> Answer {
		let token = match self.token.take() {
			Some(token) => token,
			None => panic!("cannot probe an empty fiber"),
		};

		trace!(fiber = token.addr(), ?query, "probe");
		let mut probe = ProbeMessage::new(query);
		// SAFETY: whatever the context is parked in answers and switches straight back.
		let Transfer { from, message } = unsafe { token.jump(Message::Probe(NonNull::from(&mut probe))) };
		match message {
			Message::Resume => self.token = Some(from),
			_ => protocol_violation("probe was not bounced back"),
		}

		match probe.answer() {
			Some(answer) => answer,
			None => protocol_violation("probe was not answered"),
		}
	}

	fn checked(mut self, host: HostId) -> Result<Fiber> {
		let affinity = self.affinity();
		if affinity.permits(host) {
			Ok(self)
		} else {
			trace!(%host, ?affinity, "refusing resume from foreign host");
			Err(Error::Affinity(AffinityViolation {
				fiber: self,
				affinity,
				host,
			}))
		}
	}

	fn key(&self) -> Option<usize> { self.token.as_ref().map(ContextToken::addr) }
}

/// Waits out a switch, answering probes until control comes back for real.
unsafe fn settle(mut t: Transfer, host: HostId) -> Fiber {
	loop {
		let Transfer { from, message } = t;
		match message {
			Message::Resume => return Fiber::from_token(from),
			Message::Terminated => return Fiber::default(),
			Message::Unwind => raise_unwind(from),
			Message::Probe(mut probe) => {
				probe.as_mut().respond(Affinity::Bound(host));
				t = from.jump(Message::Resume);
			},
		}
	}
}

impl Drop for Fiber {
	fn drop(&mut self) {
		let Some(token) = self.token.take() else {
			return;
		};

		trace!(fiber = token.addr(), "unwinding abandoned fiber");
		// SAFETY: the context unwinds, frees its stack and reports back as terminated.
		let Transfer { message, .. } = unsafe { token.jump_with_callback(0, unwind_on_top) };
		if !matches!(message, Message::Terminated) {
			protocol_violation("abandoned fiber did not terminate");
		}
	}
}

// Ordered by the address of the saved context, which stays put until the handle is switched through.
impl PartialEq for Fiber {
	fn eq(&self, other: &Self) -> bool { self.key() == other.key() }
}

impl Eq for Fiber {}

impl PartialOrd for Fiber {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Fiber {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.key().cmp(&other.key()) }
}

impl Hash for Fiber {
	fn hash<H: Hasher>(&self, state: &mut H) { self.key().hash(state) }
}

impl Display for Fiber {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self.key() {
			Some(addr) => write!(f, "{addr:#x}"),
			None => f.write_str("{not-a-fiber}"),
		}
	}
}

impl Debug for Fiber {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { write!(f, "Fiber({self})") }
}

/// A thread-checked resume from a host the context is not bound to. The fiber comes back untouched.
pub struct AffinityViolation {
	fiber: Fiber,
	affinity: Affinity,
	host: HostId,
}

impl AffinityViolation {
	pub fn into_fiber(self) -> Fiber { self.fiber }

	pub fn affinity(&self) -> Affinity { self.affinity }

	pub fn host(&self) -> HostId { self.host }
}

impl Display for AffinityViolation {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(
			f,
			"fiber {} is bound to {:?} and cannot be resumed from {}",
			self.fiber, self.affinity, self.host
		)
	}
}

impl Debug for AffinityViolation {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { <Self as Display>::fmt(self, f) }
}

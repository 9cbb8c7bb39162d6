//! The code every fiber starts out running, and the callbacks that run on top of other contexts.
//!
//! A forced unwind is a `resume_unwind` with a [`ForcedUnwind`] payload, raised at the point the fiber is suspended
//! at. The only place it is caught is [`fiber_entry`], and it never leaves the fiber's stack. Code running on a fiber
//! that catches panics must re-raise any payload it does not recognise.

use std::{
	any::Any,
	panic::{self, AssertUnwindSafe},
	process,
	ptr::NonNull,
};

use tracing::{error, trace};

use crate::{
	fiber::Fiber,
	host::Affinity,
	raw::{ContextToken, Message, RawTransfer, Transfer},
	record::FiberRecord,
	stack::{StackAllocator, StackKind},
};

/// Unwinds a fiber's stack, then hands control to the context inside.
pub(crate) struct ForcedUnwind(ContextToken);

// SAFETY: the payload only ever travels up the stack it was raised on.
unsafe impl Send for ForcedUnwind {}

/// Something broke the switching protocol. Carrying on would mean running on freed or foreign stacks.
#[cold]
pub(crate) fn protocol_violation(what: &str) -> ! {
	error!("fiber protocol violation: {what}");
	process::abort()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(msg) = payload.downcast_ref::<&str>() {
		msg
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg
	} else {
		"unknown panic"
	}
}

/// Starts unwinding the current fiber. `requester` gets control once the stack is gone.
pub(crate) fn raise_unwind(requester: ContextToken) -> ! {
	if StackKind::current() == StackKind::Native {
		protocol_violation("a thread's native stack cannot be unwound");
	}
	trace!(requester = requester.addr(), "forced unwind");
	panic::resume_unwind(Box::new(ForcedUnwind(requester)))
}

pub(crate) extern "C" fn fiber_entry<S: StackAllocator>(t: RawTransfer) -> ! {
	let mut record = match NonNull::new(t.data as *mut FiberRecord<S>) {
		Some(record) => record,
		None => protocol_violation("fiber started without a record"),
	};
	let creator = ContextToken::from_raw(t.context);

	// SAFETY: the record stays put until `exit_on_top` runs, which is after we have left this stack for good.
	let next = match panic::catch_unwind(AssertUnwindSafe(|| unsafe { run(record, creator) })) {
		Ok(next) => next,
		Err(payload) => match payload.downcast::<ForcedUnwind>() {
			Ok(unwind) => {
				let ForcedUnwind(requester) = *unwind;
				requester
			},
			Err(payload) => protocol_violation(&format!("fiber body panicked: {}", panic_message(&*payload))),
		},
	};

	unsafe {
		// Still here if the fiber was unwound before it ever ran.
		drop(record.as_mut().take_body());
		trace!(fiber = record.as_ref().name(), "fiber exiting");
		next.jump_with_callback(record.as_ptr() as usize, exit_on_top::<S>);
	}
	protocol_violation("terminated fiber was resumed")
}

/// Parks until dispatched, runs the body, and returns where control goes next.
unsafe fn run<S: StackAllocator>(mut record: NonNull<FiberRecord<S>>, creator: ContextToken) -> ContextToken {
	let mut t = creator.jump(Message::Resume);
	let caller = loop {
		let Transfer { from, message } = t;
		match message {
			Message::Probe(mut probe) => {
				probe.as_mut().respond(Affinity::Unbound);
				t = from.jump(Message::Resume);
			},
			Message::Resume => break Fiber::from_token(from),
			Message::Terminated => break Fiber::default(),
			Message::Unwind => return from,
		}
	};

	let record = record.as_mut();
	let body = match record.take_body() {
		Some(body) => body,
		None => protocol_violation("fiber dispatched twice"),
	};
	trace!(fiber = record.name(), "dispatching fiber body");

	match body(caller).into_token() {
		Some(next) => next,
		None => protocol_violation("fiber body returned an empty handle"),
	}
}

/// Frees the fiber that just switched away, from the stack it switched to.
extern "C" fn exit_on_top<S: StackAllocator>(t: RawTransfer) -> RawTransfer {
	// SAFETY: the finished fiber passed its own record, and nothing runs on its stack anymore.
	unsafe { FiberRecord::<S>::deallocate(NonNull::new_unchecked(t.data as *mut FiberRecord<S>)) };
	Transfer {
		from: ContextToken::from_raw(t.context),
		message: Message::Terminated,
	}
	.into_raw()
}

/// Makes the destination unwind instead of carrying on.
pub(crate) extern "C" fn unwind_on_top(t: RawTransfer) -> RawTransfer {
	Transfer {
		from: ContextToken::from_raw(t.context),
		message: Message::Unwind,
	}
	.into_raw()
}

/// Runs a user function on the destination stack. `t.data` points at an `Option<F>` on the source stack.
pub(crate) extern "C" fn user_on_top<F>(t: RawTransfer) -> RawTransfer
where
	F: FnOnce(Fiber) -> Fiber + 'static,
{
	// SAFETY: the source is suspended in the resume call that owns the slot.
	let f = match unsafe { (*(t.data as *mut Option<F>)).take() } {
		Some(f) => f,
		None => protocol_violation("on-top function ran twice"),
	};
	let source = ContextToken::from_raw(t.context);
	// SAFETY: only sent along with `Terminated`, which tells the receiver to drop it.
	let placeholder = unsafe { source.alias() };

	match panic::catch_unwind(AssertUnwindSafe(|| f(Fiber::from_token(source)))) {
		Ok(next) => match next.into_token() {
			Some(next) => Transfer {
				from: next,
				message: Message::Resume,
			},
			None => Transfer {
				from: placeholder,
				message: Message::Terminated,
			},
		},
		// The destination itself is being unwound: carry on with that once we are back on its frames.
		Err(payload) => match payload.downcast::<ForcedUnwind>() {
			Ok(unwind) => {
				let ForcedUnwind(requester) = *unwind;
				Transfer {
					from: requester,
					message: Message::Unwind,
				}
			},
			Err(payload) => protocol_violation(&format!("on-top function panicked: {}", panic_message(&*payload))),
		},
	}
	.into_raw()
}

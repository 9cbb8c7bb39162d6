//! Binding over the `fcontext` switch primitive.
//!
//! Nothing in here knows about fibers: a [`ContextToken`] is a saved machine context, and a switch carries one
//! pointer-sized word across. The word is always a [`Message`], except for the bootstrap switch into a fresh context
//! and the payload handed to an on-top callback.

use std::{mem, ptr::NonNull};

use context::{stack::Stack, Context};
use static_assertions::const_assert_eq;

use crate::probe::ProbeMessage;

pub use context::Transfer as RawTransfer;

/// First function a new context runs.
pub type EntryFn = extern "C" fn(RawTransfer) -> !;
/// Runs on the destination stack before the destination resumes. Its return value is what the destination sees.
pub type OnTopFn = extern "C" fn(RawTransfer) -> RawTransfer;

// `ContextToken::addr` reads the saved stack pointer straight out of the token.
const_assert_eq!(mem::size_of::<Context>(), mem::size_of::<usize>());

const RESUME: usize = 0;
const TERMINATED: usize = 1;
const UNWIND: usize = 2;

/// Highest data word that is a tag rather than a probe pointer.
pub const MAX_TAG: usize = UNWIND;

/// What a switch tells the context it lands in.
#[derive(Clone, Copy, Debug)]
pub enum Message {
	/// Plain transfer of control. `from` is a live, suspended context.
	Resume,
	/// The sender left no handle behind: it has terminated, or handed back an empty fiber. `from` must be discarded.
	Terminated,
	/// The receiver must unwind its stack and then hand control to `from`.
	Unwind,
	/// Fill in the answer and bounce straight back to `from`.
	Probe(NonNull<ProbeMessage>),
}

impl Message {
	fn encode(self) -> usize {
		match self {
			Message::Resume => RESUME,
			Message::Terminated => TERMINATED,
			Message::Unwind => UNWIND,
			Message::Probe(probe) => probe.as_ptr() as usize,
		}
	}

	fn decode(data: usize) -> Self {
		match data {
			RESUME => Message::Resume,
			TERMINATED => Message::Terminated,
			UNWIND => Message::Unwind,
			// SAFETY: anything above the tags was encoded from a non-null pointer.
			probe => Message::Probe(unsafe { NonNull::new_unchecked(probe as *mut ProbeMessage) }),
		}
	}
}

/// Where a switch came from, and why.
pub struct Transfer {
	pub from: ContextToken,
	pub message: Message,
}

impl From<RawTransfer> for Transfer {
	fn from(raw: RawTransfer) -> Self {
		Self {
			from: ContextToken(raw.context),
			message: Message::decode(raw.data),
		}
	}
}

impl Transfer {
	pub fn into_raw(self) -> RawTransfer { RawTransfer::new(self.from.0, self.message.encode()) }
}

/// A suspended machine context. Switching to it consumes it.
#[repr(transparent)]
pub struct ContextToken(Context);

impl ContextToken {
	pub fn from_raw(context: Context) -> Self { Self(context) }

	/// Creates a context on `stack` that starts by calling `entry`.
	///
	/// # Safety
	/// `stack` must stay valid until the context has terminated.
	pub unsafe fn create(stack: &Stack, entry: EntryFn) -> Self { Self(Context::new(stack, entry)) }

	/// # Safety
	/// The context must not have terminated, and must be able to make sense of `message`.
	pub unsafe fn jump(self, message: Message) -> Transfer { self.jump_raw(message.encode()) }

	/// Like [`Self::jump`], but sends an arbitrary word. Only the bootstrap switch uses this.
	///
	/// # Safety
	/// See [`Self::jump`].
	pub unsafe fn jump_raw(self, data: usize) -> Transfer { self.0.resume(data).into() }

	/// Switches to the context and runs `callback` on its stack before it resumes.
	///
	/// # Safety
	/// See [`Self::jump`]. `data` must be whatever `callback` expects.
	pub unsafe fn jump_with_callback(self, data: usize, callback: OnTopFn) -> Transfer {
		self.0.resume_ontop(data, callback).into()
	}

	/// The saved stack pointer. Unique among suspended contexts.
	pub fn addr(&self) -> usize {
		// SAFETY: `Context` is a single pointer, asserted above.
		unsafe { *(self as *const Self as *const usize) }
	}

	/// Duplicates the token.
	///
	/// # Safety
	/// At most one of the copies may ever be switched to.
	pub unsafe fn alias(&self) -> Self { std::ptr::read(self) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn probe_pointer_is_not_a_tag() {
		let mut probe = ProbeMessage::new(crate::probe::Query::Affinity);
		let ptr = NonNull::from(&mut probe);
		match Message::decode(Message::Probe(ptr).encode()) {
			Message::Probe(decoded) => assert_eq!(decoded, ptr),
			other => panic!("decoded {other:?}"),
		}
	}
}

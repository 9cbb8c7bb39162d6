//! Out-of-band queries into a suspended context.
//!
//! The prober switches in with a pointer to a [`ProbeMessage`]. Whatever code the context is parked in fills in the
//! answer and switches straight back, without running anything else.

use std::mem;

use static_assertions::const_assert;

use crate::{host::Affinity, raw::MAX_TAG, stack::StackKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Query {
	StackKind,
	Affinity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Answer {
	StackKind(StackKind),
	Affinity(Affinity),
}

#[repr(C, align(8))]
pub(crate) struct ProbeMessage {
	query: Query,
	answer: Option<Answer>,
}

// A probe pointer must never be mistaken for a message tag.
const_assert!(mem::align_of::<ProbeMessage>() > MAX_TAG);

impl ProbeMessage {
	pub fn new(query: Query) -> Self { Self { query, answer: None } }

	/// Answers from the context being probed. `affinity` is the binding of the code that is answering.
	pub fn respond(&mut self, affinity: Affinity) {
		self.answer = Some(match self.query {
			Query::StackKind => Answer::StackKind(StackKind::current()),
			Query::Affinity => Answer::Affinity(affinity),
		});
	}

	pub fn answer(&self) -> Option<Answer> { self.answer }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::host::HostId;

	#[test]
	fn unanswered_until_responded() {
		let mut probe = ProbeMessage::new(Query::Affinity);
		assert_eq!(probe.answer(), None);

		let host = HostId::fresh();
		probe.respond(Affinity::Bound(host));
		assert_eq!(probe.answer(), Some(Answer::Affinity(Affinity::Bound(host))));
	}

	#[test]
	fn stack_kind_is_measured_by_responder() {
		let mut probe = ProbeMessage::new(Query::StackKind);
		probe.respond(Affinity::Unbound);
		assert_eq!(probe.answer(), Some(Answer::StackKind(StackKind::Native)));
	}
}

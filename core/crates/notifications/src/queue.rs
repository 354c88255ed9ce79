use pimd_protocol::{ChangeNotification, Operation};

use std::collections::{vec_deque, VecDeque};

use tracing::trace;

/// What [`NotificationQueue::append_and_compress`] did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	Appended,
	/// Folded into an earlier modify of the same subject.
	Merged,
	/// An earlier queued add already covers it.
	Absorbed,
	/// A removal met the still queued add of its subject, neither survives.
	Cancelled,
}

/// Ordered changes waiting to be dispatched.
///
/// Only the latest queued change of a subject is ever considered for compression, and only when
/// both came from the same session, so that whatever survives still tells a consistent story.
#[derive(Debug, Default, Clone)]
pub struct NotificationQueue {
	changes: VecDeque<ChangeNotification>,
}

impl NotificationQueue {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn append_and_compress(&mut self, change: ChangeNotification) -> Compression {
		let Some(idx) = self.changes.iter().rposition(|queued| queued.same_subject(&change)) else {
			self.changes.push_back(change);
			return Compression::Appended;
		};

		if self.changes[idx].session != change.session {
			self.changes.push_back(change);
			return Compression::Appended;
		}

		match (self.changes[idx].operation, change.operation) {
			(Operation::Modify, Operation::Modify) => {
				let queued = &mut self.changes[idx];
				queued.parts.extend(change.parts);
				queued.remote_id = change.remote_id;
				queued.remote_revision = change.remote_revision;
				trace!(subject = ?queued.subject, "Merged modify notifications;");
				Compression::Merged
			}

			(Operation::Add, Operation::Modify) => Compression::Absorbed,

			(Operation::Add, Operation::Remove) => {
				self.changes.remove(idx);
				trace!(subject = ?change.subject, "Add and remove cancelled out;");
				Compression::Cancelled
			}

			(Operation::Modify, Operation::Remove) => {
				// the modify is moot, whatever preceded it still needs a say
				self.changes.remove(idx);
				self.append_and_compress(change)
			}

			_ => {
				self.changes.push_back(change);
				Compression::Appended
			}
		}
	}

	/// Plain append, for changes that must reach subscribers exactly as they happened.
	pub fn push(&mut self, change: ChangeNotification) {
		self.changes.push_back(change);
	}

	pub fn pop_front(&mut self) -> Option<ChangeNotification> {
		self.changes.pop_front()
	}

	pub fn retain(&mut self, f: impl FnMut(&ChangeNotification) -> bool) {
		self.changes.retain(f);
	}

	pub fn take(&mut self) -> Vec<ChangeNotification> {
		self.changes.drain(..).collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.changes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	pub fn iter(&self) -> vec_deque::Iter<'_, ChangeNotification> {
		self.changes.iter()
	}
}

use crate::{CollectionId, ItemId, SessionId};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum EntityKind {
	Item,
	Collection,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum Operation {
	Add,
	Modify,
	Move,
	Remove,
	Link,
	Unlink,
	Subscribe,
	Unsubscribe,
}

/// The subject of a change, its kind and id travel together so they can't disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
	Item(ItemId),
	Collection(CollectionId),
}

impl EntityRef {
	#[must_use]
	pub const fn kind(&self) -> EntityKind {
		match self {
			Self::Item(_) => EntityKind::Item,
			Self::Collection(_) => EntityKind::Collection,
		}
	}

	#[must_use]
	pub const fn as_item(&self) -> Option<ItemId> {
		match self {
			Self::Item(id) => Some(*id),
			Self::Collection(_) => None,
		}
	}

	#[must_use]
	pub const fn as_collection(&self) -> Option<CollectionId> {
		match self {
			Self::Collection(id) => Some(*id),
			Self::Item(_) => None,
		}
	}
}

/// One state change, as produced by a storage mutation.
///
/// `parent` is the collection the subject lived in when the change happened, `destination` is
/// only set for moves. Removals carry the last known remote revision so consumers can still
/// reconcile against the backend after the row is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
	pub subject: EntityRef,
	pub operation: Operation,
	pub parent: Option<CollectionId>,
	pub destination: Option<CollectionId>,
	pub session: Option<SessionId>,
	pub resource: String,
	pub destination_resource: String,
	pub mime_type: String,
	pub remote_id: String,
	pub remote_revision: String,
	pub parts: BTreeSet<String>,
}

impl ChangeNotification {
	fn new(subject: EntityRef, operation: Operation, parent: Option<CollectionId>) -> Self {
		Self {
			subject,
			operation,
			parent,
			destination: None,
			session: None,
			resource: String::new(),
			destination_resource: String::new(),
			mime_type: String::new(),
			remote_id: String::new(),
			remote_revision: String::new(),
			parts: BTreeSet::new(),
		}
	}

	#[must_use]
	pub fn item(operation: Operation, id: ItemId, parent: CollectionId) -> Self {
		Self::new(EntityRef::Item(id), operation, Some(parent))
	}

	#[must_use]
	pub fn collection(operation: Operation, id: CollectionId, parent: CollectionId) -> Self {
		Self::new(EntityRef::Collection(id), operation, Some(parent))
	}

	#[must_use]
	pub fn with_destination(mut self, destination: CollectionId, resource: impl Into<String>) -> Self {
		self.destination = Some(destination);
		self.destination_resource = resource.into();
		self
	}

	#[must_use]
	pub const fn with_session(mut self, session: SessionId) -> Self {
		self.session = Some(session);
		self
	}

	#[must_use]
	pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
		self.resource = resource.into();
		self
	}

	#[must_use]
	pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
		self.mime_type = mime_type.into();
		self
	}

	#[must_use]
	pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
		self.remote_id = remote_id.into();
		self
	}

	#[must_use]
	pub fn with_remote_revision(mut self, remote_revision: impl Into<String>) -> Self {
		self.remote_revision = remote_revision.into();
		self
	}

	#[must_use]
	pub fn with_parts<I, S>(mut self, parts: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.parts.extend(parts.into_iter().map(Into::into));
		self
	}

	#[must_use]
	pub const fn kind(&self) -> EntityKind {
		self.subject.kind()
	}

	/// Moves must know both ends, everything else needs at least a subject.
	#[must_use]
	pub const fn is_valid(&self) -> bool {
		match self.operation {
			Operation::Move => self.parent.is_some() && self.destination.is_some(),
			_ => true,
		}
	}

	/// Whether `other` talks about the same entity as `self`.
	#[must_use]
	pub fn same_subject(&self, other: &Self) -> bool {
		self.subject == other.subject
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn move_requires_both_parents() {
		let moved = ChangeNotification::item(Operation::Move, ItemId(1), CollectionId(2));
		assert!(!moved.is_valid());

		let moved = moved.with_destination(CollectionId(3), "pimd_maildir_resource_1");
		assert!(moved.is_valid());
		assert_eq!(moved.destination_resource, "pimd_maildir_resource_1");
	}

	#[test]
	fn subject_kind_follows_the_reference() {
		let change = ChangeNotification::collection(Operation::Add, CollectionId(4), CollectionId::ROOT);
		assert_eq!(change.kind(), EntityKind::Collection);
		assert_eq!(change.subject.as_collection(), Some(CollectionId(4)));
		assert_eq!(change.subject.as_item(), None);
	}
}

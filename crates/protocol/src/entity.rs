use crate::{CollectionId, ItemId};

use serde::{Deserialize, Serialize};

/// An addressable unit of content: a message, a contact, an event...
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
	/// Local id, `None` until the item was stored.
	pub id: Option<ItemId>,
	pub remote_id: String,
	pub gid: String,
	pub mime_type: String,
	/// Local revision, bumped by storage on every write.
	pub revision: u64,
	pub remote_revision: String,
	pub flags: Vec<String>,
	pub payload: Vec<u8>,
	pub parent: Option<CollectionId>,
}

impl Item {
	#[must_use]
	pub fn with_remote_id(remote_id: impl Into<String>) -> Self {
		Self {
			remote_id: remote_id.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_id(id: ItemId) -> Self {
		Self {
			id: Some(id),
			..Default::default()
		}
	}

	#[must_use]
	pub fn gid(mut self, gid: impl Into<String>) -> Self {
		self.gid = gid.into();
		self
	}

	#[must_use]
	pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
		self.mime_type = mime_type.into();
		self
	}

	#[must_use]
	pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
		self.payload = payload.into();
		self
	}

	#[must_use]
	pub fn flag(mut self, flag: impl Into<String>) -> Self {
		self.flags.push(flag.into());
		self
	}

	#[must_use]
	pub fn remote_revision(mut self, remote_revision: impl Into<String>) -> Self {
		self.remote_revision = remote_revision.into();
		self
	}

	#[must_use]
	pub const fn parent(mut self, parent: CollectionId) -> Self {
		self.parent = Some(parent);
		self
	}

	/// Compares everything a resource can change about an item.
	///
	/// Local bookkeeping (`id`, `revision`, `parent`) is ignored, flags are compared as sets.
	#[must_use]
	pub fn fingerprint_matches(&self, other: &Self) -> bool {
		let mut own_flags = self.flags.iter().collect::<Vec<_>>();
		let mut other_flags = other.flags.iter().collect::<Vec<_>>();
		own_flags.sort_unstable();
		own_flags.dedup();
		other_flags.sort_unstable();
		other_flags.dedup();

		self.remote_id == other.remote_id
			&& self.gid == other.gid
			&& self.mime_type == other.mime_type
			&& self.remote_revision == other.remote_revision
			&& self.payload == other.payload
			&& own_flags == other_flags
	}
}

/// A folder like container of items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
	pub id: Option<CollectionId>,
	pub remote_id: String,
	pub remote_revision: String,
	pub name: String,
	pub parent: Option<CollectionId>,
	pub resource: String,
	pub content_mime_types: Vec<String>,
	/// Minutes between automatic syncs, zero disables interval checking.
	pub check_interval_minutes: u32,
	pub subscribed: bool,
	pub enabled: bool,
	pub referenced: bool,
}

impl Collection {
	#[must_use]
	pub fn new(id: CollectionId, name: impl Into<String>, parent: CollectionId) -> Self {
		Self {
			id: Some(id),
			name: name.into(),
			parent: Some(parent),
			subscribed: true,
			enabled: true,
			..Default::default()
		}
	}

	/// Placeholder for an entity we only know the id of.
	#[must_use]
	pub fn with_id(id: CollectionId) -> Self {
		Self {
			id: Some(id),
			..Default::default()
		}
	}

	#[must_use]
	pub fn resource(mut self, resource: impl Into<String>) -> Self {
		self.resource = resource.into();
		self
	}

	#[must_use]
	pub fn remote_id(mut self, remote_id: impl Into<String>) -> Self {
		self.remote_id = remote_id.into();
		self
	}

	#[must_use]
	pub const fn check_interval(mut self, minutes: u32) -> Self {
		self.check_interval_minutes = minutes;
		self
	}

	#[must_use]
	pub const fn subscribed(mut self, subscribed: bool) -> Self {
		self.subscribed = subscribed;
		self
	}

	#[must_use]
	pub fn content_mime_type(mut self, mime_type: impl Into<String>) -> Self {
		self.content_mime_types.push(mime_type.into());
		self
	}
}

use crate::{ChangeNotification, Collection, Item, Operation};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A change rendered with everything the consumer needs to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
	ItemAdded {
		item: Item,
		collection: Collection,
	},
	ItemChanged {
		item: Item,
		parts: BTreeSet<String>,
	},
	ItemMoved {
		item: Item,
		source: Collection,
		destination: Collection,
	},
	ItemRemoved {
		item: Item,
	},
	ItemLinked {
		item: Item,
		collection: Collection,
	},
	ItemUnlinked {
		item: Item,
		collection: Collection,
	},
	CollectionAdded {
		collection: Collection,
		parent: Collection,
	},
	CollectionChanged {
		collection: Collection,
		parts: BTreeSet<String>,
	},
	CollectionMoved {
		collection: Collection,
		source: Collection,
		destination: Collection,
	},
	CollectionRemoved {
		collection: Collection,
	},
	CollectionSubscribed {
		collection: Collection,
		parent: Collection,
	},
	CollectionUnsubscribed {
		collection: Collection,
	},
}

impl Notification {
	#[must_use]
	pub const fn operation(&self) -> Operation {
		match self {
			Self::ItemAdded { .. } | Self::CollectionAdded { .. } => Operation::Add,
			Self::ItemChanged { .. } | Self::CollectionChanged { .. } => Operation::Modify,
			Self::ItemMoved { .. } | Self::CollectionMoved { .. } => Operation::Move,
			Self::ItemRemoved { .. } | Self::CollectionRemoved { .. } => Operation::Remove,
			Self::ItemLinked { .. } => Operation::Link,
			Self::ItemUnlinked { .. } => Operation::Unlink,
			Self::CollectionSubscribed { .. } => Operation::Subscribe,
			Self::CollectionUnsubscribed { .. } => Operation::Unsubscribe,
		}
	}

	#[must_use]
	pub const fn item(&self) -> Option<&Item> {
		match self {
			Self::ItemAdded { item, .. }
			| Self::ItemChanged { item, .. }
			| Self::ItemMoved { item, .. }
			| Self::ItemRemoved { item }
			| Self::ItemLinked { item, .. }
			| Self::ItemUnlinked { item, .. } => Some(item),
			_ => None,
		}
	}

	#[must_use]
	pub const fn collection(&self) -> Option<&Collection> {
		match self {
			Self::CollectionAdded { collection, .. }
			| Self::CollectionChanged { collection, .. }
			| Self::CollectionMoved { collection, .. }
			| Self::CollectionRemoved { collection }
			| Self::CollectionSubscribed { collection, .. }
			| Self::CollectionUnsubscribed { collection } => Some(collection),
			_ => None,
		}
	}
}

/// Sent to every subscriber while notification debugging is on: which listeners accepted a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugChangeNotification {
	pub notification: ChangeNotification,
	pub listeners: Vec<String>,
	pub timestamp: DateTime<Utc>,
}

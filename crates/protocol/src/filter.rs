use crate::{ChangeNotification, CollectionId, EntityKind, ItemId, Operation, SessionId};

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// The operation categories a consumer declared it wants to be told about.
///
/// Declared once at subscribe time, the reference tracker consults it to discard events that
/// nobody would act upon before spending any fetch on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
	items: BTreeSet<Operation>,
	collections: BTreeSet<Operation>,
}

impl Interest {
	#[must_use]
	pub fn all() -> Self {
		Self {
			items: item_operations().collect(),
			collections: collection_operations().collect(),
		}
	}

	#[must_use]
	pub fn none() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_items(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
		self.items
			.extend(operations.into_iter().filter(|op| item_operations().any(|o| o == *op)));
		self
	}

	#[must_use]
	pub fn with_collections(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
		self.collections.extend(
			operations
				.into_iter()
				.filter(|op| collection_operations().any(|o| o == *op)),
		);
		self
	}

	#[must_use]
	pub fn wants(&self, kind: EntityKind, operation: Operation) -> bool {
		match kind {
			EntityKind::Item => self.items.contains(&operation),
			EntityKind::Collection => self.collections.contains(&operation),
		}
	}
}

fn item_operations() -> impl Iterator<Item = Operation> {
	Operation::iter().filter(|op| !matches!(op, Operation::Subscribe | Operation::Unsubscribe))
}

fn collection_operations() -> impl Iterator<Item = Operation> {
	Operation::iter().filter(|op| !matches!(op, Operation::Link | Operation::Unlink))
}

/// What a subscriber monitors. Shared by the server side fan-out and the consuming monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
	pub all_monitored: bool,
	pub collections: HashSet<CollectionId>,
	pub items: HashSet<ItemId>,
	pub resources: HashSet<String>,
	pub mime_types: HashSet<String>,
	pub ignored_sessions: HashSet<SessionId>,
}

impl SubscriptionFilter {
	#[must_use]
	pub fn all() -> Self {
		Self {
			all_monitored: true,
			..Default::default()
		}
	}

	#[must_use]
	pub fn is_session_ignored(&self, session: Option<&SessionId>) -> bool {
		session.is_some_and(|session| self.ignored_sessions.contains(session))
	}

	/// Monitoring the root collection means monitoring every collection.
	#[must_use]
	pub fn is_collection_monitored(&self, id: Option<CollectionId>) -> bool {
		id.is_some_and(|id| {
			self.collections.contains(&id) || self.collections.contains(&CollectionId::ROOT)
		})
	}

	/// Exact match or a `type/*` wildcard.
	#[must_use]
	pub fn is_mime_type_monitored(&self, mime_type: &str) -> bool {
		if mime_type.is_empty() {
			return false;
		}

		self.mime_types.iter().any(|monitored| {
			monitored == mime_type
				|| monitored.strip_suffix("/*").is_some_and(|family| {
					mime_type
						.split_once('/')
						.is_some_and(|(candidate, _)| candidate == family)
				})
		})
	}

	fn is_move_destination_resource_monitored(&self, change: &ChangeNotification) -> bool {
		change.operation == Operation::Move && self.resources.contains(&change.destination_resource)
	}

	/// Filter half of notification acceptance, lazy ignoring is the tracker's business.
	#[must_use]
	pub fn accepts(&self, change: &ChangeNotification) -> bool {
		if self.is_session_ignored(change.session.as_ref()) {
			return false;
		}

		if self.all_monitored {
			return true;
		}

		match change.kind() {
			EntityKind::Item => {
				if !self.resources.is_empty() || !self.mime_types.is_empty() {
					return self.is_mime_type_monitored(&change.mime_type)
						|| self.resources.contains(&change.resource)
						|| self.is_move_destination_resource_monitored(change);
				}

				change
					.subject
					.as_item()
					.is_some_and(|id| self.items.contains(&id))
					|| self.is_collection_monitored(change.parent)
					|| self.is_collection_monitored(change.destination)
			}

			EntityKind::Collection => {
				if !self.resources.is_empty() {
					let resource_matches = self.resources.contains(&change.resource)
						|| self.is_move_destination_resource_monitored(change);

					// with only a resource filter its verdict is final
					if self.mime_types.is_empty() || resource_matches {
						return resource_matches;
					}
				}

				self.is_collection_monitored(change.subject.as_collection())
					|| self.is_collection_monitored(change.parent)
					|| self.is_collection_monitored(change.destination)
			}
		}
	}
}

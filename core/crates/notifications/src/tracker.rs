use pimd_protocol::{ChangeNotification, CollectionId, EntityKind, Interest, Operation};

use std::collections::{hash_map::Entry, HashMap, VecDeque};

use tracing::{trace, warn};

/// Fixed size ring of recently dereferenced collections.
///
/// Holding an id here keeps its events flowing for a short while after the last consumer let
/// go, so a quick deref/ref pair doesn't lose anything.
#[derive(Debug, Clone)]
pub struct PurgeBuffer {
	capacity: usize,
	ids: VecDeque<CollectionId>,
}

impl PurgeBuffer {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			ids: VecDeque::with_capacity(capacity),
		}
	}

	#[must_use]
	pub fn is_buffered(&self, id: CollectionId) -> bool {
		self.ids.contains(&id)
	}

	pub fn purge(&mut self, id: CollectionId) {
		self.ids.retain(|buffered| *buffered != id);
	}

	/// Buffers `id`, returning the oldest entry if it had to make room for it.
	pub fn buffer(&mut self, id: CollectionId) -> Option<CollectionId> {
		if self.capacity == 0 {
			return Some(id);
		}

		self.purge(id);

		let bumped = if self.ids.len() >= self.capacity {
			self.ids.pop_front()
		} else {
			None
		};

		self.ids.push_back(id);

		bumped
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.ids.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.ids.is_empty()
	}
}

/// Decides which changes a consumer can't possibly care about.
///
/// Two things make a change uninteresting: the consumer never declared interest in its
/// operation, or (with reference counting on) it's about items of a collection that no one
/// currently references nor recently referenced.
#[derive(Debug, Clone)]
pub struct ReferenceTracker {
	interest: Interest,
	ref_counting: bool,
	counts: HashMap<CollectionId, usize>,
	buffer: PurgeBuffer,
}

impl ReferenceTracker {
	#[must_use]
	pub fn new(interest: Interest, ref_counting: bool, buffer_capacity: usize) -> Self {
		Self {
			interest,
			ref_counting,
			counts: HashMap::new(),
			buffer: PurgeBuffer::new(buffer_capacity),
		}
	}

	#[must_use]
	pub const fn interest(&self) -> &Interest {
		&self.interest
	}

	pub fn set_interest(&mut self, interest: Interest) {
		self.interest = interest;
	}

	#[must_use]
	pub const fn is_ref_counting(&self) -> bool {
		self.ref_counting
	}

	pub fn ref_collection(&mut self, id: CollectionId) {
		*self.counts.entry(id).or_default() += 1;
		self.buffer.purge(id);
	}

	/// Returns the collection bumped out of the grace buffer, if any, so the caller can drop
	/// whatever it still holds for it.
	pub fn deref_collection(&mut self, id: CollectionId) -> Option<CollectionId> {
		let Entry::Occupied(mut entry) = self.counts.entry(id) else {
			warn!(%id, "Dereferenced a collection that wasn't referenced");
			return None;
		};

		*entry.get_mut() -= 1;
		if *entry.get() > 0 {
			return None;
		}

		entry.remove();
		let bumped = self.buffer.buffer(id);
		trace!(%id, ?bumped, "Collection moved to the grace buffer;");
		bumped
	}

	#[must_use]
	pub fn reference_count(&self, id: CollectionId) -> usize {
		self.counts.get(&id).copied().unwrap_or_default()
	}

	#[must_use]
	pub fn is_watched(&self, id: Option<CollectionId>) -> bool {
		id.is_some_and(|id| self.counts.contains_key(&id) || self.buffer.is_buffered(id))
	}

	#[must_use]
	pub fn is_lazily_ignored(&self, change: &ChangeNotification) -> bool {
		if !self.interest.wants(change.kind(), change.operation) {
			return true;
		}

		if !self.ref_counting || change.kind() == EntityKind::Collection {
			return false;
		}

		match change.operation {
			Operation::Add
			| Operation::Remove
			| Operation::Modify
			| Operation::Link
			| Operation::Unlink => !self.is_watched(change.parent),
			// a half watched move still has to become a removal or an insertion
			Operation::Move => !self.is_watched(change.parent) && !self.is_watched(change.destination),
			Operation::Subscribe | Operation::Unsubscribe => true,
		}
	}

	/// Turns an item move into what the consumer can make sense of given which ends it watches.
	///
	/// `None` means neither end is watched and the move is dropped.
	#[must_use]
	pub fn rewrite_move(&self, change: ChangeNotification) -> Option<ChangeNotification> {
		if !self.ref_counting
			|| change.operation != Operation::Move
			|| change.kind() != EntityKind::Item
		{
			return Some(change);
		}

		match (self.is_watched(change.parent), self.is_watched(change.destination)) {
			(true, true) => Some(change),
			(true, false) => Some(ChangeNotification {
				operation: Operation::Remove,
				destination: None,
				destination_resource: String::new(),
				..change
			}),
			(false, true) => Some(ChangeNotification {
				operation: Operation::Add,
				parent: change.destination,
				destination: None,
				resource: if change.destination_resource.is_empty() {
					change.resource
				} else {
					change.destination_resource
				},
				destination_resource: String::new(),
				..change
			}),
			(false, false) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pimd_protocol::ItemId;

	fn tracker() -> ReferenceTracker {
		ReferenceTracker::new(Interest::all(), true, 3)
	}

	#[test]
	fn purge_buffer_bumps_oldest_and_never_duplicates() {
		let mut buffer = PurgeBuffer::new(3);

		assert_eq!(buffer.buffer(CollectionId(1)), None);
		assert_eq!(buffer.buffer(CollectionId(2)), None);
		assert_eq!(buffer.buffer(CollectionId(1)), None);
		assert_eq!(buffer.len(), 2);
		assert_eq!(buffer.buffer(CollectionId(3)), None);
		assert_eq!(buffer.buffer(CollectionId(4)), Some(CollectionId(2)));
		assert_eq!(buffer.len(), 3);
		assert!(!buffer.is_buffered(CollectionId(2)));
	}

	#[test]
	fn referenced_collections_are_never_lazily_ignored() {
		let mut tracker = tracker();
		let change = ChangeNotification::item(Operation::Add, ItemId(1), CollectionId(5));

		assert!(tracker.is_lazily_ignored(&change));

		tracker.ref_collection(CollectionId(5));
		tracker.ref_collection(CollectionId(5));
		assert!(!tracker.is_lazily_ignored(&change));

		assert_eq!(tracker.deref_collection(CollectionId(5)), None);
		assert_eq!(tracker.reference_count(CollectionId(5)), 1);
		assert!(!tracker.is_lazily_ignored(&change));
	}

	#[test]
	fn grace_buffer_keeps_events_flowing_until_bumped() {
		let mut tracker = tracker();
		let change = ChangeNotification::item(Operation::Modify, ItemId(1), CollectionId(1));

		for id in 1..=4 {
			tracker.ref_collection(CollectionId(id));
		}

		assert_eq!(tracker.deref_collection(CollectionId(1)), None);
		assert!(!tracker.is_lazily_ignored(&change));

		assert_eq!(tracker.deref_collection(CollectionId(2)), None);
		assert_eq!(tracker.deref_collection(CollectionId(3)), None);
		assert_eq!(tracker.deref_collection(CollectionId(4)), Some(CollectionId(1)));
		assert!(tracker.is_lazily_ignored(&change));
	}

	#[test]
	fn re_referencing_cancels_the_grace_period() {
		let mut tracker = tracker();

		tracker.ref_collection(CollectionId(1));
		tracker.deref_collection(CollectionId(1));
		tracker.ref_collection(CollectionId(1));

		for id in 2..=5 {
			let expected = (id == 5).then_some(CollectionId(2));
			tracker.ref_collection(CollectionId(id));
			assert_eq!(tracker.deref_collection(CollectionId(id)), expected);
		}

		assert!(tracker.is_watched(Some(CollectionId(1))));
	}

	#[test]
	fn undeclared_interest_ignores_everything_of_that_kind() {
		let mut tracker = ReferenceTracker::new(
			Interest::none().with_items([Operation::Add]),
			false,
			10,
		);

		let added = ChangeNotification::item(Operation::Add, ItemId(1), CollectionId(1));
		let removed = ChangeNotification::item(Operation::Remove, ItemId(1), CollectionId(1));
		let collection =
			ChangeNotification::collection(Operation::Add, CollectionId(2), CollectionId::ROOT);

		assert!(!tracker.is_lazily_ignored(&added));
		assert!(tracker.is_lazily_ignored(&removed));
		assert!(tracker.is_lazily_ignored(&collection));

		tracker.set_interest(Interest::all());
		assert!(!tracker.is_lazily_ignored(&collection));
	}

	#[test]
	fn moves_rewrite_according_to_watched_ends() {
		let mut tracker = tracker();
		tracker.ref_collection(CollectionId(1));

		let out = ChangeNotification::item(Operation::Move, ItemId(9), CollectionId(1))
			.with_destination(CollectionId(2), "other");
		let rewritten = tracker.rewrite_move(out).expect("source watched");
		assert_eq!(rewritten.operation, Operation::Remove);
		assert_eq!(rewritten.parent, Some(CollectionId(1)));
		assert_eq!(rewritten.destination, None);

		let inward = ChangeNotification::item(Operation::Move, ItemId(9), CollectionId(3))
			.with_resource("source")
			.with_destination(CollectionId(1), "other");
		let rewritten = tracker.rewrite_move(inward).expect("destination watched");
		assert_eq!(rewritten.operation, Operation::Add);
		assert_eq!(rewritten.parent, Some(CollectionId(1)));
		assert_eq!(rewritten.resource, "other");

		let unrelated = ChangeNotification::item(Operation::Move, ItemId(9), CollectionId(3))
			.with_destination(CollectionId(4), "");
		assert_eq!(tracker.rewrite_move(unrelated), None);

		tracker.ref_collection(CollectionId(2));
		let within = ChangeNotification::item(Operation::Move, ItemId(9), CollectionId(1))
			.with_destination(CollectionId(2), "");
		assert_eq!(
			tracker.rewrite_move(within).map(|change| change.operation),
			Some(Operation::Move)
		);
	}
}

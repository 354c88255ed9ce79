use std::{collections::VecDeque, fmt::Debug, hash::Hash};

use tracing::trace;

#[derive(Debug)]
enum Slot<V> {
	Pending,
	/// `None` once the entity vanished or was invalidated.
	Ready(Option<V>),
}

#[derive(Debug)]
struct Entry<K, V> {
	id: K,
	slot: Slot<V>,
}

/// Bounded lookahead cache of resolved entities.
///
/// Doesn't fetch anything itself: misses are recorded as requests the owner collects with
/// [`EntityCache::take_requests`] and answers through [`EntityCache::fetch_completed`].
/// Entries still waiting for their fetch are never evicted, ready ones are evicted least
/// recently used first once the cache grows past its capacity.
#[derive(Debug)]
pub struct EntityCache<K, V> {
	capacity: usize,
	entries: VecDeque<Entry<K, V>>,
	requests: Vec<K>,
}

impl<K, V> EntityCache<K, V>
where
	K: Copy + Eq + Hash + Debug,
{
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: VecDeque::with_capacity(capacity),
			requests: Vec::new(),
		}
	}

	#[must_use]
	pub const fn capacity(&self) -> usize {
		self.capacity
	}

	fn position(&self, id: K) -> Option<usize> {
		self.entries.iter().position(|entry| entry.id == id)
	}

	#[must_use]
	pub fn is_cached(&self, id: K) -> bool {
		self.position(id)
			.is_some_and(|idx| matches!(self.entries[idx].slot, Slot::Ready(_)))
	}

	#[must_use]
	pub fn is_pending(&self, id: K) -> bool {
		self.position(id)
			.is_some_and(|idx| matches!(self.entries[idx].slot, Slot::Pending))
	}

	/// Moves the entry at `idx` to the most recently used end, returning its new index.
	fn touch(&mut self, idx: usize) -> usize {
		if let Some(entry) = self.entries.remove(idx) {
			self.entries.push_back(entry);
		}
		self.entries.len() - 1
	}

	/// Whether `id` is resolved, requesting it otherwise.
	pub fn ensure_cached(&mut self, id: K) -> bool {
		if let Some(idx) = self.position(id) {
			let idx = self.touch(idx);
			return matches!(self.entries[idx].slot, Slot::Ready(_));
		}

		trace!(?id, "Cache miss, requesting fetch;");

		self.entries.push_back(Entry {
			id,
			slot: Slot::Pending,
		});
		self.requests.push(id);
		self.evict();

		false
	}

	fn evict(&mut self) {
		while self.entries.len() > self.capacity {
			let Some(idx) = self
				.entries
				.iter()
				.position(|entry| matches!(entry.slot, Slot::Ready(_)))
			else {
				// everything is in flight, we'll shrink once fetches land
				break;
			};

			self.entries.remove(idx);
		}
	}

	/// Stores the result of a fetch, `None` meaning the entity is gone.
	///
	/// Returns whether the result was for an entry still waiting on it.
	pub fn fetch_completed(&mut self, id: K, value: Option<V>) -> bool {
		let Some(idx) = self.position(id) else {
			return false;
		};

		let was_pending = matches!(self.entries[idx].slot, Slot::Pending);
		self.entries[idx].slot = Slot::Ready(value);
		self.evict();

		was_pending
	}

	/// The resolved entity, `None` when unknown, not yet fetched or vanished.
	pub fn retrieve(&mut self, id: K) -> Option<&V> {
		let idx = self.position(id)?;
		let idx = self.touch(idx);

		match &self.entries[idx].slot {
			Slot::Ready(value) => value.as_ref(),
			Slot::Pending => None,
		}
	}

	/// Marks the entity as gone without dropping the entry.
	pub fn invalidate(&mut self, id: K) {
		if let Some(idx) = self.position(id) {
			if matches!(self.entries[idx].slot, Slot::Ready(_)) {
				self.entries[idx].slot = Slot::Ready(None);
			}
		}
	}

	/// Forgets what we know about the entity so the next lookup refetches it.
	///
	/// An entry with a fetch already in flight is fetched once more, the in flight result may
	/// predate the change.
	pub fn update(&mut self, id: K) {
		if let Some(idx) = self.position(id) {
			match self.entries[idx].slot {
				Slot::Pending => self.requests.push(id),
				Slot::Ready(_) => {
					self.entries.remove(idx);
				}
			}
		}
	}

	pub fn take_requests(&mut self) -> Vec<K> {
		std::mem::take(&mut self.requests)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

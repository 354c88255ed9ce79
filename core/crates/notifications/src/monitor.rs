use pimd_protocol::{
	ChangeNotification, Collection, CollectionId, EntityRef, Interest, Item, ItemId, Notification,
	Operation, SessionId, SubscriptionFilter,
};

use std::{
	collections::{HashSet, VecDeque},
	hash::Hash,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::{EntityCache, NotificationQueue, ReferenceTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
	/// Changes allowed to wait on entity fetches at the same time.
	pub pipeline_size: usize,
	pub collection_cache_size: usize,
	pub item_cache_size: usize,
	pub purge_buffer_size: usize,
	/// Resolve the involved collections before emitting.
	pub fetch_collections: bool,
	/// Resolve the changed items before emitting.
	pub fetch_items: bool,
	/// Drop item changes of collections nobody references.
	pub ref_counting: bool,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			pipeline_size: 5,
			collection_cache_size: 15,
			item_cache_size: 5,
			purge_buffer_size: 10,
			fetch_collections: true,
			fetch_items: true,
			ref_counting: false,
		}
	}
}

impl MonitorConfig {
	/// Caches smaller than what one full pipeline may need to resolve would thrash, a moved
	/// collection involves three of them.
	#[must_use]
	pub fn normalized(self) -> Self {
		let pipeline_size = self.pipeline_size.max(1);
		Self {
			pipeline_size,
			collection_cache_size: self.collection_cache_size.max(3 * pipeline_size),
			item_cache_size: self.item_cache_size.max(pipeline_size),
			..self
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterUpdate {
	Collection(CollectionId, bool),
	Item(ItemId, bool),
	Resource(String, bool),
	MimeType(String, bool),
	IgnoredSession(SessionId, bool),
	All(bool),
}

/// Entity fetches the monitor is waiting on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchRequests {
	pub collections: Vec<CollectionId>,
	pub items: Vec<ItemId>,
}

impl FetchRequests {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.collections.is_empty() && self.items.is_empty()
	}
}

/// Consumer side dispatcher.
///
/// Accepted changes wait in a compressing queue, then go through a bounded pipeline while
/// the entities they involve are fetched. Emission is strictly FIFO: a change whose data is
/// ready still waits for every change ahead of it.
///
/// The monitor does no I/O. Whoever drives it forwards fetch requests from
/// [`Monitor::take_fetch_requests`] and feeds results back through
/// [`Monitor::collection_fetched`] and [`Monitor::item_fetched`], then drains
/// [`Monitor::take_notifications`].
#[derive(Debug)]
pub struct Monitor {
	config: MonitorConfig,
	filter: SubscriptionFilter,
	tracker: ReferenceTracker,
	pending: NotificationQueue,
	pipeline: VecDeque<ChangeNotification>,
	collections: EntityCache<CollectionId, Collection>,
	items: EntityCache<ItemId, Item>,
	emitted: VecDeque<Notification>,
}

impl Monitor {
	#[must_use]
	pub fn new(config: MonitorConfig, filter: SubscriptionFilter, interest: Interest) -> Self {
		let config = config.normalized();

		Self {
			tracker: ReferenceTracker::new(interest, config.ref_counting, config.purge_buffer_size),
			pending: NotificationQueue::new(),
			pipeline: VecDeque::with_capacity(config.pipeline_size),
			collections: EntityCache::new(config.collection_cache_size),
			items: EntityCache::new(config.item_cache_size),
			emitted: VecDeque::new(),
			filter,
			config,
		}
	}

	#[must_use]
	pub const fn config(&self) -> &MonitorConfig {
		&self.config
	}

	#[must_use]
	pub const fn filter(&self) -> &SubscriptionFilter {
		&self.filter
	}

	#[must_use]
	pub const fn tracker(&self) -> &ReferenceTracker {
		&self.tracker
	}

	#[must_use]
	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	#[must_use]
	pub fn pipeline_len(&self) -> usize {
		self.pipeline.len()
	}

	/// Entry point for changes delivered by the notification source.
	#[instrument(skip_all, fields(count = changes.len()))]
	pub fn slot_notify(&mut self, changes: Vec<ChangeNotification>) {
		for change in changes {
			if !change.is_valid() {
				debug!(?change, "Discarding invalid change notification");
				continue;
			}

			self.invalidate_caches(&change);

			if self.accept_notification(&change) {
				self.append_and_compress(change);
			} else {
				trace!(subject = ?change.subject, operation = %change.operation, "Change not accepted;");
			}
		}

		self.dispatch_notifications();
	}

	#[must_use]
	pub fn accept_notification(&self, change: &ChangeNotification) -> bool {
		!self.filter.is_session_ignored(change.session.as_ref())
			&& !self.tracker.is_lazily_ignored(change)
			&& self.filter.accepts(change)
	}

	fn append_and_compress(&mut self, change: ChangeNotification) {
		if let Some(change) = self.tracker.rewrite_move(change) {
			self.pending.append_and_compress(change);
		}
	}

	fn invalidate_caches(&mut self, change: &ChangeNotification) {
		match (change.operation, change.subject) {
			(Operation::Remove, EntityRef::Collection(id)) => self.collections.invalidate(id),
			(Operation::Remove, EntityRef::Item(id)) => self.items.invalidate(id),
			(
				Operation::Modify | Operation::Move | Operation::Subscribe,
				EntityRef::Collection(id),
			) => self.collections.update(id),
			(Operation::Modify | Operation::Move | Operation::Subscribe, EntityRef::Item(id)) => {
				self.items.update(id);
			}
			_ => {}
		}
	}

	/// Moves changes from the queue into the pipeline while there is room.
	///
	/// A change that resolves right away and has nothing ahead of it skips the pipeline.
	pub fn dispatch_notifications(&mut self) {
		while self.pipeline.len() < self.config.pipeline_size {
			let Some(change) = self.pending.pop_front() else {
				break;
			};

			if self.ensure_data_available(&change) && self.pipeline.is_empty() {
				self.emit_notification(&change);
			} else {
				self.pipeline.push_back(change);
			}
		}
	}

	/// Emits from the pipeline head while heads are resolved, then refills it.
	pub fn data_available(&mut self) {
		while let Some(head) = self.pipeline.front().cloned() {
			if !self.ensure_data_available(&head) {
				break;
			}

			self.pipeline.pop_front();
			self.emit_notification(&head);
		}

		self.dispatch_notifications();
	}

	fn ensure_collection(&mut self, id: Option<CollectionId>) -> bool {
		match id {
			Some(id) if !id.is_root() => self.collections.ensure_cached(id),
			_ => true,
		}
	}

	fn ensure_data_available(&mut self, change: &ChangeNotification) -> bool {
		let mut all_cached = true;

		if self.config.fetch_collections {
			all_cached &= self.ensure_collection(change.parent);
			if change.operation == Operation::Move {
				all_cached &= self.ensure_collection(change.destination);
			}
		}

		// the entity itself is gone already
		if change.operation == Operation::Remove {
			return all_cached;
		}

		match change.subject {
			EntityRef::Item(id) if self.config.fetch_items => {
				all_cached &= self.items.ensure_cached(id);
			}
			EntityRef::Collection(id) if self.config.fetch_collections => {
				all_cached &= self.ensure_collection(Some(id));
			}
			_ => {}
		}

		all_cached
	}

	fn resolved_collection(&mut self, id: Option<CollectionId>, resource: &str) -> Collection {
		id.and_then(|id| self.collections.retrieve(id).cloned())
			.unwrap_or_else(|| {
				let mut placeholder = id.map_or_else(Collection::default, Collection::with_id);
				placeholder.resource = resource.to_string();
				placeholder
			})
	}

	fn emit_notification(&mut self, change: &ChangeNotification) {
		let parent = self.resolved_collection(change.parent, &change.resource);
		let destination = if change.operation == Operation::Move {
			self.resolved_collection(change.destination, &change.destination_resource)
		} else {
			Collection::default()
		};

		let notification = match change.subject {
			EntityRef::Item(id) => self.render_item(change, id, parent, destination),
			EntityRef::Collection(id) => self.render_collection(change, id, parent, destination),
		};

		if let Some(notification) = notification {
			trace!(operation = %notification.operation(), "Emitting notification;");
			self.emitted.push_back(notification);
		}
	}

	fn render_item(
		&mut self,
		change: &ChangeNotification,
		id: ItemId,
		parent: Collection,
		destination: Collection,
	) -> Option<Notification> {
		let cached = self.items.retrieve(id).cloned();

		let mut item = match cached {
			Some(item) if change.operation != Operation::Remove => item,
			_ => Item {
				id: Some(id),
				remote_id: change.remote_id.clone(),
				mime_type: change.mime_type.clone(),
				..Default::default()
			},
		};

		// the destination of an inter-resource move may have assigned its own remote id already
		let inter_resource_move =
			change.operation == Operation::Move && parent.resource != destination.resource;
		if !change.remote_id.is_empty() && (item.remote_id.is_empty() || inter_resource_move) {
			item.remote_id.clone_from(&change.remote_id);
		}

		if item.parent.is_none() {
			item.parent = if change.operation == Operation::Move {
				destination.id
			} else {
				parent.id
			};
		}

		if change.operation == Operation::Remove {
			item.remote_revision.clone_from(&change.remote_revision);
		}

		Some(match change.operation {
			Operation::Add => Notification::ItemAdded {
				item,
				collection: parent,
			},
			Operation::Modify => Notification::ItemChanged {
				item,
				parts: change.parts.clone(),
			},
			Operation::Move => Notification::ItemMoved {
				item,
				source: parent,
				destination,
			},
			Operation::Remove => Notification::ItemRemoved { item },
			Operation::Link => Notification::ItemLinked {
				item,
				collection: parent,
			},
			Operation::Unlink => Notification::ItemUnlinked {
				item,
				collection: parent,
			},
			Operation::Subscribe | Operation::Unsubscribe => {
				debug!(operation = %change.operation, "Unexpected operation in item change notification");
				return None;
			}
		})
	}

	fn render_collection(
		&mut self,
		change: &ChangeNotification,
		id: CollectionId,
		parent: Collection,
		destination: Collection,
	) -> Option<Notification> {
		let cached = self.collections.retrieve(id).cloned();

		let mut collection = match cached {
			Some(collection) if change.operation != Operation::Remove => collection,
			_ => Collection {
				id: Some(id),
				resource: change.resource.clone(),
				remote_id: change.remote_id.clone(),
				..Default::default()
			},
		};

		let inter_resource_move =
			change.operation == Operation::Move && parent.resource != destination.resource;
		if !change.remote_id.is_empty() && (collection.remote_id.is_empty() || inter_resource_move)
		{
			collection.remote_id.clone_from(&change.remote_id);
		}

		if collection.parent.is_none() {
			collection.parent = if change.operation == Operation::Move {
				destination.id
			} else {
				parent.id
			};
		}

		if change.operation == Operation::Remove {
			collection.remote_revision.clone_from(&change.remote_revision);
		}

		Some(match change.operation {
			Operation::Add => Notification::CollectionAdded { collection, parent },
			Operation::Modify => Notification::CollectionChanged {
				collection,
				parts: change.parts.clone(),
			},
			Operation::Move => Notification::CollectionMoved {
				collection,
				source: parent,
				destination,
			},
			Operation::Remove => Notification::CollectionRemoved { collection },
			// everything is monitored anyway, subscription state is meaningless
			Operation::Subscribe if !self.filter.all_monitored => {
				Notification::CollectionSubscribed { collection, parent }
			}
			Operation::Unsubscribe if !self.filter.all_monitored => {
				Notification::CollectionUnsubscribed { collection }
			}
			Operation::Subscribe | Operation::Unsubscribe => return None,
			Operation::Link | Operation::Unlink => {
				debug!(operation = %change.operation, "Unexpected operation in collection change notification");
				return None;
			}
		})
	}

	/// Drops queued and in flight changes that are no longer acceptable.
	pub fn clean_old_notifications(&mut self) {
		let before = self.pipeline.len() + self.pending.len();

		let mut pipeline = std::mem::take(&mut self.pipeline);
		pipeline.retain(|change| self.accept_notification(change));
		self.pipeline = pipeline;

		let mut pending = std::mem::take(&mut self.pending);
		pending.retain(|change| self.accept_notification(change));
		self.pending = pending;

		let dropped = before - (self.pipeline.len() + self.pending.len());
		if dropped > 0 {
			debug!(dropped, "Discarded changes no longer of interest;");
		}

		// a dropped head may have been the one blocking the rest
		self.data_available();
	}

	pub fn update_filter(&mut self, update: FilterUpdate) {
		match update {
			FilterUpdate::Collection(id, monitored) => toggle(&mut self.filter.collections, id, monitored),
			FilterUpdate::Item(id, monitored) => toggle(&mut self.filter.items, id, monitored),
			FilterUpdate::Resource(resource, monitored) => {
				toggle(&mut self.filter.resources, resource, monitored);
			}
			FilterUpdate::MimeType(mime_type, monitored) => {
				toggle(&mut self.filter.mime_types, mime_type, monitored);
			}
			FilterUpdate::IgnoredSession(session, ignored) => {
				toggle(&mut self.filter.ignored_sessions, session, ignored);
			}
			FilterUpdate::All(all) => self.filter.all_monitored = all,
		}

		self.clean_old_notifications();
	}

	pub fn set_collection_monitored(&mut self, id: CollectionId, monitored: bool) {
		self.update_filter(FilterUpdate::Collection(id, monitored));
	}

	pub fn set_item_monitored(&mut self, id: ItemId, monitored: bool) {
		self.update_filter(FilterUpdate::Item(id, monitored));
	}

	pub fn set_resource_monitored(&mut self, resource: impl Into<String>, monitored: bool) {
		self.update_filter(FilterUpdate::Resource(resource.into(), monitored));
	}

	pub fn set_mime_type_monitored(&mut self, mime_type: impl Into<String>, monitored: bool) {
		self.update_filter(FilterUpdate::MimeType(mime_type.into(), monitored));
	}

	pub fn set_session_ignored(&mut self, session: SessionId, ignored: bool) {
		self.update_filter(FilterUpdate::IgnoredSession(session, ignored));
	}

	pub fn set_all_monitored(&mut self, all: bool) {
		self.update_filter(FilterUpdate::All(all));
	}

	pub fn ref_collection(&mut self, id: CollectionId) {
		self.tracker.ref_collection(id);
	}

	/// Returns the collection that fell out of the grace buffer, its cached state is dropped.
	pub fn deref_collection(&mut self, id: CollectionId) -> Option<CollectionId> {
		let bumped = self.tracker.deref_collection(id);

		if let Some(bumped) = bumped {
			self.collections.update(bumped);
			self.clean_old_notifications();
		}

		bumped
	}

	#[must_use]
	pub fn take_fetch_requests(&mut self) -> FetchRequests {
		FetchRequests {
			collections: self.collections.take_requests(),
			items: self.items.take_requests(),
		}
	}

	pub fn collection_fetched(&mut self, id: CollectionId, collection: Option<Collection>) {
		if self.collections.fetch_completed(id, collection) {
			self.data_available();
		}
	}

	pub fn item_fetched(&mut self, id: ItemId, item: Option<Item>) {
		if self.items.fetch_completed(id, item) {
			self.data_available();
		}
	}

	pub fn take_notifications(&mut self) -> Vec<Notification> {
		self.emitted.drain(..).collect()
	}
}

fn toggle<T: Eq + Hash>(set: &mut HashSet<T>, value: T, on: bool) {
	if on {
		set.insert(value);
	} else {
		set.remove(&value);
	}
}

use pimd_protocol::{
	ChangeNotification, Collection, CollectionId, Item, ItemId, Operation, SessionId,
};

use std::{collections::BTreeMap, sync::Arc};

use async_channel as chan;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use super::{CommitSummary, Error, ItemScope, NotificationSink, Storage, Transaction};

#[derive(Debug, Clone)]
struct State {
	available: bool,
	items: BTreeMap<ItemId, Item>,
	collections: BTreeMap<CollectionId, Collection>,
	last_item_id: i64,
	last_collection_id: i64,
	mutations: u64,
}

impl Default for State {
	fn default() -> Self {
		Self {
			available: true,
			items: BTreeMap::new(),
			collections: BTreeMap::new(),
			last_item_id: 0,
			last_collection_id: CollectionId::ROOT.0,
			mutations: 0,
		}
	}
}

#[derive(Debug)]
enum Staged {
	Create(CollectionId, Item),
	Update(Item),
	Delete(ItemId),
}

/// Committed change batches waiting for the sink, queued while the state lock is held.
struct Outbox {
	pending_tx: chan::Sender<Vec<ChangeNotification>>,
	pending_rx: chan::Receiver<Vec<ChangeNotification>>,
	publishing: Mutex<()>,
}

impl Default for Outbox {
	fn default() -> Self {
		let (pending_tx, pending_rx) = chan::unbounded();

		Self {
			pending_tx,
			pending_rx,
			publishing: Mutex::new(()),
		}
	}
}

/// In-memory storage engine.
///
/// Transactions are applied to a copy of the current state and swapped in only once every
/// staged write validated, so a failing commit never leaves partial state behind. Item remote
/// ids are unique per collection.
///
/// Changes reach the notification sink in commit order.
#[derive(Clone, Default)]
pub struct MemoryStore {
	state: Arc<Mutex<State>>,
	outbox: Arc<Outbox>,
	sink: Option<Arc<dyn NotificationSink>>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	/// Simulates the backend going away (or coming back).
	pub async fn set_available(&self, available: bool) {
		self.state.lock().await.available = available;
	}

	/// Committed write operations since creation, handy to assert a sync was a no-op.
	pub async fn mutation_count(&self) -> u64 {
		self.state.lock().await.mutations
	}

	pub async fn item_count(&self, collection: CollectionId) -> usize {
		self.state
			.lock()
			.await
			.items
			.values()
			.filter(|item| item.parent == Some(collection))
			.count()
	}

	#[instrument(skip(self, collection), fields(name = %collection.name), err)]
	pub async fn create_collection(&self, mut collection: Collection) -> Result<CollectionId, Error> {
		let id = {
			let mut state = self.state.lock().await;
			state.ensure_available()?;

			let parent = collection.parent.unwrap_or(CollectionId::ROOT);
			if !parent.is_root() && !state.collections.contains_key(&parent) {
				return Err(Error::CollectionNotFound(parent));
			}

			let id = if let Some(id) = collection.id {
				state.last_collection_id = state.last_collection_id.max(id.0);
				id
			} else {
				state.last_collection_id += 1;
				CollectionId(state.last_collection_id)
			};

			collection.id = Some(id);
			collection.parent = Some(parent);

			let change = ChangeNotification::collection(Operation::Add, id, parent)
				.with_resource(&collection.resource)
				.with_remote_id(&collection.remote_id);

			state.collections.insert(id, collection);
			state.mutations += 1;
			self.enqueue(vec![change]);

			debug!(%id, "Created collection;");

			id
		};

		self.publish().await;

		Ok(id)
	}

	#[instrument(skip(self, collection), fields(id = ?collection.id), err)]
	pub async fn modify_collection(&self, collection: Collection) -> Result<(), Error> {
		{
			let mut state = self.state.lock().await;
			state.ensure_available()?;

			let id = collection.id.ok_or(Error::MissingId)?;
			let stored = state
				.collections
				.get_mut(&id)
				.ok_or(Error::CollectionNotFound(id))?;

			let parent = stored.parent.unwrap_or(CollectionId::ROOT);

			let change = if stored.subscribed == collection.subscribed {
				let parts = collection_parts(stored, &collection);
				if parts.is_empty() {
					return Ok(());
				}
				ChangeNotification::collection(Operation::Modify, id, parent).with_parts(parts)
			} else if collection.subscribed {
				ChangeNotification::collection(Operation::Subscribe, id, parent)
			} else {
				ChangeNotification::collection(Operation::Unsubscribe, id, parent)
			}
			.with_resource(&collection.resource)
			.with_remote_id(&collection.remote_id);

			*stored = Collection {
				parent: Some(parent),
				..collection
			};
			state.mutations += 1;
			self.enqueue(vec![change]);
		}

		self.publish().await;

		Ok(())
	}

	/// Removes a collection together with the items it contains.
	#[instrument(skip(self), err)]
	pub async fn remove_collection(&self, id: CollectionId) -> Result<(), Error> {
		{
			let mut state = self.state.lock().await;
			state.ensure_available()?;

			let removed = state
				.collections
				.remove(&id)
				.ok_or(Error::CollectionNotFound(id))?;

			state.items.retain(|_, item| item.parent != Some(id));
			state.mutations += 1;

			self.enqueue(vec![ChangeNotification::collection(
				Operation::Remove,
				id,
				removed.parent.unwrap_or(CollectionId::ROOT),
			)
			.with_resource(removed.resource)
			.with_remote_id(removed.remote_id)
			.with_remote_revision(removed.remote_revision)]);
		}

		self.publish().await;

		Ok(())
	}

	/// Must be called with the state lock held, the queue order is the commit order.
	fn enqueue(&self, changes: Vec<ChangeNotification>) {
		if changes.is_empty() || self.sink.is_none() {
			return;
		}

		if self.outbox.pending_tx.try_send(changes).is_err() {
			warn!("Change notification outbox is closed, dropping changes");
		}
	}

	/// Hands every queued batch to the sink. Returns once the caller's own batch went out, even
	/// when a concurrent publisher took it.
	async fn publish(&self) {
		let Some(sink) = &self.sink else {
			return;
		};

		let _publishing = self.outbox.publishing.lock().await;
		while let Ok(changes) = self.outbox.pending_rx.try_recv() {
			trace!(count = changes.len(), "Publishing change notifications;");
			sink.notify(changes).await;
		}
	}
}

impl State {
	const fn ensure_available(&self) -> Result<(), Error> {
		if self.available {
			Ok(())
		} else {
			Err(Error::Unavailable)
		}
	}

	fn collection(&self, id: CollectionId) -> Result<&Collection, Error> {
		self.collections
			.get(&id)
			.ok_or(Error::CollectionNotFound(id))
	}

	fn ensure_unique(
		&self,
		collection: CollectionId,
		remote_id: &str,
		except: Option<ItemId>,
	) -> Result<(), Error> {
		if remote_id.is_empty() {
			return Ok(());
		}

		let taken = self.items.values().any(|item| {
			item.parent == Some(collection) && item.remote_id == remote_id && item.id != except
		});

		if taken {
			Err(Error::DuplicateKey {
				collection,
				remote_id: remote_id.to_string(),
			})
		} else {
			Ok(())
		}
	}

	fn apply(
		&mut self,
		staged: Staged,
		session: SessionId,
		summary: &mut CommitSummary,
	) -> Result<Option<ChangeNotification>, Error> {
		match staged {
			Staged::Create(collection, mut item) => {
				let resource = self.collection(collection)?.resource.clone();
				self.ensure_unique(collection, &item.remote_id, None)?;

				self.last_item_id += 1;
				let id = ItemId(self.last_item_id);
				item.id = Some(id);
				item.parent = Some(collection);
				item.revision = 0;

				let change = ChangeNotification::item(Operation::Add, id, collection)
					.with_session(session)
					.with_resource(resource)
					.with_mime_type(&item.mime_type)
					.with_remote_id(&item.remote_id);

				self.items.insert(id, item);
				summary.created += 1;

				Ok(Some(change))
			}

			Staged::Update(mut item) => {
				let id = item.id.ok_or(Error::MissingId)?;
				let stored = self.items.get(&id).ok_or(Error::ItemNotFound(id))?;
				let collection = stored.parent.unwrap_or(CollectionId::ROOT);
				let parts = item_parts(stored, &item);
				if parts.is_empty() {
					return Ok(None);
				}

				item.revision = stored.revision + 1;
				item.parent = Some(collection);
				self.ensure_unique(collection, &item.remote_id, Some(id))?;

				let resource = self.collection(collection)?.resource.clone();
				let change = ChangeNotification::item(Operation::Modify, id, collection)
					.with_session(session)
					.with_resource(resource)
					.with_mime_type(&item.mime_type)
					.with_remote_id(&item.remote_id)
					.with_parts(parts);

				self.items.insert(id, item);
				summary.updated += 1;

				Ok(Some(change))
			}

			Staged::Delete(id) => {
				let removed = self.items.remove(&id).ok_or(Error::ItemNotFound(id))?;
				let collection = removed.parent.unwrap_or(CollectionId::ROOT);
				let resource = self
					.collections
					.get(&collection)
					.map(|collection| collection.resource.clone())
					.unwrap_or_default();

				summary.deleted += 1;

				Ok(Some(
					ChangeNotification::item(Operation::Remove, id, collection)
						.with_session(session)
						.with_resource(resource)
						.with_mime_type(removed.mime_type)
						.with_remote_id(removed.remote_id)
						.with_remote_revision(removed.remote_revision),
				))
			}
		}
	}
}

fn item_parts(stored: &Item, incoming: &Item) -> Vec<&'static str> {
	let mut parts = Vec::new();
	if stored.remote_id != incoming.remote_id {
		parts.push("REMOTEID");
	}
	if stored.gid != incoming.gid {
		parts.push("GID");
	}
	if stored.mime_type != incoming.mime_type {
		parts.push("MIMETYPE");
	}
	if stored.remote_revision != incoming.remote_revision {
		parts.push("REMOTEREVISION");
	}
	if stored.flags != incoming.flags {
		parts.push("FLAGS");
	}
	if stored.payload != incoming.payload {
		parts.push("PAYLOAD");
	}
	parts
}

fn collection_parts(stored: &Collection, incoming: &Collection) -> Vec<&'static str> {
	let mut parts = Vec::new();
	if stored.name != incoming.name {
		parts.push("NAME");
	}
	if stored.remote_id != incoming.remote_id {
		parts.push("REMOTEID");
	}
	if stored.remote_revision != incoming.remote_revision {
		parts.push("REMOTEREVISION");
	}
	if stored.content_mime_types != incoming.content_mime_types {
		parts.push("MIMETYPE");
	}
	if stored.check_interval_minutes != incoming.check_interval_minutes {
		parts.push("CACHEPOLICY");
	}
	if stored.enabled != incoming.enabled {
		parts.push("ENABLED");
	}
	if stored.referenced != incoming.referenced {
		parts.push("REFERENCED");
	}
	parts
}

#[async_trait]
impl Storage for MemoryStore {
	async fn begin_transaction(&self, session: SessionId) -> Result<Box<dyn Transaction>, Error> {
		self.state.lock().await.ensure_available()?;

		Ok(Box::new(MemoryTransaction {
			store: self.clone(),
			session,
			staged: Vec::new(),
		}))
	}

	async fn fetch_items(&self, scope: &ItemScope) -> Result<Vec<Item>, Error> {
		let state = self.state.lock().await;
		state.ensure_available()?;

		let items = match scope {
			ItemScope::Collection(collection) => {
				state.collection(*collection)?;
				state
					.items
					.values()
					.filter(|item| item.parent == Some(*collection))
					.cloned()
					.collect::<Vec<_>>()
			}
			ItemScope::Ids(ids) => ids
				.iter()
				.filter_map(|id| state.items.get(id))
				.cloned()
				.collect(),
			ItemScope::RemoteIds {
				collection,
				remote_ids,
			} => state
				.items
				.values()
				.filter(|item| {
					item.parent == Some(*collection) && remote_ids.contains(&item.remote_id)
				})
				.cloned()
				.collect(),
			ItemScope::Gids { collection, gids } => state
				.items
				.values()
				.filter(|item| {
					item.parent == Some(*collection)
						&& !item.gid.is_empty()
						&& gids.contains(&item.gid)
				})
				.cloned()
				.collect(),
		};

		if items.is_empty() && !scope.is_listing() {
			return Err(Error::EmptyScope);
		}

		Ok(items)
	}

	async fn fetch_collection(&self, id: CollectionId) -> Result<Option<Collection>, Error> {
		let state = self.state.lock().await;
		state.ensure_available()?;

		Ok(state.collections.get(&id).cloned())
	}

	async fn fetch_collections(&self) -> Result<Vec<Collection>, Error> {
		let state = self.state.lock().await;
		state.ensure_available()?;

		Ok(state.collections.values().cloned().collect())
	}
}

struct MemoryTransaction {
	store: MemoryStore,
	session: SessionId,
	staged: Vec<Staged>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
	async fn create_item(&mut self, collection: CollectionId, item: Item) -> Result<(), Error> {
		self.staged.push(Staged::Create(collection, item));
		Ok(())
	}

	async fn update_item(&mut self, item: Item) -> Result<(), Error> {
		if item.id.is_none() {
			return Err(Error::MissingId);
		}
		self.staged.push(Staged::Update(item));
		Ok(())
	}

	async fn delete_item(&mut self, id: ItemId) -> Result<(), Error> {
		self.staged.push(Staged::Delete(id));
		Ok(())
	}

	fn len(&self) -> usize {
		self.staged.len()
	}

	#[instrument(skip(self), fields(session = %self.session, staged = self.staged.len()), err)]
	async fn commit(self: Box<Self>) -> Result<CommitSummary, Error> {
		let Self {
			store,
			session,
			staged,
		} = *self;

		let mut summary = CommitSummary::default();

		{
			let mut state = store.state.lock().await;
			state.ensure_available()?;

			let mut next = state.clone();
			let mut changes = Vec::with_capacity(staged.len());

			for write in staged {
				if let Some(change) = next.apply(write, session, &mut summary)? {
					changes.push(change);
				}
			}

			next.mutations += changes.len() as u64;
			*state = next;

			store.enqueue(changes);
		}

		trace!(?summary, "Transaction committed;");

		store.publish().await;

		Ok(summary)
	}

	async fn rollback(self: Box<Self>) {
		if !self.staged.is_empty() {
			warn!(
				session = %self.session,
				discarded = self.staged.len(),
				"Rolling back transaction;"
			);
		}
	}
}

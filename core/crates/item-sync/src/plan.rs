use pimd_protocol::{Item, ItemId};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How incoming items without a local id are matched to stored ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
	/// Remote id only, the GID is consulted just for items lacking a remote id.
	#[default]
	RemoteId,
	/// Falls back to the GID whenever the remote id matched nothing, so a resource renaming
	/// an item's remote id updates it instead of duplicating it.
	Gid,
}

/// Stored items of the synced collection, indexed the ways incoming items get matched.
#[derive(Debug, Default)]
pub struct LocalItems {
	items: HashMap<ItemId, Item>,
	by_remote_id: HashMap<String, ItemId>,
	by_gid: HashMap<String, ItemId>,
}

impl LocalItems {
	pub fn new(mut items: Vec<Item>) -> Self {
		items.sort_by_key(|item| item.id);

		let mut local = Self::default();
		for item in items {
			let Some(id) = item.id else {
				continue;
			};

			if !item.remote_id.is_empty() {
				local.by_remote_id.entry(item.remote_id.clone()).or_insert(id);
			}
			if !item.gid.is_empty() {
				local.by_gid.entry(item.gid.clone()).or_insert(id);
			}
			local.items.insert(id, item);
		}

		local
	}

	pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
		self.items.keys().copied()
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	fn by_id(&self, id: Option<ItemId>) -> Option<&Item> {
		id.and_then(|id| self.items.get(&id))
	}

	fn by_remote_id(&self, remote_id: &str) -> Option<&Item> {
		if remote_id.is_empty() {
			return None;
		}
		self.by_remote_id
			.get(remote_id)
			.and_then(|id| self.items.get(id))
	}

	/// Local id first, then remote id, then GID as allowed by `mode`.
	pub fn find(&self, incoming: &Item, mode: MergeMode) -> Option<&Item> {
		if let Some(item) = self
			.by_id(incoming.id)
			.or_else(|| self.by_remote_id(&incoming.remote_id))
		{
			return Some(item);
		}

		if incoming.gid.is_empty() || (mode == MergeMode::RemoteId && !incoming.remote_id.is_empty())
		{
			return None;
		}

		self.by_gid
			.get(&incoming.gid)
			.and_then(|id| self.items.get(id))
	}

	/// Deletions are matched by reference only, never by GID.
	pub fn find_deleted(&self, reference: &Item) -> Option<&Item> {
		self.by_id(reference.id)
			.or_else(|| self.by_remote_id(&reference.remote_id))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
	Create(Item),
	Update(Item),
	Delete(ItemId),
}

#[derive(Debug, Default)]
pub struct Plan {
	pub writes: Vec<Write>,
	pub unchanged: usize,
	pub ignored_deletions: usize,
	/// Stored items the delivered set accounted for.
	pub matched: Vec<ItemId>,
}

/// The incoming item as it would be stored over `local`.
///
/// Whatever the resource left empty keeps its stored value, flags are taken as delivered.
fn merged(local: &Item, incoming: Item) -> Item {
	let mut item = Item {
		id: local.id,
		parent: local.parent,
		revision: local.revision,
		..incoming
	};

	if item.remote_id.is_empty() {
		item.remote_id.clone_from(&local.remote_id);
	}
	if item.gid.is_empty() {
		item.gid.clone_from(&local.gid);
	}
	if item.mime_type.is_empty() {
		item.mime_type.clone_from(&local.mime_type);
	}
	if item.remote_revision.is_empty() {
		item.remote_revision.clone_from(&local.remote_revision);
	}
	if item.payload.is_empty() {
		item.payload.clone_from(&local.payload);
	}

	item
}

/// Works out the writes one delivered batch needs.
pub fn plan(local: &LocalItems, changed: Vec<Item>, deleted: Vec<Item>, mode: MergeMode) -> Plan {
	let mut plan = Plan::default();

	for incoming in changed {
		match local.find(&incoming, mode) {
			Some(stored) => {
				let Some(id) = stored.id else {
					continue;
				};
				plan.matched.push(id);

				let item = merged(stored, incoming);
				if item.fingerprint_matches(stored) {
					plan.unchanged += 1;
				} else {
					plan.writes.push(Write::Update(item));
				}
			}
			None => plan.writes.push(Write::Create(Item {
				id: None,
				..incoming
			})),
		}
	}

	for reference in deleted {
		match local.find_deleted(&reference).and_then(|stored| stored.id) {
			Some(id) => plan.writes.push(Write::Delete(id)),
			None => plan.ignored_deletions += 1,
		}
	}

	plan
}

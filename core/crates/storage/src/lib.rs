//! Storage collaborator of the daemon core.
//!
//! The notification pipeline and the item synchronizer only ever talk to storage through the
//! [`Storage`] and [`Transaction`] traits. [`MemoryStore`] is the in-process engine the node
//! runs on and the tests exercise.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use pimd_protocol::{ChangeNotification, Collection, CollectionId, Item, ItemId, SessionId};

use async_channel as chan;
use async_trait::async_trait;

mod memory;

pub use memory::MemoryStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("storage backend is unavailable")]
	Unavailable,
	#[error("collection not found: {0}")]
	CollectionNotFound(CollectionId),
	#[error("item not found: {0}")]
	ItemNotFound(ItemId),
	#[error("duplicate remote id <remote_id='{remote_id}'> in {collection}")]
	DuplicateKey {
		collection: CollectionId,
		remote_id: String,
	},
	#[error("entity has no local id")]
	MissingId,
	#[error("no items matched the requested scope")]
	EmptyScope,
}

impl Error {
	/// Errors after which no further work against this storage makes sense.
	#[must_use]
	pub const fn is_fatal(&self) -> bool {
		matches!(self, Self::Unavailable | Self::EmptyScope)
	}
}

/// Which items a fetch is about.
///
/// Only [`ItemScope::Collection`] is a listing, every other scope names specific items and
/// finding none of them is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemScope {
	Collection(CollectionId),
	Ids(Vec<ItemId>),
	RemoteIds {
		collection: CollectionId,
		remote_ids: Vec<String>,
	},
	Gids {
		collection: CollectionId,
		gids: Vec<String>,
	},
}

impl ItemScope {
	#[must_use]
	pub const fn is_listing(&self) -> bool {
		matches!(self, Self::Collection(_))
	}
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
	async fn begin_transaction(&self, session: SessionId) -> Result<Box<dyn Transaction>, Error>;

	async fn fetch_items(&self, scope: &ItemScope) -> Result<Vec<Item>, Error>;

	/// `Ok(None)` when the collection doesn't exist (anymore).
	async fn fetch_collection(&self, id: CollectionId) -> Result<Option<Collection>, Error>;

	async fn fetch_collections(&self) -> Result<Vec<Collection>, Error>;
}

/// Writes staged here stay invisible to everybody until [`Transaction::commit`] succeeds,
/// and a failed commit leaves no trace of them.
#[async_trait]
pub trait Transaction: Send {
	async fn create_item(&mut self, collection: CollectionId, item: Item) -> Result<(), Error>;

	async fn update_item(&mut self, item: Item) -> Result<(), Error>;

	async fn delete_item(&mut self, id: ItemId) -> Result<(), Error>;

	/// Number of staged writes.
	fn len(&self) -> usize;

	fn is_empty(&self) -> bool {
		self.len() == 0
	}

	async fn commit(self: Box<Self>) -> Result<CommitSummary, Error>;

	async fn rollback(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
	pub created: usize,
	pub updated: usize,
	pub deleted: usize,
}

/// Receives the change notifications of every successful commit.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
	async fn notify(&self, changes: Vec<ChangeNotification>);
}

#[async_trait]
impl NotificationSink for chan::Sender<Vec<ChangeNotification>> {
	async fn notify(&self, changes: Vec<ChangeNotification>) {
		if self.send(changes).await.is_err() {
			tracing::warn!("Change notification receiver is gone, dropping changes");
		}
	}
}

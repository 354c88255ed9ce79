use pimd_core_storage::{self as storage, ItemScope, Storage};
use pimd_protocol::{
	Collection, CollectionId, Interest, Item, ItemId, Notification, SubscriptionFilter,
};

use std::{pin::pin, sync::Arc};

use async_channel as chan;
use async_trait::async_trait;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use tokio::{spawn, sync::oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use super::{Error, FilterUpdate, Monitor, MonitorConfig, SubscriberMessage};

/// Where a [`MonitorRunner`] resolves entities from.
#[async_trait]
pub trait EntityFetcher: Send + Sync + 'static {
	async fn fetch_collection(&self, id: CollectionId) -> Result<Option<Collection>, storage::Error>;

	async fn fetch_item(&self, id: ItemId) -> Result<Option<Item>, storage::Error>;
}

#[async_trait]
impl<S: Storage> EntityFetcher for S {
	async fn fetch_collection(&self, id: CollectionId) -> Result<Option<Collection>, storage::Error> {
		Storage::fetch_collection(self, id).await
	}

	async fn fetch_item(&self, id: ItemId) -> Result<Option<Item>, storage::Error> {
		match self.fetch_items(&ItemScope::Ids(vec![id])).await {
			Ok(mut items) => Ok(items.pop()),
			Err(storage::Error::EmptyScope) => Ok(None),
			Err(e) => Err(e),
		}
	}
}

enum Fetched {
	Collection(CollectionId, Option<Collection>),
	Item(ItemId, Option<Item>),
}

enum Command {
	Ref(CollectionId, oneshot::Sender<()>),
	Deref(CollectionId, oneshot::Sender<Option<CollectionId>>),
	UpdateFilter(FilterUpdate, oneshot::Sender<()>),
}

/// Drives a [`Monitor`] from a subscriber connection, fetching through an [`EntityFetcher`].
pub struct MonitorRunner;

impl MonitorRunner {
	/// Spawns the runner, typed notifications come out of the returned receiver.
	#[must_use]
	pub fn spawn(
		config: MonitorConfig,
		filter: SubscriptionFilter,
		interest: Interest,
		fetcher: Arc<dyn EntityFetcher>,
		changes_rx: chan::Receiver<SubscriberMessage>,
	) -> (MonitorHandle, chan::Receiver<Notification>) {
		let (notifications_tx, notifications_rx) = chan::bounded(64);
		let (commands_tx, commands_rx) = chan::bounded(16);
		let cancel_token = CancellationToken::new();

		spawn(run(
			Monitor::new(config, filter, interest),
			fetcher,
			changes_rx,
			commands_rx,
			notifications_tx,
			cancel_token.child_token(),
		));

		(
			MonitorHandle {
				commands_tx,
				_cancel_loop: Arc::new(cancel_token.drop_guard()),
			},
			notifications_rx,
		)
	}
}

/// Stops the runner once every clone is dropped.
///
/// Every call returns once the runner applied it, so changes sent afterwards are judged
/// against the new state.
#[derive(Clone)]
pub struct MonitorHandle {
	commands_tx: chan::Sender<Command>,
	_cancel_loop: Arc<DropGuard>,
}

impl MonitorHandle {
	async fn request<T>(
		&self,
		command: impl FnOnce(oneshot::Sender<T>) -> Command,
	) -> Result<T, Error> {
		let (tx, rx) = oneshot::channel();
		self.commands_tx
			.send(command(tx))
			.await
			.map_err(|_| Error::MonitorStopped)?;
		rx.await.map_err(|_| Error::MonitorStopped)
	}

	pub async fn ref_collection(&self, id: CollectionId) -> Result<(), Error> {
		self.request(|tx| Command::Ref(id, tx)).await
	}

	/// Returns the collection pushed out of the grace buffer, if any.
	pub async fn deref_collection(&self, id: CollectionId) -> Result<Option<CollectionId>, Error> {
		self.request(|tx| Command::Deref(id, tx)).await
	}

	pub async fn update_filter(&self, update: FilterUpdate) -> Result<(), Error> {
		self.request(|tx| Command::UpdateFilter(update, tx)).await
	}
}

async fn run(
	mut monitor: Monitor,
	fetcher: Arc<dyn EntityFetcher>,
	changes_rx: chan::Receiver<SubscriberMessage>,
	commands_rx: chan::Receiver<Command>,
	notifications_tx: chan::Sender<Notification>,
	cancel_token: CancellationToken,
) {
	enum StreamMessage {
		Change(SubscriberMessage),
		Fetched(Fetched),
		Command(Command),
		Stop,
	}

	let (fetched_tx, fetched_rx) = chan::unbounded();

	let cancel = pin!(cancel_token.cancelled());

	let mut msg_stream = pin!((
		changes_rx.map(StreamMessage::Change),
		fetched_rx.map(StreamMessage::Fetched),
		commands_rx.map(StreamMessage::Command),
		cancel.into_stream().map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Change(SubscriberMessage::Change(change)) => {
				monitor.slot_notify(vec![change]);
			}

			StreamMessage::Change(SubscriberMessage::Debug(notification)) => {
				trace!(
					listeners = ?notification.listeners,
					"Received change notification debug info;"
				);
			}

			StreamMessage::Fetched(Fetched::Collection(id, collection)) => {
				monitor.collection_fetched(id, collection);
			}

			StreamMessage::Fetched(Fetched::Item(id, item)) => monitor.item_fetched(id, item),

			StreamMessage::Command(Command::Ref(id, tx)) => {
				monitor.ref_collection(id);
				tx.send(()).ok();
			}

			StreamMessage::Command(Command::Deref(id, tx)) => {
				tx.send(monitor.deref_collection(id)).ok();
			}

			StreamMessage::Command(Command::UpdateFilter(update, tx)) => {
				monitor.update_filter(update);
				tx.send(()).ok();
			}

			StreamMessage::Stop => {
				debug!("Monitor runner is stopping");
				break;
			}
		}

		request_fetches(&mut monitor, &fetcher, &fetched_tx);

		for notification in monitor.take_notifications() {
			if notifications_tx.send(notification).await.is_err() {
				debug!("Notification consumer is gone, stopping monitor runner");
				return;
			}
		}
	}
}

fn request_fetches(
	monitor: &mut Monitor,
	fetcher: &Arc<dyn EntityFetcher>,
	fetched_tx: &chan::Sender<Fetched>,
) {
	let requests = monitor.take_fetch_requests();

	for id in requests.collections {
		let fetcher = Arc::clone(fetcher);
		let fetched_tx = fetched_tx.clone();
		spawn(async move {
			let collection = fetcher.fetch_collection(id).await.unwrap_or_else(|e| {
				warn!(%id, ?e, "Failed to fetch collection, treating it as vanished");
				None
			});
			fetched_tx
				.send(Fetched::Collection(id, collection))
				.await
				.ok();
		});
	}

	for id in requests.items {
		let fetcher = Arc::clone(fetcher);
		let fetched_tx = fetched_tx.clone();
		spawn(async move {
			let item = fetcher.fetch_item(id).await.unwrap_or_else(|e| {
				warn!(%id, ?e, "Failed to fetch item, treating it as vanished");
				None
			});
			fetched_tx.send(Fetched::Item(id, item)).await.ok();
		});
	}
}

use crate::{Error, IntervalCheck, NodeConfig, SyncRequestHandler};

use pimd_core_item_sync::ItemSync;
use pimd_core_notifications::{
	ChannelSubscriber, MonitorHandle, MonitorRunner, NotificationManager, Subscriber,
	SubscriberMessage,
};
use pimd_core_storage::{MemoryStore, Storage};
use pimd_protocol::{
	ChangeNotification, CollectionId, EntityRef, Interest, Notification, Operation, SessionId,
	SubscriberId, SubscriptionFilter,
};

use std::{pin::pin, sync::Arc};

use async_channel as chan;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use tokio::spawn;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Messages a client connection may have queued before it stalls its notification worker.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Owns the storage engine and every service built on its change notifications.
pub struct Node {
	config: NodeConfig,
	storage: MemoryStore,
	notifications: NotificationManager,
	scheduler: IntervalCheck,
	_cancel_loop: DropGuard,
}

impl Node {
	pub async fn new(
		config: NodeConfig,
		sync_handler: Arc<dyn SyncRequestHandler>,
	) -> Result<Arc<Self>, Error> {
		let notifications = NotificationManager::new(config.notifications.clone());
		let storage =
			MemoryStore::new().with_notification_sink(Arc::new(notifications.clone()));
		let scheduler = IntervalCheck::new(config.scheduler.clone(), sync_handler);

		for collection in storage.fetch_collections().await? {
			scheduler.collection_added(collection).await?;
		}

		let (subscriber, changes_rx) = ChannelSubscriber::new(
			"interval-check",
			SubscriptionFilter::all(),
			Interest::none().with_collections([
				Operation::Add,
				Operation::Modify,
				Operation::Move,
				Operation::Remove,
				Operation::Subscribe,
				Operation::Unsubscribe,
			]),
			SUBSCRIBER_CAPACITY,
		);
		notifications.register(Arc::new(subscriber)).await?;

		let cancel_token = CancellationToken::new();
		spawn(feed_scheduler(
			storage.clone(),
			scheduler.clone(),
			changes_rx,
			cancel_token.child_token(),
		));

		info!(data_dir = %config.data_dir.display(), "Node started;");

		Ok(Arc::new(Self {
			config,
			storage,
			notifications,
			scheduler,
			_cancel_loop: cancel_token.drop_guard(),
		}))
	}

	#[must_use]
	pub const fn config(&self) -> &NodeConfig {
		&self.config
	}

	#[must_use]
	pub const fn storage(&self) -> &MemoryStore {
		&self.storage
	}

	#[must_use]
	pub const fn notifications(&self) -> &NotificationManager {
		&self.notifications
	}

	#[must_use]
	pub const fn scheduler(&self) -> &IntervalCheck {
		&self.scheduler
	}

	/// Registers a client connection, the server side filter decides what reaches it.
	pub async fn subscribe(
		&self,
		name: &str,
		filter: SubscriptionFilter,
		interest: Interest,
	) -> Result<(SubscriberId, chan::Receiver<SubscriberMessage>), Error> {
		let (subscriber, changes_rx) =
			ChannelSubscriber::new(name, filter, interest, SUBSCRIBER_CAPACITY);
		let id = subscriber.id();

		self.notifications.register(Arc::new(subscriber)).await?;
		debug!(%name, ?id, "Subscriber registered;");

		Ok((id, changes_rx))
	}

	/// Subscribes a monitor resolving changes into typed notifications against this node's
	/// storage.
	pub async fn monitor(
		&self,
		name: &str,
		filter: SubscriptionFilter,
		interest: Interest,
	) -> Result<(MonitorHandle, chan::Receiver<Notification>), Error> {
		let (_, changes_rx) = self
			.subscribe(name, filter.clone(), interest.clone())
			.await?;

		Ok(MonitorRunner::spawn(
			self.config.monitor.clone(),
			filter,
			interest,
			Arc::new(self.storage.clone()),
			changes_rx,
		))
	}

	#[must_use]
	pub fn item_sync(&self, collection: CollectionId, session: SessionId) -> ItemSync {
		ItemSync::with_config(
			Arc::new(self.storage.clone()),
			collection,
			session,
			&self.config.item_sync,
		)
	}

	/// Emits pending notifications before the node goes away.
	pub async fn shutdown(&self) {
		if let Err(e) = self.notifications.flush().await {
			warn!(?e, "Failed to flush pending notifications on shutdown");
		}
		info!("Node shut down;");
	}
}

/// Keeps the interval check in step with the stored collections.
async fn feed_scheduler(
	storage: MemoryStore,
	scheduler: IntervalCheck,
	changes_rx: chan::Receiver<SubscriberMessage>,
	cancel_token: CancellationToken,
) {
	enum StreamMessage {
		Change(SubscriberMessage),
		Stop,
	}

	let cancel = pin!(cancel_token.cancelled());

	let mut msg_stream = pin!((
		changes_rx.map(StreamMessage::Change),
		cancel.into_stream().map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		let change = match msg {
			StreamMessage::Change(SubscriberMessage::Change(change)) => change,
			StreamMessage::Change(SubscriberMessage::Debug(_)) => continue,
			StreamMessage::Stop => break,
		};

		if let Err(e) = scheduler_update(&storage, &scheduler, change).await {
			match e {
				Error::SchedulerStopped => break,
				e => warn!(?e, "Failed to update the interval check"),
			}
		}
	}

	debug!("Interval check feed stopped;");
}

async fn scheduler_update(
	storage: &MemoryStore,
	scheduler: &IntervalCheck,
	change: ChangeNotification,
) -> Result<(), Error> {
	let EntityRef::Collection(id) = change.subject else {
		return Ok(());
	};

	if change.operation == Operation::Remove {
		return scheduler.collection_removed(id).await;
	}

	match storage.fetch_collection(id).await? {
		Some(collection) if change.operation == Operation::Add => {
			scheduler.collection_added(collection).await
		}
		Some(collection) => scheduler.collection_changed(collection).await,
		// removed again before we got to it
		None => scheduler.collection_removed(id).await,
	}
}

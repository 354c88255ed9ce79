use pimd_core_storage::NotificationSink;
use pimd_protocol::{ChangeNotification, DebugChangeNotification, EntityKind, SubscriberId};

use std::{
	collections::{HashMap, HashSet},
	pin::pin,
	sync::Arc,
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use serde::{Deserialize, Serialize};
use tokio::{
	spawn,
	sync::{oneshot, Semaphore},
	time::sleep,
};
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, instrument, trace, warn};

use super::{Error, NotificationQueue, Subscriber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
	/// How long changes are collected before being emitted.
	pub interval_ms: u64,
	/// Subscribers being notified at the same time.
	pub max_workers: usize,
	/// Batches a subscriber may leave undelivered before it counts as stalled and is dropped.
	pub max_backlog: usize,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			interval_ms: 50,
			max_workers: 5,
			max_backlog: 1024,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
	pub subscribers: usize,
	pub debugging: usize,
	pub pending: usize,
}

enum Command {
	Notify(Vec<ChangeNotification>),
	Register(Arc<dyn Subscriber>),
	Forget(SubscriberId),
	SetDebugging(SubscriberId, bool),
	Flush(oneshot::Sender<()>),
	Stats(oneshot::Sender<ManagerStats>),
}

enum Delivery {
	Changes {
		batch: Arc<[ChangeNotification]>,
		accepted_tx: Option<oneshot::Sender<Vec<bool>>>,
	},
	Debug(DebugChangeNotification),
}

/// Server side fan-out of committed changes.
///
/// Changes are collected for a short interval, then every registered subscriber gets the
/// batch. Each subscriber is served by its own worker draining a FIFO queue, so its stream is
/// never reordered, and a shared semaphore bounds how many subscribers are being notified at
/// any time. While any subscriber asked for notification debugging, emission becomes
/// sequential so that each change can be reported along with the subscribers that took it.
///
/// A subscriber that stops draining its connection is dropped once its backlog is full,
/// closing the connection after what was already handed over.
#[derive(Clone)]
pub struct NotificationManager {
	commands_tx: chan::Sender<Command>,
	_cancel_loop: Arc<DropGuard>,
}

impl NotificationManager {
	#[must_use]
	pub fn new(config: ManagerConfig) -> Self {
		let (commands_tx, commands_rx) = chan::bounded(256);
		let cancel_token = CancellationToken::new();

		let (timer_tx, timer_rx) = chan::bounded(1);

		debug!(
			interval_ms = config.interval_ms,
			max_workers = config.max_workers,
			"Starting notification manager;"
		);

		spawn(
			Actor {
				workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
				max_backlog: config.max_backlog.max(1),
				interval: Duration::from_millis(config.interval_ms),
				pending: NotificationQueue::new(),
				subscribers: HashMap::new(),
				debugging: HashSet::new(),
				timer_armed: false,
				timer_tx,
			}
			.run(commands_rx, timer_rx, cancel_token.child_token()),
		);

		Self {
			commands_tx,
			_cancel_loop: Arc::new(cancel_token.drop_guard()),
		}
	}

	async fn send(&self, command: Command) -> Result<(), Error> {
		self.commands_tx
			.send(command)
			.await
			.map_err(|_| Error::ManagerStopped)
	}

	pub async fn register(&self, subscriber: Arc<dyn Subscriber>) -> Result<(), Error> {
		self.send(Command::Register(subscriber)).await
	}

	pub async fn forget(&self, id: SubscriberId) -> Result<(), Error> {
		self.send(Command::Forget(id)).await
	}

	pub async fn set_debugging(&self, id: SubscriberId, enabled: bool) -> Result<(), Error> {
		self.send(Command::SetDebugging(id, enabled)).await
	}

	/// Queues changes for the next emission. Never fails the caller.
	pub async fn notify(&self, changes: Vec<ChangeNotification>) {
		if changes.is_empty() {
			return;
		}

		if self.send(Command::Notify(changes)).await.is_err() {
			error!("Notification manager is gone, dropping changes");
		}
	}

	/// Emits whatever is pending right away.
	pub async fn flush(&self) -> Result<(), Error> {
		let (tx, rx) = oneshot::channel();
		self.send(Command::Flush(tx)).await?;
		rx.await.map_err(|_| Error::ManagerStopped)
	}

	pub async fn stats(&self) -> Result<ManagerStats, Error> {
		let (tx, rx) = oneshot::channel();
		self.send(Command::Stats(tx)).await?;
		rx.await.map_err(|_| Error::ManagerStopped)
	}
}

#[async_trait]
impl NotificationSink for NotificationManager {
	async fn notify(&self, changes: Vec<ChangeNotification>) {
		Self::notify(self, changes).await;
	}
}

struct Entry {
	subscriber: Arc<dyn Subscriber>,
	deliveries_tx: chan::Sender<Delivery>,
	abandon: CancellationToken,
}

/// Hands a delivery to the subscriber's worker, `false` when its backlog is full.
fn deliver(entry: &Entry, delivery: Delivery) -> bool {
	match entry.deliveries_tx.try_send(delivery) {
		Ok(()) => true,
		Err(chan::TrySendError::Full(_)) => false,
		Err(chan::TrySendError::Closed(_)) => {
			trace!(name = entry.subscriber.name(), "Subscriber worker is gone");
			true
		}
	}
}

struct Actor {
	workers: Arc<Semaphore>,
	max_backlog: usize,
	interval: Duration,
	pending: NotificationQueue,
	subscribers: HashMap<SubscriberId, Entry>,
	debugging: HashSet<SubscriberId>,
	timer_armed: bool,
	timer_tx: chan::Sender<()>,
}

impl Actor {
	async fn run(
		mut self,
		commands_rx: chan::Receiver<Command>,
		timer_rx: chan::Receiver<()>,
		cancel_token: CancellationToken,
	) {
		enum StreamMessage {
			Command(Command),
			Timeout,
			Stop,
		}

		let cancel = pin!(cancel_token.cancelled());

		let mut msg_stream = pin!((
			commands_rx.map(StreamMessage::Command),
			timer_rx.map(|()| StreamMessage::Timeout),
			cancel.into_stream().map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Command(Command::Notify(changes)) => self.enqueue(changes),

				StreamMessage::Command(Command::Register(subscriber)) => self.register(subscriber),

				StreamMessage::Command(Command::Forget(id)) => self.forget(id),

				StreamMessage::Command(Command::SetDebugging(id, enabled)) => {
					self.set_debugging(id, enabled);
				}

				StreamMessage::Command(Command::Flush(tx)) => {
					self.emit_pending().await;
					tx.send(()).ok();
				}

				StreamMessage::Command(Command::Stats(tx)) => {
					tx.send(ManagerStats {
						subscribers: self.subscribers.len(),
						debugging: self.debugging.len(),
						pending: self.pending.len(),
					})
					.ok();
				}

				StreamMessage::Timeout => {
					self.timer_armed = false;
					self.emit_pending().await;
				}

				StreamMessage::Stop => {
					debug!("Notification manager is stopping");
					self.emit_pending().await;
					break;
				}
			}
		}
	}

	fn enqueue(&mut self, changes: Vec<ChangeNotification>) {
		for change in changes {
			match change.kind() {
				EntityKind::Collection => {
					self.pending.append_and_compress(change);
				}
				EntityKind::Item => self.pending.push(change),
			}
		}

		if !self.timer_armed && !self.pending.is_empty() {
			self.timer_armed = true;

			let timer_tx = self.timer_tx.clone();
			let interval = self.interval;
			spawn(async move {
				sleep(interval).await;
				timer_tx.send(()).await.ok();
			});
		}
	}

	#[instrument(skip(self, subscriber), fields(id = %subscriber.id(), name = subscriber.name()))]
	fn register(&mut self, subscriber: Arc<dyn Subscriber>) {
		let id = subscriber.id();
		if self.subscribers.contains_key(&id) {
			warn!("Subscriber registered twice, ignoring");
			return;
		}

		let (deliveries_tx, deliveries_rx) = chan::bounded(self.max_backlog);
		let abandon = CancellationToken::new();

		spawn(serve(
			Arc::clone(&subscriber),
			deliveries_rx,
			Arc::clone(&self.workers),
			abandon.clone(),
		));

		self.subscribers.insert(
			id,
			Entry {
				subscriber,
				deliveries_tx,
				abandon,
			},
		);

		debug!("Registered subscriber;");
	}

	fn forget(&mut self, id: SubscriberId) {
		if let Some(entry) = self.subscribers.remove(&id) {
			entry.abandon.cancel();
			debug!(%id, name = entry.subscriber.name(), "Forgot subscriber;");
		}
		self.debugging.remove(&id);
	}

	fn set_debugging(&mut self, id: SubscriberId, enabled: bool) {
		if !self.subscribers.contains_key(&id) {
			warn!(%id, "Can't toggle debugging for an unknown subscriber");
			return;
		}

		if enabled {
			self.debugging.insert(id);
		} else {
			self.debugging.remove(&id);
		}

		debug!(debugging = self.debugging.len(), "Notification debugging toggled;");
	}

	fn prune_dead(&mut self) {
		let debugging = &mut self.debugging;
		self.subscribers.retain(|id, entry| {
			let alive = entry.subscriber.is_alive();
			if !alive {
				debug!(%id, name = entry.subscriber.name(), "Subscriber went away;");
				entry.abandon.cancel();
				debugging.remove(id);
			}
			alive
		});
	}

	fn drop_stalled(&mut self, stalled: Vec<SubscriberId>) {
		for id in stalled {
			warn!(%id, "Subscriber stopped draining its notifications, dropping it");
			self.forget(id);
		}
	}

	async fn emit_pending(&mut self) {
		if self.pending.is_empty() {
			return;
		}

		self.prune_dead();

		let batch = self.pending.take();
		trace!(count = batch.len(), subscribers = self.subscribers.len(), "Emitting changes;");

		if self.debugging.is_empty() {
			let batch = Arc::<[ChangeNotification]>::from(batch);
			let stalled = self
				.subscribers
				.iter()
				.filter(|(_, entry)| {
					!deliver(
						entry,
						Delivery::Changes {
							batch: Arc::clone(&batch),
							accepted_tx: None,
						},
					)
				})
				.map(|(id, _)| *id)
				.collect();

			self.drop_stalled(stalled);
		} else {
			for change in batch {
				self.emit_debug(change).await;
			}
		}
	}

	async fn emit_debug(&mut self, change: ChangeNotification) {
		let batch = Arc::<[ChangeNotification]>::from(vec![change.clone()]);

		let mut stalled = Vec::new();
		let mut replies = Vec::with_capacity(self.subscribers.len());
		for (id, entry) in &self.subscribers {
			let (accepted_tx, accepted_rx) = oneshot::channel();
			if deliver(
				entry,
				Delivery::Changes {
					batch: Arc::clone(&batch),
					accepted_tx: Some(accepted_tx),
				},
			) {
				replies.push((entry.subscriber.name().to_string(), accepted_rx));
			} else {
				stalled.push(*id);
			}
		}

		let mut listeners = Vec::with_capacity(replies.len());
		for (name, accepted_rx) in replies {
			if accepted_rx
				.await
				.is_ok_and(|accepted| accepted.first() == Some(&true))
			{
				listeners.push(name);
			}
		}

		let notification = DebugChangeNotification {
			notification: change,
			listeners,
			timestamp: Utc::now(),
		};

		for (id, entry) in &self.subscribers {
			if !deliver(entry, Delivery::Debug(notification.clone())) && !stalled.contains(id) {
				stalled.push(*id);
			}
		}

		self.drop_stalled(stalled);
	}
}

/// Drains one subscriber's deliveries in order.
async fn serve(
	subscriber: Arc<dyn Subscriber>,
	deliveries_rx: chan::Receiver<Delivery>,
	workers: Arc<Semaphore>,
	abandon: CancellationToken,
) {
	while let Ok(delivery) = deliveries_rx.recv().await {
		if abandon.is_cancelled() || !subscriber.is_alive() {
			break;
		}

		let Ok(_permit) = workers.acquire().await else {
			break;
		};

		match delivery {
			Delivery::Changes { batch, accepted_tx } => {
				let mut accepted = Vec::with_capacity(batch.len());

				for change in batch.iter() {
					if abandon.is_cancelled() || !subscriber.is_alive() {
						trace!(
							name = subscriber.name(),
							abandoned = batch.len() - accepted.len(),
							"Abandoning changes for a departed subscriber;"
						);
						break;
					}

					accepted.push(subscriber.notify(change).await);
				}

				if let Some(accepted_tx) = accepted_tx {
					accepted_tx.send(accepted).ok();
				}
			}

			Delivery::Debug(notification) => subscriber.notify_debug(&notification).await,
		}
	}

	trace!(name = subscriber.name(), "Subscriber worker finished");
}

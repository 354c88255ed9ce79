use crate::Error;

use pimd_protocol::{Collection, CollectionId};

use std::{
	collections::{BTreeMap, HashMap},
	future::pending,
	pin::pin,
	sync::Arc,
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use serde::{Deserialize, Serialize};
use tokio::{
	spawn,
	sync::oneshot,
	time::{sleep_until, Instant},
};
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace};

/// Checks due within this window of each other run together.
const COALESCE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Floor for any collection's check interval.
	pub min_sync_interval_minutes: u32,
	/// Floor for the collection tree sync of a resource.
	pub min_tree_sync_interval_minutes: u32,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			min_sync_interval_minutes: 5,
			min_tree_sync_interval_minutes: 5,
		}
	}
}

/// The item retrieval machinery the scheduler asks to sync things.
#[async_trait]
pub trait SyncRequestHandler: Send + Sync + 'static {
	async fn request_collection_sync(&self, resource: &str, collection: CollectionId);

	async fn request_collection_tree_sync(&self, resource: &str);
}

/// Handler for a node without any resource attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSyncRequests;

#[async_trait]
impl SyncRequestHandler for LogSyncRequests {
	async fn request_collection_sync(&self, resource: &str, collection: CollectionId) {
		info!(%resource, %collection, "Collection sync requested;");
	}

	async fn request_collection_tree_sync(&self, resource: &str) {
		info!(%resource, "Collection tree sync requested;");
	}
}

#[derive(Debug)]
enum Command {
	Added(Collection),
	Changed(Collection),
	Removed(CollectionId),
	SyncNow(Collection),
	Inhibit(bool),
	Scheduled(oneshot::Sender<usize>),
}

/// Periodically asks for collections to be synced, according to their check interval.
///
/// Only subscribed collections with a non zero interval are scheduled. Intervals below the
/// configured minimum are raised to it.
#[derive(Clone)]
pub struct IntervalCheck {
	commands_tx: chan::Sender<Command>,
	_cancel_loop: Arc<DropGuard>,
}

impl IntervalCheck {
	#[must_use]
	pub fn new(config: SchedulerConfig, handler: Arc<dyn SyncRequestHandler>) -> Self {
		let (commands_tx, commands_rx) = chan::bounded(64);
		let cancel_token = CancellationToken::new();

		debug!(?config, "Starting interval check;");

		spawn(
			Actor {
				config,
				handler,
				collections: HashMap::new(),
				schedule: BTreeMap::new(),
				next_checks: HashMap::new(),
				last_checks: HashMap::new(),
				last_tree_syncs: HashMap::new(),
				inhibited: false,
			}
			.run(commands_rx, cancel_token.child_token()),
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
			.map_err(|_| Error::SchedulerStopped)
	}

	pub async fn collection_added(&self, collection: Collection) -> Result<(), Error> {
		self.send(Command::Added(collection)).await
	}

	pub async fn collection_changed(&self, collection: Collection) -> Result<(), Error> {
		self.send(Command::Changed(collection)).await
	}

	pub async fn collection_removed(&self, id: CollectionId) -> Result<(), Error> {
		self.send(Command::Removed(id)).await
	}

	/// Expires the collection right away, still at most once per interval.
	pub async fn request_collection_sync(&self, collection: Collection) -> Result<(), Error> {
		self.send(Command::SyncNow(collection)).await
	}

	/// Pauses the timer, checks that came due meanwhile run once resumed.
	pub async fn inhibit(&self, inhibited: bool) -> Result<(), Error> {
		self.send(Command::Inhibit(inhibited)).await
	}

	/// Number of collections currently scheduled.
	pub async fn scheduled(&self) -> Result<usize, Error> {
		let (tx, rx) = oneshot::channel();
		self.send(Command::Scheduled(tx)).await?;
		rx.await.map_err(|_| Error::SchedulerStopped)
	}
}

fn should_schedule(collection: &Collection) -> bool {
	collection.check_interval_minutes > 0 && collection.subscribed
}

fn has_changed(old: &Collection, new: &Collection) -> bool {
	old.check_interval_minutes != new.check_interval_minutes || old.subscribed != new.subscribed
}

fn minutes(minutes: u32) -> Duration {
	Duration::from_secs(u64::from(minutes) * 60)
}

struct Actor {
	config: SchedulerConfig,
	handler: Arc<dyn SyncRequestHandler>,
	collections: HashMap<CollectionId, Collection>,
	schedule: BTreeMap<Instant, Vec<CollectionId>>,
	next_checks: HashMap<CollectionId, Instant>,
	last_checks: HashMap<CollectionId, Instant>,
	last_tree_syncs: HashMap<String, Instant>,
	inhibited: bool,
}

impl Actor {
	async fn run(mut self, commands_rx: chan::Receiver<Command>, cancel_token: CancellationToken) {
		enum StreamMessage {
			Command(Command),
			Expired,
			Stop,
		}

		loop {
			let deadline = if self.inhibited {
				None
			} else {
				self.schedule.keys().next().copied()
			};

			let timer = async move {
				match deadline {
					Some(deadline) => sleep_until(deadline).await,
					None => pending().await,
				}
			};
			let cancel = pin!(cancel_token.cancelled());

			let mut msg_stream = pin!((
				commands_rx.clone().map(StreamMessage::Command),
				timer.into_stream().map(|()| StreamMessage::Expired),
				cancel.into_stream().map(|()| StreamMessage::Stop),
			)
				.merge());

			match msg_stream.next().await {
				Some(StreamMessage::Command(command)) => self.handle(command).await,
				Some(StreamMessage::Expired) => self.expire(Instant::now()).await,
				Some(StreamMessage::Stop) | None => {
					debug!("Interval check stopped;");
					break;
				}
			}
		}
	}

	async fn handle(&mut self, command: Command) {
		match command {
			Command::Added(collection) => self.collection_added(collection),
			Command::Changed(collection) => self.collection_changed(collection),
			Command::Removed(id) => {
				self.unschedule(id);
				self.collections.remove(&id);
				self.last_checks.remove(&id);
			}
			Command::SyncNow(collection) => {
				self.collection_expired(&collection, Instant::now()).await;
			}
			Command::Inhibit(inhibited) => {
				debug!(inhibited, "Interval check inhibition changed;");
				self.inhibited = inhibited;
			}
			Command::Scheduled(tx) => {
				tx.send(self.next_checks.len()).ok();
			}
		}
	}

	fn collection_added(&mut self, collection: Collection) {
		let Some(id) = collection.id else {
			return;
		};

		if !should_schedule(&collection) {
			trace!(%id, "Collection doesn't need interval checks;");
			return;
		}

		self.collections.insert(id, collection);
		self.schedule(id);
	}

	fn collection_changed(&mut self, collection: Collection) {
		let Some(id) = collection.id else {
			return;
		};

		if !self.collections.contains_key(&id) {
			self.collection_added(collection);
			return;
		}

		let changed = self
			.collections
			.get(&id)
			.is_some_and(|old| has_changed(old, &collection));

		if !should_schedule(&collection) {
			debug!(%id, "Collection no longer needs interval checks;");
			self.unschedule(id);
			self.collections.remove(&id);
			return;
		}

		self.collections.insert(id, collection);
		if changed {
			self.schedule(id);
		}
	}

	fn sync_interval(&self, collection: &Collection) -> Duration {
		minutes(
			collection
				.check_interval_minutes
				.max(self.config.min_sync_interval_minutes),
		)
	}

	fn tree_sync_interval(&self, collection: &Collection) -> Duration {
		minutes(
			collection
				.check_interval_minutes
				.max(self.config.min_tree_sync_interval_minutes),
		)
	}

	fn schedule(&mut self, id: CollectionId) {
		self.unschedule(id);

		let Some(collection) = self.collections.get(&id) else {
			return;
		};

		let next_check = Instant::now() + self.sync_interval(collection);
		let window_start = next_check
			.checked_sub(COALESCE_WINDOW)
			.unwrap_or(next_check);

		let next_check = self
			.schedule
			.range(window_start..=next_check + COALESCE_WINDOW)
			.map(|(at, _)| *at)
			.min_by_key(|at| {
				if *at > next_check {
					*at - next_check
				} else {
					next_check - *at
				}
			})
			.unwrap_or(next_check);

		trace!(%id, "Collection check scheduled;");

		self.schedule.entry(next_check).or_default().push(id);
		self.next_checks.insert(id, next_check);
	}

	fn unschedule(&mut self, id: CollectionId) {
		let Some(at) = self.next_checks.remove(&id) else {
			return;
		};

		if let Some(ids) = self.schedule.get_mut(&at) {
			ids.retain(|scheduled| *scheduled != id);
			if ids.is_empty() {
				self.schedule.remove(&at);
			}
		}
	}

	async fn expire(&mut self, now: Instant) {
		while let Some(entry) = self.schedule.first_entry() {
			if *entry.key() > now {
				break;
			}

			for id in entry.remove() {
				self.next_checks.remove(&id);

				if let Some(collection) = self.collections.get(&id).cloned() {
					self.collection_expired(&collection, now).await;
					self.schedule(id);
				}
			}
		}
	}

	#[instrument(skip_all, fields(collection = ?collection.id, resource = %collection.resource))]
	async fn collection_expired(&mut self, collection: &Collection, now: Instant) {
		let Some(id) = collection.id else {
			return;
		};

		if collection.parent.is_some_and(CollectionId::is_root) {
			let tree_interval = self.tree_sync_interval(collection);
			let due = self
				.last_tree_syncs
				.get(&collection.resource)
				.map_or(true, |last| now.duration_since(*last) >= tree_interval);

			if due {
				self.last_tree_syncs
					.insert(collection.resource.clone(), now);
				self.handler
					.request_collection_tree_sync(&collection.resource)
					.await;
			}
		}

		let interval = self.sync_interval(collection);
		if self
			.last_checks
			.get(&id)
			.is_some_and(|last| now.duration_since(*last) < interval)
		{
			trace!("Collection was checked recently, skipping;");
			return;
		}

		self.last_checks.insert(id, now);
		self.handler
			.request_collection_sync(&collection.resource, id)
			.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_subscribed_collections_with_an_interval_are_scheduled() {
		let collection = Collection::new(CollectionId(3), "inbox", CollectionId::ROOT);

		assert!(!should_schedule(&collection));
		assert!(should_schedule(&collection.clone().check_interval(10)));
		assert!(!should_schedule(
			&collection.check_interval(10).subscribed(false)
		));
	}

	#[test]
	fn renames_are_not_scheduling_changes() {
		let old = Collection::new(CollectionId(3), "inbox", CollectionId::ROOT).check_interval(10);
		let mut renamed = old.clone();
		renamed.name = "Inbox".to_string();

		assert!(!has_changed(&old, &renamed));
		assert!(has_changed(&old, &old.clone().check_interval(15)));
		assert!(has_changed(&old, &old.clone().subscribed(false)));
	}
}

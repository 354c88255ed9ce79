use pimd_core_storage::Storage;
use pimd_protocol::{CollectionId, Item, SessionId};

use std::sync::Arc;

use async_channel as chan;
use tokio::{
	spawn,
	sync::{oneshot, watch},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::{
	actor::{Actor, Batch, Command, Options},
	Error, ItemSyncConfig, MergeMode, SyncMode, SyncReport,
};

/// Where a sync job is at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
	/// Checking the target collection.
	#[default]
	Idle,
	AwaitingBatches,
	Processing,
	Committing,
	Succeeded,
	Failed,
	Cancelled,
}

impl SyncState {
	#[must_use]
	pub const fn is_finished(self) -> bool {
		matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
	}
}

/// Delivery bookkeeping, the caller side of the job.
#[derive(Debug, Default)]
struct Delivery {
	streaming: bool,
	total: Option<usize>,
	received: usize,
	mode: Option<SyncMode>,
	done: bool,
}

impl Delivery {
	fn accept(&mut self, mode: SyncMode, count: usize) -> Result<(), Error> {
		if self.done {
			return Err(Error::DeliveryAlreadyDone);
		}

		match self.mode {
			Some(current) if current != mode => {
				return Err(Error::SyncModeMismatch {
					current,
					requested: mode,
				});
			}
			_ => self.mode = Some(mode),
		}

		self.received += count;

		Ok(())
	}

	/// Reaching a declared total always completes delivery, without one only a non streaming
	/// delivery completes on its own.
	fn is_complete(&self) -> bool {
		self.total
			.map_or(!self.streaming, |total| self.received >= total)
	}
}

fn split(mut items: Vec<Item>, batch_size: usize) -> Vec<Vec<Item>> {
	let batch_size = batch_size.max(1);
	let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));

	while items.len() > batch_size {
		let rest = items.split_off(batch_size);
		batches.push(std::mem::replace(&mut items, rest));
	}

	if !items.is_empty() {
		batches.push(items);
	}

	batches
}

/// Synchronizes the items of one collection against what a resource reports.
///
/// Items are handed over with [`ItemSync::set_full_sync_items`] or
/// [`ItemSync::set_incremental_sync_items`]. Without streaming the first delivery is the whole
/// of it; with streaming, deliveries keep coming until [`ItemSync::delivery_done`] or until the
/// total announced through [`ItemSync::set_total_items`] arrived. The outcome is collected once
/// through [`ItemSync::result`].
///
/// Dropping the job before it finished cancels it.
pub struct ItemSync {
	collection: CollectionId,
	options: Options,
	delivery: Delivery,
	result_rx: oneshot::Receiver<Result<SyncReport, Error>>,
	state_rx: watch::Receiver<SyncState>,
	cancel_token: CancellationToken,
	_cancel_on_drop: DropGuard,
	// dropped after the guard, a dropped job is cancelled before its delivery ends
	commands_tx: chan::Sender<Command>,
}

impl ItemSync {
	#[must_use]
	pub fn new(storage: Arc<dyn Storage>, collection: CollectionId, session: SessionId) -> Self {
		Self::with_config(storage, collection, session, &ItemSyncConfig::default())
	}

	#[must_use]
	pub fn with_config(
		storage: Arc<dyn Storage>,
		collection: CollectionId,
		session: SessionId,
		config: &ItemSyncConfig,
	) -> Self {
		let options = Options {
			merge_mode: MergeMode::default(),
			batch_size: config.batch_size.max(1),
		};

		let (commands_tx, commands_rx) = chan::bounded(8);
		let (result_tx, result_rx) = oneshot::channel();
		let (state_tx, state_rx) = watch::channel(SyncState::Idle);
		let cancel_token = CancellationToken::new();

		spawn(
			Actor::new(
				storage,
				collection,
				session,
				options,
				commands_rx,
				state_tx,
				cancel_token.clone(),
			)
			.run(result_tx),
		);

		Self {
			collection,
			options,
			delivery: Delivery::default(),
			commands_tx,
			result_rx,
			state_rx,
			_cancel_on_drop: cancel_token.clone().drop_guard(),
			cancel_token,
		}
	}

	#[must_use]
	pub const fn collection(&self) -> CollectionId {
		self.collection
	}

	#[must_use]
	pub fn state(&self) -> SyncState {
		*self.state_rx.borrow()
	}

	pub fn set_streaming_enabled(&mut self, enabled: bool) {
		self.delivery.streaming = enabled;
	}

	/// Announces how many items a full sync will deliver in total. A total of zero lists an empty
	/// collection.
	pub async fn set_total_items(&mut self, total: usize) {
		if self.delivery.done {
			return;
		}

		self.delivery.total = Some(total);
		self.start_full_sync().await;
		self.complete_delivery_if_due().await;
	}

	pub async fn set_merge_mode(&mut self, merge_mode: MergeMode) {
		self.options.merge_mode = merge_mode;
		self.send(Command::Options(self.options)).await;
	}

	pub async fn set_batch_size(&mut self, batch_size: usize) {
		self.options.batch_size = batch_size.max(1);
		self.send(Command::Options(self.options)).await;
	}

	/// Delivers (part of) the complete content of the collection.
	pub async fn set_full_sync_items(&mut self, items: Vec<Item>) -> Result<(), Error> {
		self.delivery.accept(SyncMode::Full, items.len())?;

		// even an empty full delivery means something: nothing is left remotely
		let mut batches = split(items, self.options.batch_size);
		if batches.is_empty() {
			batches.push(Vec::new());
		}

		for items in batches {
			self.send(Command::Batch(Batch::Full(items))).await;
		}

		self.complete_delivery_if_due().await;

		Ok(())
	}

	/// Delivers changed items and references to deleted ones.
	pub async fn set_incremental_sync_items(
		&mut self,
		changed: Vec<Item>,
		deleted: Vec<Item>,
	) -> Result<(), Error> {
		self.delivery
			.accept(SyncMode::Incremental, changed.len() + deleted.len())?;

		for changed in split(changed, self.options.batch_size) {
			self.send(Command::Batch(Batch::Incremental {
				changed,
				deleted: Vec::new(),
			}))
			.await;
		}

		for deleted in split(deleted, self.options.batch_size) {
			self.send(Command::Batch(Batch::Incremental {
				changed: Vec::new(),
				deleted,
			}))
			.await;
		}

		self.complete_delivery_if_due().await;

		Ok(())
	}

	/// Marks the delivered items as complete. Calling it again is harmless.
	///
	/// Ending delivery before anything was delivered is an empty full sync.
	pub async fn delivery_done(&mut self) {
		if self.delivery.done {
			trace!("Delivery was already done");
			return;
		}

		self.start_full_sync().await;
		self.delivery.done = true;
		debug!(
			collection = %self.collection,
			received = self.delivery.received,
			"Item delivery done;"
		);
		self.send(Command::DeliveryDone).await;
	}

	/// Cancels the job at its next batch boundary. Committed batches stay committed.
	pub fn rollback(&self) {
		debug!(collection = %self.collection, "Sync rollback requested;");
		self.cancel_token.cancel();
	}

	/// Waits for the job to finish.
	///
	/// No more items can be delivered after this, so whatever arrived so far is taken as the
	/// complete delivery.
	pub async fn result(self) -> Result<SyncReport, Error> {
		let Self {
			result_rx,
			commands_tx,
			_cancel_on_drop,
			..
		} = self;

		// a closed command channel ends delivery
		drop(commands_tx);

		result_rx.await.map_err(|_| Error::JobStopped)?
	}

	/// Commits a job nothing was delivered to yet to a full sync, the empty batch records what
	/// is stored before any listing arrives.
	async fn start_full_sync(&mut self) {
		if self.delivery.mode.is_some() {
			return;
		}

		if self.delivery.accept(SyncMode::Full, 0).is_ok() {
			self.send(Command::Batch(Batch::Full(Vec::new()))).await;
		}
	}

	async fn complete_delivery_if_due(&mut self) {
		if self.delivery.is_complete() {
			self.delivery_done().await;
		}
	}

	async fn send(&self, command: Command) {
		if self.commands_tx.send(command).await.is_err() {
			trace!(collection = %self.collection, "Sync job already finished, dropping command");
		}
	}
}

use pimd_core_storage::{self as storage, ItemScope, Storage, Transaction};
use pimd_protocol::{CollectionId, Item, ItemId, SessionId};

use std::{
	collections::{HashSet, VecDeque},
	fmt,
	pin::pin,
	sync::Arc,
};

use async_channel as chan;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use tokio::sync::{oneshot, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{
	job::SyncState,
	plan::{self, LocalItems, Write},
	Error, MergeMode, SyncMode, SyncReport,
};

#[derive(Debug, Clone, Copy)]
pub struct Options {
	pub merge_mode: MergeMode,
	pub batch_size: usize,
}

#[derive(Debug)]
pub enum Batch {
	Full(Vec<Item>),
	Incremental {
		changed: Vec<Item>,
		deleted: Vec<Item>,
	},
}

#[derive(Debug)]
pub enum Command {
	Batch(Batch),
	Options(Options),
	DeliveryDone,
}

/// One unit of work, applied in a single transaction.
#[derive(Debug)]
enum Step {
	Sync(Batch),
	/// Stored items a full sync didn't account for.
	Complement(Vec<ItemId>),
}

#[derive(Default)]
enum State {
	#[default]
	Idle,
	AwaitingBatches,
	Processing(Step),
	Committing {
		tx: Box<dyn Transaction>,
		ignored_deletions: usize,
	},
	Finished(Result<SyncReport, Error>),
}

impl fmt::Debug for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Idle => write!(f, "Idle"),
			Self::AwaitingBatches => write!(f, "AwaitingBatches"),
			Self::Processing(Step::Sync(_)) => write!(f, "Processing(Sync)"),
			Self::Processing(Step::Complement(ids)) => {
				write!(f, "Processing(Complement({}))", ids.len())
			}
			Self::Committing { tx, .. } => write!(f, "Committing({} writes)", tx.len()),
			Self::Finished(result) => write!(f, "Finished({result:?})"),
		}
	}
}

impl From<&State> for SyncState {
	fn from(state: &State) -> Self {
		match state {
			State::Idle => Self::Idle,
			State::AwaitingBatches => Self::AwaitingBatches,
			State::Processing(_) => Self::Processing,
			State::Committing { .. } => Self::Committing,
			State::Finished(Ok(_)) => Self::Succeeded,
			State::Finished(Err(Error::Cancelled)) => Self::Cancelled,
			State::Finished(Err(_)) => Self::Failed,
		}
	}
}

/// Applies delivered batches in arrival order, one transaction each.
pub struct Actor {
	state: State,
	storage: Arc<dyn Storage>,
	collection: CollectionId,
	session: SessionId,
	options: Options,
	mode: Option<SyncMode>,
	steps: VecDeque<Step>,
	delivery_done: bool,
	reconciled: bool,
	/// Stored items when the first full batch was processed.
	baseline: Option<HashSet<ItemId>>,
	matched: HashSet<ItemId>,
	report: SyncReport,
	first_failure: Option<storage::Error>,
	commands_rx: chan::Receiver<Command>,
	state_tx: watch::Sender<SyncState>,
	cancel_token: CancellationToken,
}

impl Actor {
	pub fn new(
		storage: Arc<dyn Storage>,
		collection: CollectionId,
		session: SessionId,
		options: Options,
		commands_rx: chan::Receiver<Command>,
		state_tx: watch::Sender<SyncState>,
		cancel_token: CancellationToken,
	) -> Self {
		Self {
			state: State::Idle,
			storage,
			collection,
			session,
			options,
			mode: None,
			steps: VecDeque::new(),
			delivery_done: false,
			reconciled: false,
			baseline: None,
			matched: HashSet::new(),
			report: SyncReport::default(),
			first_failure: None,
			commands_rx,
			state_tx,
			cancel_token,
		}
	}

	pub async fn run(mut self, result_tx: oneshot::Sender<Result<SyncReport, Error>>) {
		loop {
			self.tick().await;

			if matches!(self.state, State::Finished(_)) {
				break;
			}
		}

		let State::Finished(result) = std::mem::take(&mut self.state) else {
			return;
		};

		match &result {
			Ok(report) => debug!(collection = %self.collection, ?report, "Item sync succeeded;"),
			Err(e) => debug!(collection = %self.collection, %e, "Item sync finished with error;"),
		}

		if result_tx.send(result).is_err() {
			trace!("Nobody is waiting for the item sync result");
		}
	}

	#[instrument(skip(self), fields(collection = %self.collection, old_state = ?self.state))]
	async fn tick(&mut self) {
		let state = match std::mem::take(&mut self.state) {
			State::Idle => self.idle_state_transition().await,
			State::AwaitingBatches => self.awaiting_batches_state_transition().await,
			State::Processing(step) => self.processing_state_transition(step).await,
			State::Committing {
				tx,
				ignored_deletions,
			} => self.committing_state_transition(tx, ignored_deletions).await,
			finished @ State::Finished(_) => finished,
		};

		trace!(?state, "Item sync state transitioned;");

		self.state_tx.send_replace(SyncState::from(&state));
		self.state = state;
	}

	async fn idle_state_transition(&mut self) -> State {
		match self.storage.fetch_collection(self.collection).await {
			Ok(Some(_)) => State::AwaitingBatches,
			Ok(None) => State::Finished(Err(Error::CollectionNotFound(self.collection))),
			Err(e) => State::Finished(Err(e.into())),
		}
	}

	async fn awaiting_batches_state_transition(&mut self) -> State {
		enum StreamMessage {
			Command(Command),
			Cancel,
		}

		if self.cancel_token.is_cancelled() {
			return State::Finished(Err(Error::Cancelled));
		}

		if let Some(step) = self.steps.pop_front() {
			return State::Processing(step);
		}

		if self.delivery_done {
			return self.reconcile().await;
		}

		let cancel = pin!(self.cancel_token.cancelled());

		let mut msg_stream = pin!((
			self.commands_rx.clone().map(StreamMessage::Command),
			cancel.into_stream().map(|()| StreamMessage::Cancel),
		)
			.merge());

		match msg_stream.next().await {
			Some(StreamMessage::Command(Command::Batch(batch))) => {
				let mode = match batch {
					Batch::Full(_) => SyncMode::Full,
					Batch::Incremental { .. } => SyncMode::Incremental,
				};
				self.mode.get_or_insert(mode);

				State::Processing(Step::Sync(batch))
			}

			Some(StreamMessage::Command(Command::Options(options))) => {
				trace!(?options, "Sync options changed;");
				self.options = options;
				State::AwaitingBatches
			}

			Some(StreamMessage::Command(Command::DeliveryDone)) => {
				self.delivery_done = true;
				State::AwaitingBatches
			}

			Some(StreamMessage::Cancel) => State::Finished(Err(Error::Cancelled)),

			None => {
				debug!("Sync job handle closed, delivery is done");
				self.delivery_done = true;
				State::AwaitingBatches
			}
		}
	}

	/// Queues the deletion of what a full sync left unaccounted for, then finishes.
	async fn reconcile(&mut self) -> State {
		if self.reconciled || self.mode != Some(SyncMode::Full) {
			return State::Finished(self.outcome());
		}
		self.reconciled = true;

		if self.report.failed_batches > 0 {
			warn!(
				failed_batches = self.report.failed_batches,
				"Skipping removal of unlisted items, the delivered set is incomplete"
			);
			return State::Finished(self.outcome());
		}

		let stored = match self
			.storage
			.fetch_items(&ItemScope::Collection(self.collection))
			.await
		{
			Ok(stored) => stored,
			Err(e) => return State::Finished(Err(e.into())),
		};

		let baseline = self.baseline.take().unwrap_or_default();
		let mut unlisted = stored
			.iter()
			.filter_map(|item| item.id)
			.filter(|id| baseline.contains(id) && !self.matched.contains(id))
			.collect::<Vec<_>>();

		debug!(count = unlisted.len(), "Removing items missing from the full sync;");

		let batch_size = self.options.batch_size.max(1);
		while !unlisted.is_empty() {
			let rest = unlisted.split_off(batch_size.min(unlisted.len()));
			self.steps
				.push_back(Step::Complement(std::mem::replace(&mut unlisted, rest)));
		}

		State::AwaitingBatches
	}

	async fn processing_state_transition(&mut self, step: Step) -> State {
		if self.cancel_token.is_cancelled() {
			return State::Finished(Err(Error::Cancelled));
		}

		let (writes, ignored_deletions) = match step {
			Step::Sync(batch) => match self.plan(batch).await {
				Ok(planned) => planned,
				Err(e) => return self.batch_failed(e),
			},
			Step::Complement(ids) => (ids.into_iter().map(Write::Delete).collect(), 0),
		};

		if writes.is_empty() {
			self.report.ignored_deletions += ignored_deletions;
			return State::AwaitingBatches;
		}

		let mut tx = match self.storage.begin_transaction(self.session).await {
			Ok(tx) => tx,
			Err(e) => return self.batch_failed(e),
		};

		for write in writes {
			let staged = match write {
				Write::Create(item) => tx.create_item(self.collection, item).await,
				Write::Update(item) => tx.update_item(item).await,
				Write::Delete(id) => tx.delete_item(id).await,
			};

			if let Err(e) = staged {
				tx.rollback().await;
				return self.batch_failed(e);
			}
		}

		State::Committing {
			tx,
			ignored_deletions,
		}
	}

	async fn plan(&mut self, batch: Batch) -> Result<(Vec<Write>, usize), storage::Error> {
		let local = LocalItems::new(
			self.storage
				.fetch_items(&ItemScope::Collection(self.collection))
				.await?,
		);

		let (changed, deleted) = match batch {
			Batch::Full(items) => {
				if self.baseline.is_none() {
					self.baseline = Some(local.ids().collect());
				}
				(items, Vec::new())
			}
			Batch::Incremental { changed, deleted } => (changed, deleted),
		};

		trace!(
			stored = local.len(),
			changed = changed.len(),
			deleted = deleted.len(),
			"Planning batch;"
		);

		let plan = plan::plan(&local, changed, deleted, self.options.merge_mode);
		self.matched.extend(plan.matched);

		Ok((plan.writes, plan.ignored_deletions))
	}

	async fn committing_state_transition(
		&mut self,
		tx: Box<dyn Transaction>,
		ignored_deletions: usize,
	) -> State {
		if self.cancel_token.is_cancelled() {
			tx.rollback().await;
			return State::Finished(Err(Error::Cancelled));
		}

		match tx.commit().await {
			Ok(summary) => {
				trace!(?summary, "Batch committed;");
				self.report.created += summary.created;
				self.report.updated += summary.updated;
				self.report.deleted += summary.deleted;
				self.report.ignored_deletions += ignored_deletions;
				State::AwaitingBatches
			}
			Err(e) => self.batch_failed(e),
		}
	}

	fn batch_failed(&mut self, e: storage::Error) -> State {
		if e.is_fatal() {
			warn!(?e, "Item sync hit a fatal storage error");
			return State::Finished(Err(e.into()));
		}

		warn!(?e, "Batch failed, continuing with the remaining deliveries");
		self.report.failed_batches += 1;
		self.first_failure.get_or_insert(e);

		State::AwaitingBatches
	}

	fn outcome(&mut self) -> Result<SyncReport, Error> {
		match self.first_failure.take() {
			Some(first) => Err(Error::BatchesFailed {
				failed: self.report.failed_batches,
				first,
			}),
			None => Ok(self.report),
		}
	}
}

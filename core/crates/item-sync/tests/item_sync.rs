use pimd_core_item_sync::{Error, ItemSync, MergeMode, SyncReport, SyncState};
use pimd_core_storage::{self as storage, ItemScope, MemoryStore, Storage};
use pimd_protocol::{ChangeNotification, Collection, CollectionId, Item, Operation, SessionId};

use std::{sync::Arc, time::Duration};

use async_channel as chan;
use rand::{distributions::Alphanumeric, Rng};
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

const MIME_TYPE: &str = "application/octet-stream";

struct Fixture {
	store: MemoryStore,
	collection: CollectionId,
	changes_rx: chan::Receiver<Vec<ChangeNotification>>,
}

impl Fixture {
	async fn with_items(count: usize) -> Self {
		let (changes_tx, changes_rx) = chan::unbounded();
		let store = MemoryStore::new().with_notification_sink(Arc::new(changes_tx));

		let collection = store
			.create_collection(
				Collection::new(CollectionId(2), "foo", CollectionId::ROOT)
					.resource("pimd_maildir_resource_0"),
			)
			.await
			.expect("collection");

		let fixture = Self {
			store,
			collection,
			changes_rx,
		};
		fixture
			.create((0..count).map(|i| {
				Item::with_remote_id(format!("rid{i}"))
					.gid(format!("gid{i}"))
					.mime_type(MIME_TYPE)
					.payload(b"payload1".to_vec())
			}))
			.await;
		fixture.changes();

		fixture
	}

	async fn create(&self, items: impl IntoIterator<Item = Item>) {
		let mut tx = self
			.store
			.begin_transaction(SessionId::new())
			.await
			.expect("tx");
		for item in items {
			tx.create_item(self.collection, item).await.expect("stage");
		}
		tx.commit().await.expect("commit");
	}

	fn sync(&self) -> ItemSync {
		ItemSync::new(
			Arc::new(self.store.clone()),
			self.collection,
			SessionId::new(),
		)
	}

	async fn items(&self) -> Vec<Item> {
		self.store
			.fetch_items(&ItemScope::Collection(self.collection))
			.await
			.expect("items")
	}

	/// Every change published since the last call.
	fn changes(&self) -> Vec<ChangeNotification> {
		let mut changes = Vec::new();
		while let Ok(batch) = self.changes_rx.try_recv() {
			changes.extend(batch);
		}
		changes
	}

	fn count(&self, changes: &[ChangeNotification], operation: Operation) -> usize {
		changes
			.iter()
			.filter(|change| change.operation == operation)
			.count()
	}
}

fn modified(item: Item, n: usize) -> Item {
	item.flag(format!("\\READ{n}"))
}

#[tokio::test]
#[traced_test]
async fn full_sync_of_unchanged_items_changes_nothing() -> Result<(), Error> {
	let fixture = Fixture::with_items(15).await;
	let items = fixture.items().await;
	assert_eq!(items.len(), 15);
	let mutations = fixture.store.mutation_count().await;

	let mut sync = fixture.sync();
	sync.set_full_sync_items(items).await?;
	let report = sync.result().await?;

	assert_eq!(report, SyncReport::default());
	assert_eq!(fixture.items().await.len(), 15);
	assert_eq!(fixture.store.mutation_count().await, mutations);
	assert!(fixture.changes().is_empty());

	Ok(())
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn streaming_full_sync_finishes_after_the_announced_total() -> Result<(), Error> {
	let fixture = Fixture::with_items(15).await;
	let items = fixture.items().await;

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);
	sync.set_total_items(items.len()).await;
	sleep(Duration::from_millis(10)).await;
	assert!(!sync.state().is_finished());

	let last = items.len() - 1;
	for (i, item) in items.into_iter().enumerate() {
		sync.set_full_sync_items(vec![modified(item, i)]).await?;
		sleep(Duration::from_millis(10)).await;
		if i < last {
			assert!(!sync.state().is_finished());
		}
	}

	// already done by reaching the total
	sync.delivery_done().await;

	let report = sync.result().await?;
	assert_eq!(report.updated, 15);
	assert_eq!(report.mutations(), 15);

	let changes = fixture.changes();
	assert_eq!(fixture.count(&changes, Operation::Modify), 15);
	assert_eq!(fixture.count(&changes, Operation::Add), 0);
	assert_eq!(fixture.count(&changes, Operation::Remove), 0);
	assert_eq!(fixture.items().await.len(), 15);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn full_sync_removes_items_missing_remotely() -> Result<(), Error> {
	let fixture = Fixture::with_items(15).await;
	let mut items = fixture.items().await;
	items.truncate(12);
	items.push(Item::with_remote_id("rid-new").mime_type(MIME_TYPE));

	let mut sync = fixture.sync();
	sync.set_batch_size(4).await;
	sync.set_full_sync_items(items).await?;
	let report = sync.result().await?;

	assert_eq!(
		report,
		SyncReport {
			created: 1,
			deleted: 3,
			..Default::default()
		}
	);

	let remaining = fixture.items().await;
	assert_eq!(remaining.len(), 13);
	assert!(remaining.iter().any(|item| item.remote_id == "rid-new"));
	assert!(!remaining.iter().any(|item| item.remote_id == "rid14"));

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn empty_full_listing_removes_every_item() -> Result<(), Error> {
	let fixture = Fixture::with_items(5).await;

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);
	sync.set_total_items(0).await;
	let report = sync.result().await?;

	assert_eq!(
		report,
		SyncReport {
			deleted: 5,
			..Default::default()
		}
	);
	assert!(fixture.items().await.is_empty());
	assert_eq!(fixture.count(&fixture.changes(), Operation::Remove), 5);

	// same for a streaming delivery that ends without a single batch
	fixture
		.create((0..3).map(|i| Item::with_remote_id(format!("rid{i}"))))
		.await;
	fixture.changes();

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);
	sync.delivery_done().await;
	assert_eq!(sync.result().await?.deleted, 3);
	assert!(fixture.items().await.is_empty());

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn awaiting_the_result_ends_a_streaming_delivery() -> Result<(), Error> {
	let fixture = Fixture::with_items(3).await;
	let item = fixture.items().await.remove(0);

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);
	sync.set_incremental_sync_items(vec![modified(item, 0)], Vec::new())
		.await?;

	let report = timeout(Duration::from_secs(2), sync.result())
		.await
		.expect("sync finishes")?;

	assert_eq!(report.updated, 1);
	assert_eq!(fixture.items().await.len(), 3);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn incremental_sync_deletes_by_reference() -> Result<(), Error> {
	let fixture = Fixture::with_items(15).await;
	let items = fixture.items().await;

	let mut sync = fixture.sync();
	sync.set_incremental_sync_items(items.clone(), Vec::new())
		.await?;
	assert_eq!(sync.result().await?, SyncReport::default());
	assert!(fixture.changes().is_empty());

	let mut unchanged = items;
	let full_item = unchanged.remove(0);
	let remote_id_only = Item::with_remote_id(unchanged.remove(0).remote_id);
	let random_remote_id = Item::with_remote_id(
		rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(100)
			.map(char::from)
			.collect::<String>(),
	);

	let mut sync = fixture.sync();
	sync.set_incremental_sync_items(
		unchanged.clone(),
		vec![full_item, remote_id_only, random_remote_id],
	)
	.await?;
	let report = sync.result().await?;

	assert_eq!(
		report,
		SyncReport {
			deleted: 2,
			ignored_deletions: 1,
			..Default::default()
		}
	);
	assert_eq!(fixture.items().await.len(), unchanged.len());

	let changes = fixture.changes();
	assert_eq!(fixture.count(&changes, Operation::Remove), 2);
	assert_eq!(changes.len(), 2);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn empty_incremental_sync_is_idempotent() -> Result<(), Error> {
	let fixture = Fixture::with_items(15).await;
	let mutations = fixture.store.mutation_count().await;

	let mut sync = fixture.sync();
	sync.set_incremental_sync_items(Vec::new(), Vec::new())
		.await?;
	let report = sync.result().await?;

	assert_eq!(report, SyncReport::default());
	assert_eq!(fixture.store.mutation_count().await, mutations);
	assert!(fixture.changes().is_empty());
	assert_eq!(fixture.items().await.len(), 15);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn gid_merge_updates_instead_of_duplicating() -> Result<(), Error> {
	let fixture = Fixture::with_items(0).await;
	fixture
		.create([
			Item::with_remote_id("rid1")
				.gid("gid1")
				.mime_type(MIME_TYPE)
				.payload(b"payload1".to_vec()),
			Item::with_remote_id("rid2")
				.gid("gid2")
				.mime_type(MIME_TYPE)
				.payload(b"payload1".to_vec()),
		])
		.await;

	let mut sync = fixture.sync();
	sync.set_merge_mode(MergeMode::Gid).await;
	sync.set_incremental_sync_items(
		vec![Item::with_remote_id("rid3")
			.gid("gid2")
			.mime_type(MIME_TYPE)
			.payload(b"payload2".to_vec())],
		Vec::new(),
	)
	.await?;
	assert_eq!(sync.result().await?.updated, 1);

	let items = fixture.items().await;
	assert_eq!(items.len(), 2);

	let merged = items
		.iter()
		.filter(|item| item.gid == "gid2")
		.collect::<Vec<_>>();
	assert_eq!(merged.len(), 1);
	assert_eq!(merged[0].remote_id, "rid3");
	assert_eq!(merged[0].payload, b"payload2");

	let untouched = items
		.iter()
		.find(|item| item.gid == "gid1")
		.expect("gid1 item");
	assert_eq!(untouched.remote_id, "rid1");
	assert_eq!(untouched.payload, b"payload1");

	Ok(())
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn failed_batch_does_not_end_a_streaming_sync() {
	let fixture = Fixture::with_items(15).await;
	let items = fixture.items().await;

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);

	// both new under the same remote id, the unique constraint rejects the batch
	let duplicate = Item::with_remote_id("dup").mime_type(MIME_TYPE);
	sync.set_incremental_sync_items(vec![duplicate.clone(), duplicate], Vec::new())
		.await
		.expect("delivered");

	for (i, item) in items.into_iter().enumerate().take(10) {
		sync.set_incremental_sync_items(vec![modified(item, i)], Vec::new())
			.await
			.expect("delivered");
		sleep(Duration::from_millis(10)).await;
		assert!(!sync.state().is_finished());
	}

	sleep(Duration::from_millis(100)).await;
	assert_eq!(sync.state(), SyncState::AwaitingBatches);

	sync.delivery_done().await;

	assert_eq!(
		sync.result().await,
		Err(Error::BatchesFailed {
			failed: 1,
			first: storage::Error::DuplicateKey {
				collection: fixture.collection,
				remote_id: "dup".to_string(),
			},
		})
	);

	// everything outside the failed batch made it
	let items = fixture.items().await;
	assert_eq!(items.len(), 15);
	assert_eq!(
		items.iter().filter(|item| !item.flags.is_empty()).count(),
		10
	);
	assert_eq!(
		fixture.count(&fixture.changes(), Operation::Modify),
		10
	);
}

#[tokio::test]
#[traced_test]
async fn duplicate_in_full_sync_fails_without_removing_anything() {
	let fixture = Fixture::with_items(15).await;
	let mut items = fixture.items().await;
	let duplicate = Item::with_remote_id("dup").mime_type(MIME_TYPE);
	items.push(duplicate.clone());
	items.push(duplicate);

	let mut sync = fixture.sync();
	sync.set_full_sync_items(items).await.expect("delivered");

	let result = sync.result().await;
	assert!(matches!(
		result,
		Err(Error::BatchesFailed { failed: 1, .. })
	));

	assert_eq!(fixture.items().await.len(), 15);
	assert!(fixture.changes().is_empty());
}

#[tokio::test]
#[traced_test]
async fn rollback_cancels_with_a_user_message() {
	let fixture = Fixture::with_items(100).await;
	let items = fixture
		.items()
		.await
		.into_iter()
		.enumerate()
		.map(|(i, item)| modified(item, i))
		.collect::<Vec<_>>();

	let mut sync = fixture.sync();
	sync.set_full_sync_items(items).await.expect("delivered");
	sync.rollback();

	let result = sync.result().await;
	assert_eq!(result, Err(Error::Cancelled));
	assert_eq!(
		result.map_err(|e| e.to_string()),
		Err("User canceled operation.".to_string())
	);
	assert_eq!(fixture.items().await.len(), 100);
}

#[tokio::test]
#[traced_test]
async fn deliveries_are_checked() -> Result<(), Error> {
	let fixture = Fixture::with_items(2).await;
	let items = fixture.items().await;

	let mut sync = fixture.sync();
	sync.set_incremental_sync_items(items.clone(), Vec::new())
		.await?;
	assert_eq!(
		sync.set_incremental_sync_items(items.clone(), Vec::new())
			.await,
		Err(Error::DeliveryAlreadyDone)
	);
	sync.result().await?;

	let mut sync = fixture.sync();
	sync.set_streaming_enabled(true);
	sync.set_full_sync_items(items.clone()).await?;
	assert!(matches!(
		sync.set_incremental_sync_items(items, Vec::new()).await,
		Err(Error::SyncModeMismatch { .. })
	));
	sync.delivery_done().await;
	sync.delivery_done().await;
	sync.result().await?;

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn storage_failures_end_the_job() {
	let fixture = Fixture::with_items(1).await;

	let sync = ItemSync::new(
		Arc::new(fixture.store.clone()),
		CollectionId(42),
		SessionId::new(),
	);
	assert_eq!(
		sync.result().await,
		Err(Error::CollectionNotFound(CollectionId(42)))
	);

	fixture.store.set_available(false).await;
	let mut sync = fixture.sync();
	sync.set_full_sync_items(Vec::new())
		.await
		.expect("delivered");
	assert_eq!(
		sync.result().await,
		Err(Error::Storage(storage::Error::Unavailable))
	);
}

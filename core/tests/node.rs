use pimd_core::{Node, NodeConfig, SyncRequestHandler};
use pimd_protocol::{
	Collection, CollectionId, Interest, Item, Notification, Operation, SessionId,
	SubscriptionFilter,
};

use std::{sync::Arc, time::Duration};

use async_channel as chan;
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

const RESOURCE: &str = "pimd_maildir_resource_0";

struct Recorder(chan::Sender<(String, CollectionId)>);

#[async_trait]
impl SyncRequestHandler for Recorder {
	async fn request_collection_sync(&self, resource: &str, collection: CollectionId) {
		self.0.send((resource.to_string(), collection)).await.ok();
	}

	async fn request_collection_tree_sync(&self, _resource: &str) {}
}

async fn node(dir: &tempfile::TempDir) -> (Arc<Node>, chan::Receiver<(String, CollectionId)>) {
	let mut config = NodeConfig::default_with_dir(dir.path().to_path_buf());
	config.notifications.interval_ms = 5;
	config.item_sync.batch_size = 2;

	let (tx, rx) = chan::unbounded();
	let node = Node::new(config, Arc::new(Recorder(tx)))
		.await
		.expect("node starts");

	(node, rx)
}

async fn next(rx: &chan::Receiver<Notification>) -> Notification {
	timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("notification in time")
		.expect("monitor running")
}

async fn wait_for_scheduled(node: &Node, expected: usize) {
	timeout(Duration::from_secs(60), async {
		while node.scheduler().scheduled().await.expect("running") != expected {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("interval check caught up");
}

#[tokio::test]
#[traced_test]
async fn synced_items_reach_monitors() {
	let dir = tempfile::tempdir().expect("temp dir");
	let (node, _requests) = node(&dir).await;

	let (_handle, notifications) = node
		.monitor("client", SubscriptionFilter::all(), Interest::all())
		.await
		.expect("monitor registered");

	node.storage()
		.create_collection(
			Collection::new(CollectionId(2), "inbox", CollectionId::ROOT).resource(RESOURCE),
		)
		.await
		.expect("collection created");

	let mut sync = node.item_sync(CollectionId(2), SessionId::new());
	sync.set_full_sync_items(
		(0..5)
			.map(|i| {
				Item::with_remote_id(format!("rid{i}"))
					.mime_type("application/octet-stream")
					.payload(format!("payload{i}").into_bytes())
			})
			.collect(),
	)
	.await
	.expect("items accepted");

	let report = sync.result().await.expect("sync succeeds");
	assert_eq!(report.created, 5);

	match next(&notifications).await {
		Notification::CollectionAdded { collection, .. } => assert_eq!(collection.name, "inbox"),
		other => panic!("unexpected notification: {other:?}"),
	}

	for i in 0..5 {
		match next(&notifications).await {
			Notification::ItemAdded { item, collection } => {
				assert_eq!(item.remote_id, format!("rid{i}"));
				assert_eq!(collection.resource, RESOURCE);
			}
			other => panic!("unexpected notification: {other:?}"),
		}
	}

	node.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn subscribers_only_get_what_their_filter_accepts() {
	let dir = tempfile::tempdir().expect("temp dir");
	let (node, _requests) = node(&dir).await;

	let (_, changes) = node
		.subscribe(
			"calendar-only",
			SubscriptionFilter {
				collections: [CollectionId(3)].into(),
				..Default::default()
			},
			Interest::none().with_items([Operation::Add]),
		)
		.await
		.expect("subscriber registered");

	for (id, name) in [(2, "inbox"), (3, "calendar")] {
		node.storage()
			.create_collection(Collection::new(CollectionId(id), name, CollectionId::ROOT))
			.await
			.expect("collection created");
	}

	let mut sync = node.item_sync(CollectionId(2), SessionId::new());
	sync.set_full_sync_items(vec![Item::with_remote_id("mail")])
		.await
		.expect("items accepted");
	sync.result().await.expect("sync succeeds");

	let mut sync = node.item_sync(CollectionId(3), SessionId::new());
	sync.set_full_sync_items(vec![Item::with_remote_id("event")])
		.await
		.expect("items accepted");
	sync.result().await.expect("sync succeeds");

	node.notifications().flush().await.expect("manager running");

	let change = timeout(Duration::from_secs(5), changes.recv())
		.await
		.expect("change in time")
		.expect("subscriber connected");

	match change {
		pimd_core::notifications::SubscriberMessage::Change(change) => {
			assert_eq!(change.parent, Some(CollectionId(3)));
			assert_eq!(change.remote_id, "event");
		}
		other => panic!("unexpected message: {other:?}"),
	}
	assert!(changes.is_empty());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn stored_collections_drive_the_interval_check() {
	let dir = tempfile::tempdir().expect("temp dir");
	let (node, requests) = node(&dir).await;

	let calendar = Collection::new(CollectionId(2), "calendar", CollectionId(1))
		.resource(RESOURCE)
		.check_interval(10);

	node.storage()
		.create_collection(Collection::new(CollectionId(1), "account", CollectionId::ROOT))
		.await
		.expect("collection created");
	node.storage()
		.create_collection(calendar.clone())
		.await
		.expect("collection created");
	wait_for_scheduled(&node, 1).await;

	sleep(Duration::from_secs(10 * 60 + 1)).await;
	assert_eq!(
		requests.try_recv().ok(),
		Some((RESOURCE.to_string(), CollectionId(2)))
	);

	node.storage()
		.modify_collection(calendar.subscribed(false))
		.await
		.expect("collection modified");
	wait_for_scheduled(&node, 0).await;

	sleep(Duration::from_secs(30 * 60)).await;
	assert!(requests.is_empty());
}

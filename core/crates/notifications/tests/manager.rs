use pimd_core_notifications::{
	ChannelSubscriber, ManagerConfig, ManagerStats, NotificationManager, Subscriber,
	SubscriberMessage,
};
use pimd_protocol::{
	ChangeNotification, CollectionId, Interest, ItemId, Operation, SubscriptionFilter,
};

use std::{sync::Arc, time::Duration};

use async_channel as chan;
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

fn item_added(id: i64) -> ChangeNotification {
	ChangeNotification::item(Operation::Add, ItemId(id), CollectionId(1))
}

fn subscriber(name: &str) -> (Arc<ChannelSubscriber>, chan::Receiver<SubscriberMessage>) {
	bounded_subscriber(name, 64)
}

fn bounded_subscriber(
	name: &str,
	capacity: usize,
) -> (Arc<ChannelSubscriber>, chan::Receiver<SubscriberMessage>) {
	let (subscriber, rx) =
		ChannelSubscriber::new(name, SubscriptionFilter::all(), Interest::all(), capacity);
	(Arc::new(subscriber), rx)
}

async fn recv_change(rx: &chan::Receiver<SubscriberMessage>) -> ChangeNotification {
	match timeout(Duration::from_secs(5), rx.recv()).await {
		Ok(Ok(SubscriberMessage::Change(change))) => change,
		other => panic!("expected a change, got {other:?}"),
	}
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn changes_wait_for_the_aggregation_interval() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig {
		interval_ms: 50,
		max_workers: 2,
		..Default::default()
	});
	let (sub, rx) = subscriber("mail-client");
	manager.register(sub).await?;

	manager.notify(vec![item_added(1)]).await;
	manager.notify(vec![item_added(2)]).await;

	sleep(Duration::from_millis(20)).await;
	assert!(rx.is_empty());

	assert_eq!(recv_change(&rx).await, item_added(1));
	assert_eq!(recv_change(&rx).await, item_added(2));

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn every_subscriber_sees_changes_in_enqueue_order() -> Result<(), Box<dyn std::error::Error>>
{
	let manager = NotificationManager::new(ManagerConfig {
		interval_ms: 1,
		max_workers: 1,
		..Default::default()
	});

	let subscribers = (0..3)
		.map(|n| subscriber(&format!("client-{n}")))
		.collect::<Vec<_>>();
	for (sub, _) in &subscribers {
		manager.register(Arc::clone(sub) as Arc<dyn Subscriber>).await?;
	}

	for chunk in (1..=60).collect::<Vec<_>>().chunks(7) {
		manager
			.notify(chunk.iter().copied().map(item_added).collect())
			.await;
		manager.flush().await?;
	}

	for (_, rx) in &subscribers {
		for id in 1..=60 {
			assert_eq!(recv_change(rx).await.subject, item_added(id).subject);
		}
	}

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn slow_subscriber_does_not_stall_the_others() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig {
		interval_ms: 1,
		max_workers: 2,
		..Default::default()
	});

	// never read from, fills up after four changes
	let (stuck, _stuck_rx) = bounded_subscriber("stuck", 4);
	let (fast, fast_rx) = subscriber("fast");
	manager.register(stuck).await?;
	manager.register(fast).await?;

	manager.notify((1..=10).map(item_added).collect()).await;
	manager.flush().await?;

	for id in 1..=10 {
		assert_eq!(recv_change(&fast_rx).await.subject, item_added(id).subject);
	}

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn stalled_subscribers_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig {
		interval_ms: 60_000,
		max_workers: 2,
		max_backlog: 2,
	});

	// holds one change, the worker then blocks on the next while two more batches queue up
	let (stuck, stuck_rx) = bounded_subscriber("stuck", 1);
	let (fast, fast_rx) = subscriber("fast");
	manager.register(stuck).await?;
	manager.register(fast).await?;

	for id in 1..=6 {
		manager.notify(vec![item_added(id)]).await;
		manager.flush().await?;
		assert_eq!(recv_change(&fast_rx).await, item_added(id));
	}

	assert_eq!(manager.stats().await?.subscribers, 1);

	// what was already handed over still arrives, then the connection closes
	let delivered = timeout(Duration::from_secs(5), async {
		let mut delivered = Vec::new();
		while let Ok(SubscriberMessage::Change(change)) = stuck_rx.recv().await {
			delivered.push(change);
		}
		delivered
	})
	.await
	.expect("connection closed");

	assert!(delivered.len() <= 2);
	assert_eq!(
		delivered,
		(1..).map(item_added).take(delivered.len()).collect::<Vec<_>>()
	);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn disconnected_subscribers_are_pruned() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig::default());

	let (gone, gone_rx) = subscriber("gone");
	let (staying, staying_rx) = subscriber("staying");
	manager.register(gone).await?;
	manager.register(staying).await?;
	assert_eq!(manager.stats().await?.subscribers, 2);

	drop(gone_rx);

	manager.notify(vec![item_added(1)]).await;
	manager.flush().await?;

	assert_eq!(manager.stats().await?.subscribers, 1);
	assert_eq!(recv_change(&staying_rx).await, item_added(1));

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn collection_changes_are_compressed() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig::default());
	let (sub, rx) = subscriber("notification-console");
	manager.register(sub).await?;

	let renamed =
		ChangeNotification::collection(Operation::Modify, CollectionId(4), CollectionId::ROOT)
			.with_parts(["NAME"]);
	let repolicied =
		ChangeNotification::collection(Operation::Modify, CollectionId(4), CollectionId::ROOT)
			.with_parts(["CACHEPOLICY"]);

	manager.notify(vec![renamed, item_added(1), repolicied]).await;
	manager.flush().await?;

	let merged = recv_change(&rx).await;
	assert_eq!(merged.operation, Operation::Modify);
	assert_eq!(merged.parts.len(), 2);
	assert_eq!(recv_change(&rx).await, item_added(1));
	assert!(rx.is_empty());

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn debugging_reports_accepting_listeners() -> Result<(), Box<dyn std::error::Error>> {
	let manager = NotificationManager::new(ManagerConfig::default());

	let (all, all_rx) = subscriber("all");
	let mut only_four = SubscriptionFilter::default();
	only_four.collections.insert(CollectionId(4));
	let (picky, picky_rx) = ChannelSubscriber::new("picky", only_four, Interest::all(), 4);
	let picky = Arc::new(picky);

	manager.register(Arc::clone(&all) as Arc<dyn Subscriber>).await?;
	manager.register(Arc::clone(&picky) as Arc<dyn Subscriber>).await?;
	manager.set_debugging(picky.id(), true).await?;
	assert_eq!(manager.stats().await?.debugging, 1);

	manager.notify(vec![item_added(1)]).await;
	manager.flush().await?;

	assert_eq!(recv_change(&all_rx).await, item_added(1));
	for rx in [&all_rx, &picky_rx] {
		match timeout(Duration::from_secs(5), rx.recv()).await {
			Ok(Ok(SubscriberMessage::Debug(debug))) => {
				assert_eq!(debug.notification, item_added(1));
				assert_eq!(debug.listeners, vec!["all".to_string()]);
			}
			other => panic!("expected debug info, got {other:?}"),
		}
	}

	manager.set_debugging(picky.id(), false).await?;
	manager.forget(all.id()).await?;
	assert_eq!(
		manager.stats().await?,
		ManagerStats {
			subscribers: 1,
			debugging: 0,
			pending: 0,
		}
	);

	Ok(())
}

use pimd_protocol::{
	ChangeNotification, DebugChangeNotification, Interest, SubscriberId, SubscriptionFilter,
};

use async_channel as chan;
use async_trait::async_trait;
use tracing::trace;

/// A party the [`NotificationManager`](crate::NotificationManager) fans changes out to.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
	fn id(&self) -> SubscriberId;

	fn name(&self) -> &str;

	/// A dead subscriber is dropped from the fan-out, anything still queued for it is abandoned.
	fn is_alive(&self) -> bool;

	/// Returns whether the change was accepted and queued for the client.
	async fn notify(&self, change: &ChangeNotification) -> bool;

	async fn notify_debug(&self, _notification: &DebugChangeNotification) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberMessage {
	Change(ChangeNotification),
	Debug(DebugChangeNotification),
}

/// Subscriber backed by a bounded channel towards one client connection.
///
/// A full channel makes [`Subscriber::notify`] wait, which only ever stalls the worker serving
/// this subscriber.
#[derive(Debug)]
pub struct ChannelSubscriber {
	id: SubscriberId,
	name: String,
	filter: SubscriptionFilter,
	interest: Interest,
	tx: chan::Sender<SubscriberMessage>,
}

impl ChannelSubscriber {
	#[must_use]
	pub fn new(
		name: impl Into<String>,
		filter: SubscriptionFilter,
		interest: Interest,
		capacity: usize,
	) -> (Self, chan::Receiver<SubscriberMessage>) {
		let (tx, rx) = chan::bounded(capacity.max(1));

		(
			Self {
				id: SubscriberId::new(),
				name: name.into(),
				filter,
				interest,
				tx,
			},
			rx,
		)
	}

	#[must_use]
	pub const fn filter(&self) -> &SubscriptionFilter {
		&self.filter
	}
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
	fn id(&self) -> SubscriberId {
		self.id
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn is_alive(&self) -> bool {
		!self.tx.is_closed()
	}

	async fn notify(&self, change: &ChangeNotification) -> bool {
		if !self.interest.wants(change.kind(), change.operation) || !self.filter.accepts(change) {
			return false;
		}

		if self
			.tx
			.send(SubscriberMessage::Change(change.clone()))
			.await
			.is_err()
		{
			trace!(subscriber = %self.name, "Subscriber connection closed while notifying");
			return false;
		}

		true
	}

	async fn notify_debug(&self, notification: &DebugChangeNotification) {
		if self
			.tx
			.send(SubscriberMessage::Debug(notification.clone()))
			.await
			.is_err()
		{
			trace!(subscriber = %self.name, "Subscriber connection closed while debugging");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pimd_protocol::{CollectionId, ItemId, Operation};

	#[tokio::test]
	async fn rejects_filtered_and_undeclared_changes() {
		let mut filter = SubscriptionFilter::default();
		filter.collections.insert(CollectionId(1));
		let (subscriber, rx) = ChannelSubscriber::new(
			"mail-client",
			filter,
			Interest::none().with_items([Operation::Add]),
			8,
		);

		let accepted = ChangeNotification::item(Operation::Add, ItemId(1), CollectionId(1));
		let other_collection = ChangeNotification::item(Operation::Add, ItemId(2), CollectionId(2));
		let undeclared = ChangeNotification::item(Operation::Remove, ItemId(1), CollectionId(1));

		assert!(subscriber.notify(&accepted).await);
		assert!(!subscriber.notify(&other_collection).await);
		assert!(!subscriber.notify(&undeclared).await);

		assert_eq!(rx.len(), 1);
		assert_eq!(rx.recv().await, Ok(SubscriberMessage::Change(accepted)));
	}

	#[tokio::test]
	async fn dropping_the_connection_kills_the_subscriber() {
		let (subscriber, rx) =
			ChannelSubscriber::new("calendar-client", SubscriptionFilter::all(), Interest::all(), 1);
		assert!(subscriber.is_alive());

		drop(rx);
		assert!(!subscriber.is_alive());
		assert!(
			!subscriber
				.notify(&ChangeNotification::item(Operation::Add, ItemId(1), CollectionId(1)))
				.await
		);
	}
}

//!
//! # Change notification pipeline
//!
//! Both halves of change propagation live here:
//! - The server side [`NotificationManager`], which collects the changes committed by storage,
//!   compresses them and fans them out to every registered [`Subscriber`] with bounded
//!   concurrency, never reordering the stream of a single subscriber;
//! - The consumer side [`Monitor`], which filters what a subscriber receives, drops what nobody
//!   references, resolves the involved entities through lookahead caches and emits fully typed
//!   [`Notification`](pimd_protocol::Notification)s in the order the changes arrived.
//!
//! The [`Monitor`] itself does no I/O, [`MonitorRunner`] drives one against storage.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod cache;
mod manager;
mod monitor;
mod queue;
mod runner;
mod subscriber;
mod tracker;

pub use cache::EntityCache;
pub use manager::{ManagerConfig, ManagerStats, NotificationManager};
pub use monitor::{FetchRequests, FilterUpdate, Monitor, MonitorConfig};
pub use queue::{Compression, NotificationQueue};
pub use runner::{EntityFetcher, MonitorHandle, MonitorRunner};
pub use subscriber::{ChannelSubscriber, Subscriber, SubscriberMessage};
pub use tracker::{PurgeBuffer, ReferenceTracker};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("notification manager is not running")]
	ManagerStopped,
	#[error("monitor is not running")]
	MonitorStopped,
}

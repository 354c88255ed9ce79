//! The PIM storage daemon core.
//!
//! [`Node`] wires the storage engine to the notification manager, hands out monitors and item
//! sync jobs, and keeps the [`IntervalCheck`] scheduler fed with collection changes.

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

pub mod config;
pub mod logging;
pub mod node;
pub mod scheduler;

pub use config::NodeConfig;
pub use node::Node;
pub use scheduler::{IntervalCheck, LogSyncRequests, SchedulerConfig, SyncRequestHandler};

pub use pimd_core_item_sync as item_sync;
pub use pimd_core_notifications as notifications;
pub use pimd_core_storage as storage;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Storage(#[from] storage::Error),
	#[error(transparent)]
	Notifications(#[from] notifications::Error),
	#[error("interval check is not running")]
	SchedulerStopped,
}

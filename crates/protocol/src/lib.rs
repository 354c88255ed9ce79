//!
//! # PIM daemon data model
//!
//! Types shared by the storage layer, the notification pipeline and the item synchronizer:
//! - Entity identifiers and the [`Item`] and [`Collection`] records;
//! - [`ChangeNotification`], the immutable description of one storage change;
//! - [`Notification`], the fully resolved and typed form handed to consumers;
//! - [`SubscriptionFilter`] and [`Interest`], what a subscriber wants to hear about.
//!
//! Nothing in here does I/O, framing these types on the wire is the transport's job.

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

mod change;
mod entity;
mod filter;
mod ids;
mod notification;

pub use change::{ChangeNotification, EntityKind, EntityRef, Operation};
pub use entity::{Collection, Item};
pub use filter::{Interest, SubscriptionFilter};
pub use ids::{CollectionId, ItemId, SessionId, SubscriberId};
pub use notification::{DebugChangeNotification, Notification};

//! Item synchronization of one collection.
//!
//! A resource hands an [`ItemSync`] the authoritative state of a collection, either all of it
//! (full sync) or what changed since last time (incremental sync), in one or many deliveries.
//! The job works out what to create, update and delete, applying each processing batch in its
//! own storage transaction.

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

use pimd_core_storage as storage;
use pimd_protocol::CollectionId;

use serde::{Deserialize, Serialize};

mod actor;
mod job;
mod plan;

pub use job::{ItemSync, SyncState};
pub use plan::MergeMode;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error(transparent)]
	Storage(#[from] storage::Error),
	#[error("collection to sync doesn't exist: {0}")]
	CollectionNotFound(CollectionId),
	#[error("User canceled operation.")]
	Cancelled,
	#[error("items delivered after delivery was marked done")]
	DeliveryAlreadyDone,
	#[error("can't deliver {requested:?} sync items to a {current:?} sync")]
	SyncModeMismatch {
		current: SyncMode,
		requested: SyncMode,
	},
	#[error("{failed} batch(es) failed to sync, first failure: {first}")]
	BatchesFailed {
		failed: usize,
		first: storage::Error,
	},
	#[error("sync job stopped without reporting a result")]
	JobStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
	/// The delivered items are the whole collection, anything else stored there goes away.
	Full,
	/// Changed and deleted items only.
	Incremental,
}

/// What a successful sync did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
	pub created: usize,
	pub updated: usize,
	pub deleted: usize,
	/// Deletion references matching no stored item.
	pub ignored_deletions: usize,
	pub failed_batches: usize,
}

impl SyncReport {
	#[must_use]
	pub const fn mutations(&self) -> usize {
		self.created + self.updated + self.deleted
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemSyncConfig {
	/// Items per processing batch, each batch is one transaction.
	pub batch_size: usize,
}

impl Default for ItemSyncConfig {
	fn default() -> Self {
		Self { batch_size: 10 }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancellation_reads_like_a_user_action() {
		assert_eq!(Error::Cancelled.to_string(), "User canceled operation.");
	}

	#[test]
	fn batch_failures_name_the_first_one() {
		let error = Error::BatchesFailed {
			failed: 2,
			first: storage::Error::DuplicateKey {
				collection: CollectionId(4),
				remote_id: "rid0".to_string(),
			},
		};

		assert_eq!(
			error.to_string(),
			"2 batch(es) failed to sync, first failure: duplicate remote id <remote_id='rid0'> in \
			 collection#4"
		);
	}
}

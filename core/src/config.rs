//! Node configuration

use crate::scheduler::SchedulerConfig;

use pimd_core_item_sync::ItemSyncConfig;
use pimd_core_notifications::{ManagerConfig, MonitorConfig};

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CONFIG_FILE: &str = "pimd.json";

/// Resolves the per-platform data directory, creating it if needed.
pub fn default_data_dir() -> Result<PathBuf> {
	#[cfg(any(target_os = "macos", target_os = "windows"))]
	let dir = dirs::data_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("pimd");

	#[cfg(not(any(target_os = "macos", target_os = "windows")))]
	let dir = dirs::data_local_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("pimd");

	fs::create_dir_all(&dir)?;

	Ok(dir)
}

/// Versioned configuration schemas.
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Brings the configuration up to [`Migrate::target_version`].
	fn migrate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
	/// Config schema version
	pub version: u32,

	pub data_dir: PathBuf,

	/// Default log level, `RUST_LOG` takes precedence
	pub log_level: String,

	#[serde(default)]
	pub notifications: ManagerConfig,

	#[serde(default)]
	pub monitor: MonitorConfig,

	#[serde(default)]
	pub item_sync: ItemSyncConfig,

	#[serde(default)]
	pub scheduler: SchedulerConfig,
}

impl NodeConfig {
	/// Load configuration from the default location
	pub fn load() -> Result<Self> {
		let data_dir = default_data_dir()?;
		Self::load_from(&data_dir)
	}

	/// Load configuration from a specific data directory, creating a default one if missing
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = data_dir.join(CONFIG_FILE);

		if config_path.exists() {
			info!(?config_path, "Loading config;");
			let json = fs::read_to_string(&config_path)?;
			let mut config = serde_json::from_str::<Self>(&json)?;

			if config.current_version() < Self::target_version() {
				info!(
					"Migrating config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.migrate()?;
				config.save()?;
			}

			Ok(config)
		} else {
			warn!(?config_path, "No config found, creating default;");
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	#[must_use]
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			data_dir,
			log_level: "info".to_string(),
			notifications: ManagerConfig::default(),
			monitor: MonitorConfig::default(),
			item_sync: ItemSyncConfig::default(),
			scheduler: SchedulerConfig::default(),
		}
	}

	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!(?config_path, "Saved config;");

		Ok(())
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}

impl Migrate for NodeConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			0 => {
				self.version = 1;
				self.migrate()
			}
			1 => {
				// v2 added item sync batching and the interval scheduler
				self.item_sync = ItemSyncConfig::default();
				self.scheduler = SchedulerConfig::default();
				self.version = 2;
				self.migrate()
			}
			2 => Ok(()),
			v => Err(anyhow!("Unknown config version: {v}")),
		}
	}
}

use crate::NodeConfig;

use std::sync::Once;

use anyhow::{anyhow, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "pimd.log";

/// Default filter directive for the configured level, covering every `pimd*` crate.
fn default_directive(log_level: &str) -> String {
	format!("pimd={log_level}")
}

/// Logs to stdout and to a daily rotated file under the data directory.
///
/// `RUST_LOG` overrides the configured level. Only the first call installs anything.
pub fn init_logger(config: &NodeConfig) -> Result<()> {
	static INIT: Once = Once::new();
	let mut result = Ok(());

	INIT.call_once(|| {
		let logs_dir = config.logs_dir();
		if let Err(e) = std::fs::create_dir_all(&logs_dir) {
			result = Err(anyhow!("Failed to create logs directory: {e}"));
			return;
		}

		let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, LOG_FILE_PREFIX);

		if let Err(e) = tracing_subscriber::registry()
			.with(
				EnvFilter::try_from_default_env()
					.unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level))),
			)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_writer(std::io::stdout),
			)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_ansi(false)
					.with_writer(file_appender),
			)
			.try_init()
		{
			result = Err(anyhow!("Failed to initialize tracing: {e}"));
		}
	});

	result
}

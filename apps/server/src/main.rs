use pimd_core::{config::default_data_dir, logging::init_logger, LogSyncRequests, Node, NodeConfig};

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pimd-server", about = "PIM storage daemon")]
struct Args {
	/// Path to the pimd data directory
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Log level for this run, overriding the configured one
	#[arg(long)]
	log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let data_dir = match args.data_dir {
		Some(data_dir) => data_dir,
		None => default_data_dir()?,
	};

	let mut config = NodeConfig::load_from(&data_dir)?;
	if let Some(log_level) = args.log_level {
		config.log_level = log_level;
	}

	init_logger(&config)?;

	let node = Node::new(config, Arc::new(LogSyncRequests)).await?;

	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			tracing::error!(?e, "Failed to listen for Ctrl+C");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(e) => {
				tracing::error!(?e, "Failed to install the terminate signal handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => info!("Received Ctrl+C, shutting down gracefully..."),
		() = terminate => info!("Received terminate signal, shutting down gracefully..."),
	}

	node.shutdown().await;

	Ok(())
}

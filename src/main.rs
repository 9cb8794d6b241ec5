use resilient_block_cache::{CacheEvent, CacheSettings, EventKind, ResilientCache};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let settings = match CacheSettings::from_env() {
		Ok(settings) => settings,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	info!(
		"Starting block cache for {} into {}",
		settings.ledger.base_url, settings.store.uri
	);
	let cache = ResilientCache::with_options(settings.store, settings.ledger, settings.options);

	cache.on(EventKind::Connected, |_| info!("Connected to ledger"));
	cache.on(EventKind::Data, |event| {
		if let CacheEvent::Data(blocks) = event {
			if let (Some(first), Some(last)) = (blocks.first(), blocks.last()) {
				info!(
					"Stored {} blocks ({}..={})",
					blocks.len(),
					first.height,
					last.height
				);
			}
		}
	});
	cache.on(EventKind::Error, |event| {
		if let CacheEvent::Error(failure) = event {
			warn!("Sync error: {}", failure);
		}
	});
	cache.on(EventKind::Closed, |_| info!("Cache closed"));

	if let Err(e) = cache.initialize().await {
		error!("Failed to start block cache: {}", e);
		return ExitCode::FAILURE;
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}
	info!("Shutting down");
	cache.close().await;
	info!("{}", cache.stats().summary());

	ExitCode::SUCCESS
}

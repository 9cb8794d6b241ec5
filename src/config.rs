//! Connection and tuning configuration for the block cache.
//!
//! `StoreConfig` and `LedgerConfig` mirror the two value records an embedding application
//! supplies at construction. `SyncOptions` carries the tunables of the synchronization loop
//! (batch sizes, backoff, timeouts). Validation happens when the cache is initialized; an
//! invalid configuration is reported as a `ConfigError` and never retried.

use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Location of the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
	/// Store location: `mongodb://` or `mongodb+srv://` connection string, `memory://`,
	/// `file:///some/dir` or a bare directory path.
	pub uri: String,
	/// Logical database name.
	pub db_name: String,
	/// Collection holding the blocks and the sync cursor.
	pub collection_name: String,
}

impl StoreConfig {
	pub fn new(
		uri: impl Into<String>,
		db_name: impl Into<String>,
		collection_name: impl Into<String>,
	) -> Self {
		Self {
			uri: uri.into(),
			db_name: db_name.into(),
			collection_name: collection_name.into(),
		}
	}

	/// Resolve the URI into a concrete store backend.
	pub fn location(&self) -> Result<StoreLocation, ConfigError> {
		validate_name("db_name", &self.db_name)?;
		validate_name("collection_name", &self.collection_name)?;

		let uri = self.uri.trim();
		if uri.is_empty() {
			return Err(ConfigError::MissingValue("store uri"));
		}

		if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
			validate_mongo_names(&self.db_name, &self.collection_name)?;
			let (_, rest) = uri.split_once("://").unwrap_or_default();
			if rest.trim_start_matches('/').is_empty() {
				return Err(ConfigError::InvalidStoreUri {
					uri: uri.to_string(),
					reason: "connection string has no host".to_string(),
				});
			}
			return Ok(StoreLocation::Mongo(uri.to_string()));
		}

		if uri.starts_with("memory:") {
			return Ok(StoreLocation::Memory);
		}

		if let Some(path) = uri.strip_prefix("file://") {
			if path.is_empty() {
				return Err(ConfigError::InvalidStoreUri {
					uri: uri.to_string(),
					reason: "file URI has no path".to_string(),
				});
			}
			return Ok(StoreLocation::File(PathBuf::from(path)));
		}

		if let Some((scheme, _)) = uri.split_once("://") {
			return Err(ConfigError::UnsupportedStoreScheme(scheme.to_string()));
		}

		Ok(StoreLocation::File(PathBuf::from(uri)))
	}
}

/// Backend selected by a `StoreConfig` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
	/// Process-local store, lost on exit.
	Memory,
	/// Durable store rooted at the given directory.
	File(PathBuf),
	/// MongoDB deployment reached through the given connection string.
	Mongo(String),
}

/// Ledger node endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
	/// Node address, e.g. `resilientdb://crow.resilientdb.com`.
	pub base_url: String,
	/// Use TLS for historical fetches.
	pub http_secure: bool,
	/// Use TLS for the live subscription.
	pub ws_secure: bool,
}

impl LedgerConfig {
	pub fn new(base_url: impl Into<String>, http_secure: bool, ws_secure: bool) -> Self {
		Self {
			base_url: base_url.into(),
			http_secure,
			ws_secure,
		}
	}

	/// Derive the HTTP and WebSocket base URLs from the node address.
	///
	/// The scheme of `base_url` only names the node; the transport schemes come from the
	/// `http_secure` and `ws_secure` flags.
	pub fn endpoints(&self) -> Result<LedgerEndpoints, ConfigError> {
		let trimmed = self.base_url.trim();
		let authority = match trimmed.split_once("://") {
			Some(("resilientdb" | "http" | "https" | "ws" | "wss", rest)) => rest,
			Some((scheme, _)) => {
				return Err(ConfigError::UnsupportedLedgerScheme(scheme.to_string()));
			}
			None => trimmed,
		};
		let authority = authority.trim_end_matches('/');
		if authority.is_empty() {
			return Err(ConfigError::InvalidLedgerUrl {
				url: self.base_url.clone(),
				reason: "missing host".to_string(),
			});
		}

		let http_scheme = if self.http_secure { "https" } else { "http" };
		let ws_scheme = if self.ws_secure { "wss" } else { "ws" };

		Ok(LedgerEndpoints {
			http: self.parse_base(http_scheme, authority)?,
			ws: self.parse_base(ws_scheme, authority)?,
		})
	}

	fn parse_base(&self, scheme: &str, authority: &str) -> Result<Url, ConfigError> {
		let url = Url::parse(&format!("{}://{}/", scheme, authority)).map_err(|e| {
			ConfigError::InvalidLedgerUrl {
				url: self.base_url.clone(),
				reason: e.to_string(),
			}
		})?;
		if url.host_str().is_none_or(str::is_empty) {
			return Err(ConfigError::InvalidLedgerUrl {
				url: self.base_url.clone(),
				reason: "missing host".to_string(),
			});
		}
		Ok(url)
	}
}

/// Concrete transport base URLs, always ending with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEndpoints {
	pub http: Url,
	pub ws: Url,
}

/// Tunables of the synchronization loop.
#[derive(Debug, Clone)]
pub struct SyncOptions {
	/// Maximum blocks per store write and per `data` event.
	pub batch_size: usize,
	/// Blocks requested per historical fetch call.
	pub fetch_page_size: u64,
	/// First retry delay after a transport or store failure.
	pub backoff_initial: Duration,
	/// Retry delay ceiling.
	pub backoff_max: Duration,
	/// Growth factor between consecutive retry delays.
	pub backoff_multiplier: f64,
	/// Randomization factor applied to each delay, in `[0, 1)`.
	pub backoff_jitter: f64,
	/// Consecutive failures between two `error` events.
	pub error_report_threshold: u32,
	/// Bound on a single HTTP request or WebSocket handshake.
	pub request_timeout: Duration,
	/// Reconnect when the live stream has been silent this long.
	pub live_idle_timeout: Option<Duration>,
	/// Window during which consecutive live blocks are coalesced into one batch.
	pub coalesce_window: Duration,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			batch_size: 100,
			fetch_page_size: 100,
			backoff_initial: Duration::from_millis(500),
			backoff_max: Duration::from_secs(30),
			backoff_multiplier: 2.0,
			backoff_jitter: 0.3,
			error_report_threshold: 5,
			request_timeout: Duration::from_secs(30),
			live_idle_timeout: None,
			coalesce_window: Duration::ZERO,
		}
	}
}

impl SyncOptions {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.batch_size == 0 {
			return Err(ConfigError::InvalidOption("batch_size must be positive"));
		}
		if self.fetch_page_size == 0 {
			return Err(ConfigError::InvalidOption("fetch_page_size must be positive"));
		}
		if self.backoff_initial.is_zero() {
			return Err(ConfigError::InvalidOption("backoff_initial must be positive"));
		}
		if self.backoff_max < self.backoff_initial {
			return Err(ConfigError::InvalidOption(
				"backoff_max must not be below backoff_initial",
			));
		}
		if !(self.backoff_multiplier >= 1.0) {
			return Err(ConfigError::InvalidOption("backoff_multiplier must be at least 1"));
		}
		if !(0.0..1.0).contains(&self.backoff_jitter) {
			return Err(ConfigError::InvalidOption("backoff_jitter must be in [0, 1)"));
		}
		if self.error_report_threshold == 0 {
			return Err(ConfigError::InvalidOption(
				"error_report_threshold must be positive",
			));
		}
		if self.request_timeout.is_zero() {
			return Err(ConfigError::InvalidOption("request_timeout must be positive"));
		}
		if self.live_idle_timeout.is_some_and(|t| t.is_zero()) {
			return Err(ConfigError::InvalidOption("live_idle_timeout must be positive"));
		}
		Ok(())
	}
}

/// Complete settings as loaded by the binary.
#[derive(Debug, Clone)]
pub struct CacheSettings {
	pub store: StoreConfig,
	pub ledger: LedgerConfig,
	pub options: SyncOptions,
}

impl CacheSettings {
	/// Load settings from `STORE_URI` (or `MONGO_URL`), `STORE_DB`, `STORE_COLLECTION`,
	/// `LEDGER_BASE_URL`, `LEDGER_HTTP_SECURE`, `LEDGER_WS_SECURE` and `SYNC_BATCH_SIZE`.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| env::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let required = |key: &'static str| lookup(key).ok_or(ConfigError::MissingValue(key));
		let flag = |key: &'static str| -> Result<bool, ConfigError> {
			match lookup(key) {
				None => Ok(true),
				Some(value) => match value.trim().to_ascii_lowercase().as_str() {
					"1" | "true" | "yes" => Ok(true),
					"0" | "false" | "no" => Ok(false),
					_ => Err(ConfigError::InvalidEnv { key, value }),
				},
			}
		};

		let mut options = SyncOptions::default();
		if let Some(value) = lookup("SYNC_BATCH_SIZE") {
			options.batch_size = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
				key: "SYNC_BATCH_SIZE",
				value,
			})?;
		}

		Ok(Self {
			store: StoreConfig::new(
				lookup("STORE_URI")
					.or_else(|| lookup("MONGO_URL"))
					.ok_or(ConfigError::MissingValue("STORE_URI"))?,
				required("STORE_DB")?,
				required("STORE_COLLECTION")?,
			),
			ledger: LedgerConfig::new(
				required("LEDGER_BASE_URL")?,
				flag("LEDGER_HTTP_SECURE")?,
				flag("LEDGER_WS_SECURE")?,
			),
			options,
		})
	}
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
	if value.trim().is_empty() {
		return Err(ConfigError::MissingValue(field));
	}
	if value.contains(['/', '\\']) || value == "." || value == ".." {
		return Err(ConfigError::InvalidName {
			field,
			value: value.to_string(),
		});
	}
	Ok(())
}

/// Database and collection names MongoDB refuses.
fn validate_mongo_names(db_name: &str, collection_name: &str) -> Result<(), ConfigError> {
	if db_name.contains(['.', ' ', '"', '$']) {
		return Err(ConfigError::InvalidName {
			field: "db_name",
			value: db_name.to_string(),
		});
	}
	if collection_name.contains('$') || collection_name.starts_with("system.") {
		return Err(ConfigError::InvalidName {
			field: "collection_name",
			value: collection_name.to_string(),
		});
	}
	Ok(())
}

/// Invalid configuration. Fatal: the cache refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Missing configuration value: {0}")]
	MissingValue(&'static str),

	#[error("Invalid {field}: {value:?}")]
	InvalidName { field: &'static str, value: String },

	#[error("Invalid store URI {uri}: {reason}")]
	InvalidStoreUri { uri: String, reason: String },

	#[error("Unsupported store scheme: {0}")]
	UnsupportedStoreScheme(String),

	#[error("Invalid ledger URL {url}: {reason}")]
	InvalidLedgerUrl { url: String, reason: String },

	#[error("Unsupported ledger scheme: {0}")]
	UnsupportedLedgerScheme(String),

	#[error("Invalid sync option: {0}")]
	InvalidOption(&'static str),

	#[error("Invalid value for {key}: {value:?}")]
	InvalidEnv { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn resilientdb_scheme_maps_to_secure_transports() {
		let config = LedgerConfig::new("resilientdb://crow.resilientdb.com", true, true);
		let endpoints = config.endpoints().unwrap();
		assert_eq!(endpoints.http.as_str(), "https://crow.resilientdb.com/");
		assert_eq!(endpoints.ws.as_str(), "wss://crow.resilientdb.com/");
	}

	#[test]
	fn transport_flags_are_independent() {
		let config = LedgerConfig::new("resilientdb://localhost:18000", false, true);
		let endpoints = config.endpoints().unwrap();
		assert_eq!(endpoints.http.as_str(), "http://localhost:18000/");
		assert_eq!(endpoints.ws.as_str(), "wss://localhost:18000/");
	}

	#[test]
	fn rejects_unknown_ledger_scheme_and_missing_host() {
		assert!(matches!(
			LedgerConfig::new("ftp://node", true, true).endpoints(),
			Err(ConfigError::UnsupportedLedgerScheme(_))
		));
		assert!(matches!(
			LedgerConfig::new("resilientdb://", true, true).endpoints(),
			Err(ConfigError::InvalidLedgerUrl { .. })
		));
	}

	#[test]
	fn store_uri_selects_backend() {
		let memory = StoreConfig::new("memory://", "db", "blocks");
		assert_eq!(memory.location().unwrap(), StoreLocation::Memory);

		let file = StoreConfig::new("file:///var/lib/cache", "db", "blocks");
		assert_eq!(
			file.location().unwrap(),
			StoreLocation::File(PathBuf::from("/var/lib/cache"))
		);

		let bare = StoreConfig::new("./data", "db", "blocks");
		assert_eq!(
			bare.location().unwrap(),
			StoreLocation::File(PathBuf::from("./data"))
		);

		let mongo = StoreConfig::new("mongodb://localhost:27017", "db", "blocks");
		assert_eq!(
			mongo.location().unwrap(),
			StoreLocation::Mongo("mongodb://localhost:27017".to_string())
		);

		let srv = StoreConfig::new("mongodb+srv://user:pw@cluster0.example.net", "db", "blocks");
		assert!(matches!(srv.location().unwrap(), StoreLocation::Mongo(_)));

		let ftp = StoreConfig::new("ftp://host/blocks", "db", "blocks");
		assert!(matches!(
			ftp.location(),
			Err(ConfigError::UnsupportedStoreScheme(scheme)) if scheme == "ftp"
		));
	}

	#[test]
	fn mongo_uri_needs_a_host_and_valid_names() {
		assert!(matches!(
			StoreConfig::new("mongodb://", "db", "blocks").location(),
			Err(ConfigError::InvalidStoreUri { .. })
		));
		assert!(matches!(
			StoreConfig::new("mongodb://localhost", "res.db", "blocks").location(),
			Err(ConfigError::InvalidName { field: "db_name", .. })
		));
		assert!(matches!(
			StoreConfig::new("mongodb://localhost", "db", "system.blocks").location(),
			Err(ConfigError::InvalidName { field: "collection_name", .. })
		));
	}

	#[test]
	fn mongo_url_is_accepted_as_the_store_uri() {
		let vars: HashMap<&str, &str> = HashMap::from([
			("MONGO_URL", "mongodb://localhost:27017"),
			("STORE_DB", "resdb-cache"),
			("STORE_COLLECTION", "resdb-collection"),
			("LEDGER_BASE_URL", "resilientdb://crow.resilientdb.com"),
		]);
		let settings =
			CacheSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

		assert_eq!(settings.store.uri, "mongodb://localhost:27017");
		assert!(matches!(
			settings.store.location().unwrap(),
			StoreLocation::Mongo(_)
		));
	}

	#[test]
	fn collection_names_cannot_escape_the_store() {
		let config = StoreConfig::new("memory://", "db", "../blocks");
		assert!(matches!(
			config.location(),
			Err(ConfigError::InvalidName { field: "collection_name", .. })
		));
	}

	#[test]
	fn default_options_are_valid() {
		SyncOptions::default().validate().unwrap();

		let options = SyncOptions {
			backoff_max: Duration::from_millis(1),
			..SyncOptions::default()
		};
		assert!(options.validate().is_err());

		let options = SyncOptions {
			batch_size: 0,
			..SyncOptions::default()
		};
		assert!(options.validate().is_err());
	}

	#[test]
	fn settings_load_from_lookup() {
		let vars: HashMap<&str, &str> = HashMap::from([
			("STORE_URI", "memory://"),
			("STORE_DB", "resdb-cache"),
			("STORE_COLLECTION", "resdb-collection"),
			("LEDGER_BASE_URL", "resilientdb://localhost:18000"),
			("LEDGER_HTTP_SECURE", "false"),
			("SYNC_BATCH_SIZE", "25"),
		]);
		let settings =
			CacheSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

		assert_eq!(settings.store.collection_name, "resdb-collection");
		assert!(!settings.ledger.http_secure);
		assert!(settings.ledger.ws_secure);
		assert_eq!(settings.options.batch_size, 25);

		let missing = CacheSettings::from_lookup(|_| None);
		assert!(matches!(missing, Err(ConfigError::MissingValue("STORE_URI"))));
	}
}

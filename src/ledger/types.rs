//! Types for ledger node integration

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// One ordered unit of ledger data.
///
/// `height` is the ordering key and `id` the content-derived identity used to tell two blocks
/// at the same height apart. The payload is carried verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
	/// Position of the block in the chain, starting at 1.
	#[serde(alias = "number", deserialize_with = "deserialize_height")]
	pub height: u64,
	/// Content identity of the block.
	#[serde(alias = "hash")]
	pub id: String,
	/// Opaque block content (transaction list or raw data).
	#[serde(default, alias = "transactions")]
	pub payload: serde_json::Value,
}

impl Block {
	pub fn new(height: u64, id: impl Into<String>, payload: serde_json::Value) -> Self {
		Self {
			height,
			id: id.into(),
			payload,
		}
	}
}

/// Heights arrive either as JSON numbers or as decimal strings.
fn deserialize_height<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum RawHeight {
		Number(u64),
		Text(String),
	}

	match RawHeight::deserialize(deserializer)? {
		RawHeight::Number(height) => Ok(height),
		RawHeight::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
	}
}

/// Body of a live subscription frame: a single block or a burst of blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LivePayload {
	Many(Vec<Block>),
	One(Block),
}

impl LivePayload {
	pub fn into_blocks(self) -> Vec<Block> {
		match self {
			LivePayload::Many(mut blocks) => {
				blocks.sort_by_key(|block| block.height);
				blocks
			}
			LivePayload::One(block) => vec![block],
		}
	}
}

/// Error types for ledger node operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("HTTP status {status} from {url}")]
	HttpStatus { status: u16, url: String },

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Timed out after {0:?}")]
	Timeout(Duration),

	#[error("Live subscription closed by the ledger node")]
	Disconnected,

	#[error("Protocol error: {0}")]
	ProtocolError(String),

	#[error("Invalid endpoint: {0}")]
	UrlError(String),

	#[error("History after height {from_height} is no longer retained by the ledger node")]
	NotFound { from_height: u64 },
}

impl LedgerError {
	/// Whether the node reported the requested history as unavailable.
	pub fn is_not_found(&self) -> bool {
		matches!(self, LedgerError::NotFound { .. })
	}
}

//! HTTP and WebSocket client for a ResilientDB ledger node.
//!
//! Historical blocks are read with paged `GET /v1/blocks/{start}/{end}` requests; new blocks are
//! pushed over a WebSocket subscription. All methods are async and designed for use with Tokio.

use super::source::{BlockStream, LedgerSource};
use super::types::*;
use crate::config::LedgerEndpoints;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Path of the historical block range endpoint.
const BLOCKS_PATH: &str = "v1/blocks";
/// Path of the live block subscription endpoint.
const LIVE_PATH: &str = "v1/blocks/live";

/// ResilientDB ledger node client
#[derive(Clone)]
pub struct ResilientDbClient {
	/// The underlying HTTP client for range queries.
	http_client: Client,
	/// Base URL for historical fetches.
	http_base: Url,
	/// Base URL for the live subscription.
	ws_base: Url,
	/// Blocks requested per range query.
	page_size: u64,
	/// Bound on the WebSocket handshake.
	connect_timeout: Duration,
}

impl ResilientDbClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `endpoints` - HTTP and WebSocket base URLs of the node.
	/// * `page_size` - Blocks requested per historical range query.
	/// * `request_timeout` - Bound on each HTTP request and on the WebSocket handshake.
	pub fn new(
		endpoints: LedgerEndpoints,
		page_size: u64,
		request_timeout: Duration,
	) -> Result<Self, LedgerError> {
		let http_client = Client::builder().timeout(request_timeout).build()?;

		Ok(Self {
			http_client,
			http_base: endpoints.http,
			ws_base: endpoints.ws,
			page_size: page_size.max(1),
			connect_timeout: request_timeout,
		})
	}

	fn range_url(&self, start: u64, end: u64) -> Result<Url, LedgerError> {
		self.http_base
			.join(&format!("{}/{}/{}", BLOCKS_PATH, start, end))
			.map_err(|e| LedgerError::UrlError(e.to_string()))
	}

	fn live_url(&self) -> Result<Url, LedgerError> {
		self.ws_base
			.join(LIVE_PATH)
			.map_err(|e| LedgerError::UrlError(e.to_string()))
	}

	/// Fetch one page of blocks with `start <= height <= end`.
	///
	/// # Errors
	/// `LedgerError::NotFound` when the node answers 404 (range pruned or unknown),
	/// `LedgerError::HttpStatus` for other non-success statuses.
	pub async fn fetch_page(&self, start: u64, end: u64) -> Result<Vec<Block>, LedgerError> {
		let url = self.range_url(start, end)?;
		debug!("Fetching blocks {}..={} from {}", start, end, url);

		let response = self.http_client.get(url.clone()).send().await?;
		let status = response.status();
		if status == StatusCode::NOT_FOUND {
			return Err(LedgerError::NotFound {
				from_height: start.saturating_sub(1),
			});
		}
		if !status.is_success() {
			return Err(LedgerError::HttpStatus {
				status: status.as_u16(),
				url: url.to_string(),
			});
		}

		let mut blocks: Vec<Block> = response.json().await?;
		blocks.retain(|block| block.height >= start && block.height <= end);
		blocks.sort_by_key(|block| block.height);
		blocks.dedup_by_key(|block| block.height);
		Ok(blocks)
	}

	/// Compute the next page after `after`, returning the blocks and the cursor for the
	/// following page (`None` once the range is exhausted).
	async fn next_page(
		&self,
		after: Option<u64>,
		to_height_inclusive: Option<u64>,
	) -> Result<Option<(Vec<Block>, Option<u64>)>, LedgerError> {
		let Some(after) = after else {
			return Ok(None);
		};
		let Some(start) = after.checked_add(1) else {
			return Ok(None);
		};
		let page_end = start.saturating_add(self.page_size - 1);
		let end = match to_height_inclusive {
			Some(to) if to < start => return Ok(None),
			Some(to) => to.min(page_end),
			None => page_end,
		};

		let blocks = self.fetch_page(start, end).await?;
		let requested = end - start + 1;
		let next = match (blocks.last().map(|b| b.height), to_height_inclusive) {
			(None, _) => None,
			(Some(last), Some(to)) if last >= to => None,
			(Some(_), None) if (blocks.len() as u64) < requested => None,
			(Some(last), _) => Some(last),
		};
		Ok(Some((blocks, next)))
	}
}

/// Decode one WebSocket frame into zero or more blocks.
fn decode_frame(
	frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Vec<Result<Block, LedgerError>> {
	match frame {
		Ok(Message::Text(text)) => decode_payload(text.as_bytes()),
		Ok(Message::Binary(bytes)) => decode_payload(&bytes),
		Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Vec::new(),
		Ok(Message::Close(frame)) => {
			info!("Live subscription closed by node: {:?}", frame);
			vec![Err(LedgerError::Disconnected)]
		}
		Err(e) => vec![Err(LedgerError::WebSocketError(e))],
	}
}

fn decode_payload(bytes: &[u8]) -> Vec<Result<Block, LedgerError>> {
	match serde_json::from_slice::<LivePayload>(bytes) {
		Ok(payload) => payload.into_blocks().into_iter().map(Ok).collect(),
		Err(e) => {
			warn!(
				"Ignoring undecodable live frame ({}): {}",
				e,
				String::from_utf8_lossy(bytes)
			);
			Vec::new()
		}
	}
}

#[async_trait::async_trait]
impl LedgerSource for ResilientDbClient {
	fn fetch_range(
		&self,
		from_height_exclusive: u64,
		to_height_inclusive: Option<u64>,
	) -> BlockStream {
		let client = self.clone();
		let pages = stream::try_unfold(Some(from_height_exclusive), move |after| {
			let client = client.clone();
			async move { client.next_page(after, to_height_inclusive).await }
		});

		Box::pin(
			pages
				.map_ok(|blocks| stream::iter(blocks.into_iter().map(Ok::<Block, LedgerError>)))
				.try_flatten(),
		)
	}

	async fn subscribe_live(&self) -> Result<BlockStream, LedgerError> {
		let url = self.live_url()?;
		debug!("Attempting WebSocket connection to: {}", url);

		let (ws_stream, response) =
			tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
				.await
				.map_err(|_| LedgerError::Timeout(self.connect_timeout))??;
		info!(
			"Live subscription established, response status: {}",
			response.status()
		);

		let stream = ws_stream
			.map(|frame| stream::iter(decode_frame(frame)))
			.flatten();
		Ok(Box::pin(stream))
	}

	fn name(&self) -> &'static str {
		"ResilientDbClient"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::LedgerConfig;

	fn client() -> ResilientDbClient {
		let endpoints = LedgerConfig::new("resilientdb://localhost:18000", false, true)
			.endpoints()
			.unwrap();
		ResilientDbClient::new(endpoints, 50, Duration::from_secs(5)).unwrap()
	}

	#[test]
	fn builds_range_and_live_urls() {
		let client = client();
		assert_eq!(
			client.range_url(11, 60).unwrap().as_str(),
			"http://localhost:18000/v1/blocks/11/60"
		);
		assert_eq!(
			client.live_url().unwrap().as_str(),
			"wss://localhost:18000/v1/blocks/live"
		);
	}

	#[test]
	fn decodes_text_frames_and_skips_control_frames() {
		let blocks = decode_frame(Ok(Message::Text(
			r#"[{"height": 5, "id": "e"}, {"height": 4, "id": "d"}]"#.to_string(),
		)));
		let heights: Vec<u64> = blocks.into_iter().map(|b| b.unwrap().height).collect();
		assert_eq!(heights, vec![4, 5]);

		assert!(decode_frame(Ok(Message::Ping(vec![1]))).is_empty());
		assert!(decode_frame(Ok(Message::Text("not json".to_string()))).is_empty());
	}

	#[test]
	fn close_frame_reports_disconnect() {
		let items = decode_frame(Ok(Message::Close(None)));
		assert!(matches!(items.as_slice(), [Err(LedgerError::Disconnected)]));
	}

	#[tokio::test]
	async fn bounded_range_that_is_already_covered_fetches_nothing() {
		let client = client();
		assert!(client.next_page(Some(10), Some(10)).await.unwrap().is_none());
		assert!(client.next_page(None, None).await.unwrap().is_none());
	}
}

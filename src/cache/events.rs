//! Event channel between the synchronization loop and the embedding application.
//!
//! The loop reports lifecycle changes and accepted blocks as `CacheEvent`s. Applications register
//! plain closures per `EventKind`; the dispatcher invokes them synchronously, in registration
//! order, on the task that emitted the event. A panicking handler is caught and logged, and the
//! remaining handlers still run.

use super::types::SyncFailure;
use crate::ledger::Block;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

/// Kinds of events a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	Connected,
	Data,
	Error,
	Closed,
}

impl EventKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			EventKind::Connected => "connected",
			EventKind::Data => "data",
			EventKind::Error => "error",
			EventKind::Closed => "closed",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"connected" => Ok(EventKind::Connected),
			"data" => Ok(EventKind::Data),
			"error" => Ok(EventKind::Error),
			"closed" => Ok(EventKind::Closed),
			other => Err(format!("unknown event kind: {}", other)),
		}
	}
}

/// Events emitted by the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
	/// The live subscription is open (emitted again after every reconnect)
	Connected,
	/// Newly persisted blocks, ascending and contiguous
	Data(Vec<Block>),
	/// A failure the loop absorbed
	Error(SyncFailure),
	/// The cache shut down; emitted exactly once
	Closed,
}

impl CacheEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			CacheEvent::Connected => EventKind::Connected,
			CacheEvent::Data(_) => EventKind::Data,
			CacheEvent::Error(_) => EventKind::Error,
			CacheEvent::Closed => EventKind::Closed,
		}
	}
}

/// Callback invoked for each event of the kind it was registered for.
pub type EventHandler = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Token returned by `register_handler`, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
	next_id: u64,
	handlers: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
}

/// Event dispatcher that manages the registered handlers.
///
/// Clones share the same registry, so handlers registered through the cache handle are seen by the
/// running loop.
#[derive(Clone, Default)]
pub struct EventDispatcher {
	registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a handler for `kind`.
	///
	/// Handlers of the same kind are called in the order they are registered.
	pub fn register_handler(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
		let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
		registry.next_id += 1;
		let id = HandlerId(registry.next_id);
		registry.handlers.entry(kind).or_default().push((id, handler));
		id
	}

	/// Remove a handler. Returns false if it was not registered.
	pub fn remove_handler(&self, id: HandlerId) -> bool {
		let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
		for handlers in registry.handlers.values_mut() {
			if let Some(position) = handlers.iter().position(|(handler_id, _)| *handler_id == id) {
				handlers.remove(position);
				return true;
			}
		}
		false
	}

	pub fn handler_count(&self, kind: EventKind) -> usize {
		let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
		registry.handlers.get(&kind).map_or(0, Vec::len)
	}

	/// Dispatch an event to all handlers registered for its kind.
	///
	/// The registry is not locked while handlers run, so a handler may register or remove
	/// handlers; the change applies from the next event on.
	pub fn dispatch(&self, event: &CacheEvent) {
		let handlers: Vec<EventHandler> = {
			let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
			registry
				.handlers
				.get(&event.kind())
				.map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
				.unwrap_or_default()
		};

		for handler in handlers {
			if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
				error!("Handler for {} event panicked; continuing", event.kind());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
		let log = Arc::clone(log);
		Arc::new(move |event: &CacheEvent| {
			log.lock().unwrap().push(format!("{}:{}", tag, event.kind()));
		})
	}

	#[test]
	fn handlers_run_in_registration_order_for_their_kind() {
		let dispatcher = EventDispatcher::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		dispatcher.register_handler(EventKind::Connected, recorder(&log, "first"));
		dispatcher.register_handler(EventKind::Data, recorder(&log, "data"));
		dispatcher.register_handler(EventKind::Connected, recorder(&log, "second"));

		dispatcher.dispatch(&CacheEvent::Connected);

		assert_eq!(
			*log.lock().unwrap(),
			vec!["first:connected".to_string(), "second:connected".to_string()]
		);
	}

	#[test]
	fn panicking_handler_does_not_stop_the_others() {
		let dispatcher = EventDispatcher::new();
		let calls = Arc::new(AtomicUsize::new(0));
		dispatcher.register_handler(
			EventKind::Closed,
			Arc::new(|event: &CacheEvent| {
				if event.kind() == EventKind::Closed {
					panic!("handler bug");
				}
			}),
		);
		let counter = Arc::clone(&calls);
		dispatcher.register_handler(
			EventKind::Closed,
			Arc::new(move |_: &CacheEvent| {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
		);

		dispatcher.dispatch(&CacheEvent::Closed);
		dispatcher.dispatch(&CacheEvent::Closed);

		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn removed_handler_is_not_called() {
		let dispatcher = EventDispatcher::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let id = dispatcher.register_handler(EventKind::Data, recorder(&log, "data"));

		assert!(dispatcher.remove_handler(id));
		assert!(!dispatcher.remove_handler(id));
		assert_eq!(dispatcher.handler_count(EventKind::Data), 0);

		dispatcher.dispatch(&CacheEvent::Data(Vec::new()));
		assert!(log.lock().unwrap().is_empty());
	}

	#[test]
	fn event_kinds_parse_from_their_names() {
		for kind in [
			EventKind::Connected,
			EventKind::Data,
			EventKind::Error,
			EventKind::Closed,
		] {
			assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
		}
		assert!("reorg".parse::<EventKind>().is_err());
	}
}

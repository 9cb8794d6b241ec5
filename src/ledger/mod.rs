//! Ledger node integration module
//!
//! This module provides the client and types for reading blocks from a ResilientDB ledger node.
//! A node exposes two channels: a request/response channel for historical block ranges and a
//! push channel for blocks as they are produced. Both sit behind the `LedgerSource` trait so the
//! synchronization loop can run against any transport.

/// HTTP/WebSocket client for a ResilientDB node
mod client;
/// The `LedgerSource` seam and its stream type
mod source;
/// Block and error types
mod types;

pub use client::ResilientDbClient;
pub use source::{BlockStream, LedgerSource};
pub use types::*;

//! # Relay Client Library
//!
//! This library provides the client half of the position relay. A game or
//! render loop owns its authoritative local state and, once per frame:
//! 1. pushes its own position with [`network::RelayClient::send_state`]
//! 2. reads back the peers it should draw with [`network::RelayClient::peers`]
//!
//! ## Design
//!
//! ### Best-Effort Sending
//! A send never blocks the frame loop for longer than the write timeout and
//! never returns an error. A failed send is logged and simply superseded by
//! the next one; there is no queue and no retry.
//!
//! ### Background Receive
//! A single task reads the batches the server broadcasts and upserts every
//! entry except the client's own id into the peer table. When the server
//! goes away the client marks itself stopped. It does not reconnect; the
//! caller decides whether to call `connect` again.
//!
//! ### Peer Expiry
//! Peers are never dropped implicitly. A caller that wants departed players
//! to disappear calls [`network::RelayClient::prune_stale`] with the age it
//! considers stale.
//!
//! ## Module Organization
//!
//! - `network`: connection setup, sending, the receive task and shutdown
//! - `peers`: the peer table and its expiry policy
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::RelayClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayClient::connect("127.0.0.1", 5000, "p1").await?;
//!
//!     relay.send_state(10.0, 20.0, 0.0).await;
//!     for (id, state) in relay.peers().await {
//!         println!("{} at ({}, {})", id, state.x, state.y);
//!     }
//!
//!     relay.stop().await;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod peers;

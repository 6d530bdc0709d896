//! # Relay Server Library
//!
//! This library provides the server half of the position relay. The server
//! does not simulate anything: it stores the latest state each participant
//! reports and periodically sends the merged picture back to everyone.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Accepts TCP connections without any handshake. Each connection gets a
//! dedicated reader task that decodes newline-delimited JSON states and
//! stores the most recent one. Malformed lines are dropped; the connection
//! stays open.
//!
//! ### State Broadcasting
//! Once per tick (50 ms by default) the server builds a single batch holding
//! the newest state per participant id and writes it to every connection.
//! A connection that sends faster than the tick rate only contributes its
//! latest value, so fan-out cost is one pass per tick.
//!
//! ### Fault Isolation
//! A write that fails or stalls past the write timeout drops that one
//! connection. Delivery to the remaining connections is never interrupted.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! - Live connection set keyed by a server-assigned connection id
//! - Last-write-wins storage of each connection's latest state
//! - Snapshot construction with one entry per participant id
//!
//! ### Network Module (`network`)
//! - Listener setup and the accept loop
//! - Per-connection reader tasks
//! - The fixed-tick broadcast loop and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RelayServer::start("0.0.0.0", 5000).await?;
//!     println!("relay on {}", server.local_addr()?);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod registry;

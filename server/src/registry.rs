//! Live connection tracking for the relay server
//!
//! This module owns the server-side bookkeeping for every connected peer:
//! - Connection lifecycle (register on accept, remove on disconnect or failure)
//! - The most recent state each connection has reported (last-write-wins)
//! - Snapshot construction for the broadcast tick
//!
//! The registry holds no sockets for reading; reader tasks own their read
//! halves and only reach into the registry to store decoded states.

use log::{info, warn};
use shared::StateMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Server-assigned identity of one accepted connection
pub type ConnId = u64;

/// Write half of a connection, shared between the registry and the broadcast
pub type ConnWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Bookkeeping for one live connection
///
/// The record is a plain value owned by the registry. Transport state lives
/// in `writer` and `cancel`; application state is only `last_message`.
pub struct ConnectionRecord {
    /// Unique connection identifier assigned by the registry
    pub id: ConnId,
    /// Remote address of the peer
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Latest state received on this connection, absent until the first one
    last_message: Option<StateMessage>,
    /// Registry-wide receive sequence of `last_message`
    last_received: u64,
    writer: ConnWriter,
    cancel: CancellationToken,
}

impl ConnectionRecord {
    fn new(id: ConnId, addr: SocketAddr, writer: ConnWriter, cancel: CancellationToken) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            last_message: None,
            last_received: 0,
            writer,
            cancel,
        }
    }

    pub fn last_message(&self) -> Option<&StateMessage> {
        self.last_message.as_ref()
    }

    pub fn writer(&self) -> &ConnWriter {
        &self.writer
    }

    /// Token that stops this connection's reader task when cancelled
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One broadcast destination copied out of the registry
#[derive(Clone)]
pub struct BroadcastTarget {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub writer: ConnWriter,
}

/// Registry of every live connection and its last reported state
///
/// A single instance is shared behind one lock between the accept loop, the
/// reader tasks and the broadcast loop. Every method is a short in-memory
/// operation; no I/O ever happens while the registry is borrowed.
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, ConnectionRecord>,
    next_conn_id: ConnId,
    next_receive_seq: u64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_conn_id: 1,
            next_receive_seq: 1,
        }
    }

    /// Registers a freshly accepted connection and returns its id
    pub fn register(
        &mut self,
        addr: SocketAddr,
        writer: ConnWriter,
        cancel: CancellationToken,
    ) -> ConnId {
        let conn_id = self.next_conn_id;
        self.next_conn_id = conn_id + 1;

        self.connections
            .insert(conn_id, ConnectionRecord::new(conn_id, addr, writer, cancel));
        conn_id
    }

    /// Removes a connection, returning its record if it was still registered
    ///
    /// Removal is idempotent so the reader task and a failed broadcast write
    /// can both attempt it.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<ConnectionRecord> {
        self.connections.remove(&conn_id)
    }

    /// Removes and returns every registered connection
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.connections.drain().map(|(_, record)| record).collect()
    }

    /// Stores `state` as the connection's latest message
    ///
    /// Replaces any previous message unconditionally. Returns false if the
    /// connection is no longer registered.
    pub fn record_state(&mut self, conn_id: ConnId, state: StateMessage) -> bool {
        let owner_changed = match self.connections.get(&conn_id) {
            Some(record) => {
                record.last_message.as_ref().map(|m| m.id.as_str()) != Some(state.id.as_str())
            }
            None => return false,
        };

        if owner_changed {
            if let Some(other) = self.find_by_participant(&state.id, conn_id) {
                warn!(
                    "Participant id '{}' reported by connection {} is already used by connection {}; last write wins",
                    state.id, conn_id, other
                );
            } else {
                info!("Connection {} identified as '{}'", conn_id, state.id);
            }
        }

        let seq = self.next_receive_seq;
        self.next_receive_seq += 1;

        if let Some(record) = self.connections.get_mut(&conn_id) {
            record.last_message = Some(state);
            record.last_received = seq;
        }
        true
    }

    /// Finds another connection currently reporting `participant_id`
    pub fn find_by_participant(&self, participant_id: &str, exclude: ConnId) -> Option<ConnId> {
        self.connections
            .values()
            .find(|record| {
                record.id != exclude
                    && record
                        .last_message
                        .as_ref()
                        .is_some_and(|m| m.id == participant_id)
            })
            .map(|record| record.id)
    }

    /// Latest state per participant id across all connections
    ///
    /// Connections that have not reported yet are skipped. When several
    /// connections report the same id, only the most recently received
    /// message survives, so the result never holds an id twice.
    pub fn snapshot(&self) -> Vec<StateMessage> {
        let mut newest: HashMap<&str, (u64, &StateMessage)> = HashMap::new();

        for record in self.connections.values() {
            let Some(message) = record.last_message.as_ref() else {
                continue;
            };
            newest
                .entry(message.id.as_str())
                .and_modify(|entry| {
                    if record.last_received > entry.0 {
                        *entry = (record.last_received, message);
                    }
                })
                .or_insert((record.last_received, message));
        }

        newest.into_values().map(|(_, m)| m.clone()).collect()
    }

    /// Every connection the next batch should be written to
    pub fn targets(&self) -> Vec<BroadcastTarget> {
        self.connections
            .values()
            .map(|record| BroadcastTarget {
                id: record.id,
                addr: record.addr,
                writer: Arc::clone(&record.writer),
            })
            .collect()
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&ConnectionRecord> {
        self.connections.get(&conn_id)
    }

    /// Returns the number of currently registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn sink_writer() -> ConnWriter {
        Arc::new(Mutex::new(Box::new(tokio::io::sink())))
    }

    fn register(registry: &mut ConnectionRegistry, port: u16) -> ConnId {
        registry.register(test_addr(port), sink_writer(), CancellationToken::new())
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let mut registry = ConnectionRegistry::new();
        let a = register(&mut registry, 9001);
        let b = register(&mut registry, 9002);

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().addr, test_addr(9001));
        assert!(registry.get(a).unwrap().last_message().is_none());
    }

    #[test]
    fn test_default_registry_never_hands_out_zero() {
        let mut registry = ConnectionRegistry::default();
        assert_eq!(register(&mut registry, 9001), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let id = register(&mut registry, 9001);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_state_unknown_connection() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.record_state(42, StateMessage::new("p1", 0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_last_write_wins() {
        let mut registry = ConnectionRegistry::new();
        let id = register(&mut registry, 9001);

        registry.record_state(id, StateMessage::new("p1", 1.0, 1.0, 0.0));
        registry.record_state(id, StateMessage::new("p1", 2.0, 3.0, 0.5));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_approx_eq!(snapshot[0].x, 2.0);
        assert_approx_eq!(snapshot[0].y, 3.0);
        assert_approx_eq!(snapshot[0].ang, 0.5);
    }

    #[test]
    fn test_no_backlog_growth() {
        let mut registry = ConnectionRegistry::new();
        let id = register(&mut registry, 9001);

        for i in 0..10_000 {
            registry.record_state(id, StateMessage::new("p1", i as f64, 0.0, 0.0));
        }

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].x, 9999.0);
    }

    #[test]
    fn test_snapshot_skips_silent_connections() {
        let mut registry = ConnectionRegistry::new();
        let talker = register(&mut registry, 9001);
        register(&mut registry, 9002);

        assert!(registry.snapshot().is_empty());

        registry.record_state(talker, StateMessage::new("p1", 0.0, 0.0, 0.0));
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.targets().len(), 2);
    }

    #[test]
    fn test_duplicate_ids_keep_newest() {
        let mut registry = ConnectionRegistry::new();
        let first = register(&mut registry, 9001);
        let second = register(&mut registry, 9002);

        registry.record_state(first, StateMessage::new("dup", 1.0, 0.0, 0.0));
        registry.record_state(second, StateMessage::new("dup", 2.0, 0.0, 0.0));
        assert_eq!(registry.find_by_participant("dup", second), Some(first));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].x, 2.0);

        registry.record_state(first, StateMessage::new("dup", 3.0, 0.0, 0.0));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].x, 3.0);
    }

    #[test]
    fn test_snapshot_one_entry_per_participant() {
        let mut registry = ConnectionRegistry::new();
        for port in 0..5u16 {
            let id = register(&mut registry, 9000 + port);
            registry.record_state(id, StateMessage::new(format!("p{}", port), 0.0, 0.0, 0.0));
        }

        let mut ids: Vec<_> = registry.snapshot().into_iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ConnectionRegistry::new();
        register(&mut registry, 9001);
        register(&mut registry, 9002);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}

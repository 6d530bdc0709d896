//! Client-side view of the other participants.

use shared::StateMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub state: StateMessage,
    /// When a batch last carried this peer
    pub last_seen: Instant,
}

/// Latest known state of every peer, keyed by participant id.
///
/// Never holds the owning client's id. Entries are only removed through
/// [`PeerTable::prune_stale`].
#[derive(Debug)]
pub struct PeerTable {
    own_id: String,
    peers: HashMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new(own_id: impl Into<String>) -> Self {
        Self {
            own_id: own_id.into(),
            peers: HashMap::new(),
        }
    }

    /// Upserts every entry of a batch except our own. Returns how many were
    /// applied.
    pub fn apply_batch(&mut self, messages: Vec<StateMessage>, now: Instant) -> usize {
        let mut applied = 0;
        for state in messages {
            if state.id == self.own_id {
                continue;
            }
            self.peers.insert(
                state.id.clone(),
                PeerEntry {
                    state,
                    last_seen: now,
                },
            );
            applied += 1;
        }
        applied
    }

    /// Removes peers not refreshed within `max_age` of `now` and returns
    /// their ids.
    pub fn prune_stale(&mut self, max_age: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn get(&self, id: &str) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    /// Copies the current states out for the render loop.
    pub fn states(&self) -> HashMap<String, StateMessage> {
        self.peers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_apply_batch_excludes_self() {
        let mut table = PeerTable::new("p1");
        let applied = table.apply_batch(
            vec![
                StateMessage::new("p1", 10.0, 20.0, 0.0),
                StateMessage::new("p2", 30.0, 40.0, 1.57),
            ],
            Instant::now(),
        );

        assert_eq!(applied, 1);
        assert!(table.get("p1").is_none());
        let p2 = &table.get("p2").unwrap().state;
        assert_approx_eq!(p2.x, 30.0);
        assert_approx_eq!(p2.ang, 1.57);
    }

    #[test]
    fn test_apply_batch_overwrites() {
        let mut table = PeerTable::new("me");
        let now = Instant::now();
        table.apply_batch(vec![StateMessage::new("p2", 1.0, 1.0, 0.0)], now);
        table.apply_batch(vec![StateMessage::new("p2", 5.0, 6.0, 0.0)], now);

        assert_eq!(table.len(), 1);
        assert_eq!(table.states()["p2"].x, 5.0);
    }

    #[test]
    fn test_peers_not_in_batch_are_kept() {
        let mut table = PeerTable::new("me");
        let now = Instant::now();
        table.apply_batch(
            vec![
                StateMessage::new("p2", 0.0, 0.0, 0.0),
                StateMessage::new("p3", 0.0, 0.0, 0.0),
            ],
            now,
        );
        table.apply_batch(vec![StateMessage::new("p3", 1.0, 0.0, 0.0)], now);

        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_prune_stale() {
        let mut table = PeerTable::new("me");
        let start = Instant::now();
        table.apply_batch(vec![StateMessage::new("old", 0.0, 0.0, 0.0)], start);
        table.apply_batch(
            vec![StateMessage::new("fresh", 0.0, 0.0, 0.0)],
            start + Duration::from_millis(400),
        );

        let removed =
            table.prune_stale(Duration::from_millis(200), start + Duration::from_millis(500));

        assert_eq!(removed, vec!["old".to_string()]);
        assert!(table.get("fresh").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_prune_nothing_when_fresh() {
        let mut table = PeerTable::new("me");
        let now = Instant::now();
        table.apply_batch(vec![StateMessage::new("p2", 0.0, 0.0, 0.0)], now);

        assert!(table.prune_stale(Duration::from_secs(1), now).is_empty());
        assert!(!table.is_empty());
    }
}

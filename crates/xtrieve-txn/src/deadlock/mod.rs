//! Wait-for graph deadlock detection.
//!
//! Each edge records one session waiting for another's lock. A cycle
//! through the graph is a deadlock; the victim is the youngest session in
//! the cycle: the one whose transaction (or, outside a transaction, whose
//! last registration) started most recently, since it has the least work
//! to lose.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::RwLock;

use xtrieve_common::types::SessionId;

/// The wait-for graph.
pub struct WaitForGraph {
    /// When each known session (re)started work, for victim selection.
    nodes: RwLock<HashMap<SessionId, Instant>>,
    /// waiter → the set of holders it is waiting on.
    edges: RwLock<HashMap<SessionId, HashSet<SessionId>>>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            edges: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or refreshes) a session's start time. Called when a
    /// session first appears and again when it begins a transaction.
    pub fn note_start(&self, session: SessionId) {
        self.nodes.write().insert(session, Instant::now());
    }

    /// Replaces the waiter's outgoing edges with a single wait on
    /// `holder`. One operation waits on at most one lock at a time.
    pub fn set_wait(&self, waiter: SessionId, holder: SessionId) {
        self.nodes.write().entry(waiter).or_insert_with(Instant::now);
        self.nodes.write().entry(holder).or_insert_with(Instant::now);

        let mut edges = self.edges.write();
        let set = edges.entry(waiter).or_default();
        set.clear();
        set.insert(holder);
    }

    /// Drops every outgoing edge of `waiter`.
    pub fn clear_waits(&self, waiter: SessionId) {
        self.edges.write().remove(&waiter);
    }

    /// Removes a session entirely.
    pub fn remove_session(&self, session: SessionId) {
        self.nodes.write().remove(&session);
        let mut edges = self.edges.write();
        edges.remove(&session);
        for holders in edges.values_mut() {
            holders.remove(&session);
        }
    }

    /// Finds a cycle reachable from `start`, if any.
    pub fn find_cycle(&self, start: SessionId) -> Option<Vec<SessionId>> {
        let edges = self.edges.read();
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        if Self::dfs(start, &edges, &mut visited, &mut path) {
            // `path` ends with the session that closed the cycle; trim the
            // lead-in before it.
            let closer = *path.last().unwrap();
            let from = path.iter().position(|&s| s == closer).unwrap();
            let mut cycle = path[from..path.len() - 1].to_vec();
            cycle.dedup();
            Some(cycle)
        } else {
            None
        }
    }

    fn dfs(
        current: SessionId,
        edges: &HashMap<SessionId, HashSet<SessionId>>,
        visited: &mut HashSet<SessionId>,
        path: &mut Vec<SessionId>,
    ) -> bool {
        if path.contains(&current) {
            path.push(current);
            return true;
        }
        if !visited.insert(current) {
            return false;
        }

        path.push(current);
        if let Some(holders) = edges.get(&current) {
            for &holder in holders {
                if Self::dfs(holder, edges, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Detects a deadlock involving `start` and picks the youngest cycle
    /// member as the victim.
    pub fn victim_for(&self, start: SessionId) -> Option<SessionId> {
        let cycle = self.find_cycle(start)?;
        let nodes = self.nodes.read();
        cycle
            .into_iter()
            .max_by_key(|s| nodes.get(s).copied().unwrap_or_else(Instant::now))
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(id: u64) -> SessionId {
        SessionId::new(id)
    }

    #[test]
    fn test_no_cycle() {
        let graph = WaitForGraph::new();
        graph.set_wait(s(1), s(2));
        graph.set_wait(s(2), s(3));
        assert!(graph.find_cycle(s(1)).is_none());
        assert!(graph.victim_for(s(1)).is_none());
    }

    #[test]
    fn test_two_party_cycle() {
        let graph = WaitForGraph::new();
        graph.note_start(s(1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        graph.note_start(s(2));

        graph.set_wait(s(1), s(2));
        graph.set_wait(s(2), s(1));

        let cycle = graph.find_cycle(s(1)).unwrap();
        assert!(cycle.contains(&s(1)) && cycle.contains(&s(2)));

        // Session 2 started later, so it is the victim.
        assert_eq!(graph.victim_for(s(1)), Some(s(2)));
    }

    #[test]
    fn test_three_party_cycle() {
        let graph = WaitForGraph::new();
        for id in 1..=3 {
            graph.note_start(s(id));
        }
        graph.set_wait(s(1), s(2));
        graph.set_wait(s(2), s(3));
        graph.set_wait(s(3), s(1));

        let cycle = graph.find_cycle(s(2)).unwrap();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_set_wait_replaces() {
        let graph = WaitForGraph::new();
        graph.set_wait(s(1), s(2));
        // The holder changed hands; the old edge must not linger.
        graph.set_wait(s(1), s(3));
        graph.set_wait(s(2), s(1));
        assert!(graph.find_cycle(s(1)).is_none());
    }

    #[test]
    fn test_clear_and_remove() {
        let graph = WaitForGraph::new();
        graph.set_wait(s(1), s(2));
        graph.set_wait(s(2), s(1));
        graph.clear_waits(s(1));
        assert!(graph.find_cycle(s(2)).is_none());

        graph.set_wait(s(1), s(2));
        graph.remove_session(s(1));
        assert!(graph.find_cycle(s(2)).is_none());
    }
}

//! Core Raft state: roles, log entries and the per-node volatile state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// One voting member of the consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addr: String,
}

/// What a log entry carries. The consensus layer never interprets command
/// bytes; they are handed to the state machine once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An opaque state-machine command.
    Command(Vec<u8>),
    /// A full replacement membership configuration, applied on append.
    Configuration(Vec<Peer>),
    /// Barrier entry appended when a leader takes over.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// Volatile and persistent-by-contract Raft state. The log itself lives in
/// [`crate::raft::storage::LogStore`]; term and vote changes must be
/// persisted by the caller before answering RPCs.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,

    pub commit_index: u64,
    pub last_applied: u64,

    // Leader bookkeeping, reinitialized after election.
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    pub role: RaftRole,
    pub leader_id: Option<String>,
    pub leader_addr: Option<String>,

    pub votes_received: u64,

    /// Latest membership configuration seen in the log (or the snapshot).
    pub configuration: Vec<Peer>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            leader_addr: None,
            votes_received: 0,
            configuration: Vec::new(),
        }
    }

    /// Peers in the current configuration other than `my_id`.
    pub fn other_peers(&self, my_id: &str) -> Vec<Peer> {
        self.configuration
            .iter()
            .filter(|p| p.id != my_id)
            .cloned()
            .collect()
    }

    pub fn majority(&self) -> usize {
        self.configuration.len() / 2 + 1
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.configuration.iter().any(|p| p.id == id)
    }

    pub fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received = 0;
    }

    pub fn become_candidate(&mut self, my_id: &str) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id.to_string());
        self.votes_received = 1;
        self.leader_id = None;
        self.leader_addr = None;
    }

    pub fn become_leader(&mut self, my_id: &str, my_addr: &str, last_log_index: u64) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id.to_string());
        self.leader_addr = Some(my_addr.to_string());

        self.next_index.clear();
        self.match_index.clear();
        for peer in self.other_peers(my_id) {
            self.next_index.insert(peer.id.clone(), last_log_index + 1);
            self.match_index.insert(peer.id, 0);
        }
    }

    /// Whether a candidate's log is at least as up to date as ours.
    pub fn is_log_up_to_date(
        &self,
        our_last_index: u64,
        our_last_term: u64,
        candidate_last_index: u64,
        candidate_last_term: u64,
    ) -> bool {
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[&str]) -> Vec<Peer> {
        ids.iter()
            .map(|id| Peer {
                id: id.to_string(),
                addr: format!("{id}:6868"),
            })
            .collect()
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.voted_for.is_none());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate("n1");

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("n1"));
        assert_eq!(state.votes_received, 1);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn test_become_leader_initializes_follower_indices() {
        let mut state = RaftState::new();
        state.configuration = peers(&["n1", "n2", "n3"]);
        state.become_candidate("n1");
        state.become_leader("n1", "n1:6868", 4);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id.as_deref(), Some("n1"));
        assert_eq!(state.next_index.get("n2"), Some(&5));
        assert_eq!(state.next_index.get("n3"), Some(&5));
        assert_eq!(state.match_index.get("n2"), Some(&0));
        assert!(!state.next_index.contains_key("n1"));
    }

    #[test]
    fn test_become_follower_clears_vote() {
        let mut state = RaftState::new();
        state.become_candidate("n1");
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert!(state.voted_for.is_none());
        assert_eq!(state.votes_received, 0);
    }

    #[test]
    fn test_majority_and_voters() {
        let mut state = RaftState::new();
        state.configuration = peers(&["n1", "n2", "n3"]);
        assert_eq!(state.majority(), 2);
        assert!(state.is_voter("n2"));
        assert!(!state.is_voter("n9"));
        assert_eq!(state.other_peers("n1").len(), 2);
    }

    #[test]
    fn test_log_up_to_date_rules() {
        let state = RaftState::new();
        // Higher term always wins.
        assert!(state.is_log_up_to_date(2, 2, 1, 3));
        // Same term needs at least the same index.
        assert!(state.is_log_up_to_date(2, 2, 2, 2));
        assert!(state.is_log_up_to_date(2, 2, 3, 2));
        assert!(!state.is_log_up_to_date(2, 2, 1, 2));
        // Lower term never wins.
        assert!(!state.is_log_up_to_date(2, 2, 5, 1));
    }
}

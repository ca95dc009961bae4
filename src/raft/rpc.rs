//! Pure handlers for the consensus RPCs, operating on the shared state and
//! log under the node's write lock.

use crate::proto::{
    raft_log_entry, AppendEntriesRequest, AppendEntriesResponse, RaftConfiguration,
    RaftLogEntry as ProtoLogEntry, RaftPeer, VoteRequest, VoteResponse,
};
use crate::raft::state::{EntryPayload, LogEntry, Peer, RaftRole, RaftState};
use crate::raft::storage::LogStore;

fn persist_meta(state: &RaftState, log: &mut LogStore) {
    if let Err(e) = log.set_meta(state.current_term, state.voted_for.clone()) {
        tracing::error!(error = %e, "raft: failed to persist term/vote");
    }
}

/// Handle a RequestVote RPC.
pub fn handle_request_vote(
    state: &mut RaftState,
    log: &mut LogStore,
    req: &VoteRequest,
    my_id: &str,
) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
        persist_meta(state, log);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for.as_deref() != Some(&req.candidate_id) {
        // Already voted for someone else this term.
        false
    } else if !state.is_log_up_to_date(
        log.last_index(),
        log.last_term(),
        req.last_log_index,
        req.last_log_term,
    ) {
        false
    } else {
        state.voted_for = Some(req.candidate_id.clone());
        persist_meta(state, log);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle an AppendEntries RPC.
pub fn handle_append_entries(
    state: &mut RaftState,
    log: &mut LogStore,
    req: &AppendEntriesRequest,
    my_id: &str,
) -> AppendEntriesResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
        persist_meta(state, log);
    }

    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: log.last_index(),
        };
    }

    // A valid AppendEntries from the current leader; candidates step down.
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
        persist_meta(state, log);
    }
    state.leader_id = Some(req.leader_id.clone());
    state.leader_addr = state
        .configuration
        .iter()
        .find(|p| p.id == req.leader_id)
        .map(|p| p.addr.clone());

    // Entries at or below the snapshot base are already covered.
    if req.prev_log_index < log.snapshot_last_index {
        return AppendEntriesResponse {
            term: state.current_term,
            success: true,
            match_index: log.last_index(),
        };
    }

    if req.prev_log_index > 0 && req.prev_log_index != log.snapshot_last_index {
        match log.term_at(req.prev_log_index) {
            None => {
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: log.last_index(),
                };
            }
            Some(term) if term != req.prev_log_term => {
                // Conflicting entry, drop it and everything after it.
                if let Err(e) = log.truncate_from(req.prev_log_index) {
                    tracing::error!(error = %e, "raft: failed to truncate conflicting log");
                }
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: log.last_index(),
                };
            }
            Some(_) => {}
        }
    }

    if !req.entries.is_empty() {
        let new_entries: Vec<LogEntry> = req
            .entries
            .iter()
            .filter(|e| e.index > log.snapshot_last_index)
            .map(proto_to_entry)
            .collect();

        for entry in &new_entries {
            if let EntryPayload::Configuration(peers) = &entry.payload {
                state.configuration = peers.clone();
            }
        }

        if let Err(e) = log.append(&new_entries) {
            tracing::error!(error = %e, "raft: failed to append entries");
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: log.last_index(),
            };
        }

        tracing::debug!(
            node_id = my_id,
            entries_appended = new_entries.len(),
            new_last_index = log.last_index(),
            "Appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, log.last_index());
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: log.last_index(),
    }
}

pub fn entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    let payload = match &entry.payload {
        EntryPayload::Command(data) => Some(raft_log_entry::Payload::Command(data.clone())),
        EntryPayload::Configuration(peers) => {
            Some(raft_log_entry::Payload::Configuration(RaftConfiguration {
                servers: peers
                    .iter()
                    .map(|p| RaftPeer {
                        id: p.id.clone(),
                        address: p.addr.clone(),
                    })
                    .collect(),
            }))
        }
        EntryPayload::Noop => None,
    };

    ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        payload,
    }
}

pub fn proto_to_entry(proto: &ProtoLogEntry) -> LogEntry {
    let payload = match &proto.payload {
        Some(raft_log_entry::Payload::Command(data)) => EntryPayload::Command(data.clone()),
        Some(raft_log_entry::Payload::Configuration(config)) => EntryPayload::Configuration(
            config
                .servers
                .iter()
                .map(|s| Peer {
                    id: s.id.clone(),
                    addr: s.address.clone(),
                })
                .collect(),
        ),
        None => EntryPayload::Noop,
    };

    LogEntry {
        term: proto.term,
        index: proto.index,
        payload,
    }
}

pub fn configuration_to_proto(peers: &[Peer]) -> RaftConfiguration {
    RaftConfiguration {
        servers: peers
            .iter()
            .map(|p| RaftPeer {
                id: p.id.clone(),
                address: p.addr.clone(),
            })
            .collect(),
    }
}

pub fn proto_to_configuration(config: &RaftConfiguration) -> Vec<Peer> {
    config
        .servers
        .iter()
        .map(|s| Peer {
            id: s.id.clone(),
            addr: s.address.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Command(vec![1, 2, 3]),
        }
    }

    fn vote_req(term: u64, candidate: &str, last_index: u64, last_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut state = RaftState::new();
        let mut log = LogStore::open(None).unwrap();

        let resp = handle_request_vote(&mut state, &mut log, &vote_req(1, "n2", 0, 0), "n1");
        assert!(resp.vote_granted);

        // A competing candidate in the same term is refused.
        let resp = handle_request_vote(&mut state, &mut log, &vote_req(1, "n3", 0, 0), "n1");
        assert!(!resp.vote_granted);

        // The same candidate asking again still gets the vote.
        let resp = handle_request_vote(&mut state, &mut log, &vote_req(1, "n2", 0, 0), "n1");
        assert!(resp.vote_granted);
    }

    #[test]
    fn test_vote_rejected_for_stale_term_or_log() {
        let mut state = RaftState::new();
        state.current_term = 5;
        let mut log = LogStore::open(None).unwrap();
        log.append(&[entry(5, 1)]).unwrap();

        let resp = handle_request_vote(&mut state, &mut log, &vote_req(4, "n2", 10, 4), "n1");
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);

        // Same term but shorter log.
        let resp = handle_request_vote(&mut state, &mut log, &vote_req(5, "n2", 0, 0), "n1");
        assert!(!resp.vote_granted);
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let mut state = RaftState::new();
        state.current_term = 3;
        let mut log = LogStore::open(None).unwrap();

        let req = AppendEntriesRequest {
            term: 2,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &mut log, &req, "n1");
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
    }

    #[test]
    fn test_append_entries_appends_and_commits() {
        let mut state = RaftState::new();
        let mut log = LogStore::open(None).unwrap();

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry_to_proto(&entry(1, 1)), entry_to_proto(&entry(1, 2))],
            leader_commit: 1,
        };
        let resp = handle_append_entries(&mut state, &mut log, &req, "n1");
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(state.commit_index, 1);
        assert_eq!(state.leader_id.as_deref(), Some("n2"));
    }

    #[test]
    fn test_append_entries_truncates_conflicts() {
        let mut state = RaftState::new();
        state.current_term = 2;
        let mut log = LogStore::open(None).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();

        // Leader disagrees about the term of entry 2.
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: "n2".into(),
            prev_log_index: 2,
            prev_log_term: 2,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &mut log, &req, "n1");
        assert!(!resp.success);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_append_entries_missing_prev_entry() {
        let mut state = RaftState::new();
        let mut log = LogStore::open(None).unwrap();

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![entry_to_proto(&entry(1, 6))],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &mut log, &req, "n1");
        assert!(!resp.success);
        assert_eq!(resp.match_index, 0);
    }

    #[test]
    fn test_configuration_entries_apply_on_append() {
        let mut state = RaftState::new();
        let mut log = LogStore::open(None).unwrap();

        let config = LogEntry {
            term: 1,
            index: 1,
            payload: EntryPayload::Configuration(vec![
                Peer {
                    id: "n1".into(),
                    addr: "127.0.0.1:1".into(),
                },
                Peer {
                    id: "n2".into(),
                    addr: "127.0.0.1:2".into(),
                },
            ]),
        };
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry_to_proto(&config)],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &mut log, &req, "n1");
        assert!(resp.success);
        assert_eq!(state.configuration.len(), 2);
        assert!(state.is_voter("n1"));
    }

    #[test]
    fn test_entry_proto_roundtrip() {
        for payload in [
            EntryPayload::Command(vec![9, 9]),
            EntryPayload::Configuration(vec![Peer {
                id: "n1".into(),
                addr: "a:1".into(),
            }]),
            EntryPayload::Noop,
        ] {
            let entry = LogEntry {
                term: 7,
                index: 8,
                payload,
            };
            assert_eq!(proto_to_entry(&entry_to_proto(&entry)), entry);
        }
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{ServerMessage, Signal};
use super::types::{OutboundMessage, SessionId, SessionState, SignalingError};

/// Commands sent to the matchmaker actor
pub(crate) enum MatchCommand {
    Admit {
        id: SessionId,
        addr: SocketAddr,
        session_tx: mpsc::UnboundedSender<OutboundMessage>,
        evict_tx: oneshot::Sender<()>,
    },
    Relay {
        from: SessionId,
        signal: Signal,
    },
    LinkEstablished {
        id: SessionId,
    },
    Disconnect {
        id: SessionId,
    },
    Reap {
        id: SessionId,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) async fn matchmaker_actor(mut rx: mpsc::Receiver<MatchCommand>) {
    let mut state = Matchmaker::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            MatchCommand::Admit {
                id,
                addr,
                session_tx,
                evict_tx,
            } => state.admit(id, addr, session_tx, evict_tx),
            MatchCommand::Relay { from, signal } => state.relay(from, signal),
            MatchCommand::LinkEstablished { id } => state.link_established(id),
            MatchCommand::Disconnect { id } => state.disconnect(id),
            MatchCommand::Reap { id } => state.reap(id),
            MatchCommand::RoomCount { reply } => {
                let _ = reply.send(state.room_count());
            }
        }
    }
}

/// Session registry, waiting pool and room table.
///
/// Owned exclusively by the actor task, so each command mutates the three
/// structures as one uninterrupted step and a half-applied pairing is never
/// observable.
struct Matchmaker {
    sessions: HashMap<SessionId, SessionState>,
    /// Unmatched sessions, newest last; pairing pops from the back
    waiting: Vec<SessionId>,
    /// Symmetric peer mapping; both directed entries live and die together
    peer_of: HashMap<SessionId, SessionId>,
}

impl Matchmaker {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            waiting: Vec::new(),
            peer_of: HashMap::new(),
        }
    }

    fn admit(
        &mut self,
        id: SessionId,
        addr: SocketAddr,
        session_tx: mpsc::UnboundedSender<OutboundMessage>,
        evict_tx: oneshot::Sender<()>,
    ) {
        info!("Session {} admitted from {}", id, addr);
        self.sessions.insert(
            id,
            SessionState {
                addr,
                tx: session_tx,
                evict: Some(evict_tx),
            },
        );
        self.waiting.push(id);
        self.pair_waiting();
    }

    /// Pairing pass: take the two newest waiting sessions, re-check that
    /// both connections are still live, and commit a room. A dead entry is
    /// dropped from the pool (its disconnect handler owns full cleanup) and
    /// the surviving one goes back on top of the stack.
    fn pair_waiting(&mut self) {
        while self.waiting.len() >= 2 {
            let Some(first) = self.waiting.pop() else { break };
            let Some(second) = self.waiting.pop() else { break };

            let first_live = self.sessions.get(&first).is_some_and(SessionState::is_live);
            let second_live = self
                .sessions
                .get(&second)
                .is_some_and(SessionState::is_live);

            match (first_live, second_live) {
                (true, true) => self.commit_room(first, second),
                (true, false) => {
                    debug!("Discarding stale waiting session {}", second);
                    self.waiting.push(first);
                }
                (false, true) => {
                    debug!("Discarding stale waiting session {}", first);
                    self.waiting.push(second);
                }
                (false, false) => {
                    debug!(
                        "Discarding stale waiting sessions {} and {}",
                        first, second
                    );
                }
            }
        }
    }

    /// Insert both directed entries, then tell both members. The
    /// first-popped (newest) member opens the handshake.
    fn commit_room(&mut self, first: SessionId, second: SessionId) {
        self.peer_of.insert(first, second);
        self.peer_of.insert(second, first);

        info!("Room created: {} <-> {}", first, second);
        self.notify(first, &ServerMessage::RoomCreated { initiator: true });
        self.notify(second, &ServerMessage::RoomCreated { initiator: false });
    }

    fn relay(&mut self, from: SessionId, signal: Signal) {
        let Some(&peer) = self.peer_of.get(&from) else {
            // Normal race: the peer disconnected a moment earlier
            debug!("Session {} has no peer, dropping signal", from);
            return;
        };
        self.notify(peer, &ServerMessage::FromServer { signal });
    }

    /// The client reports its direct peer link is up. The session is
    /// forgotten while the transport connection stays open; the eventual
    /// disconnect becomes a no-op.
    fn link_established(&mut self, id: SessionId) {
        if self.sessions.contains_key(&id) {
            info!("Peer link established for {}", id);
        }
        self.remove_session(id);
    }

    fn disconnect(&mut self, id: SessionId) {
        if self.sessions.contains_key(&id) {
            info!("Session {} disconnected", id);
        }
        self.remove_session(id);
    }

    /// Abandonment timer fired. Paired sessions are spared; an unmatched
    /// one still connected is forcibly closed, and cleanup then runs
    /// through its normal disconnect path. Stale fires are no-ops.
    fn reap(&mut self, id: SessionId) {
        if self.peer_of.contains_key(&id) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        warn!("Session {} unpaired after grace period, evicting", id);
        if let Some(evict) = session.evict.take() {
            let _ = evict.send(());
        }
    }

    fn room_count(&self) -> usize {
        self.peer_of.len() / 2
    }

    /// Idempotent removal from registry, waiting pool and room table
    fn remove_session(&mut self, id: SessionId) {
        self.teardown_room(id);
        self.waiting.retain(|waiting| *waiting != id);
        self.sessions.remove(&id);
    }

    /// Remove both directed entries for the room containing `id`, if any
    fn teardown_room(&mut self, id: SessionId) {
        if let Some(peer) = self.peer_of.remove(&id) {
            self.peer_of.remove(&peer);
            info!("Room torn down: {} <-> {}", id, peer);
        }
    }

    fn notify(&self, id: SessionId, msg: &ServerMessage) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let json =
            serde_json::to_string(msg).expect("ServerMessage serialization should never fail");
        let _ = session.tx.send(OutboundMessage::from(json));
    }
}

/// Handle to communicate with the matchmaker actor
#[derive(Clone)]
pub struct MatchmakerHandle {
    pub(crate) tx: mpsc::Sender<MatchCommand>,
}

impl MatchmakerHandle {
    /// Register a freshly accepted connection and trigger a pairing pass
    pub(crate) async fn admit(
        &self,
        id: SessionId,
        addr: SocketAddr,
        session_tx: mpsc::UnboundedSender<OutboundMessage>,
        evict_tx: oneshot::Sender<()>,
    ) {
        let _ = self
            .tx
            .send(MatchCommand::Admit {
                id,
                addr,
                session_tx,
                evict_tx,
            })
            .await;
    }

    /// Forward a handshake message to the sender's current peer
    pub async fn relay(&self, from: SessionId, signal: Signal) {
        let _ = self.tx.send(MatchCommand::Relay { from, signal }).await;
    }

    /// The client no longer needs the relay
    pub async fn link_established(&self, id: SessionId) {
        let _ = self.tx.send(MatchCommand::LinkEstablished { id }).await;
    }

    /// Tear down everything the session touches; safe to call twice
    pub async fn disconnect(&self, id: SessionId) {
        let _ = self.tx.send(MatchCommand::Disconnect { id }).await;
    }

    /// Abandonment timer callback for `id`
    pub async fn reap(&self, id: SessionId) {
        let _ = self.tx.send(MatchCommand::Reap { id }).await;
    }

    /// Number of rooms currently committed
    pub async fn room_count(&self) -> Result<usize, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(MatchCommand::RoomCount { reply: reply_tx }).await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSession {
        id: SessionId,
        rx: mpsc::UnboundedReceiver<OutboundMessage>,
        evict_rx: oneshot::Receiver<()>,
    }

    impl TestSession {
        /// Next message pushed to this session, if any
        fn next_message(&mut self) -> Option<ServerMessage> {
            self.rx
                .try_recv()
                .ok()
                .map(|msg| serde_json::from_str(msg.into_inner().as_str()).unwrap())
        }

        fn evicted(&mut self) -> bool {
            self.evict_rx.try_recv().is_ok()
        }
    }

    fn admit(state: &mut Matchmaker) -> TestSession {
        let id = SessionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = oneshot::channel();
        state.admit(id, "127.0.0.1:5000".parse().unwrap(), tx, evict_tx);
        TestSession { id, rx, evict_rx }
    }

    /// Put a session into the registry and pool without running a pairing
    /// pass, to observe the pool discipline with several entries queued
    fn register(state: &mut Matchmaker) -> TestSession {
        let id = SessionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let (evict_tx, evict_rx) = oneshot::channel();
        state.sessions.insert(
            id,
            SessionState {
                addr: "127.0.0.1:5000".parse().unwrap(),
                tx,
                evict: Some(evict_tx),
            },
        );
        state.waiting.push(id);
        TestSession { id, rx, evict_rx }
    }

    fn assert_invariants(state: &Matchmaker) {
        for (a, b) in &state.peer_of {
            assert_eq!(state.peer_of.get(b), Some(a), "room table not symmetric");
            assert!(
                state.sessions.contains_key(a),
                "paired session not registered"
            );
            assert!(
                !state.waiting.contains(a),
                "session both paired and waiting"
            );
        }
        for waiting in &state.waiting {
            assert!(
                state.sessions.contains_key(waiting),
                "waiting session not registered"
            );
        }
        let mut seen = std::collections::HashSet::new();
        for waiting in &state.waiting {
            assert!(seen.insert(*waiting), "session waiting twice");
        }
    }

    fn description(sdp: &str) -> Signal {
        Signal::SessionDescription(serde_json::json!({ "sdp": sdp }))
    }

    #[test]
    fn two_sessions_pair_with_one_initiator() {
        let mut state = Matchmaker::new();
        let mut s1 = admit(&mut state);
        let mut s2 = admit(&mut state);

        assert_eq!(state.peer_of.get(&s1.id), Some(&s2.id));
        assert_eq!(state.peer_of.get(&s2.id), Some(&s1.id));

        let initiators: Vec<bool> = [s1.next_message(), s2.next_message()]
            .into_iter()
            .map(|msg| match msg {
                Some(ServerMessage::RoomCreated { initiator }) => initiator,
                other => panic!("Expected RoomCreated, got {:?}", other),
            })
            .collect();
        assert_eq!(initiators.iter().filter(|i| **i).count(), 1);

        assert_invariants(&state);
    }

    #[test]
    fn pairing_pass_takes_the_two_newest() {
        let mut state = Matchmaker::new();
        let s1 = register(&mut state);
        let s2 = register(&mut state);
        let mut s3 = register(&mut state);

        state.pair_waiting();

        // LIFO: the two newest waiting sessions go together
        assert_eq!(state.peer_of.get(&s2.id), Some(&s3.id));
        assert!(!state.peer_of.contains_key(&s1.id));
        assert_eq!(state.waiting, vec![s1.id]);

        // The last-pushed member opens the handshake
        match s3.next_message() {
            Some(ServerMessage::RoomCreated { initiator }) => assert!(initiator),
            other => panic!("Expected RoomCreated, got {:?}", other),
        }
        assert_invariants(&state);
    }

    #[test]
    fn relay_reaches_only_the_peer() {
        let mut state = Matchmaker::new();
        let mut s1 = admit(&mut state);
        let mut s2 = admit(&mut state);
        s1.next_message();
        s2.next_message();
        let mut s3 = admit(&mut state);

        state.relay(s1.id, description("v=0"));

        match s2.next_message() {
            Some(ServerMessage::FromServer {
                signal: Signal::SessionDescription(payload),
            }) => assert_eq!(payload["sdp"], "v=0"),
            other => panic!("Expected relayed description, got {:?}", other),
        }
        assert!(s1.next_message().is_none());
        assert!(s3.next_message().is_none());
    }

    #[test]
    fn relay_without_peer_is_dropped() {
        let mut state = Matchmaker::new();
        let mut s1 = admit(&mut state);

        state.relay(s1.id, description("v=0"));

        assert!(s1.next_message().is_none());
        assert_invariants(&state);
    }

    #[test]
    fn early_disconnect_leaves_later_pairings_untouched() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        state.disconnect(s1.id);

        assert!(state.waiting.is_empty());
        assert!(state.sessions.is_empty());

        let s2 = admit(&mut state);
        let s3 = admit(&mut state);

        assert_eq!(state.peer_of.get(&s2.id), Some(&s3.id));
        assert_invariants(&state);
    }

    #[test]
    fn disconnect_tears_down_both_room_entries() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        let s2 = admit(&mut state);

        state.disconnect(s1.id);

        assert!(state.peer_of.is_empty());
        assert!(state.sessions.contains_key(&s2.id));
        assert_invariants(&state);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        let _s2 = admit(&mut state);

        state.disconnect(s1.id);
        let sessions_after_first = state.sessions.len();
        state.disconnect(s1.id);

        assert_eq!(state.sessions.len(), sessions_after_first);
        assert!(state.peer_of.is_empty());
        assert_invariants(&state);
    }

    #[test]
    fn stale_waiting_entry_is_skipped() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        drop(s1.rx);

        let s2 = admit(&mut state);

        // The dead s1 is discarded; s2 goes back to waiting
        assert!(state.peer_of.is_empty());
        assert_eq!(state.waiting, vec![s2.id]);

        let s3 = admit(&mut state);
        assert_eq!(state.peer_of.get(&s2.id), Some(&s3.id));
        assert_invariants(&state);
    }

    #[test]
    fn reap_evicts_only_unpaired_sessions() {
        let mut state = Matchmaker::new();
        let mut lone = admit(&mut state);
        state.reap(lone.id);
        assert!(lone.evicted());
        // forced close runs the normal disconnect path
        state.disconnect(lone.id);

        let mut s1 = admit(&mut state);
        let mut s2 = admit(&mut state);
        state.reap(s1.id);
        assert!(!s1.evicted());
        assert!(!s2.evicted());
        assert_eq!(state.peer_of.get(&s1.id), Some(&s2.id));
    }

    #[test]
    fn reap_after_removal_is_a_no_op() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        state.disconnect(s1.id);

        state.reap(s1.id);
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn link_established_forgets_the_session() {
        let mut state = Matchmaker::new();
        let s1 = admit(&mut state);
        let mut s2 = admit(&mut state);
        s2.next_message();

        state.link_established(s1.id);

        assert!(!state.sessions.contains_key(&s1.id));
        assert!(state.peer_of.is_empty());

        // The former peer's signals now drop silently
        state.relay(s2.id, description("v=0"));
        assert!(s2.next_message().is_none());
        assert_invariants(&state);
    }

    #[test]
    fn room_count_counts_pairs() {
        let mut state = Matchmaker::new();
        assert_eq!(state.room_count(), 0);

        let s1 = admit(&mut state);
        assert_eq!(state.room_count(), 0);
        let _s2 = admit(&mut state);
        assert_eq!(state.room_count(), 1);

        let _s3 = admit(&mut state);
        let _s4 = admit(&mut state);
        assert_eq!(state.room_count(), 2);

        state.disconnect(s1.id);
        assert_eq!(state.room_count(), 1);
    }
}

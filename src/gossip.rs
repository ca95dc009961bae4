//! Gossip membership: failure detection, tag propagation and member events.
//!
//! Nodes exchange their full member table over UDP on a randomized
//! schedule. Exchanges are encrypted with AES-128-GCM when a key is
//! configured. Member liveness piggybacks on the exchange: every entry
//! carries how long ago its sender last heard from that member, so silence
//! propagates and a node that stops talking moves to `failed` and is
//! eventually reaped.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use rand::seq::SliceRandom;
use ring::aead;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How many peers each probe tick pushes state to.
const GOSSIP_FANOUT: usize = 3;

const MAX_PACKET: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("gossip: encryption key must be 16 bytes base64 encoded")]
    InvalidKey,

    #[error("gossip: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gossip: codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    Reap,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
            MemberStatus::Reap => "reap",
        };
        write!(f, "{s}")
    }
}

/// One member of the cluster as seen through gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
    Failed(Member),
    Reap(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m)
            | MemberEvent::Update(m)
            | MemberEvent::Leave(m)
            | MemberEvent::Failed(m)
            | MemberEvent::Reap(m) => m,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: SocketAddr,
    pub tags: HashMap<String, String>,
    /// Base64-encoded 16-byte symmetric key; `None` disables encryption.
    pub encrypt_key: Option<String>,
    pub probe_interval: Duration,
    /// Silence after which an alive member is declared failed.
    pub failure_timeout: Duration,
    /// How long failed/left members linger before being reaped.
    pub reconnect_timeout: Duration,
}

impl GossipConfig {
    pub fn new(node_name: &str, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.to_string(),
            bind_addr,
            advertise_addr: bind_addr,
            tags: HashMap::new(),
            encrypt_key: None,
            probe_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(3600 * 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberState {
    name: String,
    addr: IpAddr,
    port: u16,
    tags: HashMap<String, String>,
    incarnation: u64,
    status: MemberStatus,
    /// Milliseconds since the sender last heard from this member.
    age_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// Full-state push; the receiver merges and answers joins with its own
    /// state.
    Sync {
        from: String,
        reply: bool,
        members: Vec<MemberState>,
    },
    Leave {
        from: String,
    },
}

struct MemberInfo {
    state: MemberState,
    last_heard: Instant,
    failed_at: Option<Instant>,
}

struct Inner {
    members: HashMap<String, MemberInfo>,
    incarnation: u64,
}

/// The gossip endpoint of one agent.
pub struct Gossip {
    config: GossipConfig,
    socket: UdpSocket,
    inner: Mutex<Inner>,
    key: Option<aead::LessSafeKey>,
    events: mpsc::Sender<MemberEvent>,
}

impl Gossip {
    /// Bind the UDP socket and assemble the endpoint. Call [`Gossip::run`]
    /// to start exchanging state.
    pub async fn new(
        config: GossipConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<MemberEvent>), GossipError> {
        let key = match &config.encrypt_key {
            Some(encoded) => Some(parse_key(encoded)?),
            None => None,
        };

        let socket = UdpSocket::bind(config.bind_addr).await?;

        let local = MemberState {
            name: config.node_name.clone(),
            addr: config.advertise_addr.ip(),
            port: config.advertise_addr.port(),
            tags: config.tags.clone(),
            incarnation: 1,
            status: MemberStatus::Alive,
            age_ms: 0,
        };
        let mut members = HashMap::new();
        members.insert(
            config.node_name.clone(),
            MemberInfo {
                state: local,
                last_heard: Instant::now(),
                failed_at: None,
            },
        );

        let (events, events_rx) = mpsc::channel(256);

        let gossip = Arc::new(Self {
            config,
            socket,
            inner: Mutex::new(Inner {
                members,
                incarnation: 1,
            }),
            key,
            events,
        });

        Ok((gossip, events_rx))
    }

    /// The local UDP address actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drive the receive and probe loops until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let recv = {
            let gossip = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_PACKET];
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        result = gossip.socket.recv_from(&mut buf) => {
                            match result {
                                Ok((n, from)) => gossip.handle_packet(&buf[..n], from).await,
                                Err(e) => {
                                    tracing::warn!(error = %e, "gossip: recv error");
                                }
                            }
                        }
                    }
                }
            })
        };

        let mut interval = tokio::time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check_liveness().await;
                    self.push_state().await;
                }
            }
        }
        recv.abort();
    }

    /// Join a cluster by pushing our state to the given `host:port` UDP
    /// addresses. Returns how many peers were contacted.
    pub async fn join(&self, addrs: &[String]) -> usize {
        let payload = {
            let inner = self.inner.lock().unwrap();
            GossipMessage::Sync {
                from: self.config.node_name.clone(),
                reply: true,
                members: snapshot_states(&inner),
            }
        };
        let Ok(data) = self.seal(&payload) else {
            return 0;
        };

        let mut contacted = 0;
        for addr in addrs {
            match tokio::net::lookup_host(addr).await {
                Ok(mut resolved) => {
                    if let Some(target) = resolved.next() {
                        if self.socket.send_to(&data, target).await.is_ok() {
                            contacted += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "gossip: join address lookup failed");
                }
            }
        }
        contacted
    }

    /// Announce a graceful leave to every known member.
    pub async fn leave(&self) {
        let (targets, message) = {
            let mut inner = self.inner.lock().unwrap();
            let name = self.config.node_name.clone();
            if let Some(me) = inner.members.get_mut(&name) {
                me.state.status = MemberStatus::Left;
                me.state.incarnation += 1;
            }
            (
                peer_addrs(&inner, &name),
                GossipMessage::Leave { from: name },
            )
        };

        if let Ok(data) = self.seal(&message) {
            for target in targets {
                let _ = self.socket.send_to(&data, target).await;
            }
        }
    }

    /// Replace the local tag set and propagate it with a new incarnation.
    pub fn set_tags(&self, tags: HashMap<String, String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.incarnation += 1;
        let incarnation = inner.incarnation;
        if let Some(me) = inner.members.get_mut(&self.config.node_name) {
            me.state.tags = tags;
            me.state.incarnation = incarnation;
        }
    }

    pub fn members(&self) -> Vec<Member> {
        let inner = self.inner.lock().unwrap();
        inner
            .members
            .values()
            .map(|info| to_member(&info.state))
            .collect()
    }

    pub fn local_member(&self) -> Member {
        let inner = self.inner.lock().unwrap();
        to_member(&inner.members[&self.config.node_name].state)
    }

    // ---- internals ----

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let message: GossipMessage = match self.open(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "gossip: dropping undecodable packet");
                return;
            }
        };

        match message {
            GossipMessage::Sync {
                from: sender,
                reply,
                members,
            } => {
                let events = self.merge(&sender, members);
                for event in events {
                    let _ = self.events.send(event).await;
                }
                if reply {
                    self.push_state_to(&[from]).await;
                }
            }
            GossipMessage::Leave { from: sender } => {
                let event = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.members.get_mut(&sender).map(|info| {
                        info.state.status = MemberStatus::Left;
                        info.failed_at = Some(Instant::now());
                        MemberEvent::Leave(to_member(&info.state))
                    })
                };
                if let Some(event) = event {
                    tracing::info!(member = %event.member().name, "gossip: member left");
                    let _ = self.events.send(event).await;
                }
            }
        }
    }

    /// Merge a remote member table into ours, returning the resulting
    /// events.
    fn merge(&self, sender: &str, remote: Vec<MemberState>) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        for state in remote {
            // Our own entry is authoritative locally.
            if state.name == self.config.node_name {
                continue;
            }

            let heard = if state.name == sender {
                now
            } else {
                now.checked_sub(Duration::from_millis(state.age_ms))
                    .unwrap_or(now)
            };

            match inner.members.entry(state.name.clone()) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let info = occupied.get_mut();
                    if heard > info.last_heard {
                        info.last_heard = heard;
                    }
                    if state.incarnation > info.state.incarnation {
                        let tags_changed = state.tags != info.state.tags;
                        let status_changed = state.status != info.state.status;
                        info.state = state;
                        // A member speaking with a fresh incarnation is not
                        // failed anymore.
                        if info.state.status == MemberStatus::Alive {
                            info.failed_at = None;
                        }
                        if status_changed && info.state.status == MemberStatus::Left {
                            events.push(MemberEvent::Leave(to_member(&info.state)));
                        } else if tags_changed || status_changed {
                            events.push(MemberEvent::Update(to_member(&info.state)));
                        }
                    } else if info.state.status == MemberStatus::Failed && state.name == sender {
                        // Hearing from a failed member directly revives it.
                        info.state.status = MemberStatus::Alive;
                        info.failed_at = None;
                        events.push(MemberEvent::Join(to_member(&info.state)));
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    tracing::info!(member = %state.name, "gossip: member joined");
                    events.push(MemberEvent::Join(to_member(&state)));
                    vacant.insert(MemberInfo {
                        state,
                        last_heard: heard,
                        failed_at: None,
                    });
                }
            }
        }
        events
    }

    async fn check_liveness(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let mut reap = Vec::new();

            for (name, info) in inner.members.iter_mut() {
                if name == &self.config.node_name {
                    info.last_heard = now;
                    continue;
                }
                match info.state.status {
                    MemberStatus::Alive => {
                        if now.duration_since(info.last_heard) > self.config.failure_timeout {
                            info.state.status = MemberStatus::Failed;
                            info.failed_at = Some(now);
                            tracing::warn!(member = %name, "gossip: member failed");
                            events.push(MemberEvent::Failed(to_member(&info.state)));
                        }
                    }
                    MemberStatus::Failed | MemberStatus::Left => {
                        let expired = info
                            .failed_at
                            .map(|t| now.duration_since(t) > self.config.reconnect_timeout)
                            .unwrap_or(false);
                        if expired {
                            reap.push(name.clone());
                        }
                    }
                    _ => {}
                }
            }

            for name in reap {
                if let Some(info) = inner.members.remove(&name) {
                    let mut member = to_member(&info.state);
                    member.status = MemberStatus::Reap;
                    tracing::info!(member = %name, "gossip: member reaped");
                    events.push(MemberEvent::Reap(member));
                }
            }
        }

        for event in events {
            let _ = self.events.send(event).await;
        }
    }

    async fn push_state(&self) {
        let targets = {
            let inner = self.inner.lock().unwrap();
            let mut addrs = peer_addrs(&inner, &self.config.node_name);
            addrs.shuffle(&mut rand::thread_rng());
            addrs.truncate(GOSSIP_FANOUT);
            addrs
        };
        if !targets.is_empty() {
            self.push_state_to(&targets).await;
        }
    }

    async fn push_state_to(&self, targets: &[SocketAddr]) {
        let message = {
            let inner = self.inner.lock().unwrap();
            GossipMessage::Sync {
                from: self.config.node_name.clone(),
                reply: false,
                members: snapshot_states(&inner),
            }
        };
        let Ok(data) = self.seal(&message) else { return };
        for target in targets {
            if let Err(e) = self.socket.send_to(&data, target).await {
                tracing::trace!(target = %target, error = %e, "gossip: send failed");
            }
        }
    }

    fn seal(&self, message: &GossipMessage) -> Result<Vec<u8>, GossipError> {
        let plain = serde_json::to_vec(message)?;
        let Some(key) = &self.key else {
            return Ok(plain);
        };

        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut sealed = plain;
        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut sealed)
            .map_err(|_| GossipError::InvalidKey)?;

        let mut packet = nonce_bytes.to_vec();
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }

    fn open(&self, data: &[u8]) -> Result<GossipMessage, GossipError> {
        let Some(key) = &self.key else {
            return Ok(serde_json::from_slice(data)?);
        };

        if data.len() < 12 {
            return Err(GossipError::InvalidKey);
        }
        let (nonce_bytes, sealed) = data.split_at(12);
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| GossipError::InvalidKey)?;
        let mut buf = sealed.to_vec();
        let plain = key
            .open_in_place(nonce, aead::Aad::empty(), &mut buf)
            .map_err(|_| GossipError::InvalidKey)?;
        Ok(serde_json::from_slice(plain)?)
    }
}

fn parse_key(encoded: &str) -> Result<aead::LessSafeKey, GossipError> {
    let raw = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|_| GossipError::InvalidKey)?;
    if raw.len() != 16 {
        return Err(GossipError::InvalidKey);
    }
    let unbound =
        aead::UnboundKey::new(&aead::AES_128_GCM, &raw).map_err(|_| GossipError::InvalidKey)?;
    Ok(aead::LessSafeKey::new(unbound))
}

fn to_member(state: &MemberState) -> Member {
    Member {
        name: state.name.clone(),
        addr: state.addr,
        port: state.port,
        status: state.status,
        tags: state.tags.clone(),
    }
}

fn snapshot_states(inner: &Inner) -> Vec<MemberState> {
    let now = Instant::now();
    inner
        .members
        .values()
        .map(|info| {
            let mut state = info.state.clone();
            state.age_ms = now.duration_since(info.last_heard).as_millis() as u64;
            state
        })
        .collect()
}

fn peer_addrs(inner: &Inner, exclude: &str) -> Vec<SocketAddr> {
    inner
        .members
        .values()
        .filter(|info| info.state.name != exclude && info.state.status == MemberStatus::Alive)
        .map(|info| SocketAddr::new(info.state.addr, info.state.port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gossip_pair(
        key: Option<String>,
    ) -> (
        Arc<Gossip>,
        mpsc::Receiver<MemberEvent>,
        Arc<Gossip>,
        mpsc::Receiver<MemberEvent>,
    ) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let mut cfg1 = GossipConfig::new("n1", bind);
        cfg1.encrypt_key = key.clone();
        cfg1.probe_interval = Duration::from_millis(50);
        cfg1.failure_timeout = Duration::from_millis(400);
        cfg1.reconnect_timeout = Duration::from_millis(400);
        let (g1, rx1) = Gossip::new(cfg1).await.unwrap();
        let addr1 = g1.local_addr().unwrap();

        let mut cfg2 = GossipConfig::new("n2", bind);
        cfg2.encrypt_key = key;
        cfg2.probe_interval = Duration::from_millis(50);
        cfg2.failure_timeout = Duration::from_millis(400);
        cfg2.reconnect_timeout = Duration::from_millis(400);
        let (g2, rx2) = Gossip::new(cfg2).await.unwrap();

        // Fix up the advertised address now that the real port is known.
        {
            let mut inner = g1.inner.lock().unwrap();
            let me = inner.members.get_mut("n1").unwrap();
            me.state.addr = addr1.ip();
            me.state.port = addr1.port();
        }
        let addr2 = g2.local_addr().unwrap();
        {
            let mut inner = g2.inner.lock().unwrap();
            let me = inner.members.get_mut("n2").unwrap();
            me.state.addr = addr2.ip();
            me.state.port = addr2.port();
        }

        (g1, rx1, g2, rx2)
    }

    #[tokio::test]
    async fn test_two_nodes_discover_each_other() {
        let (g1, _rx1, g2, mut rx2) = gossip_pair(None).await;
        let shutdown = CancellationToken::new();
        tokio::spawn(g1.clone().run(shutdown.clone()));
        tokio::spawn(g2.clone().run(shutdown.clone()));

        let addr2 = g2.local_addr().unwrap();
        assert_eq!(g1.join(&[addr2.to_string()]).await, 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .expect("join should produce an event")
            .unwrap();
        assert!(matches!(event, MemberEvent::Join(ref m) if m.name == "n1"));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if g1.members().len() == 2 && g2.members().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("both nodes should see each other");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_encrypted_exchange_and_key_mismatch() {
        let key = BASE64_STANDARD.encode([7u8; 16]);
        let (g1, _rx1, g2, _rx2) = gossip_pair(Some(key)).await;

        let message = GossipMessage::Sync {
            from: "n1".into(),
            reply: false,
            members: vec![],
        };
        let sealed = g1.seal(&message).unwrap();
        assert!(g2.open(&sealed).is_ok());

        // A different key cannot open the packet.
        let other_key = BASE64_STANDARD.encode([9u8; 16]);
        let mut cfg = GossipConfig::new("n3", "127.0.0.1:0".parse().unwrap());
        cfg.encrypt_key = Some(other_key);
        let (g3, _rx3) = Gossip::new(cfg).await.unwrap();
        assert!(g3.open(&sealed).is_err());
    }

    #[test]
    fn test_parse_key_validation() {
        assert!(parse_key(&BASE64_STANDARD.encode([1u8; 16])).is_ok());
        assert!(parse_key(&BASE64_STANDARD.encode([1u8; 8])).is_err());
        assert!(parse_key("not base64!!!").is_err());
    }

    #[tokio::test]
    async fn test_silent_member_fails_and_is_reaped() {
        let (g1, mut rx1, g2, _rx2) = gossip_pair(None).await;
        let shutdown = CancellationToken::new();
        tokio::spawn(g1.clone().run(shutdown.clone()));

        // Only g2's endpoint joins, then goes silent (its loop never runs).
        let addr1 = g1.local_addr().unwrap();
        g2.join(&[addr1.to_string()]).await;

        let mut saw_join = false;
        let mut saw_failed = false;
        let mut saw_reap = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx1.recv()).await {
                Ok(Some(MemberEvent::Join(m))) if m.name == "n2" => saw_join = true,
                Ok(Some(MemberEvent::Failed(m))) if m.name == "n2" => saw_failed = true,
                Ok(Some(MemberEvent::Reap(m))) if m.name == "n2" => {
                    saw_reap = true;
                    break;
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }

        assert!(saw_join, "n2 should have joined");
        assert!(saw_failed, "silent n2 should be declared failed");
        assert!(saw_reap, "failed n2 should be reaped");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_tag_update_propagates() {
        let (g1, _rx1, g2, mut rx2) = gossip_pair(None).await;
        let shutdown = CancellationToken::new();
        tokio::spawn(g1.clone().run(shutdown.clone()));
        tokio::spawn(g2.clone().run(shutdown.clone()));

        let addr2 = g2.local_addr().unwrap();
        g1.join(&[addr2.to_string()]).await;

        let mut tags = HashMap::new();
        tags.insert("role".to_string(), "web".to_string());
        g1.set_tags(tags);

        let updated = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = rx2.recv().await {
                if let MemberEvent::Update(m) = &event {
                    if m.name == "n1" && m.tags.get("role").map(String::as_str) == Some("web") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        assert!(updated, "tag update should reach the peer");
        shutdown.cancel();
    }
}

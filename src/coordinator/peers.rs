use crate::coordinator::random_index;
use crate::net::{PeerId, Transport, TransportError};
use crate::protocol::{OutboundMessage, PeerAddr};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

/// Value handle to a stager connection, shared by the registry, jobs and uploads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub id: PeerId,
    pub addr: PeerAddr,
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: PeerAddr,
    /// False while a ping is outstanding.
    pub pong: bool,
    pub confirmed: bool,
    pub missed_pongs: u32,
    pub connected_at: Instant,
    pub extra: bool,
}

impl PeerHandle {
    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: self.id,
            addr: self.addr.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStager {
    AlreadyPresent,
    Added(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    Answered,
    /// Pong with no ping outstanding; every peer was re-pinged.
    Resynced,
    UnknownPeer,
}

#[derive(Debug, Clone)]
pub struct PeerRegistryConfig {
    pub advertise_addr: PeerAddr,
    pub seed_stagers: Vec<PeerAddr>,
    pub max_stagers: usize,
    pub request_stager_every: Duration,
    pub ping_every: Duration,
    /// Consecutive unanswered ping cycles before a stager is dropped. 0 disables eviction.
    pub max_missed_pongs: u32,
}

#[derive(Debug)]
pub struct PeerRegistry {
    cfg: PeerRegistryConfig,
    peers: BTreeMap<PeerId, PeerHandle>,
    last_stager_request: Option<Instant>,
    last_ping: Option<Instant>,
}

impl PeerRegistry {
    pub fn new(cfg: PeerRegistryConfig) -> Self {
        Self {
            cfg,
            peers: BTreeMap::new(),
            last_stager_request: None,
            last_ping: None,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerHandle> {
        self.peers.get(&id)
    }

    pub fn peer_ref(&self, id: PeerId) -> Option<PeerRef> {
        self.peers.get(&id).map(PeerHandle::peer_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values()
    }

    pub fn addresses(&self) -> Vec<PeerAddr> {
        self.peers.values().map(|p| p.addr.clone()).collect()
    }

    pub fn contains_addr(&self, addr: &PeerAddr) -> bool {
        self.peers.values().any(|p| &p.addr == addr)
    }

    pub fn confirmed_count(&self) -> usize {
        self.peers.values().filter(|p| p.confirmed).count()
    }

    pub fn stagers_needed(&self) -> usize {
        self.cfg.max_stagers.saturating_sub(self.peers.len())
    }

    pub fn add_stager(
        &mut self,
        transport: &mut impl Transport,
        addr: &PeerAddr,
        extra: bool,
        now: Instant,
    ) -> Result<AddStager, TransportError> {
        if self.contains_addr(addr) {
            return Ok(AddStager::AlreadyPresent);
        }
        let id = transport.connect(addr)?;
        self.peers.insert(
            id,
            PeerHandle {
                id,
                addr: addr.clone(),
                pong: true,
                confirmed: false,
                missed_pongs: 0,
                connected_at: now,
                extra,
            },
        );
        let address = self.cfg.advertise_addr.clone();
        let announce = if extra {
            OutboundMessage::AnnounceCrawlerExtra { address }
        } else {
            OutboundMessage::AnnounceCrawler { address }
        };
        transport.send_or_log(id, announce);
        tracing::info!(peer = %id, addr = %addr, extra, "stager added");
        Ok(AddStager::Added(id))
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerHandle> {
        self.peers.remove(&id)
    }

    /// Asks one random stager for more stager addresses while below `max_stagers`.
    ///
    /// With no stager left at all, the seed stagers are dialed again instead.
    pub fn maintain_count(&mut self, transport: &mut impl Transport, now: Instant) {
        let needed = self.stagers_needed();
        if needed == 0 || !elapsed(self.last_stager_request, now, self.cfg.request_stager_every) {
            return;
        }
        self.last_stager_request = Some(now);

        if self.peers.is_empty() {
            tracing::info!(
                seeds = self.cfg.seed_stagers.len(),
                "no stager connected; dialing seed stagers"
            );
            for seed in self.cfg.seed_stagers.clone() {
                if let Err(err) = self.add_stager(transport, &seed, false, now) {
                    tracing::warn!(addr = %seed, error = %err, "failed dialing seed stager");
                }
            }
            return;
        }

        let Some(target) = self.random_peer() else {
            return;
        };
        let known = self.addresses();
        tracing::debug!(peer = %target, count = needed, known = known.len(), "requesting stagers");
        transport.send_or_log(
            target,
            OutboundMessage::RequestStager {
                count: needed,
                known,
            },
        );
    }

    pub fn ping_due(&self, now: Instant) -> bool {
        elapsed(self.last_ping, now, self.cfg.ping_every)
    }

    /// Bumps the miss counter of every peer that left the last ping unanswered and returns the
    /// peers that reached `max_missed_pongs`. Call right before [`PeerRegistry::ping_all`].
    pub fn sweep_unresponsive(&mut self) -> Vec<PeerId> {
        if self.last_ping.is_none() {
            return Vec::new();
        }
        let mut evict = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.pong {
                peer.missed_pongs = 0;
                continue;
            }
            peer.missed_pongs = peer.missed_pongs.saturating_add(1);
            if self.cfg.max_missed_pongs > 0 && peer.missed_pongs >= self.cfg.max_missed_pongs {
                tracing::warn!(
                    peer = %peer.id,
                    addr = %peer.addr,
                    missed = peer.missed_pongs,
                    "stager unresponsive"
                );
                evict.push(peer.id);
            }
        }
        evict
    }

    /// Scheduled ping cycle. Only these cycles move the clock that [`PeerRegistry::ping_due`]
    /// and miss accounting run on.
    pub fn ping_all(&mut self, transport: &mut impl Transport, now: Instant) {
        self.broadcast_ping(transport);
        self.last_ping = Some(now);
    }

    fn broadcast_ping(&mut self, transport: &mut impl Transport) {
        for peer in self.peers.values_mut() {
            peer.pong = false;
            transport.send_or_log(peer.id, OutboundMessage::Ping);
        }
    }

    pub fn on_pong(&mut self, transport: &mut impl Transport, id: PeerId) -> PongOutcome {
        let Some(peer) = self.peers.get_mut(&id) else {
            return PongOutcome::UnknownPeer;
        };
        if !peer.pong {
            peer.pong = true;
            peer.missed_pongs = 0;
            return PongOutcome::Answered;
        }
        tracing::debug!(peer = %id, "unsolicited pong; re-pinging all stagers");
        self.broadcast_ping(transport);
        PongOutcome::Resynced
    }

    /// Marks the handshake done. Returns false for an unknown peer.
    pub fn on_confirmed(&mut self, id: PeerId) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.confirmed = true;
                true
            }
            None => false,
        }
    }

    fn random_peer(&self) -> Option<PeerId> {
        let idx = random_index(self.peers.len())?;
        self.peers.keys().nth(idx).copied()
    }
}

pub(crate) fn elapsed(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= every,
    }
}

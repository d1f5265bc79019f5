//! In-process cluster of peers sharing one loopback hub.

use crate::demo::{self, Drone, Scoreboard, DRONE, SCOREBOARD};
use anyhow::{Context, Result};
use mesh_core::math::{DeterministicRng, Transform, Vec2, Vec3};
use mesh_core::PeerId;
use mesh_metrics::{Stat, StatCounters};
use mesh_net::{
    Lobby, LobbyEvent, LoopbackHub, ObjectId, Peer, PeerContext, PeerState, RpcMode, RpcTarget,
    SessionEvent, Value,
};
use mesh_services::{InputState, ProfileStore, Settings};
use tracing::{debug, info, warn};

pub struct Cluster {
    peers: Vec<Peer>,
    lobby: Lobby,
    rng: DeterministicRng,
    drones: Vec<ObjectId>,
}

impl Cluster {
    pub fn new(count: u64, settings: &Settings, profiles: &ProfileStore) -> Result<Self> {
        let hub = LoopbackHub::new(&settings.loopback);
        let host = PeerId(1);
        let mut lobby = Lobby::new(host);
        let mut peers = Vec::new();
        for id in 1..=count {
            let peer_id = PeerId(id);
            let mut peer = Peer::new(PeerContext {
                transport: Box::new(hub.endpoint(peer_id)),
                session_authority: host,
                profile: profiles.profile_for(peer_id),
                settings: settings.clone(),
                types: demo::object_types().context("registering object types")?,
                rpc: demo::rpc_methods().context("registering rpc methods")?,
            });
            peer.rpc_mut()
                .add_node(SCOREBOARD, Scoreboard::default())
                .context("hosting scoreboard")?;
            peers.push(peer);
            lobby.join(peer_id);
        }

        let mut cluster = Self {
            peers,
            lobby,
            rng: DeterministicRng::new(settings.loopback.seed),
            drones: Vec::new(),
        };
        cluster.sync_lobby();
        Ok(cluster)
    }

    fn sync_lobby(&mut self) {
        for event in self.lobby.drain_events() {
            debug!(?event, "lobby event");
            for peer in &mut self.peers {
                match event {
                    LobbyEvent::Joined(id) => peer.add_peer(id),
                    LobbyEvent::Left(id) if id != peer.local_peer() => peer.remove_peer(id),
                    LobbyEvent::Left(_) => {}
                }
            }
        }
    }

    /// Peers still in the lobby.
    fn present(&mut self) -> impl Iterator<Item = &mut Peer> {
        let members = self.lobby.present_members();
        self.peers
            .iter_mut()
            .filter(move |peer| members.contains(&peer.local_peer()))
    }

    pub fn poll(&mut self) -> usize {
        self.present().map(Peer::poll).sum()
    }

    /// Every present peer has config, progression and options of every
    /// other one.
    pub fn handshake_done(&mut self) -> bool {
        self.present().all(|peer| {
            let session = peer.session();
            session.local_state() >= PeerState::PreGameOk
                && session
                    .records()
                    .filter(|record| !record.removed)
                    .all(|record| record.has_info())
        })
    }

    pub fn all_started(&mut self) -> bool {
        self.present().all(|peer| peer.simulation_started())
    }

    pub fn start_game(&mut self) -> Result<()> {
        let host = self.lobby.host();
        let peer = self
            .peers
            .iter_mut()
            .find(|peer| peer.local_peer() == host)
            .context("host peer is missing")?;
        peer.start_game()?;
        peer.send_debug_text("game starting");
        Ok(())
    }

    /// Every present peer spawns one drone.
    pub fn spawn_drones(&mut self) -> Result<()> {
        let mut spawned = Vec::new();
        for peer in self.present() {
            let x = peer.local_peer().to_bits() as f32 * 3.0;
            let id = peer.spawn(DRONE, Transform::from_translation(Vec3::new(x, 0.0, 0.0)), Vec::new())?;
            spawned.push(id);
        }
        self.drones.extend(spawned);
        Ok(())
    }

    /// Fresh wander input for every present peer.
    pub fn steer(&mut self) {
        let inputs: Vec<InputState> = (0..self.peers.len())
            .map(|_| InputState {
                movement: Vec2::new(self.rng.next_f32() * 2.0 - 1.0, self.rng.next_f32() * 2.0 - 1.0),
                ..InputState::default()
            })
            .collect();
        for (peer, input) in self.present().zip(inputs) {
            peer.set_local_input(input);
        }
    }

    /// Every present peer tags its neighbour on the scoreboard.
    pub fn tag_round(&mut self) {
        let members = self.lobby.present_members();
        for peer in self.present() {
            let local = peer.local_peer();
            let Some(victim) = members.iter().copied().find(|&id| id != local) else {
                continue;
            };
            if let Err(err) = peer.call(
                RpcTarget::Node(SCOREBOARD.into()),
                "tag",
                vec![Value::Peer(victim)],
                RpcMode::ToAuthorityOnly,
            ) {
                warn!(peer = %local, error = %err, "tag failed");
            }
        }
    }

    pub fn tick(&mut self, delta: f32) {
        for peer in self.present() {
            if let Some(report) = peer.tick(delta) {
                if report.dropped > 0 || !report.destroyed.is_empty() {
                    debug!(peer = %peer.local_peer(), ?report, "tick");
                }
            }
        }
    }

    pub fn frame(&mut self, delta: f32) {
        for peer in self.present() {
            peer.frame(delta);
        }
    }

    /// Drop `peer` from the lobby as if its connection went away.
    pub fn depart(&mut self, peer: PeerId) {
        if self.lobby.leave(peer) {
            info!(peer = %peer, "peer leaving");
            self.sync_lobby();
        }
    }

    pub fn log_events(&mut self) {
        for peer in self.present() {
            let local = peer.local_peer();
            for event in peer.drain_events() {
                match event {
                    SessionEvent::SimulationStarted => info!(peer = %local, "simulation started"),
                    SessionEvent::AuthorityChanged { previous, current } => {
                        info!(peer = %local, %previous, %current, "authority changed")
                    }
                    other => debug!(peer = %local, event = ?other, "session event"),
                }
            }
            for (sender, text) in peer.drain_debug_text() {
                debug!(peer = %local, from = %sender, %text, "debug text received");
            }
        }
    }

    pub fn report(&self) {
        let mut total = StatCounters::new();
        for peer in &self.peers {
            let stats = peer.stats();
            let local = peer.local_peer();
            let drones: Vec<String> = self
                .drones
                .iter()
                .filter_map(|&id| peer.scheduler().object(id))
                .filter_map(|object| object.behavior_as::<Drone>())
                .map(|drone| format!("{:.1?}", drone.position()))
                .collect();
            info!(
                peer = %local,
                tick = peer.scheduler().current_tick(),
                objects = peer.scheduler().objects().len(),
                sent = stats.get(Stat::UpdatesSent),
                applied = stats.get(Stat::UpdatesApplied),
                ?drones,
                "peer summary"
            );
            if let Some(board) = peer.rpc().node::<Scoreboard>(SCOREBOARD) {
                if let Some(line) = &board.last_announcement {
                    debug!(peer = %local, %line, "last scoreboard announcement");
                }
            }
            total.merge(&stats);
        }
        for (stat, value) in total.iter() {
            info!(stat = stat.name(), value, "cluster total");
        }
    }
}

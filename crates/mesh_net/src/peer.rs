//! One simulation participant
//!
//! Owns the transport adapter and the three engines that share it, and
//! demultiplexes inbound datagrams to them in arrival order.

use crate::codec::decode;
use crate::object::ObjectTypeRegistry;
use crate::replication::{DestroyError, ReplicationScheduler, SchedulerConfig, SpawnError, TickReport};
use crate::rpc::{RpcDispatcher, RpcError, RpcMode, RpcRegistry, RpcScope};
use crate::session::{PlayerOptions, SessionContext, SessionError, SessionEvent, SessionStateMachine};
use crate::transport::{Inbound, MessageClass, MessageKind, Transport, TransportAdapter};
use crate::wire::{ObjectCommand, ObjectType, PlayerInputData, RpcTarget, StateUpdatePacket, Value};
use mesh_core::math::Transform;
use mesh_core::{ObjectId, PeerId};
use mesh_metrics::StatCounters;
use mesh_services::{InputState, Profile, Settings};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Everything needed to bring up a [`Peer`].
pub struct PeerContext {
    pub transport: Box<dyn Transport>,
    /// Initial session authority, normally the lobby host.
    pub session_authority: PeerId,
    pub profile: Profile,
    pub settings: Settings,
    pub types: ObjectTypeRegistry,
    pub rpc: RpcRegistry,
}

pub struct Peer {
    link: TransportAdapter,
    scheduler: ReplicationScheduler,
    rpc: RpcDispatcher,
    session: SessionStateMachine,
    max_inbound_per_poll: usize,
    events: VecDeque<SessionEvent>,
    debug_texts: VecDeque<(PeerId, String)>,
}

impl Peer {
    /// Build the engines and join the local peer to its own session.
    pub fn new(ctx: PeerContext) -> Self {
        let mut link = TransportAdapter::new(ctx.transport);
        let local = link.local_peer();
        let scheduler = ReplicationScheduler::new(local, SchedulerConfig::from(&ctx.settings.net))
            .with_types(ctx.types);
        let rpc = RpcDispatcher::new(ctx.rpc, ctx.session_authority);
        let mut session = SessionStateMachine::new(SessionContext {
            local_peer: local,
            authority: ctx.session_authority,
            progression: ctx.profile.progression,
            config: ctx.profile.config,
            max_players: ctx.settings.session.max_players,
        });
        session.add_peer(local, &mut link);

        let mut peer = Self {
            link,
            scheduler,
            rpc,
            session,
            max_inbound_per_poll: ctx.settings.net.max_inbound_per_poll.max(1),
            events: VecDeque::new(),
            debug_texts: VecDeque::new(),
        };
        peer.absorb_session_events();
        info!(peer = %local, authority = %ctx.session_authority, "peer created");
        peer
    }

    pub fn local_peer(&self) -> PeerId {
        self.link.local_peer()
    }

    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub fn scheduler(&self) -> &ReplicationScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut ReplicationScheduler {
        &mut self.scheduler
    }

    pub fn rpc(&self) -> &RpcDispatcher {
        &self.rpc
    }

    pub fn rpc_mut(&mut self) -> &mut RpcDispatcher {
        &mut self.rpc
    }

    /// Active session members, local peer included.
    pub fn members(&self) -> Vec<PeerId> {
        self.session.active_peers()
    }

    pub fn simulation_started(&self) -> bool {
        self.session.simulation_started()
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub fn add_peer(&mut self, peer: PeerId) {
        self.session.add_peer(peer, &mut self.link);
        self.absorb_session_events();
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.session.remove_peer(peer, &mut self.link);
        self.absorb_session_events();
    }

    /// React to session events the other engines care about, then queue
    /// them for the application.
    fn absorb_session_events(&mut self) {
        for event in self.session.drain_events() {
            match &event {
                SessionEvent::PlayerRemoved(peer) => {
                    self.scheduler.remove_objects_of(*peer);
                }
                SessionEvent::AuthorityChanged { current, .. } => {
                    self.rpc.set_default_authority(*current);
                }
                _ => {}
            }
            self.events.push_back(event);
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_debug_text(&mut self) -> Vec<(PeerId, String)> {
        self.debug_texts.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle up to the configured number of datagrams, then run the calls
    /// this peer made to itself. Returns how many datagrams were handled.
    pub fn poll(&mut self) -> usize {
        let inbound = self.link.drain(self.max_inbound_per_poll);
        let count = inbound.len();
        for message in inbound {
            self.route(message);
        }

        let members = self.members();
        let tick = self.scheduler.current_tick();
        let mut scope = RpcScope {
            objects: self.scheduler.objects_mut(),
            link: &mut self.link,
            members: &members,
            tick,
        };
        self.rpc.flush_local(&mut scope);
        count
    }

    fn route(&mut self, message: Inbound) {
        let Inbound {
            kind,
            payload,
            sender,
        } = message;
        match kind {
            MessageKind::Session => {
                // Logged and counted by the session.
                let _ = self.session.handle_message(&payload, sender, &mut self.link);
                self.absorb_session_events();
            }
            MessageKind::ObjectCommand => match decode::<ObjectCommand>(&payload) {
                Ok(command) => {
                    let members = self.members();
                    self.scheduler.handle_object_command(command, sender, &members);
                }
                Err(err) => warn!(peer = %sender, error = %err, "dropping object command"),
            },
            MessageKind::Rpc => {
                let members = self.members();
                let tick = self.scheduler.current_tick();
                let mut scope = RpcScope {
                    objects: self.scheduler.objects_mut(),
                    link: &mut self.link,
                    members: &members,
                    tick,
                };
                self.rpc.receive(&payload, sender, &mut scope);
            }
            MessageKind::Input => match decode::<PlayerInputData>(&payload) {
                Ok(data) if data.peer == sender => self.scheduler.queue_input(data),
                Ok(data) => {
                    warn!(peer = %sender, claimed = %data.peer, "input sent on behalf of another peer, dropping")
                }
                Err(err) => warn!(peer = %sender, error = %err, "dropping input"),
            },
            MessageKind::StateUpdate => match decode::<StateUpdatePacket>(&payload) {
                Ok(packet) if packet.sender == sender => self.scheduler.queue_update(packet),
                Ok(packet) => warn!(
                    peer = %sender,
                    claimed = %packet.sender,
                    object = %packet.object_id,
                    "state update with forged sender, dropping"
                ),
                Err(err) => debug!(peer = %sender, error = %err, "dropping state update"),
            },
            MessageKind::DebugText => match String::from_utf8(payload) {
                Ok(text) => {
                    info!(peer = %sender, %text, "debug text");
                    self.debug_texts.push_back((sender, text));
                }
                Err(_) => warn!(peer = %sender, "dropping non-utf8 debug text"),
            },
        }
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// One network tick. Nothing runs until the session has started the
    /// simulation.
    pub fn tick(&mut self, delta: f32) -> Option<TickReport> {
        if !self.session.simulation_started() {
            return None;
        }
        let members = self.members();
        Some(self.scheduler.tick(delta, &mut self.link, &members))
    }

    pub fn frame(&mut self, delta: f32) {
        if self.session.simulation_started() {
            self.scheduler.frame(delta);
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub fn spawn(
        &mut self,
        object_type: ObjectType,
        transform: Transform,
        params: Vec<Value>,
    ) -> Result<ObjectId, SpawnError> {
        let members = self.members();
        self.scheduler
            .spawn_local(object_type, transform, params, &mut self.link, &members)
    }

    pub fn destroy(&mut self, id: ObjectId) -> Result<(), DestroyError> {
        self.scheduler.destroy(id)
    }

    pub fn set_local_input(&mut self, input: InputState) {
        self.scheduler.set_local_input(input);
    }

    pub fn call(
        &mut self,
        target: RpcTarget,
        method: &str,
        params: Vec<Value>,
        mode: RpcMode,
    ) -> Result<(), RpcError> {
        let members = self.members();
        let tick = self.scheduler.current_tick();
        let mut scope = RpcScope {
            objects: self.scheduler.objects_mut(),
            link: &mut self.link,
            members: &members,
            tick,
        };
        self.rpc.call(target, method, params, mode, &mut scope)
    }

    pub fn start_game(&mut self) -> Result<(), SessionError> {
        let result = self.session.start_game(&mut self.link);
        self.absorb_session_events();
        result
    }

    pub fn set_player_options(
        &mut self,
        subject: PeerId,
        options: PlayerOptions,
    ) -> Result<(), SessionError> {
        let result = self
            .session
            .set_player_options(subject, options, &mut self.link);
        self.absorb_session_events();
        result
    }

    pub fn begin_ingame_load(&mut self) -> Result<(), SessionError> {
        let result = self.session.begin_ingame_load(&mut self.link);
        self.absorb_session_events();
        result
    }

    pub fn finish_ingame_load(&mut self) -> Result<(), SessionError> {
        let result = self.session.finish_ingame_load(&mut self.link);
        self.absorb_session_events();
        result
    }

    /// Send free-form text to every member, unreliably.
    pub fn send_debug_text(&mut self, text: &str) -> usize {
        let members = self.members();
        self.link.broadcast(
            MessageKind::DebugText,
            text.as_bytes(),
            MessageClass::Unreliable,
            &members,
        )
    }

    /// Counters of every engine, summed.
    pub fn stats(&self) -> StatCounters {
        let mut total = StatCounters::new();
        total.merge(self.link.stats());
        total.merge(self.scheduler.stats());
        total.merge(self.rpc.stats());
        total.merge(self.session.stats());
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;
    use crate::object::test_support::{counter_types, Counter, COUNTER};
    use crate::rpc::RpcSpec;
    use crate::wire::ValueKind;

    fn peers(n: u64) -> Vec<Peer> {
        let hub = LoopbackHub::default();
        let mut peers: Vec<Peer> = (1..=n)
            .map(|id| {
                let mut rpc = RpcRegistry::new();
                rpc.register_object_method::<Counter, _>(
                    RpcSpec::new("press", RpcMode::ToAuthorityOnly).params([ValueKind::U64]),
                    |counter, params, _ctx| {
                        counter.presses.extend(params.iter().filter_map(Value::as_u64));
                        Ok(())
                    },
                )
                .unwrap();
                Peer::new(PeerContext {
                    transport: Box::new(hub.endpoint(PeerId(id))),
                    session_authority: PeerId(1),
                    profile: Profile {
                        progression: vec![id as u8],
                        config: vec![0xC0],
                    },
                    settings: Settings::default(),
                    types: counter_types(),
                    rpc,
                })
            })
            .collect();
        for peer in &mut peers {
            for id in 1..=n {
                peer.add_peer(PeerId(id));
            }
        }
        peers
    }

    fn settle(peers: &mut [Peer]) {
        loop {
            let moved: usize = peers.iter_mut().map(Peer::poll).sum();
            if moved == 0 {
                break;
            }
        }
    }

    fn started(n: u64) -> Vec<Peer> {
        let mut peers = peers(n);
        settle(&mut peers);
        peers[0].start_game().unwrap();
        settle(&mut peers);
        assert!(peers.iter().all(Peer::simulation_started));
        peers
    }

    #[test]
    fn tick_waits_for_the_session() {
        let mut peers = peers(2);
        assert!(peers[0].tick(0.016).is_none());
        settle(&mut peers);
        peers[0].start_game().unwrap();
        settle(&mut peers);
        assert!(peers[0].tick(0.016).is_some());
        assert!(peers[1].tick(0.016).is_some());
        let events = peers[1].drain_events();
        assert!(events.contains(&SessionEvent::SimulationStarted));
    }

    #[test]
    fn spawned_object_replicates_state() {
        let mut peers = started(2);
        let id = peers[0]
            .spawn(COUNTER, Transform::default(), Vec::new())
            .unwrap();
        settle(&mut peers);
        assert!(peers[1].scheduler().object(id).is_some());

        for _ in 0..3 {
            peers[0].tick(0.016);
        }
        settle(&mut peers);
        let report = peers[1].tick(0.016).unwrap();
        assert_eq!(report.applied, 3);
        let replica = peers[1].scheduler().object(id).unwrap();
        assert_eq!(replica.behavior_as::<Counter>().unwrap().value, 3);
    }

    #[test]
    fn rpc_reaches_the_owner_only() {
        let mut peers = started(2);
        let id = peers[1]
            .spawn(COUNTER, Transform::default(), Vec::new())
            .unwrap();
        settle(&mut peers);

        peers[0]
            .call(RpcTarget::Object(id), "press", vec![Value::U64(4)], RpcMode::ToAuthorityOnly)
            .unwrap();
        settle(&mut peers);

        let owner = peers[1].scheduler().object(id).unwrap();
        assert_eq!(owner.behavior_as::<Counter>().unwrap().presses, vec![4]);
        let replica = peers[0].scheduler().object(id).unwrap();
        assert!(replica.behavior_as::<Counter>().unwrap().presses.is_empty());
    }

    #[test]
    fn departure_removes_objects_and_moves_authority() {
        let mut peers = started(3);
        let id = peers[0]
            .spawn(COUNTER, Transform::default(), Vec::new())
            .unwrap();
        settle(&mut peers);
        assert!(peers[2].scheduler().object(id).is_some());

        peers[2].remove_peer(PeerId(1));
        assert!(peers[2].scheduler().object(id).is_none());
        assert_eq!(peers[2].session().authority(), PeerId(2));
        assert_eq!(peers[2].rpc().default_authority(), PeerId(2));
        assert!(peers[2]
            .drain_events()
            .contains(&SessionEvent::PlayerRemoved(PeerId(1))));
    }

    #[test]
    fn forged_input_is_dropped() {
        let mut peers = started(2);
        let forged = PlayerInputData {
            peer: PeerId(7),
            tick: 1,
            input: InputState::default(),
        };
        let bytes = crate::codec::encode(&forged).unwrap();
        peers[1]
            .link
            .send(MessageKind::Input, &bytes, MessageClass::ReliableOrdered, PeerId(1))
            .unwrap();
        settle(&mut peers);
        peers[0].tick(0.016);
        assert!(peers[0].scheduler().inputs().get(PeerId(7)).is_none());
        assert!(peers[0].scheduler().inputs().get(PeerId(1)).is_some());
    }

    #[test]
    fn debug_text_is_surfaced() {
        let mut peers = peers(2);
        assert_eq!(peers[0].send_debug_text("hello"), 1);
        settle(&mut peers);
        assert_eq!(
            peers[1].drain_debug_text(),
            vec![(PeerId(1), "hello".to_string())]
        );
    }
}

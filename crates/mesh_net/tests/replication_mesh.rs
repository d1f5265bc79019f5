//! Three peers over the in-memory hub: handshake, start, replication, RPC and
//! departure.

use mesh_core::math::{Transform, Vec3};
use mesh_net::codec::{decode, encode};
use mesh_net::{
    behavior_any, Behavior, CallerPolicy, Lobby, LobbyEvent, LoopbackHub, ObjectCtx, ObjectId,
    ObjectType, ObjectTypeRegistry, Peer, PeerContext, PeerId, PeerState, RpcError, RpcMode,
    RpcRegistry, RpcSpec, RpcTarget, SessionEvent, TypeSpec, Value, ValueKind, WireError,
};
use mesh_services::{Profile, Settings};

const BEACON: ObjectType = ObjectType(7);

/// Moves along x every authority tick and counts the pings it receives.
#[derive(Debug, Default)]
struct Beacon {
    x: f32,
    pings: Vec<(PeerId, u64)>,
    broadcasts: u32,
}

impl Behavior for Beacon {
    fn authority_tick(&mut self, ctx: &mut ObjectCtx<'_>) {
        self.x += 1.0;
        ctx.mark_dirty();
    }

    fn write_state(&self) -> Result<Vec<u8>, WireError> {
        encode(&self.x)
    }

    fn read_state(&mut self, payload: &[u8]) -> Result<(), WireError> {
        self.x = decode(payload)?;
        Ok(())
    }

    behavior_any!();
}

fn types() -> ObjectTypeRegistry {
    let mut types = ObjectTypeRegistry::new();
    types
        .register(BEACON, TypeSpec::new("beacon", 1.0), |args| {
            let x = args.params.first().and_then(Value::as_f32).unwrap_or(0.0);
            Ok(Box::new(Beacon {
                x,
                ..Beacon::default()
            }))
        })
        .unwrap();
    types
}

fn methods() -> RpcRegistry {
    let mut rpc = RpcRegistry::new();
    rpc.register_object_method::<Beacon, _>(
        RpcSpec::new("ping", RpcMode::ToAuthorityOnly).params([ValueKind::U64]),
        |beacon, params, ctx| {
            let n = params[0]
                .as_u64()
                .ok_or_else(|| RpcError::Handler("ping needs a number".into()))?;
            beacon.pings.push((ctx.sender, n));
            Ok(())
        },
    )
    .unwrap();
    rpc.register_object_method::<Beacon, _>(
        RpcSpec::new("flash", RpcMode::ToAllPeers).caller(CallerPolicy::AuthorityOnly),
        |beacon, _params, _ctx| {
            beacon.broadcasts += 1;
            Ok(())
        },
    )
    .unwrap();
    rpc
}

struct Mesh {
    peers: Vec<Peer>,
    lobby: Lobby,
}

impl Mesh {
    fn new(n: u64) -> Self {
        let hub = LoopbackHub::default();
        let mut settings = Settings::default();
        settings.net.num_updates_per_frame = 2;
        let peers = (1..=n)
            .map(|id| {
                Peer::new(PeerContext {
                    transport: Box::new(hub.endpoint(PeerId(id))),
                    session_authority: PeerId(1),
                    profile: Profile {
                        progression: vec![id as u8, 1],
                        config: vec![0xAB],
                    },
                    settings: settings.clone(),
                    types: types(),
                    rpc: methods(),
                })
            })
            .collect();
        let mut lobby = Lobby::new(PeerId(1));
        for id in 2..=n {
            lobby.join(PeerId(id));
        }
        let mut mesh = Self { peers, lobby };
        mesh.sync_lobby();
        mesh
    }

    /// Forward lobby events to every peer still present.
    fn sync_lobby(&mut self) {
        for event in self.lobby.drain_events() {
            for peer in &mut self.peers {
                match event {
                    LobbyEvent::Joined(id) => peer.add_peer(id),
                    LobbyEvent::Left(id) if id != peer.local_peer() => peer.remove_peer(id),
                    LobbyEvent::Left(_) => {}
                }
            }
        }
    }

    fn settle(&mut self) {
        loop {
            let moved: usize = self.peers.iter_mut().map(Peer::poll).sum();
            if moved == 0 {
                break;
            }
        }
    }

    fn start(&mut self) {
        self.settle();
        self.peers[0].start_game().unwrap();
        self.settle();
    }

    fn peer(&self, id: u64) -> &Peer {
        &self.peers[(id - 1) as usize]
    }

    fn peer_mut(&mut self, id: u64) -> &mut Peer {
        &mut self.peers[(id - 1) as usize]
    }

    fn beacon(&self, on: u64, object: ObjectId) -> &Beacon {
        self.peer(on)
            .scheduler()
            .object(object)
            .and_then(|o| o.behavior_as::<Beacon>())
            .unwrap()
    }
}

#[test]
fn handshake_reaches_ingame_once_on_every_peer() {
    let mut mesh = Mesh::new(3);
    mesh.settle();
    for peer in &mesh.peers {
        for id in 1..=3 {
            let record = peer.session().record(PeerId(id)).unwrap();
            assert!(record.has_info(), "{} lacks info about {}", peer.local_peer(), id);
        }
    }

    mesh.start();
    // A late duplicate start changes nothing.
    mesh.peers[0].start_game().unwrap();
    mesh.settle();

    for peer in &mut mesh.peers {
        assert_eq!(peer.session().local_state(), PeerState::InGameOk);
        let started = peer
            .drain_events()
            .into_iter()
            .filter(|event| *event == SessionEvent::SimulationStarted)
            .count();
        assert_eq!(started, 1);
    }
}

#[test]
fn remote_peers_follow_the_authority_state() {
    let mut mesh = Mesh::new(3);
    mesh.start();

    let id = mesh
        .peer_mut(2)
        .spawn(BEACON, Transform::from_translation(Vec3::ZERO), vec![Value::F32(5.0)])
        .unwrap();
    mesh.settle();
    assert_eq!(mesh.beacon(1, id).x, 5.0);
    assert_eq!(mesh.beacon(3, id).x, 5.0);

    for _ in 0..4 {
        for peer in &mut mesh.peers {
            peer.tick(1.0 / 60.0);
        }
        mesh.settle();
    }
    // The last batch is still queued on the replicas until their next tick.
    for peer in &mut mesh.peers {
        peer.tick(1.0 / 60.0);
    }
    let owner_x = mesh.beacon(2, id).x;
    assert_eq!(owner_x, 10.0);
    assert_eq!(mesh.beacon(1, id).x, 9.0);
    assert_eq!(mesh.beacon(3, id).x, 9.0);
}

#[test]
fn authority_only_rpc_runs_on_the_owner_alone() {
    let mut mesh = Mesh::new(3);
    mesh.start();
    let id = mesh
        .peer_mut(2)
        .spawn(BEACON, Transform::default(), Vec::new())
        .unwrap();
    mesh.settle();

    mesh.peer_mut(1)
        .call(RpcTarget::Object(id), "ping", vec![Value::U64(3)], RpcMode::ToAuthorityOnly)
        .unwrap();
    mesh.peer_mut(2)
        .call(RpcTarget::Object(id), "ping", vec![Value::U64(4)], RpcMode::ToAuthorityOnly)
        .unwrap();
    mesh.settle();

    // Inbound datagrams are handled before the owner's own queued calls.
    assert_eq!(mesh.beacon(2, id).pings, vec![(PeerId(1), 3), (PeerId(2), 4)]);
    assert!(mesh.beacon(1, id).pings.is_empty());
    assert!(mesh.beacon(3, id).pings.is_empty());
}

#[test]
fn broadcast_rpc_from_the_owner_runs_everywhere() {
    let mut mesh = Mesh::new(3);
    mesh.start();
    let id = mesh
        .peer_mut(3)
        .spawn(BEACON, Transform::default(), Vec::new())
        .unwrap();
    mesh.settle();

    mesh.peer_mut(3)
        .call(RpcTarget::Object(id), "flash", Vec::new(), RpcMode::ToAllPeers)
        .unwrap();
    // Passes local validation but is refused by every receiver.
    mesh.peer_mut(1)
        .call(RpcTarget::Object(id), "flash", Vec::new(), RpcMode::ToAllPeers)
        .unwrap();
    mesh.settle();

    for on in 1..=3 {
        assert_eq!(mesh.beacon(on, id).broadcasts, 1, "on peer {on}");
    }
}

#[test]
fn mismatched_rpc_mode_is_rejected_before_sending() {
    let mut mesh = Mesh::new(2);
    mesh.start();
    let id = mesh
        .peer_mut(2)
        .spawn(BEACON, Transform::default(), Vec::new())
        .unwrap();
    mesh.settle();

    let err = mesh
        .peer_mut(1)
        .call(RpcTarget::Object(id), "ping", vec![Value::U64(1)], RpcMode::ToAllPeers)
        .unwrap_err();
    assert!(matches!(err, RpcError::ModeMismatch { .. }));
    let err = mesh
        .peer_mut(1)
        .call(RpcTarget::Object(id), "ping", vec![Value::Bool(true)], RpcMode::ToAuthorityOnly)
        .unwrap_err();
    assert!(matches!(err, RpcError::BadParams { .. }));
}

#[test]
fn departure_drops_objects_and_promotes_the_next_authority() {
    let mut mesh = Mesh::new(3);
    mesh.start();
    let hosted = mesh
        .peer_mut(1)
        .spawn(BEACON, Transform::default(), Vec::new())
        .unwrap();
    let kept = mesh
        .peer_mut(3)
        .spawn(BEACON, Transform::default(), Vec::new())
        .unwrap();
    mesh.settle();

    mesh.lobby.leave(PeerId(1));
    mesh.sync_lobby();
    mesh.settle();

    for on in 2..=3 {
        let peer = mesh.peer(on);
        assert!(peer.scheduler().object(hosted).is_none());
        assert!(peer.scheduler().object(kept).is_some());
        assert_eq!(peer.session().authority(), PeerId(2));
        assert_eq!(peer.members(), vec![PeerId(2), PeerId(3)]);
    }
    assert!(mesh.peer_mut(3).tick(1.0 / 60.0).is_some());
}

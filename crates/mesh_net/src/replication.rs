//! Replication scheduler
//!
//! Owns the object registry and runs the fixed-rate tick and variable-rate
//! frame passes. Each tick, locally owned objects accumulate their priority
//! and the highest accumulators win one of a bounded number of send slots.

use crate::codec::{encode, WireError};
use crate::input::InputTable;
use crate::object::{
    ConstructError, Hook, ObjectRegistry, ObjectTypeRegistry, PassClock, SimObject, SpawnArgs,
};
use crate::transport::{MessageClass, MessageKind, TransportAdapter};
use crate::wire::{ObjectCommand, ObjectType, PlayerInputData, SpawnCommand, StateUpdatePacket, Value};
use mesh_core::math::{DeterministicRng, Transform};
use mesh_core::{ObjectId, PeerId};
use mesh_metrics::{Stat, StatCounters};
use mesh_services::{InputState, NetSettings};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub type Tick = u64;

/// Attempts at drawing a free object id before giving up.
const ID_ALLOC_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Send slots per tick.
    pub num_updates_per_frame: usize,
    pub freshness_threshold_ticks: u64,
    pub heal_unknown_objects: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&NetSettings::default())
    }
}

impl From<&NetSettings> for SchedulerConfig {
    fn from(net: &NetSettings) -> Self {
        Self {
            num_updates_per_frame: net.num_updates_per_frame,
            freshness_threshold_ticks: net.freshness_threshold_ticks,
            heal_unknown_objects: net.heal_unknown_objects,
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("object id 0 is reserved")]
    ZeroId,
    #[error("{0} already exists")]
    DuplicateId(ObjectId),
    #[error("authority {0} is not a session member")]
    UnknownAuthority(PeerId),
    #[error("{0} is not registered")]
    UnknownType(ObjectType),
    #[error("constructor of {ty} failed: {source}")]
    Construct {
        ty: ObjectType,
        #[source]
        source: ConstructError,
    },
    #[error("no free object id after repeated draws")]
    IdSpaceExhausted,
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestroyError {
    #[error("{0} does not exist")]
    UnknownObject(ObjectId),
    #[error("{object} is owned by {authority}")]
    NotAuthority { object: ObjectId, authority: PeerId },
}

/// Why an inbound state update was not applied.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update for {object} is {age} ticks old")]
    Stale { object: ObjectId, age: u64 },
    #[error("update for {object} at tick {tick} is older than the applied tick {last}")]
    OutOfOrder { object: ObjectId, tick: u64, last: u64 },
    #[error("update for unknown {object} of {ty}")]
    UnknownObject { object: ObjectId, ty: ObjectType },
    #[error("{object} is owned by {expected}, update came from {sender}")]
    AuthorityMismatch {
        object: ObjectId,
        expected: PeerId,
        sender: PeerId,
    },
    #[error("{object} is {expected}, update claims {got}")]
    TypeMismatch {
        object: ObjectId,
        expected: ObjectType,
        got: ObjectType,
    },
    #[error("undecodable payload for {object}: {source}")]
    Decode {
        object: ObjectId,
        #[source]
        source: WireError,
    },
}

impl UpdateError {
    /// Local records disagree with the sender about the object.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            UpdateError::UnknownObject { .. }
                | UpdateError::AuthorityMismatch { .. }
                | UpdateError::TypeMismatch { .. }
        )
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: Tick,
    /// Objects whose state was broadcast, in selection order.
    pub sent: Vec<ObjectId>,
    pub applied: usize,
    pub dropped: usize,
    pub destroyed: Vec<ObjectId>,
}

pub struct ReplicationScheduler {
    local_peer: PeerId,
    config: SchedulerConfig,
    tick: Tick,
    types: ObjectTypeRegistry,
    objects: ObjectRegistry,
    inputs: InputTable,
    local_input: InputState,
    pending_inputs: VecDeque<PlayerInputData>,
    pending_updates: VecDeque<StateUpdatePacket>,
    id_rng: DeterministicRng,
    stats: StatCounters,
}

impl ReplicationScheduler {
    pub fn new(local_peer: PeerId, config: SchedulerConfig) -> Self {
        Self {
            local_peer,
            config,
            tick: 0,
            types: ObjectTypeRegistry::new(),
            objects: ObjectRegistry::new(),
            inputs: InputTable::new(),
            local_input: InputState::default(),
            pending_inputs: VecDeque::new(),
            pending_updates: VecDeque::new(),
            id_rng: DeterministicRng::new(local_peer.to_bits()),
            stats: StatCounters::new(),
        }
    }

    pub fn with_types(mut self, types: ObjectTypeRegistry) -> Self {
        self.types = types;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn types(&self) -> &ObjectTypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut ObjectTypeRegistry {
        &mut self.types
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub(crate) fn objects_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.objects
    }

    pub fn object(&self, id: ObjectId) -> Option<&SimObject> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SimObject> {
        self.objects.get_mut(id)
    }

    pub fn inputs(&self) -> &InputTable {
        &self.inputs
    }

    pub fn stats(&self) -> &StatCounters {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an already constructed object without broadcasting it.
    pub fn register_object(&mut self, object: SimObject) -> Result<ObjectId, SpawnError> {
        let id = object.id();
        if id.is_none() {
            return Err(SpawnError::ZeroId);
        }
        self.objects
            .insert(object)
            .map_err(|rejected| SpawnError::DuplicateId(rejected.id()))?;
        Ok(id)
    }

    pub fn unregister_object(&mut self, id: ObjectId) -> Option<SimObject> {
        self.objects.remove(id)
    }

    /// Create an object owned by the local peer and announce it to `members`.
    pub fn spawn_local(
        &mut self,
        object_type: ObjectType,
        transform: Transform,
        params: Vec<Value>,
        link: &mut TransportAdapter,
        members: &[PeerId],
    ) -> Result<ObjectId, SpawnError> {
        let command = SpawnCommand {
            id: self.allocate_id()?,
            authority: self.local_peer,
            object_type,
            transform,
            params,
        };
        let bytes = encode(&ObjectCommand::Spawn(command.clone()))?;
        let id = self.apply_spawn(&command, members)?;
        link.broadcast(
            MessageKind::ObjectCommand,
            &bytes,
            MessageClass::ReliableOrdered,
            members,
        );
        Ok(id)
    }

    fn allocate_id(&mut self) -> Result<ObjectId, SpawnError> {
        for _ in 0..ID_ALLOC_ATTEMPTS {
            let candidate = ObjectId(self.id_rng.next_u64());
            if !candidate.is_none() && !self.objects.contains(candidate) {
                return Ok(candidate);
            }
        }
        Err(SpawnError::IdSpaceExhausted)
    }

    /// Validate and apply a spawn command. A rejected spawn leaves the
    /// registry untouched.
    pub fn apply_spawn(
        &mut self,
        command: &SpawnCommand,
        members: &[PeerId],
    ) -> Result<ObjectId, SpawnError> {
        let result = self.try_spawn(command, members);
        match &result {
            Ok(id) => debug!(
                object = %id,
                authority = %command.authority,
                ty = %command.object_type,
                "spawned object"
            ),
            Err(err) => {
                warn!(object = %command.id, authority = %command.authority, error = %err, "spawn rejected");
                self.stats.increment(Stat::SpawnsRejected, 1);
            }
        }
        result
    }

    fn try_spawn(
        &mut self,
        command: &SpawnCommand,
        members: &[PeerId],
    ) -> Result<ObjectId, SpawnError> {
        if command.id.is_none() {
            return Err(SpawnError::ZeroId);
        }
        if self.objects.contains(command.id) {
            return Err(SpawnError::DuplicateId(command.id));
        }
        if command.authority.is_none() || !members.contains(&command.authority) {
            return Err(SpawnError::UnknownAuthority(command.authority));
        }
        let args = SpawnArgs {
            id: command.id,
            authority: command.authority,
            transform: &command.transform,
            params: &command.params,
        };
        let object = self
            .types
            .instantiate(command.object_type, &args)
            .ok_or(SpawnError::UnknownType(command.object_type))?
            .map_err(|source| SpawnError::Construct {
                ty: command.object_type,
                source,
            })?;
        self.register_object(object)
    }

    /// Mark a locally owned object for removal at the end of the next tick.
    pub fn destroy(&mut self, id: ObjectId) -> Result<(), DestroyError> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or(DestroyError::UnknownObject(id))?;
        if object.authority() != self.local_peer {
            return Err(DestroyError::NotAuthority {
                object: id,
                authority: object.authority(),
            });
        }
        object.flags.destroyed = true;
        Ok(())
    }

    /// Apply a reliable lifecycle command from `sender`.
    pub fn handle_object_command(
        &mut self,
        command: ObjectCommand,
        sender: PeerId,
        members: &[PeerId],
    ) {
        match command {
            ObjectCommand::Spawn(spawn) => {
                if spawn.authority != sender {
                    warn!(
                        object = %spawn.id,
                        authority = %spawn.authority,
                        sender = %sender,
                        "spawn issued on behalf of another peer, dropping"
                    );
                    self.stats.increment(Stat::SpawnsRejected, 1);
                    return;
                }
                // Rejections are logged by apply_spawn.
                let _ = self.apply_spawn(&spawn, members);
            }
            ObjectCommand::Destroy { id } => {
                if let Err(err) = self.apply_remote_destroy(id, sender) {
                    warn!(object = %id, sender = %sender, error = %err, "destroy rejected");
                    self.stats.increment(Stat::Desyncs, 1);
                }
            }
        }
    }

    fn apply_remote_destroy(&mut self, id: ObjectId, sender: PeerId) -> Result<(), DestroyError> {
        let authority = self
            .objects
            .get(id)
            .ok_or(DestroyError::UnknownObject(id))?
            .authority();
        if authority != sender {
            return Err(DestroyError::NotAuthority {
                object: id,
                authority,
            });
        }
        self.objects.remove(id);
        debug!(object = %id, sender = %sender, "destroyed object");
        Ok(())
    }

    /// Drop every object owned by a departed peer. Ownership is not handed
    /// over.
    pub fn remove_objects_of(&mut self, peer: PeerId) -> Vec<ObjectId> {
        let owned = self.objects.owned_by(peer);
        for &id in &owned {
            self.objects.remove(id);
        }
        if !owned.is_empty() {
            info!(peer = %peer, count = owned.len(), "removed objects of departed peer");
        }
        self.inputs.forget(peer);
        owned
    }

    // ------------------------------------------------------------------
    // Inbound queues
    // ------------------------------------------------------------------

    pub fn queue_input(&mut self, data: PlayerInputData) {
        self.pending_inputs.push_back(data);
    }

    pub fn queue_update(&mut self, packet: StateUpdatePacket) {
        self.pending_updates.push_back(packet);
    }

    pub fn pending_updates(&self) -> usize {
        self.pending_updates.len()
    }

    /// Input broadcast at the end of every tick.
    pub fn set_local_input(&mut self, input: InputState) {
        self.local_input = input.clamped();
    }

    /// Apply one state update against the registry.
    pub fn apply_update(
        &mut self,
        packet: StateUpdatePacket,
        members: &[PeerId],
    ) -> Result<(), UpdateError> {
        let object_id = packet.object_id;
        let age = self.tick.saturating_sub(packet.tick);
        if age > self.config.freshness_threshold_ticks {
            return Err(UpdateError::Stale {
                object: object_id,
                age,
            });
        }

        if !self.objects.contains(object_id) {
            self.heal(&packet, members)?;
        }
        let Some(object) = self.objects.get_mut(object_id) else {
            return Err(UpdateError::UnknownObject {
                object: object_id,
                ty: packet.object_type,
            });
        };

        if object.authority() != packet.sender {
            return Err(UpdateError::AuthorityMismatch {
                object: object_id,
                expected: object.authority(),
                sender: packet.sender,
            });
        }
        if object.object_type() != packet.object_type {
            return Err(UpdateError::TypeMismatch {
                object: object_id,
                expected: object.object_type(),
                got: packet.object_type,
            });
        }
        if let Some(last) = object.last_update_tick {
            if packet.tick < last {
                return Err(UpdateError::OutOfOrder {
                    object: object_id,
                    tick: packet.tick,
                    last,
                });
            }
        }

        object
            .behavior_mut()
            .read_state(&packet.payload)
            .map_err(|source| UpdateError::Decode {
                object: object_id,
                source,
            })?;
        object.last_update_tick = Some(packet.tick);
        Ok(())
    }

    /// Spawn a default instance for an update naming an unknown object.
    fn heal(&mut self, packet: &StateUpdatePacket, members: &[PeerId]) -> Result<(), UpdateError> {
        let unknown = UpdateError::UnknownObject {
            object: packet.object_id,
            ty: packet.object_type,
        };
        if !self.config.heal_unknown_objects {
            return Err(unknown);
        }
        let command = SpawnCommand {
            id: packet.object_id,
            authority: packet.sender,
            object_type: packet.object_type,
            transform: Transform::default(),
            params: Vec::new(),
        };
        match self.apply_spawn(&command, members) {
            Ok(_) => {
                warn!(object = %packet.object_id, ty = %packet.object_type, "healed unknown object with a default instance");
                Ok(())
            }
            Err(_) => Err(unknown),
        }
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Variable-rate presentation pass.
    pub fn frame(&mut self, delta: f32) {
        let clock = PassClock {
            tick: self.tick,
            delta,
            local_peer: self.local_peer,
        };
        let inputs = &self.inputs;
        for object in self.objects.iter_mut() {
            if object.is_destroyed() {
                continue;
            }
            let hook = if object.authority() == clock.local_peer {
                Hook::AuthorityFrame
            } else {
                Hook::PredictFrame
            };
            object.run(hook, clock, inputs);
            object.run(Hook::SharedFrame, clock, inputs);
        }
    }

    /// Fixed-rate network heartbeat.
    pub fn tick(
        &mut self,
        delta: f32,
        link: &mut TransportAdapter,
        members: &[PeerId],
    ) -> TickReport {
        let mut report = TickReport::default();

        // Inputs first, then updates.
        while let Some(data) = self.pending_inputs.pop_front() {
            self.inputs.apply(data);
        }
        while let Some(packet) = self.pending_updates.pop_front() {
            match self.apply_update(packet, members) {
                Ok(()) => {
                    report.applied += 1;
                    self.stats.increment(Stat::UpdatesApplied, 1);
                }
                Err(err) => {
                    report.dropped += 1;
                    self.record_rejected_update(&err);
                }
            }
        }

        self.tick += 1;
        report.tick = self.tick;
        let clock = PassClock {
            tick: self.tick,
            delta,
            local_peer: self.local_peer,
        };

        self.run_simulation(clock);
        report.sent = self.send_updates(link, members);
        self.send_local_input(link, members);
        report.destroyed = self.reap_destroyed(link, members);
        report
    }

    fn record_rejected_update(&mut self, err: &UpdateError) {
        match err {
            UpdateError::Stale { .. } => {
                trace!(error = %err, "discarding stale update");
                self.stats.increment(Stat::UpdatesStale, 1);
            }
            err if err.is_desync() => {
                warn!(tick = self.tick, error = %err, "desync");
                self.stats.increment(Stat::Desyncs, 1);
            }
            err => debug!(tick = self.tick, error = %err, "dropping update"),
        }
    }

    fn run_simulation(&mut self, clock: PassClock) {
        let inputs = &self.inputs;
        let local = clock.local_peer;

        for object in self.objects.iter_mut() {
            if object.is_destroyed() || object.authority() != local {
                continue;
            }
            object.run(Hook::AuthorityTick, clock, inputs);
            let flags = object.flags;
            let priority = object.priority();
            if flags.dirty && !flags.sleeping && priority > 0.0 {
                object.accumulator += priority;
            }
        }

        for object in self.objects.iter_mut() {
            if object.is_destroyed() || object.authority() == local || !object.flags.predict {
                continue;
            }
            object.run(Hook::PredictTick, clock, inputs);
        }

        for object in self.objects.iter_mut() {
            if !object.is_destroyed() {
                object.run(Hook::SharedTick, clock, inputs);
            }
        }
    }

    /// Pick the highest accumulators and broadcast their state. Ties go to
    /// the lower id.
    fn send_updates(&mut self, link: &mut TransportAdapter, members: &[PeerId]) -> Vec<ObjectId> {
        let local = self.local_peer;
        let mut candidates: Vec<(ObjectId, f32)> = self
            .objects
            .iter()
            .filter(|o| {
                o.authority() == local && !o.is_destroyed() && !o.is_sleeping() && o.accumulator > 0.0
            })
            .map(|o| (o.id(), o.accumulator))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates.truncate(self.config.num_updates_per_frame);

        let mut sent = Vec::with_capacity(candidates.len());
        for (id, _) in candidates {
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            // Credit is only spent once the update is on its way.
            let bytes = match object.behavior().write_state() {
                Ok(payload) => encode(&StateUpdatePacket {
                    object_id: id,
                    object_type: object.object_type(),
                    tick: self.tick,
                    sender: local,
                    payload,
                }),
                Err(err) => Err(err),
            };
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(object = %id, error = %err, "failed to encode state update");
                    continue;
                }
            };
            object.accumulator = 0.0;
            object.flags.dirty = false;
            link.broadcast(
                MessageKind::StateUpdate,
                &bytes,
                MessageClass::UnreliableNoDelay,
                members,
            );
            sent.push(id);
            self.stats.increment(Stat::UpdatesSent, 1);
        }
        sent
    }

    fn send_local_input(&mut self, link: &mut TransportAdapter, members: &[PeerId]) {
        let data = PlayerInputData {
            peer: self.local_peer,
            tick: self.tick,
            input: self.local_input,
        };
        self.inputs.apply(data);
        match encode(&data) {
            Ok(bytes) => {
                link.broadcast(MessageKind::Input, &bytes, MessageClass::ReliableOrdered, members);
            }
            Err(err) => warn!(error = %err, "failed to encode local input"),
        }
    }

    fn reap_destroyed(&mut self, link: &mut TransportAdapter, members: &[PeerId]) -> Vec<ObjectId> {
        let doomed: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.is_destroyed())
            .map(|o| o.id())
            .collect();
        for &id in &doomed {
            let Some(object) = self.objects.remove(id) else {
                continue;
            };
            if object.authority() != self.local_peer {
                continue;
            }
            match encode(&ObjectCommand::Destroy { id }) {
                Ok(bytes) => {
                    link.broadcast(
                        MessageKind::ObjectCommand,
                        &bytes,
                        MessageClass::ReliableOrdered,
                        members,
                    );
                    debug!(object = %id, "destroyed object");
                }
                Err(err) => warn!(object = %id, error = %err, "failed to encode destroy"),
            }
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use crate::loopback::LoopbackHub;
    use crate::object::test_support::{counter_types, Counter, COUNTER};
    use crate::object::{Behavior, ObjectCtx};
    use crate::transport::Inbound;

    const LOCAL: PeerId = PeerId(1);
    const REMOTE: PeerId = PeerId(2);
    const THIRD: PeerId = PeerId(3);
    const MEMBERS: [PeerId; 3] = [LOCAL, REMOTE, THIRD];

    struct Rig {
        hub: LoopbackHub,
        link: TransportAdapter,
        remote: TransportAdapter,
        scheduler: ReplicationScheduler,
    }

    fn rig(config: SchedulerConfig) -> Rig {
        let hub = LoopbackHub::default();
        let link = TransportAdapter::new(Box::new(hub.endpoint(LOCAL)));
        let remote = TransportAdapter::new(Box::new(hub.endpoint(REMOTE)));
        let _third = hub.endpoint(THIRD);
        Rig {
            hub,
            link,
            remote,
            scheduler: ReplicationScheduler::new(LOCAL, config).with_types(counter_types()),
        }
    }

    impl Rig {
        fn tick(&mut self) -> TickReport {
            self.scheduler.tick(1.0 / 60.0, &mut self.link, &MEMBERS)
        }

        fn add(&mut self, id: u64, authority: PeerId, priority: f32) {
            let behavior = Counter {
                always_dirty: true,
                ..Counter::default()
            };
            self.scheduler
                .register_object(SimObject::new(
                    ObjectId(id),
                    authority,
                    COUNTER,
                    priority,
                    Box::new(behavior),
                ))
                .unwrap();
        }

        fn remote_inbound(&mut self) -> Vec<Inbound> {
            self.remote.drain(usize::MAX)
        }

        fn counter(&self, id: u64) -> &Counter {
            self.scheduler
                .object(ObjectId(id))
                .and_then(|o| o.behavior_as::<Counter>())
                .unwrap()
        }
    }

    fn budget(n: usize) -> SchedulerConfig {
        SchedulerConfig {
            num_updates_per_frame: n,
            ..SchedulerConfig::default()
        }
    }

    fn update(id: u64, sender: PeerId, tick: u64, value: u64) -> StateUpdatePacket {
        StateUpdatePacket {
            object_id: ObjectId(id),
            object_type: COUNTER,
            tick,
            sender,
            payload: encode(&value).unwrap(),
        }
    }

    #[test]
    fn highest_accumulators_win_the_budget() {
        let mut rig = rig(budget(2));
        rig.add(1, LOCAL, 10.0);
        rig.add(2, LOCAL, 1.0);
        rig.add(3, LOCAL, 1.0);

        let first = rig.tick();
        assert_eq!(first.sent, vec![ObjectId(1), ObjectId(2)]);
        let acc = |rig: &Rig, id| rig.scheduler.object(ObjectId(id)).unwrap().priority_accumulator();
        assert_eq!(acc(&rig, 1), 0.0);
        assert_eq!(acc(&rig, 2), 0.0);
        assert_eq!(acc(&rig, 3), 1.0);

        // 10 vs 1 vs 2: the waiting object takes the second slot.
        let second = rig.tick();
        assert_eq!(second.sent, vec![ObjectId(1), ObjectId(3)]);
    }

    #[test]
    fn low_priority_objects_do_not_starve() {
        let mut rig = rig(budget(1));
        rig.add(1, LOCAL, 5.0);
        for id in 2..=4 {
            rig.add(id, LOCAL, 1.0);
        }

        let mut counts = [0usize; 5];
        for _ in 0..20 {
            for id in rig.tick().sent {
                counts[id.0 as usize] += 1;
            }
        }
        for id in 2..=4 {
            assert!(counts[id] >= 2, "object {id} sent {} times", counts[id]);
            assert!(counts[1] > counts[id]);
        }
    }

    #[test]
    fn sent_payload_is_object_state_only() {
        let mut rig = rig(budget(20));
        rig.add(7, LOCAL, 3.0);
        rig.tick();

        let object = rig.scheduler.object(ObjectId(7)).unwrap();
        assert_eq!(object.priority_accumulator(), 0.0);
        assert!(object.is_dirty(), "hook re-marks the counter dirty");

        let inbound = rig.remote_inbound();
        let update = inbound
            .iter()
            .find(|m| m.kind == MessageKind::StateUpdate)
            .unwrap();
        let packet: StateUpdatePacket = decode(&update.payload).unwrap();
        assert_eq!(packet.tick, 1);
        assert_eq!(packet.sender, LOCAL);
        assert_eq!(decode::<u64>(&packet.payload).unwrap(), 1);
        assert!(inbound.iter().any(|m| m.kind == MessageKind::Input));
    }

    /// Serialization fails while `broken` is set.
    #[derive(Debug, Default)]
    struct Fragile {
        broken: bool,
    }

    impl Behavior for Fragile {
        fn authority_tick(&mut self, ctx: &mut ObjectCtx<'_>) {
            ctx.mark_dirty();
        }

        fn write_state(&self) -> Result<Vec<u8>, WireError> {
            if self.broken {
                return Err(WireError::Empty);
            }
            encode(&0u8)
        }

        fn read_state(&mut self, _payload: &[u8]) -> Result<(), WireError> {
            Ok(())
        }

        crate::behavior_any!();
    }

    #[test]
    fn failed_serialization_keeps_its_credit() {
        let mut rig = rig(budget(1));
        rig.scheduler
            .register_object(SimObject::new(
                ObjectId(1),
                LOCAL,
                COUNTER,
                1.0,
                Box::new(Fragile { broken: true }),
            ))
            .unwrap();

        assert!(rig.tick().sent.is_empty());
        let object = rig.scheduler.object(ObjectId(1)).unwrap();
        assert!(object.priority_accumulator() > 0.0);
        assert!(object.is_dirty());
        assert!(rig
            .remote_inbound()
            .iter()
            .all(|m| m.kind != MessageKind::StateUpdate));

        rig.scheduler
            .object_mut(ObjectId(1))
            .and_then(|o| o.behavior_as_mut::<Fragile>())
            .unwrap()
            .broken = false;
        assert_eq!(rig.tick().sent, vec![ObjectId(1)]);
        assert_eq!(
            rig.scheduler.object(ObjectId(1)).unwrap().priority_accumulator(),
            0.0
        );
    }

    #[test]
    fn clean_and_sleeping_objects_do_not_accumulate() {
        let mut rig = rig(budget(20));
        rig.scheduler
            .register_object(SimObject::new(
                ObjectId(1),
                LOCAL,
                COUNTER,
                1.0,
                Box::new(Counter::default()),
            ))
            .unwrap();
        rig.add(2, LOCAL, 1.0);
        rig.scheduler.object_mut(ObjectId(2)).unwrap().set_sleeping(true);

        // Fresh objects start dirty, so the first tick sends the first one.
        assert_eq!(rig.tick().sent, vec![ObjectId(1)]);
        assert!(rig.tick().sent.is_empty());
        assert_eq!(
            rig.scheduler.object(ObjectId(2)).unwrap().priority_accumulator(),
            0.0
        );
    }

    #[test]
    fn remote_objects_predict_only_when_flagged() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        rig.add(2, REMOTE, 1.0);
        rig.scheduler.object_mut(ObjectId(2)).unwrap().flags.predict = true;

        let report = rig.tick();
        assert!(report.sent.is_empty());
        assert_eq!(rig.counter(1).predict_ticks, 0);
        assert_eq!(rig.counter(2).predict_ticks, 1);
        assert_eq!(rig.counter(1).authority_ticks, 0);
        assert_eq!(rig.counter(1).shared_ticks, 1);
    }

    #[test]
    fn frame_runs_matching_variant() {
        let mut rig = rig(budget(20));
        rig.add(1, LOCAL, 1.0);
        rig.add(2, REMOTE, 1.0);
        rig.scheduler.frame(0.01);
        rig.scheduler.frame(0.01);
        assert_eq!(rig.counter(1).frames, 2);
        assert_eq!(rig.counter(2).frames, 2);
        assert_eq!(rig.counter(1).authority_ticks, 0);
    }

    #[test]
    fn invalid_spawns_leave_registry_untouched() {
        let mut rig = rig(budget(20));
        rig.add(5, REMOTE, 1.0);
        let spawn = |id, authority| SpawnCommand {
            id: ObjectId(id),
            authority,
            object_type: COUNTER,
            transform: Transform::default(),
            params: Vec::new(),
        };

        let cases = [
            (spawn(0, REMOTE), "zero id"),
            (spawn(5, REMOTE), "duplicate"),
            (spawn(6, PeerId(99)), "stranger"),
            (spawn(6, PeerId::NONE), "no authority"),
        ];
        for (command, label) in cases {
            assert!(
                rig.scheduler.apply_spawn(&command, &MEMBERS).is_err(),
                "{label} accepted"
            );
            assert_eq!(rig.scheduler.objects().ids(), vec![ObjectId(5)], "{label}");
        }

        let unknown_type = SpawnCommand {
            object_type: ObjectType(42),
            ..spawn(6, REMOTE)
        };
        assert!(matches!(
            rig.scheduler.apply_spawn(&unknown_type, &MEMBERS),
            Err(SpawnError::UnknownType(_))
        ));
        assert_eq!(rig.scheduler.objects().len(), 1);
    }

    #[test]
    fn spawn_from_impostor_is_dropped() {
        let mut rig = rig(budget(20));
        let command = ObjectCommand::Spawn(SpawnCommand {
            id: ObjectId(3),
            authority: THIRD,
            object_type: COUNTER,
            transform: Transform::default(),
            params: Vec::new(),
        });
        rig.scheduler.handle_object_command(command, REMOTE, &MEMBERS);
        assert!(rig.scheduler.objects().is_empty());
    }

    #[test]
    fn spawn_local_registers_and_announces() {
        let mut rig = rig(budget(20));
        let id = rig
            .scheduler
            .spawn_local(COUNTER, Transform::default(), Vec::new(), &mut rig.link, &MEMBERS)
            .unwrap();
        assert!(!id.is_none());
        assert_eq!(rig.scheduler.object(id).unwrap().authority(), LOCAL);

        let inbound = rig.remote_inbound();
        let command: ObjectCommand = decode(&inbound[0].payload).unwrap();
        assert!(matches!(command, ObjectCommand::Spawn(ref s) if s.id == id && s.authority == LOCAL));
        assert_eq!(rig.hub.pending(THIRD), 1);
    }

    #[test]
    fn stale_updates_are_never_applied() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        for _ in 0..100 {
            rig.tick();
        }

        rig.scheduler.queue_update(update(1, REMOTE, 30, 777));
        let report = rig.tick();
        assert_eq!((report.applied, report.dropped), (0, 1));
        assert_eq!(rig.counter(1).value, 0);

        rig.scheduler.queue_update(update(1, REMOTE, 50, 555));
        assert_eq!(rig.tick().applied, 1);
        assert_eq!(rig.counter(1).value, 555);
    }

    #[test]
    fn reapplying_an_update_is_idempotent() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        let packet = update(1, REMOTE, 0, 42);
        rig.scheduler.apply_update(packet.clone(), &MEMBERS).unwrap();
        rig.scheduler.apply_update(packet, &MEMBERS).unwrap();
        assert_eq!(rig.counter(1).value, 42);
    }

    #[test]
    fn older_update_than_applied_is_dropped() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        for _ in 0..10 {
            rig.tick();
        }
        rig.scheduler.apply_update(update(1, REMOTE, 9, 9), &MEMBERS).unwrap();
        let err = rig
            .scheduler
            .apply_update(update(1, REMOTE, 8, 8), &MEMBERS)
            .unwrap_err();
        assert!(matches!(err, UpdateError::OutOfOrder { last: 9, .. }));
        assert_eq!(rig.counter(1).value, 9);
    }

    #[test]
    fn mismatched_updates_are_desyncs() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);

        let err = rig
            .scheduler
            .apply_update(update(1, THIRD, 0, 5), &MEMBERS)
            .unwrap_err();
        assert!(matches!(err, UpdateError::AuthorityMismatch { .. }));

        let mut wrong_type = update(1, REMOTE, 0, 5);
        wrong_type.object_type = ObjectType(9);
        let err = rig.scheduler.apply_update(wrong_type, &MEMBERS).unwrap_err();
        assert!(matches!(err, UpdateError::TypeMismatch { .. }));

        let err = rig
            .scheduler
            .apply_update(update(2, REMOTE, 0, 5), &MEMBERS)
            .unwrap_err();
        assert!(err.is_desync());
        assert_eq!(rig.counter(1).value, 0);
        assert!(!rig.scheduler.objects().contains(ObjectId(2)));
    }

    #[test]
    fn healing_spawns_default_instance() {
        let mut rig = rig(SchedulerConfig {
            heal_unknown_objects: true,
            ..SchedulerConfig::default()
        });
        rig.scheduler
            .apply_update(update(9, REMOTE, 0, 11), &MEMBERS)
            .unwrap();
        let object = rig.scheduler.object(ObjectId(9)).unwrap();
        assert_eq!(object.authority(), REMOTE);
        assert_eq!(rig.counter(9).value, 11);

        // Strangers still cannot create objects.
        assert!(rig
            .scheduler
            .apply_update(update(10, PeerId(77), 0, 1), &MEMBERS)
            .is_err());
    }

    #[test]
    fn destroy_is_broadcast_at_end_of_tick() {
        let mut rig = rig(budget(20));
        rig.add(1, LOCAL, 1.0);
        rig.add(2, REMOTE, 1.0);

        assert_eq!(
            rig.scheduler.destroy(ObjectId(2)),
            Err(DestroyError::NotAuthority {
                object: ObjectId(2),
                authority: REMOTE
            })
        );
        rig.scheduler.destroy(ObjectId(1)).unwrap();
        let report = rig.tick();
        assert_eq!(report.destroyed, vec![ObjectId(1)]);
        assert!(report.sent.is_empty());
        assert!(!rig.scheduler.objects().contains(ObjectId(1)));

        let destroys: Vec<ObjectCommand> = rig
            .remote_inbound()
            .into_iter()
            .filter(|m| m.kind == MessageKind::ObjectCommand)
            .map(|m| decode(&m.payload).unwrap())
            .collect();
        assert_eq!(destroys, vec![ObjectCommand::Destroy { id: ObjectId(1) }]);
    }

    #[test]
    fn remote_destroy_requires_authority() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        rig.scheduler
            .handle_object_command(ObjectCommand::Destroy { id: ObjectId(1) }, THIRD, &MEMBERS);
        assert!(rig.scheduler.objects().contains(ObjectId(1)));
        rig.scheduler
            .handle_object_command(ObjectCommand::Destroy { id: ObjectId(1) }, REMOTE, &MEMBERS);
        assert!(rig.scheduler.objects().is_empty());
    }

    #[test]
    fn departed_peer_objects_are_removed() {
        let mut rig = rig(budget(20));
        rig.add(1, REMOTE, 1.0);
        rig.add(2, THIRD, 1.0);
        rig.add(3, REMOTE, 1.0);
        assert_eq!(
            rig.scheduler.remove_objects_of(REMOTE),
            vec![ObjectId(1), ObjectId(3)]
        );
        assert_eq!(rig.scheduler.objects().ids(), vec![ObjectId(2)]);
    }

    #[test]
    fn inputs_are_applied_before_simulation() {
        let mut rig = rig(budget(20));
        let mut input = InputState::default();
        input.actions.insert(mesh_services::ActionFlags::JUMP);
        rig.scheduler.queue_input(PlayerInputData {
            peer: REMOTE,
            tick: 3,
            input,
        });
        rig.tick();
        assert!(rig
            .scheduler
            .inputs()
            .state_of(REMOTE)
            .actions
            .contains(mesh_services::ActionFlags::JUMP));
        assert_eq!(rig.scheduler.inputs().get(LOCAL).map(|d| d.tick), Some(1));
    }
}

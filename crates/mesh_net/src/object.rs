//! Replicated simulation objects
//!
//! An object is an identity and scheduling record wrapped around a gameplay
//! [`Behavior`]. The behavior owns the actual state and knows how to write it
//! into, and read it back from, a state update payload.

use crate::authority::AuthorityMap;
use crate::codec::WireError;
use crate::input::InputTable;
use crate::registration_error::RegistryError;
use crate::wire::{ObjectType, Value};
use mesh_core::math::Transform;
use mesh_core::{ObjectId, PeerId};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Gameplay hooks of a replicated object.
///
/// `authority_*` hooks run on the peer that owns the object, `predict_*`
/// hooks on every other peer, and `shared_*` hooks everywhere. Hooks must not
/// block.
pub trait Behavior: Any + Send {
    fn authority_tick(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    /// Local prediction between authoritative updates. Only runs when the
    /// object's `predict` flag is set.
    fn predict_tick(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    fn shared_tick(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    fn authority_frame(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    fn predict_frame(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    fn shared_frame(&mut self, _ctx: &mut ObjectCtx<'_>) {}

    /// Serialize the replicated state. Scheduling bookkeeping is never part
    /// of it.
    fn write_state(&self) -> Result<Vec<u8>, WireError>;

    /// Overwrite the replicated state from an authoritative payload.
    fn read_state(&mut self, payload: &[u8]) -> Result<(), WireError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Implements the `as_any` plumbing of [`Behavior`].
///
/// # Example
/// ```ignore
/// impl Behavior for Door {
///     fn write_state(&self) -> Result<Vec<u8>, WireError> { encode(&self.open) }
///     fn read_state(&mut self, payload: &[u8]) -> Result<(), WireError> { ... }
///     behavior_any!();
/// }
/// ```
#[macro_export]
macro_rules! behavior_any {
    () => {
        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }
    };
}

/// Per-object scheduling flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectFlags {
    pub dirty: bool,
    pub sleeping: bool,
    pub destroyed: bool,
    pub predict: bool,
}

/// What a hook may see and touch while it runs.
pub struct ObjectCtx<'a> {
    pub id: ObjectId,
    pub tick: u64,
    pub delta: f32,
    pub local_peer: PeerId,
    pub authority: PeerId,
    inputs: &'a InputTable,
    flags: &'a mut ObjectFlags,
}

impl<'a> ObjectCtx<'a> {
    pub fn is_authority(&self) -> bool {
        self.local_peer == self.authority
    }

    /// Latest input of `peer`.
    pub fn input_of(&self, peer: PeerId) -> mesh_services::InputState {
        self.inputs.state_of(peer)
    }

    pub fn inputs(&self) -> &InputTable {
        self.inputs
    }

    /// Flag the object as changed so it competes for bandwidth.
    pub fn mark_dirty(&mut self) {
        self.flags.dirty = true;
    }

    pub fn set_sleeping(&mut self, sleeping: bool) {
        self.flags.sleeping = sleeping;
    }

    pub fn is_sleeping(&self) -> bool {
        self.flags.sleeping
    }

    /// Ask for the object to be destroyed at the end of the tick. Ignored
    /// unless the local peer holds authority.
    pub fn request_destroy(&mut self) {
        if self.is_authority() {
            self.flags.destroyed = true;
        } else {
            tracing::warn!(object = %self.id, "non-authority hook requested destroy, ignoring");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hook {
    AuthorityTick,
    PredictTick,
    SharedTick,
    AuthorityFrame,
    PredictFrame,
    SharedFrame,
}

/// Tick/frame values handed to every hook of one pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassClock {
    pub tick: u64,
    pub delta: f32,
    pub local_peer: PeerId,
}

/// A unit of replicated state.
pub struct SimObject {
    id: ObjectId,
    authority: PeerId,
    object_type: ObjectType,
    priority: f32,
    pub(crate) accumulator: f32,
    pub(crate) flags: ObjectFlags,
    pub(crate) last_update_tick: Option<u64>,
    behavior: Box<dyn Behavior>,
}

impl SimObject {
    pub fn new(
        id: ObjectId,
        authority: PeerId,
        object_type: ObjectType,
        priority: f32,
        behavior: Box<dyn Behavior>,
    ) -> Self {
        Self {
            id,
            authority,
            object_type,
            priority: priority.max(0.0),
            accumulator: 0.0,
            flags: ObjectFlags {
                dirty: true,
                ..ObjectFlags::default()
            },
            last_update_tick: None,
            behavior,
        }
    }

    pub fn with_predict(mut self, predict: bool) -> Self {
        self.flags.predict = predict;
        self
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn authority(&self) -> PeerId {
        self.authority
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = priority.max(0.0);
    }

    pub fn priority_accumulator(&self) -> f32 {
        self.accumulator
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.flags.dirty = dirty;
    }

    pub fn is_sleeping(&self) -> bool {
        self.flags.sleeping
    }

    pub fn set_sleeping(&mut self, sleeping: bool) {
        self.flags.sleeping = sleeping;
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.destroyed
    }

    pub fn last_update_tick(&self) -> Option<u64> {
        self.last_update_tick
    }

    pub fn behavior(&self) -> &dyn Behavior {
        self.behavior.as_ref()
    }

    pub fn behavior_mut(&mut self) -> &mut dyn Behavior {
        self.behavior.as_mut()
    }

    /// Downcast the behavior to its concrete type.
    pub fn behavior_as<B: Behavior>(&self) -> Option<&B> {
        self.behavior.as_any().downcast_ref::<B>()
    }

    pub fn behavior_as_mut<B: Behavior>(&mut self) -> Option<&mut B> {
        self.behavior.as_any_mut().downcast_mut::<B>()
    }

    pub(crate) fn run(&mut self, hook: Hook, clock: PassClock, inputs: &InputTable) {
        let mut ctx = ObjectCtx {
            id: self.id,
            tick: clock.tick,
            delta: clock.delta,
            local_peer: clock.local_peer,
            authority: self.authority,
            inputs,
            flags: &mut self.flags,
        };
        let behavior = self.behavior.as_mut();
        match hook {
            Hook::AuthorityTick => behavior.authority_tick(&mut ctx),
            Hook::PredictTick => behavior.predict_tick(&mut ctx),
            Hook::SharedTick => behavior.shared_tick(&mut ctx),
            Hook::AuthorityFrame => behavior.authority_frame(&mut ctx),
            Hook::PredictFrame => behavior.predict_frame(&mut ctx),
            Hook::SharedFrame => behavior.shared_frame(&mut ctx),
        }
    }
}

impl std::fmt::Debug for SimObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimObject")
            .field("id", &self.id)
            .field("authority", &self.authority)
            .field("object_type", &self.object_type)
            .field("priority", &self.priority)
            .field("accumulator", &self.accumulator)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Type registry
// ============================================================================

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConstructError(pub String);

/// Inputs to an object constructor, taken from a spawn command.
#[derive(Debug, Clone, Copy)]
pub struct SpawnArgs<'a> {
    pub id: ObjectId,
    pub authority: PeerId,
    pub transform: &'a Transform,
    pub params: &'a [Value],
}

pub type Constructor =
    Box<dyn Fn(&SpawnArgs<'_>) -> Result<Box<dyn Behavior>, ConstructError> + Send + Sync>;

/// Static description of an object type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub name: String,
    /// Default scheduling weight of new instances.
    pub priority: f32,
    pub predict: bool,
}

impl TypeSpec {
    pub fn new(name: impl Into<String>, priority: f32) -> Self {
        Self {
            name: name.into(),
            priority,
            predict: false,
        }
    }

    pub fn predicted(mut self) -> Self {
        self.predict = true;
        self
    }
}

struct RegisteredType {
    spec: TypeSpec,
    constructor: Constructor,
}

/// Maps [`ObjectType`] to its spec and constructor.
#[derive(Default)]
pub struct ObjectTypeRegistry {
    types: HashMap<ObjectType, RegisteredType>,
    names: HashMap<String, ObjectType>,
}

impl ObjectTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        ty: ObjectType,
        spec: TypeSpec,
        constructor: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&SpawnArgs<'_>) -> Result<Box<dyn Behavior>, ConstructError> + Send + Sync + 'static,
    {
        if self.types.contains_key(&ty) {
            return Err(RegistryError::DuplicateType { ty });
        }
        if self.names.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateTypeName { name: spec.name });
        }
        self.names.insert(spec.name.clone(), ty);
        self.types.insert(
            ty,
            RegisteredType {
                spec,
                constructor: Box::new(constructor),
            },
        );
        Ok(())
    }

    pub fn spec(&self, ty: ObjectType) -> Option<&TypeSpec> {
        self.types.get(&ty).map(|registered| &registered.spec)
    }

    pub fn type_named(&self, name: &str) -> Option<ObjectType> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, ty: ObjectType) -> bool {
        self.types.contains_key(&ty)
    }

    /// Build a fully initialised object record for `ty`.
    pub(crate) fn instantiate(
        &self,
        ty: ObjectType,
        args: &SpawnArgs<'_>,
    ) -> Option<Result<SimObject, ConstructError>> {
        let registered = self.types.get(&ty)?;
        Some((registered.constructor)(args).map(|behavior| {
            SimObject::new(args.id, args.authority, ty, registered.spec.priority, behavior)
                .with_predict(registered.spec.predict)
        }))
    }
}

// ============================================================================
// Object registry
// ============================================================================

/// Live objects in id order, plus the per-peer authority index.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectId, SimObject>,
    authority: AuthorityMap,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&SimObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SimObject> {
        self.objects.get_mut(&id)
    }

    /// Insert `object`; returns it back if the id is already taken.
    pub(crate) fn insert(&mut self, object: SimObject) -> Result<(), SimObject> {
        if self.objects.contains_key(&object.id()) {
            return Err(object);
        }
        self.authority.assign_authority(object.id(), object.authority());
        self.objects.insert(object.id(), object);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<SimObject> {
        self.authority.release(id);
        self.objects.remove(&id)
    }

    pub fn owned_by(&self, peer: PeerId) -> Vec<ObjectId> {
        self.authority.owned_by(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimObject> {
        self.objects.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SimObject> {
        self.objects.values_mut()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn duplicate_type_is_rejected() {
        let mut types = counter_types();
        let err = types
            .register(COUNTER, TypeSpec::new("other", 1.0), |_| {
                Ok(Box::new(Counter::default()))
            })
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateType { ty: COUNTER });

        let err = types
            .register(ObjectType(2), TypeSpec::new("counter", 1.0), |_| {
                Ok(Box::new(Counter::default()))
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTypeName { .. }));
    }

    #[test]
    fn instantiate_applies_type_defaults() {
        let types = counter_types();
        let transform = Transform::default();
        let object = types
            .instantiate(
                COUNTER,
                &SpawnArgs {
                    id: ObjectId(9),
                    authority: PeerId(1),
                    transform: &transform,
                    params: &[],
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(object.priority(), 1.0);
        assert!(object.flags().predict);
        assert!(object.is_dirty());
        assert_eq!(object.priority_accumulator(), 0.0);
        assert!(object.behavior_as::<Counter>().is_some());
        assert!(types.instantiate(ObjectType(99), &SpawnArgs {
            id: ObjectId(10),
            authority: PeerId(1),
            transform: &transform,
            params: &[],
        })
        .is_none());
    }

    #[test]
    fn registry_indexes_authority() {
        let mut registry = ObjectRegistry::new();
        for (id, owner) in [(1, 10), (2, 20), (3, 10)] {
            registry
                .insert(SimObject::new(
                    ObjectId(id),
                    PeerId(owner),
                    COUNTER,
                    1.0,
                    Box::new(Counter::default()),
                ))
                .unwrap();
        }
        assert!(registry
            .insert(SimObject::new(
                ObjectId(2),
                PeerId(10),
                COUNTER,
                1.0,
                Box::new(Counter::default())
            ))
            .is_err());
        assert_eq!(registry.owned_by(PeerId(10)), vec![ObjectId(1), ObjectId(3)]);
        registry.remove(ObjectId(1));
        assert_eq!(registry.owned_by(PeerId(10)), vec![ObjectId(3)]);
    }

    #[test]
    fn non_authority_cannot_request_destroy() {
        let inputs = InputTable::new();
        let mut flags = ObjectFlags::default();
        let mut ctx = ObjectCtx {
            id: ObjectId(1),
            tick: 0,
            delta: 0.016,
            local_peer: PeerId(2),
            authority: PeerId(1),
            inputs: &inputs,
            flags: &mut flags,
        };
        ctx.request_destroy();
        assert!(!flags.destroyed);
    }
}

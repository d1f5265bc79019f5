use super::{RpcContext, RpcError};
use crate::object::Behavior;
use crate::registration_error::RegistryError;
use crate::wire::{Value, ValueKind};
use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Where a call is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMode {
    /// Reliable send to the target's authority only.
    ToAuthorityOnly,
    /// Reliable broadcast, also delivered locally.
    ToAllPeers,
}

/// Who may invoke a method on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallerPolicy {
    #[default]
    Anyone,
    /// Only the target's authority.
    AuthorityOnly,
}

/// Declaration of one callable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSpec {
    name: String,
    mode: RpcMode,
    caller: CallerPolicy,
    params: Vec<ValueKind>,
}

impl RpcSpec {
    pub fn new(name: impl Into<String>, mode: RpcMode) -> Self {
        Self {
            name: name.into(),
            mode,
            caller: CallerPolicy::Anyone,
            params: Vec::new(),
        }
    }

    pub fn caller(mut self, policy: CallerPolicy) -> Self {
        self.caller = policy;
        self
    }

    /// Declare the parameter kinds, in order.
    pub fn params<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = ValueKind>,
    {
        self.params = kinds.into_iter().collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> RpcMode {
        self.mode
    }

    pub fn caller_policy(&self) -> CallerPolicy {
        self.caller
    }

    pub fn param_kinds(&self) -> &[ValueKind] {
        &self.params
    }

    pub(crate) fn check_params(&self, params: &[Value]) -> Result<(), RpcError> {
        let matches = params.len() == self.params.len()
            && params
                .iter()
                .zip(&self.params)
                .all(|(value, &kind)| value.kind() == kind);
        if matches {
            Ok(())
        } else {
            Err(RpcError::BadParams {
                method: self.name.clone(),
                expected: self.params.clone(),
                got: crate::wire::kinds_of(params),
            })
        }
    }
}

pub(crate) type RpcHandler =
    Box<dyn Fn(&mut dyn Any, &[Value], &mut RpcContext) -> Result<(), RpcError> + Send + Sync>;

pub(crate) struct RegisteredMethod {
    pub spec: RpcSpec,
    pub handler: RpcHandler,
}

/// Table from `(target type, method name)` to handler, filled once at
/// startup and locked before the first call.
#[derive(Default)]
pub struct RpcRegistry {
    methods: HashMap<(TypeId, String), RegisteredMethod>,
    owners: HashMap<TypeId, &'static str>,
    locked: bool,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method on objects whose behavior is `B`.
    pub fn register_object_method<B, F>(&mut self, spec: RpcSpec, handler: F) -> Result<(), RegistryError>
    where
        B: Behavior,
        F: Fn(&mut B, &[Value], &mut RpcContext) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.insert::<B, F>(spec, handler)
    }

    /// Register a method on a named node of type `N`.
    pub fn register_node_method<N, F>(&mut self, spec: RpcSpec, handler: F) -> Result<(), RegistryError>
    where
        N: Any + Send,
        F: Fn(&mut N, &[Value], &mut RpcContext) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.insert::<N, F>(spec, handler)
    }

    fn insert<T, F>(&mut self, spec: RpcSpec, handler: F) -> Result<(), RegistryError>
    where
        T: Any,
        F: Fn(&mut T, &[Value], &mut RpcContext) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        if self.locked {
            return Err(RegistryError::Locked);
        }
        let owner = std::any::type_name::<T>();
        let key = (TypeId::of::<T>(), spec.name.clone());
        if self.methods.contains_key(&key) {
            return Err(RegistryError::DuplicateMethod {
                owner: owner.to_string(),
                method: spec.name,
            });
        }

        let method = spec.name.clone();
        let erased: RpcHandler = Box::new(
            move |target: &mut dyn Any, params: &[Value], ctx: &mut RpcContext| {
                let target = target
                    .downcast_mut::<T>()
                    .ok_or_else(|| RpcError::TargetType {
                        method: method.clone(),
                    })?;
                handler(target, params, ctx)
            },
        );
        self.owners.insert(key.0, owner);
        self.methods.insert(
            key,
            RegisteredMethod {
                spec,
                handler: erased,
            },
        );
        Ok(())
    }

    /// Refuse further registrations.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn spec(&self, target: TypeId, method: &str) -> Option<&RpcSpec> {
        self.get(target, method).map(|registered| &registered.spec)
    }

    pub(crate) fn get(&self, target: TypeId, method: &str) -> Option<&RegisteredMethod> {
        self.methods.get(&(target, method.to_string()))
    }

    pub fn owner_name(&self, target: TypeId) -> Option<&'static str> {
        self.owners.get(&target).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

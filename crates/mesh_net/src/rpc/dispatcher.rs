use super::{RpcContext, RpcError, RpcMode, RpcRegistry};
use crate::codec::{decode, encode};
use crate::object::ObjectRegistry;
use crate::registration_error::RegistryError;
use crate::rpc::CallerPolicy;
use crate::transport::{MessageClass, MessageKind, TransportAdapter};
use crate::wire::{RpcEnvelope, RpcTarget, Value};
use mesh_core::PeerId;
use mesh_metrics::{Stat, StatCounters};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// Everything a call or a delivery touches besides the dispatcher itself.
pub struct RpcScope<'a> {
    pub objects: &'a mut ObjectRegistry,
    pub link: &'a mut TransportAdapter,
    pub members: &'a [PeerId],
    pub tick: u64,
}

struct NodeEntry {
    type_id: TypeId,
    node: Box<dyn Any + Send>,
}

pub struct RpcDispatcher {
    registry: RpcRegistry,
    nodes: BTreeMap<String, NodeEntry>,
    default_authority: PeerId,
    /// Encoded calls addressed to the local peer by itself.
    local_queue: VecDeque<Vec<u8>>,
    stats: StatCounters,
}

impl RpcDispatcher {
    /// Takes ownership of `registry` and locks it.
    pub fn new(mut registry: RpcRegistry, default_authority: PeerId) -> Self {
        registry.lock();
        Self {
            registry,
            nodes: BTreeMap::new(),
            default_authority,
            local_queue: VecDeque::new(),
            stats: StatCounters::new(),
        }
    }

    pub fn registry(&self) -> &RpcRegistry {
        &self.registry
    }

    /// Host a non-replicated handler target under `path`.
    pub fn add_node<N: Any + Send>(
        &mut self,
        path: impl Into<String>,
        node: N,
    ) -> Result<(), RegistryError> {
        let path = path.into();
        if self.nodes.contains_key(&path) {
            return Err(RegistryError::DuplicateNode { path });
        }
        self.nodes.insert(
            path,
            NodeEntry {
                type_id: TypeId::of::<N>(),
                node: Box::new(node),
            },
        );
        Ok(())
    }

    pub fn node<N: Any>(&self, path: &str) -> Option<&N> {
        self.nodes.get(path)?.node.downcast_ref::<N>()
    }

    pub fn node_mut<N: Any>(&mut self, path: &str) -> Option<&mut N> {
        self.nodes.get_mut(path)?.node.downcast_mut::<N>()
    }

    /// Authority of node targets.
    pub fn default_authority(&self) -> PeerId {
        self.default_authority
    }

    pub fn set_default_authority(&mut self, peer: PeerId) {
        self.default_authority = peer;
    }

    pub fn pending_local(&self) -> usize {
        self.local_queue.len()
    }

    pub fn stats(&self) -> &StatCounters {
        &self.stats
    }

    fn resolve(
        &self,
        target: &RpcTarget,
        objects: &ObjectRegistry,
    ) -> Result<(TypeId, PeerId), RpcError> {
        match target {
            RpcTarget::Object(id) => {
                let object = objects
                    .get(*id)
                    .ok_or_else(|| RpcError::UnknownTarget(target.clone()))?;
                Ok((Any::type_id(object.behavior().as_any()), object.authority()))
            }
            RpcTarget::Node(path) => {
                let entry = self
                    .nodes
                    .get(path)
                    .ok_or_else(|| RpcError::UnknownTarget(target.clone()))?;
                Ok((entry.type_id, self.default_authority))
            }
        }
    }

    /// Validate a call against the method table and send it.
    pub fn call(
        &mut self,
        target: RpcTarget,
        method: &str,
        params: Vec<Value>,
        mode: RpcMode,
        scope: &mut RpcScope<'_>,
    ) -> Result<(), RpcError> {
        let (type_id, authority) = self.resolve(&target, scope.objects)?;
        let spec = self
            .registry
            .spec(type_id, method)
            .ok_or_else(|| RpcError::UnknownMethod {
                target: target.clone(),
                method: method.to_string(),
            })?;
        if spec.mode() != mode {
            return Err(RpcError::ModeMismatch {
                method: method.to_string(),
                declared: spec.mode(),
                requested: mode,
            });
        }
        spec.check_params(&params)?;

        let local = scope.link.local_peer();
        let envelope = RpcEnvelope {
            target,
            method: method.to_string(),
            params,
        };
        let bytes = encode(&envelope)?;
        match mode {
            RpcMode::ToAuthorityOnly if authority == local => self.local_queue.push_back(bytes),
            RpcMode::ToAuthorityOnly => {
                scope
                    .link
                    .send(MessageKind::Rpc, &bytes, MessageClass::ReliableOrdered, authority)?;
            }
            RpcMode::ToAllPeers => {
                scope.link.broadcast(
                    MessageKind::Rpc,
                    &bytes,
                    MessageClass::ReliableOrdered,
                    scope.members,
                );
                self.local_queue.push_back(bytes);
            }
        }
        trace!(rpc_target = %envelope.target, method, ?mode, "rpc sent");
        Ok(())
    }

    /// Decode and run one inbound call. Bad calls are logged and dropped.
    pub fn receive(&mut self, payload: &[u8], sender: PeerId, scope: &mut RpcScope<'_>) -> bool {
        match self.dispatch(payload, sender, scope) {
            Ok(()) => {
                self.stats.increment(Stat::RpcsDispatched, 1);
                true
            }
            Err(err) => {
                warn!(peer = %sender, error = %err, "dropping rpc");
                self.stats.increment(Stat::RpcsDropped, 1);
                false
            }
        }
    }

    /// Run the calls this peer addressed to itself. Calls queued while
    /// flushing wait for the next flush.
    pub fn flush_local(&mut self, scope: &mut RpcScope<'_>) -> usize {
        let local = scope.link.local_peer();
        let batch: Vec<Vec<u8>> = self.local_queue.drain(..).collect();
        let count = batch.len();
        for bytes in batch {
            self.receive(&bytes, local, scope);
        }
        count
    }

    fn dispatch(
        &mut self,
        payload: &[u8],
        sender: PeerId,
        scope: &mut RpcScope<'_>,
    ) -> Result<(), RpcError> {
        let envelope: RpcEnvelope = decode(payload)?;
        let local = scope.link.local_peer();
        let (type_id, authority) = self.resolve(&envelope.target, scope.objects)?;
        let method = self
            .registry
            .get(type_id, &envelope.method)
            .ok_or_else(|| RpcError::UnknownMethod {
                target: envelope.target.clone(),
                method: envelope.method.clone(),
            })?;

        let spec = &method.spec;
        if spec.mode() == RpcMode::ToAuthorityOnly && authority != local {
            return Err(RpcError::Misrouted {
                method: envelope.method.clone(),
                local,
            });
        }
        if spec.caller_policy() == CallerPolicy::AuthorityOnly && sender != authority {
            return Err(RpcError::CallerNotAuthority {
                method: envelope.method.clone(),
                sender,
            });
        }
        spec.check_params(&envelope.params)?;

        let mut ctx = RpcContext::new(sender, local, scope.tick, envelope.target.clone());
        let target: &mut dyn Any = match &envelope.target {
            RpcTarget::Object(id) => scope
                .objects
                .get_mut(*id)
                .ok_or_else(|| RpcError::UnknownTarget(envelope.target.clone()))?
                .behavior_mut()
                .as_any_mut(),
            RpcTarget::Node(path) => self
                .nodes
                .get_mut(path)
                .ok_or_else(|| RpcError::UnknownTarget(envelope.target.clone()))?
                .node
                .as_mut(),
        };
        (method.handler)(target, &envelope.params, &mut ctx)?;
        debug!(rpc_target = %envelope.target, method = %envelope.method, peer = %sender, "rpc dispatched");

        for call in ctx.take_outbox() {
            let method = call.method.clone();
            if let Err(err) = self.call(call.target, &call.method, call.params, call.mode, scope) {
                warn!(method = %method, error = %err, "follow-up rpc rejected");
            }
        }
        Ok(())
    }
}

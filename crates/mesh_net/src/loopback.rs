//! In-memory transport
//!
//! Routes datagrams between peers living in the same process. Used by the
//! integration tests and the demo runtime in place of a real messenger.

use crate::transport::{MessageClass, Transport, TransportError};
use dashmap::DashMap;
use mesh_core::math::DeterministicRng;
use mesh_core::PeerId;
use mesh_services::LoopbackSettings;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Largest datagram the hub accepts.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

struct HubInner {
    mailboxes: DashMap<PeerId, VecDeque<(Vec<u8>, PeerId)>>,
    drop_rate: f32,
    rng: Mutex<DeterministicRng>,
}

impl HubInner {
    fn should_drop(&self, class: MessageClass) -> bool {
        if class.is_reliable() || self.drop_rate <= 0.0 {
            return false;
        }
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.next_f32() < self.drop_rate
    }
}

/// Shared switchboard. Clone it freely; clones address the same mailboxes.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new(settings: &LoopbackSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                mailboxes: DashMap::new(),
                drop_rate: settings.unreliable_drop_rate,
                rng: Mutex::new(DeterministicRng::new(settings.seed)),
            }),
        }
    }

    /// Open a mailbox for `peer` and return its endpoint.
    pub fn endpoint(&self, peer: PeerId) -> LoopbackTransport {
        self.inner.mailboxes.entry(peer).or_default();
        LoopbackTransport {
            peer,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Close the mailbox of `peer`; later sends to it fail.
    pub fn disconnect(&self, peer: PeerId) {
        self.inner.mailboxes.remove(&peer);
    }

    /// Datagrams waiting for `peer`.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.inner
            .mailboxes
            .get(&peer)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0)
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(&LoopbackSettings::default())
    }
}

/// One peer's handle on a [`LoopbackHub`].
pub struct LoopbackTransport {
    peer: PeerId,
    inner: Arc<HubInner>,
}

impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(
        &mut self,
        bytes: &[u8],
        class: MessageClass,
        peer: PeerId,
    ) -> Result<(), TransportError> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(TransportError::TooLarge {
                size: bytes.len(),
                limit: MAX_DATAGRAM_BYTES,
            });
        }
        if !self.inner.mailboxes.contains_key(&self.peer) {
            return Err(TransportError::Closed);
        }
        let mut mailbox = self
            .inner
            .mailboxes
            .get_mut(&peer)
            .ok_or(TransportError::Unreachable(peer))?;
        if self.inner.should_drop(class) {
            tracing::trace!(from = %self.peer, to = %peer, "link conditioner dropped datagram");
            return Ok(());
        }
        mailbox.push_back((bytes.to_vec(), self.peer));
        Ok(())
    }

    fn drain_inbound(&mut self, max_count: usize) -> Vec<(Vec<u8>, PeerId)> {
        match self.inner.mailboxes.get_mut(&self.peer) {
            Some(mut mailbox) => {
                let n = max_count.min(mailbox.len());
                mailbox.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

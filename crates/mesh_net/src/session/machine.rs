use super::{
    PeerRecord, PeerState, PlayerOptions, SessionContext, SessionError, SessionEvent,
    SessionMessage,
};
use crate::transport::{MessageClass, MessageKind, TransportAdapter};
use mesh_core::PeerId;
use mesh_metrics::{Stat, StatCounters};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// Session bootstrap and lifecycle for one local peer.
///
/// All outgoing traffic is reliable-ordered and goes through the link passed
/// to each operation. Events are queued for [`drain_events`].
///
/// [`drain_events`]: SessionStateMachine::drain_events
pub struct SessionStateMachine {
    local_peer: PeerId,
    authority: PeerId,
    progression: Vec<u8>,
    config: Vec<u8>,
    max_players: u32,
    records: BTreeMap<PeerId, PeerRecord>,
    /// Peers still short of done-loading, counted from the start command.
    loading_countdown: Option<usize>,
    /// Start command heard before the local peer had all its info.
    start_deferred: bool,
    simulation_started: bool,
    events: VecDeque<SessionEvent>,
    stats: StatCounters,
}

impl SessionStateMachine {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            local_peer: ctx.local_peer,
            authority: ctx.authority,
            progression: ctx.progression,
            config: ctx.config,
            max_players: ctx.max_players,
            records: BTreeMap::new(),
            loading_countdown: None,
            start_deferred: false,
            simulation_started: false,
            events: VecDeque::new(),
            stats: StatCounters::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn authority(&self) -> PeerId {
        self.authority
    }

    pub fn is_authority(&self) -> bool {
        self.authority == self.local_peer
    }

    pub fn record(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.records.get(&peer)
    }

    /// Every peer ever seen, removed ones included.
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    fn is_active(&self, peer: PeerId) -> bool {
        self.records.get(&peer).is_some_and(|record| !record.removed)
    }

    /// Current members in id order, local peer included.
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.records
            .values()
            .filter(|record| !record.removed)
            .map(|record| record.peer)
            .collect()
    }

    fn remote_peers(&self) -> Vec<PeerId> {
        self.active_peers()
            .into_iter()
            .filter(|&peer| peer != self.local_peer)
            .collect()
    }

    pub fn state_of(&self, peer: PeerId) -> Option<PeerState> {
        self.records.get(&peer).map(|record| record.state)
    }

    pub fn local_state(&self) -> PeerState {
        self.state_of(self.local_peer)
            .unwrap_or(PeerState::WaitingForInfo)
    }

    pub fn options_of(&self, peer: PeerId) -> Option<PlayerOptions> {
        self.records.get(&peer).and_then(|record| record.options.clone())
    }

    pub fn simulation_started(&self) -> bool {
        self.simulation_started
    }

    pub fn loading_countdown(&self) -> Option<usize> {
        self.loading_countdown
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn stats(&self) -> &StatCounters {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    fn send(&self, link: &mut TransportAdapter, peer: PeerId, message: &SessionMessage) {
        match message.encode() {
            Ok(bytes) => {
                // Failures are logged and counted by the adapter.
                let _ = link.send(
                    MessageKind::Session,
                    &bytes,
                    MessageClass::ReliableOrdered,
                    peer,
                );
            }
            Err(err) => warn!(peer = %peer, code = ?message.code(), error = %err, "failed to encode session message"),
        }
    }

    fn broadcast(&self, link: &mut TransportAdapter, message: &SessionMessage) {
        match message.encode() {
            Ok(bytes) => {
                link.broadcast(
                    MessageKind::Session,
                    &bytes,
                    MessageClass::ReliableOrdered,
                    &self.remote_peers(),
                );
            }
            Err(err) => warn!(code = ?message.code(), error = %err, "failed to encode session message"),
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Lobby join event. Re-adding a removed peer starts it over with a
    /// fresh record.
    pub fn add_peer(&mut self, peer: PeerId, link: &mut TransportAdapter) {
        match self.records.get(&peer) {
            Some(record) if !record.removed => {
                debug!(peer = %peer, "peer is already in the session");
                return;
            }
            Some(_) => {
                info!(peer = %peer, "removed peer rejoined, prior state is not restored");
                self.events.push_back(SessionEvent::PlayerRejoined(peer));
            }
            None => {}
        }
        self.records.insert(peer, PeerRecord::new(peer));
        self.events.push_back(SessionEvent::NewPlayer(peer));
        let is_local = peer == self.local_peer;
        info!(peer = %peer, local = is_local, "peer joined session");

        if is_local {
            self.add_local(link);
        } else {
            self.add_remote(peer, link);
        }
    }

    fn add_local(&mut self, link: &mut TransportAdapter) {
        let local = self.local_peer;
        if let Some(record) = self.records.get_mut(&local) {
            record.progression = Some(self.progression.clone());
            record.config = Some(self.config.clone());
        }
        if self.is_authority() {
            let options = self.assign_options(local);
            self.store_options(local, options);
        } else if self.is_active(self.authority) {
            self.send(link, self.authority, &SessionMessage::RequestPlayerOptions { subject: local });
        }
        self.refresh_local(link);
    }

    fn add_remote(&mut self, peer: PeerId, link: &mut TransportAdapter) {
        let local = self.local_peer;
        if self.is_authority() {
            let options = self.assign_options(peer);
            self.store_options(peer, options.clone());
            self.broadcast(link, &SessionMessage::CommandSetOptions { subject: peer, options });
        }

        self.send(link, peer, &SessionMessage::RequestConfig);
        self.send(link, peer, &SessionMessage::RequestProgression);
        if !self.is_authority() {
            self.send(link, peer, &SessionMessage::RequestPlayerOptions { subject: peer });
        }
        if peer == self.authority && self.is_active(local) && self.options_of(local).is_none() {
            self.send(link, peer, &SessionMessage::RequestPlayerOptions { subject: local });
        }
        if let Some(state) = self.state_of(local) {
            self.send(link, peer, &SessionMessage::NotifyState(state));
        }
    }

    /// Lobby leave event. The record is kept, flagged as removed.
    pub fn remove_peer(&mut self, peer: PeerId, link: &mut TransportAdapter) {
        let Some(record) = self.records.get_mut(&peer) else {
            return;
        };
        if record.removed {
            return;
        }
        record.removed = true;
        info!(peer = %peer, "peer left session");
        self.events.push_back(SessionEvent::PlayerRemoved(peer));

        if peer == self.authority {
            self.promote_authority(link);
        }
        if self.loading_countdown.is_some() && !self.simulation_started {
            let pending = self.pending_loaders();
            self.loading_countdown = Some(pending);
            if pending == 0 {
                self.enter_game(link);
            }
        }
    }

    fn promote_authority(&mut self, link: &mut TransportAdapter) {
        let previous = self.authority;
        let Some(next) = self.active_peers().first().copied() else {
            return;
        };
        self.authority = next;
        warn!(previous = %previous, current = %next, "session authority left, promoted lowest peer");
        self.events.push_back(SessionEvent::AuthorityChanged {
            previous,
            current: next,
        });

        if self.is_authority() {
            let unassigned: Vec<PeerId> = self
                .records
                .values()
                .filter(|record| !record.removed && record.options.is_none())
                .map(|record| record.peer)
                .collect();
            for peer in unassigned {
                let options = self.assign_options(peer);
                self.store_options(peer, options.clone());
                self.broadcast(link, &SessionMessage::CommandSetOptions { subject: peer, options });
            }
            self.refresh_local(link);
        }
    }

    /// Lowest free slot, or spectator once every slot is taken.
    fn assign_options(&self, peer: PeerId) -> PlayerOptions {
        let taken: BTreeSet<u32> = self
            .records
            .values()
            .filter(|record| !record.removed && record.peer != peer)
            .filter_map(|record| record.options.as_ref().and_then(|options| options.slot))
            .collect();
        let slot = (0..self.max_players).find(|slot| !taken.contains(slot));
        if slot.is_none() {
            info!(peer = %peer, "session is full, joining as spectator");
        }
        PlayerOptions { slot, team: 0 }
    }

    fn store_options(&mut self, peer: PeerId, options: PlayerOptions) -> bool {
        let Some(record) = self.records.get_mut(&peer).filter(|record| !record.removed) else {
            return false;
        };
        if record.options.as_ref() == Some(&options) {
            return false;
        }
        record.options = Some(options.clone());
        debug!(peer = %peer, slot = ?options.slot, "player options changed");
        self.events
            .push_back(SessionEvent::OptionsChanged { peer, options });
        true
    }

    // ------------------------------------------------------------------
    // Local transitions
    // ------------------------------------------------------------------

    fn refresh_local(&mut self, link: &mut TransportAdapter) {
        let ready = self
            .records
            .get(&self.local_peer)
            .is_some_and(|record| record.state == PeerState::WaitingForInfo && record.has_info());
        if ready && self.advance_local(PeerState::PreGameOk, link) && self.start_deferred {
            self.start_deferred = false;
            self.begin_pregame_load(link);
        }
    }

    fn advance_local(&mut self, state: PeerState, link: &mut TransportAdapter) -> bool {
        let local = self.local_peer;
        let Some(record) = self.records.get_mut(&local) else {
            return false;
        };
        if record.state.next() != Some(state) {
            debug!(peer = %local, from = ?record.state, to = ?state, "local state change out of order, ignored");
            return false;
        }
        record.state = state;
        info!(peer = %local, ?state, "local state changed");
        self.events
            .push_back(SessionEvent::StateChanged { peer: local, state });
        self.broadcast(link, &SessionMessage::NotifyState(state));
        if state == PeerState::PreGameDoneLoading {
            self.note_done_loading(link);
        }
        true
    }

    fn pending_loaders(&self) -> usize {
        self.records
            .values()
            .filter(|record| !record.removed && record.state < PeerState::PreGameDoneLoading)
            .count()
    }

    fn note_done_loading(&mut self, link: &mut TransportAdapter) {
        if let Some(remaining) = self.loading_countdown.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.enter_game(link);
            }
        }
    }

    fn enter_game(&mut self, link: &mut TransportAdapter) {
        if self.simulation_started {
            return;
        }
        self.simulation_started = true;
        self.advance_local(PeerState::InGameOk, link);
        info!(peer = %self.local_peer, "every peer loaded, simulation started");
        self.events.push_back(SessionEvent::SimulationStarted);
    }

    fn begin_pregame_load(&mut self, link: &mut TransportAdapter) {
        if self.loading_countdown.is_some() || self.simulation_started {
            debug!("game already starting, ignoring repeated start");
            return;
        }
        if self.local_state() < PeerState::PreGameOk {
            info!(peer = %self.local_peer, "start heard before local info is complete, deferring load");
            self.start_deferred = true;
            return;
        }
        let pending = self.pending_loaders();
        self.loading_countdown = Some(pending);
        info!(pending, "game starting");
        self.advance_local(PeerState::PreGameLoading, link);
        self.advance_local(PeerState::PreGameDoneLoading, link);
        if self.loading_countdown == Some(0) {
            self.enter_game(link);
        }
    }

    /// Authority only: tell everyone to load and start.
    pub fn start_game(&mut self, link: &mut TransportAdapter) -> Result<(), SessionError> {
        if !self.is_authority() {
            return Err(SessionError::NotAuthority {
                sender: self.local_peer,
            });
        }
        let waiting: Vec<PeerId> = self
            .records
            .values()
            .filter(|record| !record.removed && record.state < PeerState::PreGameOk)
            .map(|record| record.peer)
            .collect();
        if !waiting.is_empty() {
            warn!(?waiting, "starting while peers are still waiting for info");
        }
        self.broadcast(link, &SessionMessage::CommandStartGame);
        self.begin_pregame_load(link);
        Ok(())
    }

    /// Authority only: change and publish the options of `subject`.
    pub fn set_player_options(
        &mut self,
        subject: PeerId,
        options: PlayerOptions,
        link: &mut TransportAdapter,
    ) -> Result<(), SessionError> {
        if !self.is_authority() {
            return Err(SessionError::NotAuthority {
                sender: self.local_peer,
            });
        }
        if !self.is_active(subject) {
            return Err(SessionError::UnknownPeer(subject));
        }
        if self.store_options(subject, options.clone()) {
            self.broadcast(link, &SessionMessage::CommandSetOptions { subject, options });
        }
        if subject == self.local_peer {
            self.refresh_local(link);
        }
        Ok(())
    }

    pub fn begin_ingame_load(&mut self, link: &mut TransportAdapter) -> Result<(), SessionError> {
        self.require_local(PeerState::InGameOk, PeerState::InGameLoading)?;
        self.advance_local(PeerState::InGameLoading, link);
        Ok(())
    }

    pub fn finish_ingame_load(&mut self, link: &mut TransportAdapter) -> Result<(), SessionError> {
        self.require_local(PeerState::InGameLoading, PeerState::InGameDoneLoading)?;
        self.advance_local(PeerState::InGameDoneLoading, link);
        Ok(())
    }

    fn require_local(&self, expected: PeerState, to: PeerState) -> Result<(), SessionError> {
        let from = self.local_state();
        if from == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition { from, to })
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    /// Handle one session payload. Errors are logged, counted and returned;
    /// the message is dropped either way.
    pub fn handle_message(
        &mut self,
        bytes: &[u8],
        from: PeerId,
        link: &mut TransportAdapter,
    ) -> Result<(), SessionError> {
        let result = SessionMessage::decode(bytes).and_then(|message| self.apply(message, from, link));
        if let Err(err) = &result {
            warn!(peer = %from, error = %err, "dropping session message");
            self.stats.increment(Stat::SessionDropped, 1);
        }
        result
    }

    fn known_record_mut(&mut self, peer: PeerId) -> Result<&mut PeerRecord, SessionError> {
        self.records
            .get_mut(&peer)
            .filter(|record| !record.removed)
            .ok_or(SessionError::UnknownPeer(peer))
    }

    fn apply(
        &mut self,
        message: SessionMessage,
        from: PeerId,
        link: &mut TransportAdapter,
    ) -> Result<(), SessionError> {
        match message {
            // Requests are answered from local copies, even before the
            // lobby has announced the requester.
            SessionMessage::RequestConfig => {
                let reply = SessionMessage::ResponseConfig(self.config.clone());
                self.send(link, from, &reply);
                // The requester has added us by now; our earlier state notice
                // may have reached it before that and been dropped.
                if let Some(state) = self.state_of(self.local_peer) {
                    self.send(link, from, &SessionMessage::NotifyState(state));
                }
            }
            SessionMessage::RequestProgression => {
                let reply = SessionMessage::ResponseProgression(self.progression.clone());
                self.send(link, from, &reply);
            }
            SessionMessage::RequestPlayerOptions { subject } => {
                let reply = SessionMessage::ResponsePlayerOptions {
                    subject,
                    options: self.options_of(subject),
                };
                self.send(link, from, &reply);
            }
            SessionMessage::ResponseConfig(blob) => {
                self.known_record_mut(from)?.config = Some(blob);
            }
            SessionMessage::ResponseProgression(blob) => {
                self.known_record_mut(from)?.progression = Some(blob);
            }
            SessionMessage::ResponsePlayerOptions { subject, options } => {
                self.on_options_response(subject, options, from, link)?;
            }
            SessionMessage::CommandStartGame => {
                if from != self.authority {
                    return Err(SessionError::NotAuthority { sender: from });
                }
                self.begin_pregame_load(link);
            }
            SessionMessage::CommandSetOptions { subject, options } => {
                if from != self.authority {
                    return Err(SessionError::NotAuthority { sender: from });
                }
                if !self.is_active(subject) {
                    return Err(SessionError::UnknownPeer(subject));
                }
                self.store_options(subject, options);
                if subject == self.local_peer {
                    self.refresh_local(link);
                }
            }
            SessionMessage::NotifyState(state) => self.on_remote_state(from, state, link)?,
        }
        Ok(())
    }

    fn on_options_response(
        &mut self,
        subject: PeerId,
        options: Option<PlayerOptions>,
        from: PeerId,
        link: &mut TransportAdapter,
    ) -> Result<(), SessionError> {
        match options {
            Some(options) => {
                if from != self.authority && from != subject {
                    return Err(SessionError::NotAuthority { sender: from });
                }
                if !self.is_active(subject) {
                    return Err(SessionError::UnknownPeer(subject));
                }
                self.store_options(subject, options);
                if subject == self.local_peer {
                    self.refresh_local(link);
                }
            }
            None if from != self.authority && !self.is_authority() && self.is_active(self.authority) => {
                debug!(subject = %subject, responder = %from, "options unknown at responder, asking authority");
                self.send(link, self.authority, &SessionMessage::RequestPlayerOptions { subject });
            }
            None => debug!(subject = %subject, responder = %from, "options not assigned yet"),
        }
        Ok(())
    }

    fn on_remote_state(
        &mut self,
        from: PeerId,
        state: PeerState,
        link: &mut TransportAdapter,
    ) -> Result<(), SessionError> {
        let record = self.known_record_mut(from)?;
        if state <= record.state {
            debug!(peer = %from, ?state, current = ?record.state, "ignoring backward state");
            return Ok(());
        }
        let previous = record.state;
        record.state = state;
        debug!(peer = %from, ?state, "peer state changed");
        self.events
            .push_back(SessionEvent::StateChanged { peer: from, state });
        if previous < PeerState::PreGameDoneLoading && state >= PeerState::PreGameDoneLoading {
            self.note_done_loading(link);
        }
        Ok(())
    }
}

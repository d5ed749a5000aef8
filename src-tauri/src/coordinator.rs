//! Координатор звонка: единственный владелец состояния.
//!
//! Every mutation happens under `machine`, and the lock is never held across
//! an `.await`. Async steps (device capture, link setup, SDP) run unlocked and
//! re-check the attempt epoch when they resume; a resumption that finds the
//! call gone releases whatever it acquired and reports `Cancelled`.
//!
//! Lock order is `machine` then `transport`.

use crate::config::CallConfig;
use crate::error::{CallError, ErrorCategory};
use crate::peer::ice::analyze_candidates;
use crate::peer::{
    IceCandidate, LinkState, LocalMedia, MediaConstraints, MediaDevices, PeerEvent, PeerEventSink,
    PeerFactory, PeerLink, RemoteTrack, RtcPeerFactory, SampleDevices, SessionDescription,
    TrackKind,
};
use crate::session::{
    Acquiring, CallSession, CallSnapshot, CallState, CallStatus, MediaResources, ParticipantId,
    RoomId,
};
use crate::signaling::{InboundSignal, OutboundSignal};
use crate::transport::{SignalingTransport, TransportEvent};
use crate::ui::{CallNotice, CallPhase, Notifier};
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Events produced outside the caller's control flow, tagged with the
/// attempt that scheduled them.
#[derive(Debug)]
enum SessionEvent {
    Peer { epoch: u64, event: PeerEvent },
    RingTimeout { epoch: u64 },
    GraceExpired { epoch: u64, timer: u64 },
}

/// Ожидание восстановления соединения; одно на звонок
struct GraceTimer {
    id: u64,
    task: JoinHandle<()>,
}

struct Machine {
    /// Bumped whenever an attempt starts or ends.
    epoch: u64,
    state: CallState,
    grace: Option<GraceTimer>,
    next_timer: u64,
}

impl Machine {
    fn begin(&mut self, state: CallState) -> u64 {
        self.epoch += 1;
        self.state = state;
        self.epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn clear(&mut self) -> CallState {
        self.epoch += 1;
        self.cancel_grace();
        std::mem::replace(&mut self.state, CallState::Idle)
    }

    fn cancel_grace(&mut self) -> bool {
        match self.grace.take() {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }
}

/// What the other side hears while we tear down.
#[derive(Debug, Clone, Copy)]
enum Farewell {
    Silent,
    End,
    Decline,
}

impl Farewell {
    fn signal(self, session: &CallSession) -> Option<OutboundSignal> {
        let room_id = session.room_id.clone();
        let recipient_id = session.remote_id.clone();
        match self {
            Farewell::Silent => None,
            Farewell::End => Some(OutboundSignal::CallEnd {
                room_id,
                recipient_id,
            }),
            Farewell::Decline => Some(OutboundSignal::CallDeclined {
                room_id,
                recipient_id,
            }),
        }
    }
}

struct Inner {
    config: CallConfig,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    notifier: Arc<dyn Notifier>,
    transport: Mutex<Option<Arc<dyn SignalingTransport>>>,
    machine: Mutex<Machine>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<SessionEvent>>,
    /// Generation of the newest `run`; older loops step aside for it.
    loop_gen: watch::Sender<u64>,
}

/// Drives one call at a time between signaling, the peer link and the UI.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

impl CallCoordinator {
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                devices,
                peers,
                notifier,
                transport: Mutex::new(None),
                machine: Mutex::new(Machine {
                    epoch: 0,
                    state: CallState::Idle,
                    grace: None,
                    next_timer: 0,
                }),
                events_tx,
                events_rx: AsyncMutex::new(events_rx),
                loop_gen: watch::Sender::new(0),
            }),
        }
    }

    /// Coordinator over webrtc-rs with sample-fed capture devices.
    pub fn with_webrtc(
        config: CallConfig,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, Arc<RtcPeerFactory>) {
        let peers = Arc::new(RtcPeerFactory::new(config.ice_servers.clone()));
        let coordinator = Self::new(
            config,
            Arc::new(SampleDevices::default()),
            peers.clone(),
            notifier,
        );
        (coordinator, peers)
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn set_transport(&self, transport: Arc<dyn SignalingTransport>) {
        *self.transport() = Some(transport);
    }

    pub fn transport_open(&self) -> bool {
        self.transport().as_ref().is_some_and(|t| t.is_open())
    }

    pub fn status(&self) -> CallStatus {
        self.machine().state.status()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot::of(&self.machine().state)
    }

    /// Local capture of the current call, for preview.
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.machine().state.media().map(|m| m.local.clone())
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.machine()
            .state
            .media()
            .map(|m| m.remote.clone())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Outgoing
    // ---------------------------------------------------------------------

    /// Captures media, builds the link and sends `call_offer` to `remote_id`.
    pub async fn start_call(
        &self,
        remote_id: ParticipantId,
        is_video: bool,
    ) -> Result<RoomId, CallError> {
        let begun = {
            let mut m = self.machine();
            if !matches!(m.state, CallState::Idle) {
                Err(CallError::AlreadyInCall)
            } else if !self.transport_open() {
                Err(CallError::NoConnection)
            } else {
                Ok(m.begin(CallState::AcquiringMedia(Acquiring::Outgoing {
                    remote_id: remote_id.clone(),
                    is_video,
                })))
            }
        };
        let epoch = match begun {
            Ok(epoch) => epoch,
            Err(err) => {
                warn!("Cannot call {remote_id}: {err}");
                return Err(self.surface(err));
            }
        };
        info!("Starting {} call to {remote_id}", call_kind(is_video));

        let media = match self.inner.devices.open(MediaConstraints::for_call(is_video)).await {
            Ok(media) => media,
            Err(err) => {
                warn!("Media access failed: {err}");
                return Err(self.fail(epoch, err.into(), Farewell::Silent).await);
            }
        };

        let link = match self.inner.peers.connect(&media, self.peer_sink(epoch)).await {
            Ok(link) => link,
            Err(err) => {
                media.stop();
                return Err(self.fail(epoch, err, Farewell::Silent).await);
            }
        };

        let installed = {
            let mut m = self.machine();
            let current = m.is_current(epoch)
                && matches!(m.state, CallState::AcquiringMedia(Acquiring::Outgoing { .. }));
            if current {
                let session = CallSession::outgoing(remote_id, is_video);
                let room_id = session.room_id.clone();
                m.state = CallState::AwaitingAnswer {
                    session,
                    media: MediaResources::new(media, link.clone()),
                };
                Ok(room_id)
            } else {
                Err(media)
            }
        };
        let room_id = match installed {
            Ok(room_id) => room_id,
            Err(media) => {
                info!("Call attempt ended while acquiring media; releasing it");
                media.stop();
                link.close().await;
                return Err(CallError::Cancelled);
            }
        };

        self.notify(CallNotice::state(CallPhase::Outgoing));
        self.arm_ring_timer(epoch);

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail(epoch, err, Farewell::End).await),
        };

        let sent = {
            let mut m = self.machine();
            let current = m.is_current(epoch);
            match &mut m.state {
                CallState::AwaitingAnswer { session, .. } if current => {
                    let signal = OutboundSignal::CallOffer {
                        offer,
                        room_id: session.room_id.clone(),
                        recipient_id: session.remote_id.clone(),
                        is_video,
                    };
                    self.send(signal).map(|_| {
                        session.description_sent = true;
                        self.flush_candidates(session);
                    })
                }
                _ => Err(CallError::Cancelled),
            }
        };

        match sent {
            Ok(()) => {
                info!("Offer sent for room {room_id}");
                Ok(room_id)
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(err) => Err(self.fail(epoch, err, Farewell::End).await),
        }
    }

    // ---------------------------------------------------------------------
    // Incoming
    // ---------------------------------------------------------------------

    /// Decodes a relay frame and dispatches it. Non-call traffic is ignored.
    pub async fn handle_text(&self, text: &str) {
        match InboundSignal::decode(text) {
            Ok(Some(signal)) => self.handle_incoming(signal).await,
            Ok(None) => trace!("Skipping non-call message"),
            Err(e) => warn!("Dropping malformed signaling message: {e}"),
        }
    }

    pub async fn handle_incoming(&self, signal: InboundSignal) {
        debug!(
            "Received {} from {} for room {}",
            signal.kind(),
            signal.sender_id(),
            signal.room_id()
        );
        match signal {
            InboundSignal::CallOffer {
                offer,
                room_id,
                sender_id,
                sender_name,
                is_video,
            } => self.on_offer(offer, room_id, sender_id, sender_name, is_video),
            InboundSignal::CallAnswer {
                answer, room_id, ..
            } => self.on_answer(room_id, answer).await,
            InboundSignal::IceCandidate {
                candidate, room_id, ..
            } => self.on_remote_candidate(room_id, candidate).await,
            InboundSignal::CallEnd { room_id, .. } => {
                let ended = self
                    .teardown_if(|m| m.state.is_room(&room_id), Farewell::Silent, None)
                    .await;
                if ended {
                    info!("Remote party ended call {room_id}");
                }
            }
            InboundSignal::CallDeclined { room_id, .. } => {
                let declined = self
                    .teardown_if(
                        |m| {
                            matches!(m.state, CallState::AwaitingAnswer { .. })
                                && m.state.is_room(&room_id)
                        },
                        Farewell::Silent,
                        Some(CallNotice::Declined),
                    )
                    .await;
                if declined {
                    info!("Call {room_id} was declined");
                }
            }
        }
    }

    fn on_offer(
        &self,
        offer: SessionDescription,
        room_id: RoomId,
        sender_id: ParticipantId,
        sender_name: Option<String>,
        is_video: bool,
    ) {
        let ringing = {
            let mut m = self.machine();
            if matches!(m.state, CallState::Idle) {
                let session = CallSession::incoming(
                    sender_id.clone(),
                    sender_name.clone(),
                    room_id.clone(),
                    is_video,
                );
                Some(m.begin(CallState::RingingIncoming { session, offer }))
            } else {
                // Занят: сразу отклоняем, текущий звонок не трогаем
                info!("Busy, declining call {room_id} from {sender_id}");
                self.send_best_effort(OutboundSignal::CallDeclined {
                    room_id: room_id.clone(),
                    recipient_id: sender_id.clone(),
                });
                None
            }
        };

        if let Some(epoch) = ringing {
            info!("Incoming {} call from {sender_id}", call_kind(is_video));
            self.notify(CallNotice::IncomingCall {
                caller_id: sender_id,
                caller_name: sender_name,
                is_video,
                room_id,
            });
            self.arm_ring_timer(epoch);
        }
    }

    /// Accepts the ringing call: capture, link, remote offer, then `call_answer`.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let accepted = {
            let mut m = self.machine();
            let epoch = m.epoch;
            match std::mem::replace(&mut m.state, CallState::Idle) {
                CallState::RingingIncoming { session, offer } => {
                    let is_video = session.is_video;
                    m.state = CallState::AcquiringMedia(Acquiring::Incoming {
                        session,
                        media: None,
                    });
                    Some((epoch, offer, is_video))
                }
                other => {
                    m.state = other;
                    None
                }
            }
        };
        let Some((epoch, offer, is_video)) = accepted else {
            return Err(CallError::InvalidState("accept a call"));
        };
        info!("Accepting {} call", call_kind(is_video));

        let media = match self.inner.devices.open(MediaConstraints::for_call(is_video)).await {
            Ok(media) => media,
            Err(err) => {
                warn!("Media access failed while accepting: {err}");
                return Err(self.fail(epoch, err.into(), Farewell::Decline).await);
            }
        };

        let link = match self.inner.peers.connect(&media, self.peer_sink(epoch)).await {
            Ok(link) => link,
            Err(err) => {
                media.stop();
                return Err(self.fail(epoch, err, Farewell::End).await);
            }
        };

        let leftover = {
            let mut m = self.machine();
            let current = m.is_current(epoch);
            match &mut m.state {
                CallState::AcquiringMedia(Acquiring::Incoming { media: slot, .. }) if current => {
                    *slot = Some(MediaResources::new(media, link.clone()));
                    None
                }
                _ => Some(media),
            }
        };
        if let Some(media) = leftover {
            info!("Call ended while accepting; releasing media");
            media.stop();
            link.close().await;
            return Err(CallError::Cancelled);
        }

        if let Err(err) = link.set_remote_description(offer).await {
            error!("Failed to apply remote offer: {err}");
            return Err(self.fail(epoch, err, Farewell::End).await);
        }

        let pending = {
            let mut m = self.machine();
            let current = m.is_current(epoch);
            match m.state.parts_mut() {
                (Some(session), Some(media)) if current => {
                    media.remote_applied = true;
                    Some(std::mem::take(&mut session.pending_candidates))
                }
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return Err(CallError::Cancelled);
        };
        self.apply_candidates(&link, pending).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(epoch, err, Farewell::End).await),
        };

        let sent = {
            let mut m = self.machine();
            if !m.is_current(epoch) {
                Err(CallError::Cancelled)
            } else {
                match std::mem::replace(&mut m.state, CallState::Idle) {
                    CallState::AcquiringMedia(Acquiring::Incoming {
                        mut session,
                        media: Some(media),
                    }) => {
                        let signal = OutboundSignal::CallAnswer {
                            answer,
                            room_id: session.room_id.clone(),
                            recipient_id: session.remote_id.clone(),
                        };
                        match self.send(signal) {
                            Ok(_) => {
                                session.description_sent = true;
                                session.connected_at = Some(Utc::now());
                                self.flush_candidates(&mut session);
                                m.state = CallState::Active { session, media };
                                Ok(())
                            }
                            Err(err) => {
                                m.state = CallState::AcquiringMedia(Acquiring::Incoming {
                                    session,
                                    media: Some(media),
                                });
                                Err(err)
                            }
                        }
                    }
                    other => {
                        m.state = other;
                        Err(CallError::Cancelled)
                    }
                }
            }
        };

        match sent {
            Ok(()) => {
                info!("Answer sent, call is active");
                self.notify(CallNotice::state(CallPhase::Active));
                Ok(())
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(err) => Err(self.fail(epoch, err, Farewell::End).await),
        }
    }

    /// Declines the ringing call with `call_declined`.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let declined = self
            .teardown_if(
                |m| matches!(m.state, CallState::RingingIncoming { .. }),
                Farewell::Decline,
                None,
            )
            .await;
        if declined {
            info!("Declined incoming call");
            Ok(())
        } else {
            Err(CallError::InvalidState("decline a call"))
        }
    }

    async fn on_answer(&self, room_id: RoomId, answer: SessionDescription) {
        let target = {
            let m = self.machine();
            match &m.state {
                CallState::AwaitingAnswer { session, media } if session.room_id == room_id => {
                    Some((m.epoch, media.link.clone()))
                }
                _ => None,
            }
        };
        let Some((epoch, link)) = target else {
            debug!("Ignoring call_answer for room {room_id}");
            return;
        };

        if let Err(err) = link.set_remote_description(answer).await {
            error!("Failed to apply answer: {err}");
            self.fail(epoch, err, Farewell::End).await;
            return;
        }

        let pending = {
            let mut m = self.machine();
            if !m.is_current(epoch) {
                None
            } else {
                match std::mem::replace(&mut m.state, CallState::Idle) {
                    CallState::AwaitingAnswer {
                        mut session,
                        mut media,
                    } => {
                        media.remote_applied = true;
                        session.connected_at = Some(Utc::now());
                        let pending = std::mem::take(&mut session.pending_candidates);
                        m.state = CallState::Active { session, media };
                        Some(pending)
                    }
                    other => {
                        m.state = other;
                        None
                    }
                }
            }
        };

        if let Some(pending) = pending {
            info!("Answer applied, call {room_id} is active");
            self.notify(CallNotice::state(CallPhase::Active));
            self.apply_candidates(&link, pending).await;
        }
    }

    async fn on_remote_candidate(&self, room_id: RoomId, candidate: IceCandidate) {
        let ready = {
            let mut m = self.machine();
            if !m.state.is_room(&room_id) {
                debug!("Ignoring ice_candidate for room {room_id}");
                return;
            }
            match m.state.parts_mut() {
                (Some(_), Some(media)) if media.remote_applied => {
                    Some((media.link.clone(), candidate))
                }
                (Some(session), _) => {
                    trace!("Buffering remote candidate until the remote description is set");
                    session.pending_candidates.push(candidate);
                    None
                }
                _ => None,
            }
        };

        if let Some((link, candidate)) = ready {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!("Failed to add remote ICE candidate: {e}");
            }
        }
    }

    // ---------------------------------------------------------------------
    // In-call controls
    // ---------------------------------------------------------------------

    /// Hangs up whatever is in progress, telling the other side if there is one.
    pub async fn end_call(&self) {
        if self.teardown_if(|_| true, Farewell::End, None).await {
            info!("Call ended locally");
        }
    }

    /// Releases everything without signaling. Safe to call repeatedly.
    pub async fn teardown(&self) {
        self.teardown_if(|_| true, Farewell::Silent, None).await;
    }

    /// Flips the microphone; returns the new enabled flag.
    pub fn toggle_mute(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Flips the camera; `None` for audio-only calls.
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let m = self.machine();
        let track = m.state.media()?.local.track(kind)?;
        let enabled = track.toggle();
        info!(
            "Local {} {}",
            kind.label(),
            if enabled { "enabled" } else { "disabled" }
        );
        Some(enabled)
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Pumps transport events and link/timer events until the transport
    /// stream ends. A transport drop leaves the call alone.
    ///
    /// Calling `run` again with a new stream (after a reconnect) takes over
    /// from the loop already running; the old one returns.
    pub async fn run(&self, mut inbound: mpsc::Receiver<TransportEvent>) {
        let mut generation = self.inner.loop_gen.subscribe();
        let mut mine = 0;
        self.inner.loop_gen.send_modify(|g| {
            *g += 1;
            mine = *g;
        });

        let mut events = self.inner.events_rx.lock().await;
        if *generation.borrow_and_update() != mine {
            debug!("Signaling stream was replaced before its loop started");
            return;
        }
        debug!("Call coordinator loop #{mine} started");

        loop {
            tokio::select! {
                changed = generation.changed() => {
                    if changed.is_err() || *generation.borrow_and_update() != mine {
                        info!("Signaling stream replaced, handing over the event loop");
                        break;
                    }
                }
                event = inbound.recv() => match event {
                    Some(TransportEvent::Connected) => info!("Signaling channel connected"),
                    Some(TransportEvent::Message(text)) => self.handle_text(&text).await,
                    Some(TransportEvent::Disconnected) => warn!("Signaling channel disconnected"),
                    None => break,
                },
                Some(event) = events.recv() => self.on_session_event(event).await,
            }
        }

        debug!("Call coordinator loop #{mine} stopped");
    }

    async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Peer { epoch, event } => self.on_peer_event(epoch, event).await,
            SessionEvent::RingTimeout { epoch } => self.on_ring_timeout(epoch).await,
            SessionEvent::GraceExpired { epoch, timer } => {
                self.on_grace_expired(epoch, timer).await
            }
        }
    }

    async fn on_peer_event(&self, epoch: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let mut m = self.machine();
                if !m.is_current(epoch) {
                    trace!("Dropping local candidate from a finished attempt");
                    return;
                }
                if let Some(session) = m.state.session_mut() {
                    if session.description_sent {
                        self.send_candidate(session, candidate);
                    } else {
                        session.outbound_candidates.push(candidate);
                    }
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let kind = track.kind;
                let stored = {
                    let mut m = self.machine();
                    let current = m.is_current(epoch);
                    match m.state.media_mut() {
                        Some(media) if current => {
                            media.remote.push(track);
                            true
                        }
                        _ => false,
                    }
                };
                if stored {
                    self.notify(CallNotice::RemoteStream { track_kind: kind });
                }
            }
            PeerEvent::StateChanged(state) => match state {
                LinkState::Disconnected | LinkState::Failed => {
                    let mut m = self.machine();
                    if !m.is_current(epoch) || !matches!(m.state, CallState::Active { .. }) {
                        return;
                    }
                    if m.grace.is_some() {
                        debug!("Peer link {state:?}, grace timer already running");
                        return;
                    }
                    warn!(
                        "Peer link {state:?}, waiting {:?} for recovery",
                        self.inner.config.grace_period()
                    );
                    m.next_timer += 1;
                    let id = m.next_timer;
                    m.grace = Some(GraceTimer {
                        id,
                        task: self.arm_grace_timer(epoch, id),
                    });
                }
                LinkState::Connected => {
                    let recovered = {
                        let mut m = self.machine();
                        m.is_current(epoch) && m.cancel_grace()
                    };
                    if recovered {
                        info!("Peer link recovered, grace timer cancelled");
                    } else {
                        info!("Peer link connected");
                    }
                }
                other => debug!("Peer link state: {other:?}"),
            },
        }
    }

    async fn on_ring_timeout(&self, epoch: u64) {
        let status = {
            let m = self.machine();
            m.is_current(epoch).then(|| m.state.status())
        };
        match status {
            Some(CallStatus::AwaitingAnswer) => {
                info!("No answer, hanging up");
                self.teardown_if(
                    |m| m.is_current(epoch) && matches!(m.state, CallState::AwaitingAnswer { .. }),
                    Farewell::End,
                    Some(CallNotice::error(ErrorCategory::NoAnswer, "No answer")),
                )
                .await;
            }
            Some(CallStatus::RingingIncoming) => {
                info!("Incoming call was not answered");
                self.teardown_if(
                    |m| m.is_current(epoch) && matches!(m.state, CallState::RingingIncoming { .. }),
                    Farewell::Decline,
                    Some(CallNotice::error(ErrorCategory::NoAnswer, "Missed call")),
                )
                .await;
            }
            _ => {}
        }
    }

    async fn on_grace_expired(&self, epoch: u64, timer: u64) {
        let link = {
            let mut m = self.machine();
            let pending = m.is_current(epoch) && m.grace.as_ref().is_some_and(|t| t.id == timer);
            if pending {
                m.grace = None;
            }
            match &m.state {
                CallState::Active { media, .. } if pending => Some(media.link.clone()),
                _ => None,
            }
        };
        let Some(link) = link else { return };
        if link.is_connected() {
            debug!("Peer link recovered within the grace period");
            return;
        }

        warn!("Peer link did not recover, ending call");
        self.teardown_if(
            |m| m.is_current(epoch) && matches!(m.state, CallState::Active { .. }),
            Farewell::End,
            Some(CallNotice::error(
                ErrorCategory::ConnectionLost,
                "Connection lost",
            )),
        )
        .await;
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> MutexGuard<'_, Option<Arc<dyn SignalingTransport>>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: CallNotice) {
        self.inner.notifier.notify(notice);
    }

    /// Reports `err` to the UI and hands it back.
    fn surface(&self, err: CallError) -> CallError {
        self.notify(CallNotice::error(err.category(), err.to_string()));
        err
    }

    /// Returns whether the frame went out; a closed channel drops it.
    fn send(&self, signal: OutboundSignal) -> Result<bool, CallError> {
        let transport = self.transport().clone();
        match transport {
            Some(t) if t.is_open() => {
                let text = signal.encode()?;
                t.send_text(text)?;
                debug!("Sent {}", signal.kind());
                Ok(true)
            }
            _ => {
                warn!("Dropping {}: signaling channel is not open", signal.kind());
                Ok(false)
            }
        }
    }

    fn send_best_effort(&self, signal: OutboundSignal) {
        let kind = signal.kind();
        if let Err(e) = self.send(signal) {
            warn!("Failed to send {kind}: {e}");
        }
    }

    fn send_candidate(&self, session: &mut CallSession, candidate: IceCandidate) {
        self.send_best_effort(OutboundSignal::IceCandidate {
            candidate: candidate.clone(),
            room_id: session.room_id.clone(),
            recipient_id: session.remote_id.clone(),
        });
        session.sent_candidates.push(candidate);
    }

    /// Sends the local candidates gathered before the description went out.
    fn flush_candidates(&self, session: &mut CallSession) {
        let queued = std::mem::take(&mut session.outbound_candidates);
        if !queued.is_empty() {
            debug!("Flushing {} queued local candidates", queued.len());
        }
        for candidate in queued {
            self.send_candidate(session, candidate);
        }
    }

    async fn apply_candidates(&self, link: &Arc<dyn PeerLink>, candidates: Vec<IceCandidate>) {
        if !candidates.is_empty() {
            debug!("Applying {} buffered remote candidates", candidates.len());
        }
        for candidate in candidates {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered ICE candidate: {e}");
            }
        }
    }

    fn peer_sink(&self, epoch: u64) -> PeerEventSink {
        let tx = self.inner.events_tx.clone();
        PeerEventSink::new(move |event| {
            let _ = tx.send(SessionEvent::Peer { epoch, event });
        })
    }

    fn arm_ring_timer(&self, epoch: u64) {
        let Some(timeout) = self.inner.config.ring_timeout() else {
            return;
        };
        let tx = self.inner.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SessionEvent::RingTimeout { epoch });
        });
    }

    fn arm_grace_timer(&self, epoch: u64, timer: u64) -> JoinHandle<()> {
        let grace = self.inner.config.grace_period();
        let tx = self.inner.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(SessionEvent::GraceExpired { epoch, timer });
        })
    }

    /// Tears the attempt down and reports `err`, unless it is already gone.
    async fn fail(&self, epoch: u64, err: CallError, farewell: Farewell) -> CallError {
        let notice = CallNotice::error(err.category(), err.to_string());
        if self
            .teardown_if(|m| m.is_current(epoch), farewell, Some(notice))
            .await
        {
            err
        } else {
            CallError::Cancelled
        }
    }

    /// Если `pred` разрешает: прощаемся с собеседником, гасим захват,
    /// переходим в Idle, закрываем соединение и сообщаем UI.
    async fn teardown_if(
        &self,
        pred: impl FnOnce(&Machine) -> bool,
        farewell: Farewell,
        notice: Option<CallNotice>,
    ) -> bool {
        let old = {
            let mut m = self.machine();
            if matches!(m.state, CallState::Idle) || !pred(&*m) {
                return false;
            }
            if let Some(signal) = m.state.session().and_then(|s| farewell.signal(s)) {
                self.send_best_effort(signal);
            }
            // захват гасим до того, как сессия исчезнет
            if let Some(media) = m.state.media() {
                media.local.stop();
            }
            m.clear()
        };

        let status = old.status();
        let (session, media) = old.into_parts();
        if let Some(media) = media {
            media.link.close().await;
        }

        let duration_secs = session.as_ref().and_then(CallSession::duration_secs);
        if let Some(session) = &session {
            if !session.sent_candidates.is_empty() {
                analyze_candidates(&session.sent_candidates);
            }
            info!(
                "Call {} with {} torn down from {status:?}",
                session.room_id, session.remote_id
            );
        } else {
            info!("Call attempt torn down from {status:?}");
        }

        if let Some(notice) = notice {
            self.notify(notice);
        }
        self.notify(CallNotice::StateChanged {
            state: CallPhase::Ended,
            duration_secs,
        });
        true
    }
}

fn call_kind(is_video: bool) -> &'static str {
    if is_video {
        "video"
    } else {
        "audio"
    }
}

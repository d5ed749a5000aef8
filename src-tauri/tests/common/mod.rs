#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sscall_lib::config::CallConfig;
use sscall_lib::error::{CallError, MediaAccessCause, MediaAccessError};
use sscall_lib::peer::{
    IceCandidate, LocalMedia, MediaConstraints, MediaDevices, PeerEvent, PeerEventSink,
    PeerFactory, PeerLink, SessionDescription,
};
use sscall_lib::{CallCoordinator, CallNotice, ChannelTransport, InboundSignal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Capture that can be told to fail or to hold until released.
#[derive(Default)]
pub struct FakeDevices {
    failure: Mutex<Option<MediaAccessCause>>,
    gate: Option<Arc<Notify>>,
    pub opened: Mutex<Vec<LocalMedia>>,
}

impl FakeDevices {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_with(&self, cause: MediaAccessCause) {
        *self.failure.lock().unwrap() = Some(cause);
    }

    pub fn opened(&self) -> Vec<LocalMedia> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(cause) = *self.failure.lock().unwrap() {
            return Err(MediaAccessError::new(cause));
        }
        let media = LocalMedia::new(constraints);
        self.opened.lock().unwrap().push(media.clone());
        Ok(media)
    }
}

/// Link that records what the coordinator asked of it.
pub struct FakeLink {
    calls: Mutex<Vec<&'static str>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
    pub connected: AtomicBool,
    fail_offer: bool,
    /// Reject remote descriptions / remote candidates.
    pub fail_remote: AtomicBool,
    pub fail_candidates: AtomicBool,
    sink: PeerEventSink,
}

impl FakeLink {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Plays an event as if the connection raised it.
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.record("create_offer");
        if self.fail_offer {
            return Err(CallError::Negotiation("offer rejected".into()));
        }
        // gathering starts as soon as the local description is set
        self.emit(PeerEvent::LocalCandidate(candidate(100)));
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.record("create_answer");
        self.emit(PeerEvent::LocalCandidate(candidate(200)));
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.record("set_remote_description");
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("remote description rejected".into()));
        }
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.record("add_ice_candidate");
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("candidate rejected".into()));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeers {
    pub links: Mutex<Vec<Arc<FakeLink>>>,
    pub fail_offer: AtomicBool,
    /// Switches copied into every link created from here on.
    pub fail_remote: AtomicBool,
    pub fail_candidates: AtomicBool,
}

impl FakePeers {
    pub fn link(&self) -> Arc<FakeLink> {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no link was created")
    }

    pub fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeers {
    async fn connect(
        &self,
        _media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let link = Arc::new(FakeLink {
            calls: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            fail_remote: AtomicBool::new(self.fail_remote.load(Ordering::SeqCst)),
            fail_candidates: AtomicBool::new(self.fail_candidates.load(Ordering::SeqCst)),
            sink: events,
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

pub struct Harness {
    pub coordinator: CallCoordinator,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeers>,
    pub transport: Arc<ChannelTransport>,
    wire: mpsc::UnboundedReceiver<String>,
    notices: mpsc::UnboundedReceiver<CallNotice>,
}

impl Harness {
    /// No ring timeout, so nothing fires behind the test's back.
    pub fn new() -> Self {
        Self::with(
            CallConfig {
                ring_timeout_secs: None,
                ..CallConfig::default()
            },
            FakeDevices::default(),
        )
    }

    pub fn with(config: CallConfig, devices: FakeDevices) -> Self {
        let devices = Arc::new(devices);
        let peers = Arc::new(FakePeers::default());
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let coordinator =
            CallCoordinator::new(config, devices.clone(), peers.clone(), Arc::new(notice_tx));
        let (transport, wire) = ChannelTransport::new();
        coordinator.set_transport(transport.clone());
        Self {
            coordinator,
            devices,
            peers,
            transport,
            wire,
            notices,
        }
    }

    /// Everything sent to the relay since the last call.
    pub fn sent(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = self.wire.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    pub fn sent_types(&mut self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|v| v["type"].as_str().unwrap().to_owned())
            .collect()
    }

    /// Waits for the next frame on the wire.
    pub async fn next_sent(&mut self) -> Value {
        let text = tokio::time::timeout(std::time::Duration::from_secs(5), self.wire.recv())
            .await
            .expect("nothing was sent")
            .expect("wire closed");
        serde_json::from_str(&text).unwrap()
    }

    pub fn notices(&mut self) -> Vec<CallNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }

    /// Starts the event loop; keep the sender alive for as long as it should run.
    pub fn spawn_loop(&self) -> mpsc::Sender<sscall_lib::TransportEvent> {
        let (tx, rx) = mpsc::channel(16);
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.run(rx).await });
        tx
    }
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{} 5{n:04} typ host", n % 250),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn offer_from(sender: i64, room: &str, is_video: bool) -> InboundSignal {
    InboundSignal::CallOffer {
        offer: SessionDescription::offer("v=0 remote-offer"),
        room_id: room.into(),
        sender_id: sender.into(),
        sender_name: Some(format!("user{sender}")),
        is_video,
    }
}

pub fn answer_for(sender: i64, room: &str) -> InboundSignal {
    InboundSignal::CallAnswer {
        answer: SessionDescription::answer("v=0 remote-answer"),
        room_id: room.into(),
        sender_id: sender.into(),
    }
}

pub fn remote_candidate(sender: i64, room: &str, n: u16) -> InboundSignal {
    InboundSignal::IceCandidate {
        candidate: candidate(n),
        room_id: room.into(),
        sender_id: sender.into(),
    }
}

pub fn end_from(sender: i64, room: &str) -> InboundSignal {
    InboundSignal::CallEnd {
        room_id: room.into(),
        sender_id: sender.into(),
    }
}

pub fn declined_by(sender: i64, room: &str) -> InboundSignal {
    InboundSignal::CallDeclined {
        room_id: room.into(),
        sender_id: sender.into(),
    }
}

/// Lets spawned tasks run on the current-thread runtime.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

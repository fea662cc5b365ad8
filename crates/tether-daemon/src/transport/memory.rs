//! In-memory transports and peer links
//!
//! [`RecordingTransport`] captures everything sent through it and
//! [`MemoryConnector`] hands out [`MemoryLink`]s whose events are injected by
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use tether_core::error::TransportError;
use tether_core::traits::Transport;
use tether_protocol::IceCandidate;

use super::peer::{DirectEvent, DirectState, LinkEvent, LinkEventSender, PeerConnector, PeerLink};

/// Transport that records what it is asked to send
#[derive(Debug)]
pub struct RecordingTransport {
    name: &'static str,
    open: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingTransport {
    pub fn new(name: &'static str, open: bool) -> Self {
        Self {
            name,
            open: AtomicBool::new(open),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Make sends fail while still reporting the channel as open
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Action names sent so far
    pub fn actions(&self) -> Vec<String> {
        self.sent().into_iter().map(|(action, _)| action).collect()
    }

    /// Payloads sent under `action`
    pub fn payloads(&self, action: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(a, _)| a == action)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Drain the record
    pub fn take(&self) -> Vec<(String, Value)> {
        self.sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Direct(format!("{} send failed", self.name)));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| TransportError::Relay("record poisoned".to_string()))?;
        sent.push((event.to_string(), payload.clone()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn close(&self) {
        self.set_open(false);
    }
}

#[derive(Debug, Default)]
struct LinkLog {
    remote_answer: Option<String>,
    remote_candidates: Vec<IceCandidate>,
    closed: bool,
}

/// Peer link driven by the test
pub struct MemoryLink {
    id: u64,
    events: LinkEventSender,
    stall_gathering: bool,
    channel: Arc<RecordingTransport>,
    log: Mutex<LinkLog>,
}

impl MemoryLink {
    /// Id the coordinator assigned to this link
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publish an event as if the peer connection produced it
    pub fn emit(&self, event: DirectEvent) {
        let _ = self.events.send(LinkEvent {
            link: self.id,
            event,
        });
    }

    /// Simulate ICE connecting and the data channel opening
    pub fn open_channel(&self) {
        self.channel.set_open(true);
        self.emit(DirectEvent::StateChanged(DirectState::Connected));
        self.emit(DirectEvent::ChannelOpen);
    }

    /// Simulate the connection dropping
    pub fn drop_connection(&self, state: DirectState) {
        self.channel.set_open(false);
        self.emit(DirectEvent::StateChanged(state));
    }

    /// Simulate the channel dying with frames still queued: everything sent
    /// so far comes back undelivered
    pub fn fail_queued_writes(&self) {
        self.channel.set_open(false);
        for (event, payload) in self.channel.take() {
            self.emit(DirectEvent::Undelivered { event, payload });
        }
    }

    /// The data channel record
    pub fn recording(&self) -> Arc<RecordingTransport> {
        Arc::clone(&self.channel)
    }

    pub fn remote_answer(&self) -> Option<String> {
        self.log.lock().ok()?.remote_answer.clone()
    }

    /// Remote candidates in the order they were applied
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.log
            .lock()
            .map(|l| l.remote_candidates.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().map(|l| l.closed).unwrap_or(false)
    }

    fn offer_sdp(&self) -> String {
        format!("v=0 memory-offer-{}", self.id)
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok(self.offer_sdp())
    }

    async fn gathering_complete(&self) {
        if self.stall_gathering {
            futures::future::pending::<()>().await;
        }
    }

    async fn local_description(&self) -> Option<String> {
        Some(self.offer_sdp())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| TransportError::Direct("link log poisoned".to_string()))?;
        if log.closed {
            return Err(TransportError::Closed);
        }
        log.remote_answer = Some(sdp.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| TransportError::Direct("link log poisoned".to_string()))?;
        if log.remote_answer.is_none() {
            return Err(TransportError::Direct(
                "candidate before remote description".to_string(),
            ));
        }
        log.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn channel(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.channel) as Arc<dyn Transport>
    }

    async fn close(&self) {
        self.channel.set_open(false);
        if let Ok(mut log) = self.log.lock() {
            log.closed = true;
        }
    }
}

/// Connector handing out [`MemoryLink`]s
#[derive(Clone, Default)]
pub struct MemoryConnector {
    links: Arc<Mutex<Vec<Arc<MemoryLink>>>>,
    stall_gathering: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links created from now on never finish ICE gathering
    pub fn stall_gathering(&self, stall: bool) {
        self.stall_gathering.store(stall, Ordering::SeqCst);
    }

    /// Make `connect` fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn link(&self, index: usize) -> Option<Arc<MemoryLink>> {
        self.links.lock().ok()?.get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<MemoryLink>> {
        self.links.lock().ok()?.last().cloned()
    }

    /// Number of links created so far
    pub fn connected(&self) -> usize {
        self.links.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(
        &self,
        link: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Direct("peer connection refused".to_string()));
        }

        let memory_link = Arc::new(MemoryLink {
            id: link,
            events,
            stall_gathering: self.stall_gathering.load(Ordering::SeqCst),
            channel: Arc::new(RecordingTransport::new("memory-direct", false)),
            log: Mutex::new(LinkLog::default()),
        });
        self.links
            .lock()
            .map_err(|_| TransportError::Direct("connector state poisoned".to_string()))?
            .push(Arc::clone(&memory_link));
        Ok(memory_link as Arc<dyn PeerLink>)
    }
}

//! Test doubles for driving sessions without a SIP stack
//!
//! [`ScriptedInvitation`] implements the dialog contract against an in-memory
//! script: it records every operation the session performs and lets a test
//! fire dialog events back through the bus. [`MockStream`] is a controllable
//! media stream for failure injection. Used by the test suite; kept public so
//! downstream integrations can drive their own session tests the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::CoreConfig;
use crate::events::{Event, EventBus, EventPayload, SenderId};
use crate::protocols::invitation::{
    status_reason, CallDirection, Header, Invitation, InvitationEvent, InvitationFactory,
    InvitationState, InvitationStateEvent, InvitationSubState, InviteRequest, NegotiatedSdp,
    Originator, SdpNegotiation, SdpUpdateEvent, SipAddress, Transport,
};
use crate::protocols::sdp::{Connection, MediaDescription, SessionDescription};
use crate::streams::{MediaStream, MediaStreamEvent, StreamKind};
use crate::Result;

/// Everything a scripted invitation was asked to do, in order.
#[derive(Debug, Clone)]
pub enum InvitationAction {
    InviteSent { request: InviteRequest },
    ResponseSent {
        code: u16,
        sdp: Option<SessionDescription>,
        headers: Vec<Header>,
    },
    ReinviteSent { sdp: SessionDescription },
    Ended,
}

struct ScriptState {
    state: InvitationState,
    sub_state: Option<InvitationSubState>,
    sdp: SdpNegotiation,
    request_uri: Option<String>,
    local_identity: Option<SipAddress>,
    remote_identity: Option<SipAddress>,
    remote_user_agent: Option<String>,
}

/// A dialog double scripted from the outside.
///
/// Operations the session invokes are appended to an action queue the test
/// consumes with [`ScriptedInvitation::expect_action`]. Responses that settle
/// a negotiation (a `200` answering an offer, the answer to a re-INVITE) are
/// reflected into the SDP slots and echoed back as dialog events, the way a
/// real transaction layer would.
pub struct ScriptedInvitation {
    id: SenderId,
    bus: EventBus,
    direction: CallDirection,
    auto_disconnect: AtomicBool,
    script: Mutex<ScriptState>,
    actions_tx: mpsc::UnboundedSender<InvitationAction>,
    actions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InvitationAction>>,
}

impl ScriptedInvitation {
    pub fn outgoing(bus: EventBus) -> Arc<Self> {
        Self::build(bus, CallDirection::Outgoing, InvitationState::Idle, None, None)
    }

    pub fn incoming(
        bus: EventBus,
        request_uri: &str,
        offer: Option<SessionDescription>,
    ) -> Arc<Self> {
        Self::build(
            bus,
            CallDirection::Incoming,
            InvitationState::Incoming,
            Some(request_uri.to_string()),
            offer,
        )
    }

    fn build(
        bus: EventBus,
        direction: CallDirection,
        state: InvitationState,
        request_uri: Option<String>,
        offer: Option<SessionDescription>,
    ) -> Arc<Self> {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: SenderId::new(),
            bus,
            direction,
            auto_disconnect: AtomicBool::new(true),
            script: Mutex::new(ScriptState {
                state,
                sub_state: None,
                sdp: SdpNegotiation { proposed_remote: offer, ..Default::default() },
                request_uri,
                local_identity: None,
                remote_identity: Some(SipAddress::new("sip:peer@example.com")),
                remote_user_agent: Some("scripted/1.0".to_string()),
            }),
            actions_tx,
            actions_rx: tokio::sync::Mutex::new(actions_rx),
        })
    }

    /// Disable the automatic `disconnected` event on `end()` and on negative
    /// final responses, for tests exercising the disconnect timeout.
    pub fn manual_disconnect(&self) {
        self.auto_disconnect.store(false, Ordering::Relaxed);
    }

    /// Publish this dialog as an ownerless incoming INVITE.
    pub fn announce(self: &Arc<Self>) {
        self.bus.publish(Event::new(
            self.id,
            EventPayload::Invitation(InvitationEvent::NewIncoming { invitation: self.clone() }),
        ));
    }

    /// Next recorded action, failing the test after one second of silence.
    pub async fn expect_action(&self) -> InvitationAction {
        let mut rx = self.actions_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for an invitation action")
            .expect("invitation action channel closed")
    }

    /// Fire a dialog state change, updating the visible state first.
    pub fn fire_state(&self, event: InvitationStateEvent) {
        {
            let mut script = self.script.lock().unwrap();
            script.state = event.state;
            script.sub_state = event.sub_state;
        }
        self.publish(InvitationEvent::StateChanged(event));
    }

    /// Convenience state event with the current state as `prev_state`.
    pub fn state_event(&self, state: InvitationState, code: u16) -> InvitationStateEvent {
        let prev = self.script.lock().unwrap().state;
        InvitationStateEvent {
            state,
            sub_state: None,
            prev_state: Some(prev),
            code,
            reason: if code > 0 { Some(status_reason(code).to_string()) } else { None },
            originator: Originator::Remote,
            method: None,
            disconnect_reason: None,
        }
    }

    /// Complete an offer/answer round successfully.
    pub fn fire_sdp_ok(&self, local: SessionDescription, remote: SessionDescription) {
        {
            let mut script = self.script.lock().unwrap();
            script.sdp.active_local = Some(local.clone());
            script.sdp.active_remote = Some(remote.clone());
            script.sdp.proposed_local = None;
            script.sdp.proposed_remote = None;
        }
        self.publish(InvitationEvent::SdpUpdate(SdpUpdateEvent {
            result: Ok(NegotiatedSdp { local, remote }),
        }));
    }

    /// Fail the pending offer/answer round.
    pub fn fire_sdp_error(&self, error: &str) {
        self.publish(InvitationEvent::SdpUpdate(SdpUpdateEvent { result: Err(error.to_string()) }));
    }

    /// Stage a peer re-INVITE: install the proposed SDP and raise the
    /// `received_proposal` sub-state.
    pub fn receive_reinvite(&self, proposed_remote: SessionDescription) {
        let prev = {
            let mut script = self.script.lock().unwrap();
            script.sdp.proposed_remote = Some(proposed_remote);
            script.state
        };
        self.fire_state(InvitationStateEvent {
            state: InvitationState::Connected,
            sub_state: Some(InvitationSubState::ReceivedProposal),
            prev_state: Some(prev),
            code: 0,
            reason: None,
            originator: Originator::Remote,
            method: Some("INVITE".to_string()),
            disconnect_reason: None,
        });
    }

    /// Answer our own pending re-INVITE with a 2xx and the given remote SDP.
    pub fn answer_reinvite(&self, remote: SessionDescription, code: u16) {
        let local = {
            let mut script = self.script.lock().unwrap();
            let local = script.sdp.proposed_local.take();
            if let Some(local) = &local {
                script.sdp.active_local = Some(local.clone());
                script.sdp.active_remote = Some(remote.clone());
            }
            script.sub_state = Some(InvitationSubState::Normal);
            local
        };
        if let Some(local) = local {
            self.publish(InvitationEvent::SdpUpdate(SdpUpdateEvent {
                result: Ok(NegotiatedSdp { local, remote }),
            }));
        }
        self.fire_state(InvitationStateEvent {
            state: InvitationState::Connected,
            sub_state: Some(InvitationSubState::Normal),
            prev_state: Some(InvitationState::Connected),
            code,
            reason: Some(status_reason(code).to_string()),
            originator: Originator::Remote,
            method: Some("INVITE".to_string()),
            disconnect_reason: None,
        });
    }

    /// Remote BYE: tear the dialog down from the far side.
    pub fn remote_bye(&self) {
        let prev = self.script.lock().unwrap().state;
        self.fire_state(InvitationStateEvent {
            state: InvitationState::Disconnected,
            sub_state: None,
            prev_state: Some(prev),
            code: 0,
            reason: None,
            originator: Originator::Remote,
            method: Some("BYE".to_string()),
            disconnect_reason: Some("user request".to_string()),
        });
    }

    fn publish(&self, event: InvitationEvent) {
        self.bus.publish(Event::new(self.id, EventPayload::Invitation(event)));
    }

    fn record(&self, action: InvitationAction) {
        let _ = self.actions_tx.send(action);
    }

    /// The transaction layer's reflexive behavior after we answer a request:
    /// a `200` with SDP settles the negotiation, an error answer to a
    /// proposal restores the normal sub-state, a final negative answer to the
    /// initial INVITE disconnects.
    fn apply_response(&self, code: u16, sdp: Option<SessionDescription>) {
        let mut script = self.script.lock().unwrap();
        match script.state {
            InvitationState::Incoming | InvitationState::Early => {
                if code == 180 || code == 183 {
                    script.state = InvitationState::Early;
                } else if (200..300).contains(&code) {
                    script.state = InvitationState::Connecting;
                    if let Some(local) = sdp {
                        if let Some(remote) = script.sdp.proposed_remote.take() {
                            script.sdp.active_local = Some(local);
                            script.sdp.active_remote = Some(remote);
                        } else {
                            script.sdp.proposed_local = Some(local);
                        }
                    }
                } else if code >= 300 {
                    script.state = InvitationState::Disconnecting;
                    if self.auto_disconnect.load(Ordering::Relaxed) {
                        script.state = InvitationState::Disconnected;
                        let event = InvitationStateEvent {
                            state: InvitationState::Disconnected,
                            sub_state: None,
                            prev_state: Some(InvitationState::Disconnecting),
                            code,
                            reason: Some(status_reason(code).to_string()),
                            originator: Originator::Local,
                            method: Some("INVITE".to_string()),
                            disconnect_reason: None,
                        };
                        drop(script);
                        self.publish(InvitationEvent::StateChanged(event));
                    }
                }
            }
            InvitationState::Connected
                if script.sub_state == Some(InvitationSubState::ReceivedProposal) =>
            {
                script.sub_state = Some(InvitationSubState::Normal);
                let negotiated = if (200..300).contains(&code) {
                    match (sdp, script.sdp.proposed_remote.take()) {
                        (Some(local), Some(remote)) => {
                            script.sdp.active_local = Some(local.clone());
                            script.sdp.active_remote = Some(remote.clone());
                            Some(NegotiatedSdp { local, remote })
                        }
                        _ => None,
                    }
                } else {
                    script.sdp.proposed_remote = None;
                    None
                };
                drop(script);
                if let Some(negotiated) = negotiated {
                    self.publish(InvitationEvent::SdpUpdate(SdpUpdateEvent {
                        result: Ok(negotiated),
                    }));
                }
                self.fire_state(InvitationStateEvent {
                    state: InvitationState::Connected,
                    sub_state: Some(InvitationSubState::Normal),
                    prev_state: Some(InvitationState::Connected),
                    code,
                    reason: Some(status_reason(code).to_string()),
                    originator: Originator::Remote,
                    method: Some("INVITE".to_string()),
                    disconnect_reason: None,
                });
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Invitation for ScriptedInvitation {
    fn id(&self) -> SenderId {
        self.id
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn state(&self) -> InvitationState {
        self.script.lock().unwrap().state
    }

    fn sub_state(&self) -> Option<InvitationSubState> {
        self.script.lock().unwrap().sub_state
    }

    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn sdp(&self) -> SdpNegotiation {
        self.script.lock().unwrap().sdp.clone()
    }

    fn request_uri(&self) -> Option<String> {
        self.script.lock().unwrap().request_uri.clone()
    }

    fn local_identity(&self) -> Option<SipAddress> {
        self.script.lock().unwrap().local_identity.clone()
    }

    fn remote_identity(&self) -> Option<SipAddress> {
        self.script.lock().unwrap().remote_identity.clone()
    }

    fn remote_user_agent(&self) -> Option<String> {
        self.script.lock().unwrap().remote_user_agent.clone()
    }

    async fn send_invite(&self, request: InviteRequest) -> Result<()> {
        {
            let mut script = self.script.lock().unwrap();
            script.state = InvitationState::Outgoing;
            script.sdp.proposed_local = Some(request.sdp.clone());
            script.local_identity = Some(request.from.clone());
            script.remote_identity = Some(request.to.clone());
        }
        self.record(InvitationAction::InviteSent { request });
        Ok(())
    }

    async fn send_response(
        &self,
        code: u16,
        sdp: Option<SessionDescription>,
        extra_headers: Vec<Header>,
    ) -> Result<()> {
        self.record(InvitationAction::ResponseSent {
            code,
            sdp: sdp.clone(),
            headers: extra_headers,
        });
        self.apply_response(code, sdp);
        Ok(())
    }

    async fn send_reinvite(&self, sdp: SessionDescription) -> Result<()> {
        {
            let mut script = self.script.lock().unwrap();
            script.sub_state = Some(InvitationSubState::SentProposal);
            script.sdp.proposed_local = Some(sdp.clone());
        }
        self.record(InvitationAction::ReinviteSent { sdp });
        Ok(())
    }

    async fn end(&self, _timeout: Option<Duration>) -> Result<()> {
        self.record(InvitationAction::Ended);
        let prev = {
            let mut script = self.script.lock().unwrap();
            let prev = script.state;
            script.state = InvitationState::Disconnecting;
            prev
        };
        if self.auto_disconnect.load(Ordering::Relaxed) {
            let code = if prev == InvitationState::Connected { 200 } else { 487 };
            {
                self.script.lock().unwrap().state = InvitationState::Disconnected;
            }
            self.publish(InvitationEvent::StateChanged(InvitationStateEvent {
                state: InvitationState::Disconnected,
                sub_state: None,
                prev_state: Some(InvitationState::Disconnecting),
                code,
                reason: Some(status_reason(code).to_string()),
                originator: Originator::Local,
                method: None,
                disconnect_reason: None,
            }));
        }
        Ok(())
    }
}

/// Factory handing out scripted dialogs. Tests stage the invitation up front
/// so they hold the handle before the session starts driving it.
pub struct ScriptedFactory {
    bus: EventBus,
    staged: Mutex<Vec<Arc<ScriptedInvitation>>>,
}

impl ScriptedFactory {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self { bus, staged: Mutex::new(Vec::new()) })
    }

    /// Pre-create the next outgoing dialog and keep a handle to it.
    pub fn stage_outgoing(&self) -> Arc<ScriptedInvitation> {
        let invitation = ScriptedInvitation::outgoing(self.bus.clone());
        self.staged.lock().unwrap().push(invitation.clone());
        invitation
    }
}

impl InvitationFactory for ScriptedFactory {
    fn create_outgoing(&self) -> Result<Arc<dyn Invitation>> {
        let mut staged = self.staged.lock().unwrap();
        let invitation = if staged.is_empty() {
            ScriptedInvitation::outgoing(self.bus.clone())
        } else {
            staged.remove(0)
        };
        Ok(invitation)
    }
}

/// A controllable media stream for failure injection.
#[derive(Debug)]
pub struct MockStream {
    id: SenderId,
    kind: StreamKind,
    hold_supported: bool,
    fail_initialize: AtomicBool,
    fail_start: AtomicBool,
    inner: Mutex<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    index: Option<usize>,
    bus: Option<EventBus>,
    on_hold_by_local: bool,
    on_hold_by_remote: bool,
}

impl MockStream {
    pub fn audio() -> Arc<Self> {
        Self::new(StreamKind::Audio, true)
    }

    pub fn chat() -> Arc<Self> {
        Self::new(StreamKind::Chat, false)
    }

    fn new(kind: StreamKind, hold_supported: bool) -> Arc<Self> {
        Arc::new(Self {
            id: SenderId::new(),
            kind,
            hold_supported,
            fail_initialize: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            inner: Mutex::new(MockInner {
                index: None,
                bus: None,
                on_hold_by_local: false,
                on_hold_by_remote: false,
            }),
        })
    }

    pub fn fail_on_initialize(&self) {
        self.fail_initialize.store(true, Ordering::Relaxed);
    }

    pub fn fail_on_start(&self) {
        self.fail_start.store(true, Ordering::Relaxed);
    }

    fn publish(&self, event: MediaStreamEvent) {
        if let Some(bus) = self.inner.lock().unwrap().bus.clone() {
            bus.publish(Event::new(self.id, EventPayload::Media(event)));
        }
    }
}

#[async_trait]
impl MediaStream for MockStream {
    fn id(&self) -> SenderId {
        self.id
    }

    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn index(&self) -> Option<usize> {
        self.inner.lock().unwrap().index
    }

    fn set_index(&self, index: usize) {
        self.inner.lock().unwrap().index = Some(index);
    }

    fn hold_supported(&self) -> bool {
        self.hold_supported
    }

    fn on_hold_by_local(&self) -> bool {
        self.inner.lock().unwrap().on_hold_by_local
    }

    fn on_hold_by_remote(&self) -> bool {
        self.inner.lock().unwrap().on_hold_by_remote
    }

    async fn initialize(&self, bus: EventBus) -> Result<()> {
        self.inner.lock().unwrap().bus = Some(bus);
        if self.fail_initialize.load(Ordering::Relaxed) {
            self.publish(MediaStreamEvent::DidFail { reason: "mock initialize failure".to_string() });
            return Err(crate::Error::media("mock initialize failure"));
        }
        self.publish(MediaStreamEvent::DidInitialize);
        Ok(())
    }

    async fn start(
        &self,
        _local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()> {
        if self.fail_start.load(Ordering::Relaxed) {
            self.publish(MediaStreamEvent::DidFail { reason: "mock start failure".to_string() });
            return Err(crate::Error::media("mock start failure"));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.index = Some(index);
            inner.on_hold_by_remote = remote_sdp
                .media
                .get(index)
                .map(|media| media.direction().is_hold())
                .unwrap_or(false);
        }
        self.publish(MediaStreamEvent::DidStart);
        Ok(())
    }

    async fn update(
        &self,
        _local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.index = Some(index);
        inner.on_hold_by_remote = remote_sdp
            .media
            .get(index)
            .map(|media| media.direction().is_hold())
            .unwrap_or(false);
        Ok(())
    }

    async fn end(&self) {
        self.publish(MediaStreamEvent::WillEnd);
        self.publish(MediaStreamEvent::DidEnd);
    }

    fn hold(&self) {
        self.inner.lock().unwrap().on_hold_by_local = true;
    }

    fn unhold(&self) {
        self.inner.lock().unwrap().on_hold_by_local = false;
    }

    fn local_media(&self, _for_offer: bool) -> MediaDescription {
        let mut media = match self.kind {
            StreamKind::Audio => {
                let mut media = MediaDescription::new("audio", 6000, "RTP/AVP");
                media.formats = vec!["0".to_string()];
                media
            }
            _ => {
                let mut media = MediaDescription::new("message", 2855, "TCP/MSRP");
                media.formats = vec!["*".to_string()];
                media
            }
        };
        let inner = self.inner.lock().unwrap();
        if self.hold_supported {
            let direction = match (inner.on_hold_by_local, inner.on_hold_by_remote) {
                (false, false) => crate::protocols::sdp::Direction::SendRecv,
                (true, false) => crate::protocols::sdp::Direction::SendOnly,
                (false, true) => crate::protocols::sdp::Direction::RecvOnly,
                (true, true) => crate::protocols::sdp::Direction::Inactive,
            };
            media.set_direction(direction);
        }
        media
    }

    fn validate_incoming(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        remote_sdp.media.get(index).is_some()
    }

    fn validate_update(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        remote_sdp.media.get(index).is_some()
    }
}

/// A symmetric answer for an offer: every media line mirrored back with a
/// peer-side port, zero-port lines kept rejected.
pub fn answer_for(offer: &SessionDescription) -> SessionDescription {
    let mut answer = SessionDescription::new("203.0.113.5", "peer");
    for (index, media) in offer.media.iter().enumerate() {
        let mut line = MediaDescription::new(
            media.media_type.clone(),
            if media.port == 0 { 0 } else { 20000 + (index as u16) * 2 },
            media.transport.clone(),
        );
        line.formats = media.formats.clone();
        line.connection = Some(Connection::new("203.0.113.5"));
        if media.media_type == "message" {
            line.attributes.push(crate::protocols::sdp::Attribute::new(
                "path",
                format!("msrp://203.0.113.5:{}/peer;tcp", line.port),
            ));
        }
        answer.media.push(line);
    }
    answer
}

/// A fresh audio offer as a remote party would send it.
pub fn remote_audio_offer() -> SessionDescription {
    let mut offer = SessionDescription::new("203.0.113.5", "peer");
    let mut media = MediaDescription::new("audio", 20000, "RTP/AVP");
    media.formats = vec!["0".to_string(), "8".to_string()];
    media.connection = Some(Connection::new("203.0.113.5"));
    offer.media.push(media);
    offer
}

/// Test configuration with one account and tight timeouts.
pub fn test_config() -> Arc<CoreConfig> {
    let mut config = CoreConfig::default();
    config.accounts.push(crate::config::AccountConfig::new("sip:alice@example.com"));
    config.session.disconnect_wait_secs = 1;
    Arc::new(config)
}

/// Next session notification on a bus subscription, with a one second guard.
pub async fn next_session_notification(
    sub: &mut crate::events::Subscription,
) -> crate::core::session::SessionNotification {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for a session notification")
            .expect("event bus closed");
        if let EventPayload::Session(notification) = event.payload {
            return notification;
        }
    }
}

/// Like [`next_session_notification`] but skipping transaction reports.
pub async fn next_lifecycle_notification(
    sub: &mut crate::events::Subscription,
) -> crate::core::session::SessionNotification {
    loop {
        let notification = next_session_notification(sub).await;
        if !matches!(
            notification,
            crate::core::session::SessionNotification::DidProcessTransaction { .. }
        ) {
            return notification;
        }
    }
}

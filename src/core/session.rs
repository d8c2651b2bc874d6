//! INVITE session state machine
//!
//! One [`Session`] per INVITE dialog. The session owns the dialog handle and
//! the set of active media streams, and drives every offer/answer flow: call
//! setup, mid-dialog proposals from either side, hold and resume, and
//! termination.
//!
//! All mutation happens on a single dialog worker task. Dialog and stream
//! events are routed from the bus into the session's queue, user operations
//! enqueue requests onto the same queue, and the worker consumes it in order,
//! so no two flows ever touch the session concurrently. User-facing methods
//! only validate state, advance it to the transitional value and hand off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{AccountConfig, CoreConfig};
use crate::events::{
    Event, EventBus, EventFilter, EventPayload, EventSink, SenderId, SenderSet, SinkResult,
    SubscriberId,
};
use crate::protocols::invitation::{
    status_reason, CallDirection, Credentials, Header, Invitation, InvitationEvent,
    InvitationFactory, InvitationState, InvitationStateEvent, InvitationSubState, InviteRequest,
    NegotiatedSdp, Originator, Route, SipAddress, Transport,
};
use crate::protocols::sdp::SessionDescription;
use crate::streams::{stream_for_media_line, MediaStream, MediaStreamEvent};
use crate::{Error, Result};

pub type SessionId = SenderId;
pub type StreamList = Vec<Arc<dyn MediaStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Null,
    Connecting,
    Incoming,
    Accepting,
    Connected,
    ReceivedProposal,
    AcceptingProposal,
    SendingProposal,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Null => "null",
            SessionState::Connecting => "connecting",
            SessionState::Incoming => "incoming",
            SessionState::Accepting => "accepting",
            SessionState::Connected => "connected",
            SessionState::ReceivedProposal => "received_proposal",
            SessionState::AcceptingProposal => "accepting_proposal",
            SessionState::SendingProposal => "sending_proposal",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The legal state graph. Termination is reachable from every live state.
pub fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    if from == to {
        return true;
    }
    if from != Terminated && matches!(to, Terminating | Terminated) {
        return from != Terminating || to == Terminated;
    }
    matches!(
        (from, to),
        (Null, Connecting)
            | (Null, Incoming)
            | (Connecting, Connected)
            | (Incoming, Accepting)
            | (Accepting, Connected)
            | (Connected, ReceivedProposal)
            | (Connected, SendingProposal)
            | (ReceivedProposal, AcceptingProposal)
            | (ReceivedProposal, Connected)
            | (AcceptingProposal, Connected)
            | (SendingProposal, Connected)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Add,
    Remove,
}

/// Observable session lifecycle, published on the bus with the session's id
/// as sender.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    NewIncoming { streams: StreamList },
    NewOutgoing { streams: StreamList },
    GotRingIndication,
    WillStart,
    DidStart { streams: StreamList },
    DidFail {
        originator: Originator,
        code: u16,
        reason: Option<String>,
        failure_reason: String,
    },
    WillEnd { originator: Originator },
    DidEnd { originator: Originator, end_reason: String },
    GotProposal { originator: Originator, streams: StreamList },
    GotAcceptProposal { originator: Originator, streams: StreamList },
    GotRejectProposal {
        originator: Originator,
        code: u16,
        reason: Option<String>,
        streams: StreamList,
    },
    HadProposalFailure {
        originator: Originator,
        reason: String,
        streams: StreamList,
    },
    DidChangeHoldState {
        originator: Originator,
        on_hold: bool,
        partial: bool,
    },
    DidRenegotiateStreams {
        originator: Originator,
        action: StreamAction,
        streams: StreamList,
    },
    DidProcessTransaction {
        originator: Originator,
        method: String,
        code: u16,
        reason: Option<String>,
        ack_received: Option<bool>,
    },
}

/// User operations handed to the dialog worker.
#[derive(Debug)]
enum SessionRequest {
    Connect {
        to: SipAddress,
        routes: Vec<Route>,
        streams: StreamList,
    },
    SendRingIndication,
    Accept { streams: StreamList },
    Reject { code: u16 },
    AcceptProposal { streams: StreamList },
    RejectProposal { code: u16 },
    AddStream { stream: Arc<dyn MediaStream> },
    RemoveStream { stream: Arc<dyn MediaStream> },
    Hold,
    Unhold,
    End,
}

/// One entry of the dialog queue: either a routed bus event or a request.
#[derive(Debug)]
enum SessionItem {
    Event(Event),
    Request(SessionRequest),
}

/// Adapter delivering bus events into the dialog queue.
struct SessionSink(mpsc::Sender<SessionItem>);

impl EventSink for SessionSink {
    fn deliver(&self, event: Event) -> SinkResult {
        match self.0.try_send(SessionItem::Event(event)) {
            Ok(()) => SinkResult::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SinkResult::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SinkResult::Closed,
        }
    }
}

/// Conditions that abort the current operation mid-flow.
#[derive(Debug)]
enum OpInterrupt {
    /// The user ended the session while an operation was in flight.
    Ended,
    /// The dialog reported an unsolicited disconnect.
    InvitationFailed(InvitationStateEvent),
    /// A media stream reported failure.
    MediaFailed { reason: String },
    /// SDP offer/answer came back unsuccessful.
    SdpFailed { error: String },
    /// The peer's re-INVITE won the race against a local proposal.
    PeerProposal,
    /// A signaling operation failed at the transport.
    Transport { error: String },
    /// The session queue is gone; the session is being torn down.
    ChannelClosed,
}

type OpResult<T> = std::result::Result<T, OpInterrupt>;

struct SharedState {
    state: SessionState,
    direction: Option<CallDirection>,
    on_hold: bool,
    hold_pending: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    route: Option<Route>,
    transport: Option<Transport>,
    local_identity: Option<SipAddress>,
    remote_identity: Option<SipAddress>,
}

/// One SIP INVITE session.
pub struct Session {
    id: SessionId,
    account: AccountConfig,
    config: Arc<CoreConfig>,
    bus: EventBus,
    factory: Arc<dyn InvitationFactory>,
    shared: Mutex<SharedState>,
    invitation: Mutex<Option<Arc<dyn Invitation>>>,
    streams: Mutex<StreamList>,
    proposed_streams: Mutex<Option<StreamList>>,
    watched: SenderSet,
    tx: mpsc::Sender<SessionItem>,
    subscriber: SubscriberId,
    finished: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("direction", &self.direction())
            .finish()
    }
}

impl Session {
    pub fn new(
        bus: EventBus,
        account: AccountConfig,
        config: Arc<CoreConfig>,
        factory: Arc<dyn InvitationFactory>,
    ) -> Arc<Self> {
        let id = SessionId::new();
        let watched: SenderSet = Arc::new(DashSet::new());
        let (tx, rx) = mpsc::channel(config.session.channel_capacity);
        let subscriber =
            bus.subscribe_with(EventFilter::senders(watched.clone()), SessionSink(tx.clone()));

        let session = Arc::new(Self {
            id,
            account,
            config,
            bus,
            factory,
            shared: Mutex::new(SharedState {
                state: SessionState::Null,
                direction: None,
                on_hold: false,
                hold_pending: false,
                start_time: None,
                end_time: None,
                route: None,
                transport: None,
                local_identity: None,
                remote_identity: None,
            }),
            invitation: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            proposed_streams: Mutex::new(None),
            watched,
            tx,
            subscriber,
            finished: AtomicBool::new(false),
        });

        let worker = DialogWorker { session: session.clone(), rx, stash: Vec::new() };
        tokio::spawn(worker.run());
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().unwrap().state
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.shared.lock().unwrap().direction
    }

    pub fn on_hold(&self) -> bool {
        self.shared.lock().unwrap().on_hold
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().unwrap().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().unwrap().end_time
    }

    pub fn route(&self) -> Option<Route> {
        self.shared.lock().unwrap().route.clone()
    }

    pub fn transport(&self) -> Option<Transport> {
        self.shared.lock().unwrap().transport
    }

    pub fn streams(&self) -> StreamList {
        self.streams.lock().unwrap().clone()
    }

    pub fn proposed_streams(&self) -> Option<StreamList> {
        self.proposed_streams.lock().unwrap().clone()
    }

    pub fn local_identity(&self) -> Option<SipAddress> {
        self.invitation()
            .and_then(|invitation| invitation.local_identity())
            .or_else(|| self.shared.lock().unwrap().local_identity.clone())
    }

    pub fn remote_identity(&self) -> Option<SipAddress> {
        self.invitation()
            .and_then(|invitation| invitation.remote_identity())
            .or_else(|| self.shared.lock().unwrap().remote_identity.clone())
    }

    pub fn remote_user_agent(&self) -> Option<String> {
        self.invitation().and_then(|invitation| invitation.remote_user_agent())
    }

    /// Start an outgoing call: propose `streams` to `to` through the first
    /// route. The call setup itself runs on the dialog worker; progress is
    /// reported through session notifications.
    pub async fn connect(
        &self,
        to: SipAddress,
        routes: Vec<Route>,
        streams: StreamList,
    ) -> Result<()> {
        if streams.is_empty() {
            return Err(Error::media("cannot connect without streams"));
        }
        let route = routes
            .first()
            .cloned()
            .ok_or_else(|| Error::sip("cannot connect without a route"))?;
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != SessionState::Null {
                return Err(Error::invalid_state(format!(
                    "cannot connect in {} state",
                    shared.state
                )));
            }
            shared.state = SessionState::Connecting;
            shared.direction = Some(CallDirection::Outgoing);
            shared.transport = Some(route.transport);
            shared.route = Some(route);
            shared.local_identity = Some(self.local_address());
            shared.remote_identity = Some(to.clone());
        }
        self.enqueue(SessionRequest::Connect { to, routes, streams }).await
    }

    /// Send `180 Ringing` for an incoming call being alerted.
    pub async fn send_ring_indication(&self) -> Result<()> {
        self.require_state(SessionState::Incoming, "send ring indication")?;
        self.enqueue(SessionRequest::SendRingIndication).await
    }

    /// Answer an incoming call with the accepted subset of the proposed
    /// streams.
    pub async fn accept(&self, streams: StreamList) -> Result<()> {
        if streams.is_empty() {
            return Err(Error::media("cannot accept without streams"));
        }
        self.guarded_transition(SessionState::Incoming, SessionState::Accepting, "accept")?;
        self.enqueue(SessionRequest::Accept { streams }).await
    }

    /// Decline an incoming call with the given response code.
    pub async fn reject(&self, code: u16) -> Result<()> {
        self.guarded_transition(SessionState::Incoming, SessionState::Terminating, "reject")?;
        self.enqueue(SessionRequest::Reject { code }).await
    }

    /// Accept a peer-proposed set of additional streams.
    pub async fn accept_proposal(&self, streams: StreamList) -> Result<()> {
        self.guarded_transition(
            SessionState::ReceivedProposal,
            SessionState::AcceptingProposal,
            "accept proposal",
        )?;
        self.enqueue(SessionRequest::AcceptProposal { streams }).await
    }

    /// Decline a peer-proposed stream change.
    pub async fn reject_proposal(&self, code: u16) -> Result<()> {
        self.require_state(SessionState::ReceivedProposal, "reject proposal")?;
        self.enqueue(SessionRequest::RejectProposal { code }).await
    }

    /// Offer one additional stream to the peer.
    pub async fn add_stream(&self, stream: Arc<dyn MediaStream>) -> Result<()> {
        self.guarded_transition(
            SessionState::Connected,
            SessionState::SendingProposal,
            "add stream",
        )?;
        self.enqueue(SessionRequest::AddStream { stream }).await
    }

    /// Withdraw one active stream from the session.
    pub async fn remove_stream(&self, stream: Arc<dyn MediaStream>) -> Result<()> {
        self.guarded_transition(
            SessionState::Connected,
            SessionState::SendingProposal,
            "remove stream",
        )?;
        self.enqueue(SessionRequest::RemoveStream { stream }).await
    }

    /// Put the session on hold. Outside `connected` the request stays pending
    /// and is sent once the session settles.
    pub async fn hold(&self) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.on_hold || shared.hold_pending || shared.state.is_terminal() {
                return Ok(());
            }
            shared.hold_pending = true;
        }
        self.enqueue(SessionRequest::Hold).await
    }

    /// Resume a held session.
    pub async fn unhold(&self) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if (!shared.on_hold && !shared.hold_pending) || shared.state.is_terminal() {
                return Ok(());
            }
            shared.hold_pending = false;
        }
        self.enqueue(SessionRequest::Unhold).await
    }

    /// Tear the session down. Always safe: cancels whatever operation is in
    /// flight, ends every stream and drives the dialog to `disconnected`.
    pub async fn end(&self) -> Result<()> {
        if self.state() == SessionState::Terminated {
            return Ok(());
        }
        self.enqueue(SessionRequest::End).await
    }

    /// Adopt an incoming dialog that the manager validated and answered
    /// `100 Trying`. The proposed streams already carry their media indexes.
    pub(crate) fn init_incoming(&self, invitation: Arc<dyn Invitation>, proposed: StreamList) {
        {
            let mut shared = self.shared.lock().unwrap();
            debug_assert!(transition_allowed(shared.state, SessionState::Incoming));
            shared.state = SessionState::Incoming;
            shared.direction = Some(CallDirection::Incoming);
            shared.transport = Some(invitation.transport());
            shared.local_identity = invitation.local_identity();
            shared.remote_identity = invitation.remote_identity();
        }
        self.watched.insert(invitation.id());
        *self.invitation.lock().unwrap() = Some(invitation);
        *self.proposed_streams.lock().unwrap() = Some(proposed.clone());
        info!(session = %self.id, streams = proposed.len(), "new incoming session");
        self.notify(SessionNotification::NewIncoming { streams: proposed });
    }

    fn local_address(&self) -> SipAddress {
        match &self.account.display_name {
            Some(name) => SipAddress::with_display_name(self.account.uri.clone(), name.clone()),
            None => SipAddress::new(self.account.uri.clone()),
        }
    }

    fn contact_address(&self) -> SipAddress {
        let user = self.account.address().split('@').next().unwrap_or("anonymous").to_string();
        SipAddress::new(format!("sip:{}@{}", user, self.config.general.local_address))
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.account.auth_username, &self.account.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    fn invitation(&self) -> Option<Arc<dyn Invitation>> {
        self.invitation.lock().unwrap().clone()
    }

    fn require_state(&self, required: SessionState, operation: &str) -> Result<()> {
        let state = self.state();
        if state != required {
            return Err(Error::invalid_state(format!("cannot {} in {} state", operation, state)));
        }
        Ok(())
    }

    /// Check-and-advance: verifies the session is in `required` and atomically
    /// moves it to `new` before the request is enqueued, so an illegal call
    /// surfaces synchronously and never mutates anything.
    fn guarded_transition(
        &self,
        required: SessionState,
        new: SessionState,
        operation: &str,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != required {
            return Err(Error::invalid_state(format!(
                "cannot {} in {} state",
                operation, shared.state
            )));
        }
        debug!(session = %self.id, from = %shared.state, to = %new, "session state changed");
        shared.state = new;
        Ok(())
    }

    fn set_state(&self, new: SessionState) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state == new {
            return;
        }
        debug_assert!(
            transition_allowed(shared.state, new),
            "illegal transition {} -> {}",
            shared.state,
            new
        );
        debug!(session = %self.id, from = %shared.state, to = %new, "session state changed");
        shared.state = new;
    }

    fn hold_pending(&self) -> bool {
        self.shared.lock().unwrap().hold_pending
    }

    fn clear_hold_pending(&self) {
        self.shared.lock().unwrap().hold_pending = false;
    }

    fn notify(&self, notification: SessionNotification) {
        // Nothing may be announced for a session that already reported its
        // final outcome.
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if matches!(
            notification,
            SessionNotification::DidEnd { .. } | SessionNotification::DidFail { .. }
        ) {
            self.finished.store(true, Ordering::Release);
        }
        trace!(session = %self.id, ?notification, "session notification");
        self.bus.publish(Event::new(self.id, EventPayload::Session(notification)));
    }

    fn notify_transaction(
        &self,
        originator: Originator,
        method: &str,
        code: u16,
        reason: Option<String>,
        ack_received: Option<bool>,
    ) {
        self.notify(SessionNotification::DidProcessTransaction {
            originator,
            method: method.to_string(),
            code,
            reason,
            ack_received,
        });
    }

    async fn enqueue(&self, request: SessionRequest) -> Result<()> {
        self.tx
            .send(SessionItem::Request(request))
            .await
            .map_err(|_| Error::invalid_state("session is terminated"))
    }

    fn take_proposed(&self) -> Option<StreamList> {
        self.proposed_streams.lock().unwrap().take()
    }

    fn set_proposed(&self, streams: Option<StreamList>) {
        *self.proposed_streams.lock().unwrap() = streams;
    }

    fn stream_at(&self, index: usize) -> Option<Arc<dyn MediaStream>> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .find(|stream| stream.index() == Some(index))
            .cloned()
    }

    fn watch_stream(&self, stream: &Arc<dyn MediaStream>) {
        self.watched.insert(stream.id());
    }

    fn unwatch(&self, id: SenderId) {
        self.watched.remove(&id);
    }

    /// Streams whose remote description currently holds them, used to detect
    /// remote hold state changes across renegotiations.
    fn held_by_remote(&self) -> BTreeSet<SenderId> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|stream| stream.hold_supported() && stream.on_hold_by_remote())
            .map(|stream| stream.id())
            .collect()
    }
}

/// Outcome classification for one queue item during a nested wait.
enum Classified {
    Deliver(Event),
    Consumed,
    Interrupt(OpInterrupt),
}

/// The single task that owns a session's mutations.
struct DialogWorker {
    session: Arc<Session>,
    rx: mpsc::Receiver<SessionItem>,
    stash: Vec<Event>,
}

impl DialogWorker {
    async fn run(mut self) {
        loop {
            let item = if !self.stash.is_empty() {
                SessionItem::Event(self.stash.remove(0))
            } else {
                match self.rx.recv().await {
                    Some(item) => item,
                    None => break,
                }
            };
            match item {
                SessionItem::Request(request) => self.apply_request(request).await,
                SessionItem::Event(event) => self.handle_idle_event(event).await,
            }
            if self.session.state() == SessionState::Terminated {
                break;
            }
        }
        self.session.bus.unsubscribe(self.session.subscriber);
        debug!(session = %self.session.id, "dialog worker finished");
    }

    async fn apply_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Connect { to, routes, streams } => {
                self.op_connect(to, routes, streams).await
            }
            SessionRequest::SendRingIndication => self.op_send_ring_indication().await,
            SessionRequest::Accept { streams } => self.op_accept(streams).await,
            SessionRequest::Reject { code } => self.op_reject(code).await,
            SessionRequest::AcceptProposal { streams } => self.op_accept_proposal(streams).await,
            SessionRequest::RejectProposal { code } => self.op_reject_proposal(code).await,
            SessionRequest::AddStream { stream } => self.op_add_stream(stream).await,
            SessionRequest::RemoveStream { stream } => self.op_remove_stream(stream).await,
            SessionRequest::Hold => self.op_hold().await,
            SessionRequest::Unhold => self.op_unhold().await,
            SessionRequest::End => self.finish_end().await,
        }
    }

    // ------------------------------------------------------------------
    // queue plumbing

    fn classify(&mut self, item: SessionItem, glare_aborts: bool) -> Classified {
        match item {
            SessionItem::Request(SessionRequest::End) => Classified::Interrupt(OpInterrupt::Ended),
            SessionItem::Request(SessionRequest::Hold) => {
                self.mark_hold_requested();
                Classified::Consumed
            }
            SessionItem::Request(SessionRequest::Unhold) => {
                self.mark_unhold_requested();
                Classified::Consumed
            }
            SessionItem::Request(other) => {
                // State guards at the call sites make this unreachable short
                // of a request that raced a state change; drop it.
                warn!(session = %self.session.id, request = ?other,
                    "dropping request received mid-operation");
                Classified::Consumed
            }
            SessionItem::Event(event) => match &event.payload {
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) if e.is_failure() => {
                    Classified::Interrupt(OpInterrupt::InvitationFailed(e.clone()))
                }
                EventPayload::Invitation(InvitationEvent::StateChanged(e))
                    if glare_aborts
                        && e.state == InvitationState::Connected
                        && e.sub_state == Some(InvitationSubState::ReceivedProposal) =>
                {
                    Classified::Interrupt(OpInterrupt::PeerProposal)
                }
                EventPayload::Media(MediaStreamEvent::DidFail { reason }) => {
                    Classified::Interrupt(OpInterrupt::MediaFailed { reason: reason.clone() })
                }
                _ => Classified::Deliver(event),
            },
        }
    }

    async fn wait_event(&mut self, glare_aborts: bool) -> OpResult<Event> {
        loop {
            let item = match self.rx.recv().await {
                Some(item) => item,
                None => return Err(OpInterrupt::ChannelClosed),
            };
            match self.classify(item, glare_aborts) {
                Classified::Deliver(event) => return Ok(event),
                Classified::Consumed => continue,
                Classified::Interrupt(interrupt) => return Err(interrupt),
            }
        }
    }

    /// Non-blocking variant used to drain whatever is already queued before
    /// an operation commits.
    fn try_event(&mut self, glare_aborts: bool) -> OpResult<Option<Event>> {
        loop {
            let item = match self.rx.try_recv() {
                Ok(item) => item,
                Err(_) => return Ok(None),
            };
            match self.classify(item, glare_aborts) {
                Classified::Deliver(event) => return Ok(Some(event)),
                Classified::Consumed => continue,
                Classified::Interrupt(interrupt) => return Err(interrupt),
            }
        }
    }

    fn mark_hold_requested(&self) {
        let session = &self.session;
        for stream in session.streams() {
            stream.hold();
        }
        if let Some(proposed) = session.proposed_streams() {
            for stream in proposed {
                stream.hold();
            }
        }
        session.shared.lock().unwrap().hold_pending = true;
    }

    fn mark_unhold_requested(&self) {
        let session = &self.session;
        for stream in session.streams() {
            stream.unhold();
        }
        if let Some(proposed) = session.proposed_streams() {
            for stream in proposed {
                stream.unhold();
            }
        }
        session.shared.lock().unwrap().hold_pending = false;
    }

    /// Bounded wait for the dialog to reach `disconnected`, used after
    /// rejects, local ends and failures.
    async fn wait_for_disconnect(&mut self) -> Option<InvitationStateEvent> {
        let wait = Duration::from_secs(self.session.config.session.disconnect_wait_secs);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) | Ok(None) => return None,
                Ok(Some(SessionItem::Event(event))) => {
                    if let EventPayload::Invitation(InvitationEvent::StateChanged(e)) =
                        event.payload
                    {
                        if e.state == InvitationState::Disconnected {
                            return Some(e);
                        }
                    }
                }
                Ok(Some(SessionItem::Request(_))) => {}
            }
        }
    }

    async fn end_streams(&self, streams: &[Arc<dyn MediaStream>]) {
        for stream in streams {
            self.session.unwatch(stream.id());
            stream.end().await;
        }
    }

    async fn end_all_streams(&self) {
        let active = self.session.streams();
        self.end_streams(&active).await;
        self.session.streams.lock().unwrap().clear();
        if let Some(proposed) = self.session.take_proposed() {
            self.end_streams(&proposed).await;
        }
    }

    // ------------------------------------------------------------------
    // idle event handling

    async fn handle_idle_event(&mut self, event: Event) {
        match event.payload {
            EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                if e.state == InvitationState::Connected
                    && e.sub_state == Some(InvitationSubState::ReceivedProposal)
                    && self.session.state() == SessionState::Connected
                {
                    self.handle_received_proposal().await;
                } else if e.state == InvitationState::Disconnected {
                    self.handle_remote_disconnect(e).await;
                } else {
                    trace!(session = %self.session.id, event = ?e, "ignoring dialog event");
                }
            }
            EventPayload::Media(MediaStreamEvent::DidFail { reason }) => {
                if !self.session.state().is_terminal() {
                    warn!(session = %self.session.id, reason, "media stream failed");
                    self.end_all_streams().await;
                    self.fail(Originator::Local, 0, None, format!("media stream failed: {}", reason))
                        .await;
                }
            }
            EventPayload::Media(other) => {
                trace!(session = %self.session.id, event = ?other, "ignoring media event");
            }
            EventPayload::Invitation(other) => {
                trace!(session = %self.session.id, event = ?other, "ignoring dialog event");
            }
            EventPayload::Session(_) => {}
        }
    }

    /// The dialog disconnected while no operation was waiting: a remote BYE,
    /// a remote CANCEL of an unanswered call, or a transport-level failure.
    async fn handle_remote_disconnect(&mut self, e: InvitationStateEvent) {
        let session = self.session.clone();
        match session.state() {
            SessionState::Terminated => {}
            SessionState::Incoming => {
                if let Some(proposed) = session.take_proposed() {
                    self.end_streams(&proposed).await;
                }
                self.unwatch_invitation();
                session.set_state(SessionState::Terminated);
                if e.originator == Originator::Remote {
                    session.notify_transaction(
                        Originator::Remote,
                        "INVITE",
                        487,
                        Some("Canceled".to_string()),
                        None,
                    );
                    session.notify(SessionNotification::DidFail {
                        originator: Originator::Remote,
                        code: 487,
                        reason: Some("Canceled".to_string()),
                        failure_reason: "user request".to_string(),
                    });
                } else {
                    session.notify(SessionNotification::DidFail {
                        originator: Originator::Local,
                        code: 0,
                        reason: None,
                        failure_reason: disconnect_reason(&e),
                    });
                }
            }
            _ => {
                session.notify(SessionNotification::WillEnd { originator: e.originator });
                self.end_all_streams().await;
                self.unwatch_invitation();
                session.set_state(SessionState::Terminated);
                if e.originator == Originator::Remote {
                    let method = e.method.clone().unwrap_or_else(|| "BYE".to_string());
                    session.notify_transaction(
                        Originator::Remote,
                        &method,
                        200,
                        Some(status_reason(200).to_string()),
                        None,
                    );
                }
                session.shared.lock().unwrap().end_time = Some(Utc::now());
                session.notify(SessionNotification::DidEnd {
                    originator: e.originator,
                    end_reason: disconnect_reason(&e),
                });
            }
        }
    }

    fn unwatch_invitation(&self) {
        if let Some(invitation) = self.session.invitation() {
            self.session.unwatch(invitation.id());
        }
    }

    // ------------------------------------------------------------------
    // outgoing call setup

    async fn op_connect(&mut self, to: SipAddress, _routes: Vec<Route>, streams: StreamList) {
        let session = self.session.clone();
        session.set_proposed(Some(streams.clone()));
        session.notify(SessionNotification::NewOutgoing { streams });

        let mut cx = EstablishCx::default();
        match self.connect_flow(to, &mut cx).await {
            Ok(()) => {
                self.commit_established().await;
            }
            Err(interrupt) => self.connect_interrupt(interrupt, &cx).await,
        }
    }

    async fn connect_flow(&mut self, to: SipAddress, cx: &mut EstablishCx) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .factory
            .create_outgoing()
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;
        session.watched.insert(invitation.id());
        *session.invitation.lock().unwrap() = Some(invitation.clone());

        let proposed = session.proposed_streams().unwrap_or_default();
        for (index, stream) in proposed.iter().enumerate() {
            stream.set_index(index);
            session.watch_stream(stream);
            stream
                .initialize(session.bus.clone())
                .await
                .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
        }
        self.wait_initialized(proposed.len()).await?;

        let mut local_sdp = SessionDescription::new(
            session.config.general.local_address.clone(),
            session.config.general.user_agent.clone(),
        );
        let mut reflexive = None;
        for stream in &proposed {
            let media = stream.local_media(true);
            if reflexive.is_none() {
                reflexive = media.server_reflexive_address();
            }
            local_sdp.media.push(media);
        }
        if let Some(address) = reflexive {
            local_sdp.set_connection_address(address);
        }

        let route = session
            .route()
            .ok_or(OpInterrupt::Transport { error: "no route to destination".to_string() })?;
        invitation
            .send_invite(InviteRequest {
                from: session.local_address(),
                to,
                route,
                contact: session.contact_address(),
                sdp: local_sdp,
                credentials: session.credentials(),
            })
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;

        // Offer sent; wait for the answer.
        let negotiated = loop {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Invitation(InvitationEvent::SdpUpdate(update)) => {
                    match update.result {
                        Ok(negotiated) => break negotiated,
                        Err(error) => return Err(OpInterrupt::SdpFailed { error }),
                    }
                }
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    self.outgoing_progress(&e, cx);
                }
                _ => self.stash.push(event),
            }
        };

        session.notify(SessionNotification::WillStart);
        let mut started = self.start_streams(&negotiated).await?;
        while started > 0 || !cx.connected {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidStart) => started -= 1,
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    self.outgoing_progress(&e, cx);
                }
                _ => self.stash.push(event),
            }
        }
        while let Some(event) = self.try_event(false)? {
            match event.payload {
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    self.outgoing_progress(&e, cx);
                }
                _ => self.stash.push(event),
            }
        }
        Ok(())
    }

    /// Progress reporting shared by the outgoing setup wait loops.
    fn outgoing_progress(&mut self, e: &InvitationStateEvent, cx: &mut EstablishCx) {
        match e.state {
            InvitationState::Early if e.code == 180 => {
                self.session.notify(SessionNotification::GotRingIndication);
            }
            InvitationState::Connecting => {
                cx.received_code = e.code;
                cx.received_reason = e.reason.clone();
            }
            InvitationState::Connected if !cx.connected => {
                cx.connected = true;
                self.session.notify_transaction(
                    Originator::Local,
                    "INVITE",
                    cx.received_code,
                    cx.received_reason.clone(),
                    None,
                );
            }
            _ => {}
        }
    }

    async fn connect_interrupt(&mut self, interrupt: OpInterrupt, cx: &EstablishCx) {
        let session = self.session.clone();
        match interrupt {
            OpInterrupt::Ended => self.finish_end().await,
            OpInterrupt::ChannelClosed => session.set_state(SessionState::Terminated),
            // No re-INVITE can arrive before the dialog exists.
            OpInterrupt::PeerProposal => {}
            OpInterrupt::MediaFailed { reason } => {
                self.end_all_streams().await;
                self.fail(
                    Originator::Local,
                    cx.received_code,
                    cx.received_reason.clone(),
                    format!("media stream failed: {}", reason),
                )
                .await;
            }
            OpInterrupt::SdpFailed { error } => {
                self.end_all_streams().await;
                self.fail(
                    Originator::Remote,
                    cx.received_code,
                    cx.received_reason.clone(),
                    format!("SDP negotiation failed: {}", error),
                )
                .await;
            }
            OpInterrupt::Transport { error } => {
                self.end_all_streams().await;
                self.fail(
                    Originator::Local,
                    cx.received_code,
                    cx.received_reason.clone(),
                    format!("transport error: {}", error),
                )
                .await;
            }
            OpInterrupt::InvitationFailed(e) => {
                self.unwatch_invitation();
                self.end_all_streams().await;
                session.set_state(SessionState::Terminated);
                if matches!(
                    e.prev_state,
                    Some(InvitationState::Connecting) | Some(InvitationState::Connected)
                ) {
                    session.notify(SessionNotification::WillEnd { originator: e.originator });
                    if e.originator == Originator::Remote {
                        let method = e.method.clone().unwrap_or_else(|| "BYE".to_string());
                        session.notify_transaction(
                            Originator::Remote,
                            &method,
                            200,
                            Some(status_reason(200).to_string()),
                            None,
                        );
                    }
                    session.shared.lock().unwrap().end_time = Some(Utc::now());
                    session.notify(SessionNotification::DidEnd {
                        originator: e.originator,
                        end_reason: disconnect_reason(&e),
                    });
                } else {
                    if e.originator == Originator::Remote {
                        session.notify_transaction(
                            Originator::Local,
                            "INVITE",
                            e.code,
                            e.reason.clone(),
                            None,
                        );
                    }
                    let (code, reason) = match e.originator {
                        Originator::Remote => (e.code, e.reason.clone()),
                        Originator::Local => (0, None),
                    };
                    session.notify(SessionNotification::DidFail {
                        originator: e.originator,
                        code,
                        reason,
                        failure_reason: disconnect_reason(&e),
                    });
                }
            }
        }
    }

    async fn wait_initialized(&mut self, count: usize) -> OpResult<()> {
        let mut remaining = count;
        while remaining > 0 {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidInitialize) => remaining -= 1,
                _ => self.stash.push(event),
            }
        }
        Ok(())
    }

    /// Start every proposed stream the answer accepted; end the ones it
    /// declined with a zero port or left out entirely. Returns the number of
    /// `DidStart` events to wait for.
    async fn start_streams(&mut self, negotiated: &NegotiatedSdp) -> OpResult<usize> {
        let session = self.session.clone();
        let proposed = session.proposed_streams().unwrap_or_default();
        let mut surviving = Vec::new();
        let mut started = 0;
        for stream in proposed {
            let index = match stream.index() {
                Some(index) if index < negotiated.local.media.len() => index,
                _ => {
                    self.end_streams(&[stream]).await;
                    continue;
                }
            };
            let remote_port =
                negotiated.remote.media.get(index).map(|media| media.port).unwrap_or(0);
            if remote_port == 0 {
                self.end_streams(&[stream]).await;
                continue;
            }
            stream
                .start(&negotiated.local, &negotiated.remote, index)
                .await
                .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
            started += 1;
            surviving.push(stream);
        }
        session.set_proposed(Some(surviving));
        Ok(started)
    }

    /// Promote the proposed streams and report the session established.
    async fn commit_established(&mut self) {
        let session = self.session.clone();
        let streams = session.take_proposed().unwrap_or_default();
        *session.streams.lock().unwrap() = streams.clone();
        session.set_state(SessionState::Connected);
        session.shared.lock().unwrap().start_time = Some(Utc::now());
        info!(session = %session.id, streams = streams.len(), "session established");
        session.notify(SessionNotification::DidStart { streams });
        self.maybe_send_hold().await;
    }

    // ------------------------------------------------------------------
    // incoming call handling

    async fn op_send_ring_indication(&mut self) {
        if let Some(invitation) = self.session.invitation() {
            // The INVITE may already have been canceled; the disconnect event
            // will follow on the queue.
            if let Err(e) = invitation.send_response(180, None, Vec::new()).await {
                debug!(session = %self.session.id, error = %e, "could not send ring indication");
            }
        }
    }

    async fn op_accept(&mut self, streams: StreamList) {
        let mut cx = EstablishCx::default();
        match self.accept_flow(streams, &mut cx).await {
            Ok(()) => {
                self.commit_established().await;
            }
            Err(interrupt) => self.accept_interrupt(interrupt, &cx).await,
        }
    }

    async fn accept_flow(&mut self, selected: StreamList, cx: &mut EstablishCx) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .invitation()
            .ok_or(OpInterrupt::Transport { error: "no dialog".to_string() })?;

        let mut kept = Vec::new();
        match session.take_proposed() {
            Some(offered) if !offered.is_empty() => {
                for stream in offered {
                    if selected.iter().any(|s| s.id() == stream.id()) {
                        session.watch_stream(&stream);
                        stream
                            .initialize(session.bus.clone())
                            .await
                            .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
                        kept.push(stream);
                    } else {
                        stream.end().await;
                    }
                }
            }
            _ => {
                // Offerless INVITE: we make the offer, the ACK answers.
                for (index, stream) in selected.into_iter().enumerate() {
                    stream.set_index(index);
                    session.watch_stream(&stream);
                    stream
                        .initialize(session.bus.clone())
                        .await
                        .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
                    kept.push(stream);
                }
            }
        }
        session.set_proposed(Some(kept.clone()));
        self.wait_initialized(kept.len()).await?;

        let mut local_sdp = SessionDescription::new(
            session.config.general.local_address.clone(),
            session.config.general.user_agent.clone(),
        );
        let mut reflexive = None;
        match invitation.sdp().proposed_remote {
            Some(remote) => {
                for (index, media) in remote.media.iter().enumerate() {
                    match kept.iter().find(|stream| stream.index() == Some(index)) {
                        Some(stream) => {
                            let media = stream.local_media(false);
                            if reflexive.is_none() {
                                reflexive = media.server_reflexive_address();
                            }
                            local_sdp.media.push(media);
                        }
                        None => local_sdp.media.push(media.rejected()),
                    }
                }
            }
            None => {
                for stream in &kept {
                    let media = stream.local_media(true);
                    if reflexive.is_none() {
                        reflexive = media.server_reflexive_address();
                    }
                    local_sdp.media.push(media);
                }
            }
        }
        if let Some(address) = reflexive {
            local_sdp.set_connection_address(address);
        }
        invitation
            .send_response(200, Some(local_sdp), Vec::new())
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;
        session.notify(SessionNotification::WillStart);

        // With an offer in the INVITE the answer we just sent completes
        // negotiation; with an offerless INVITE it arrives in the ACK.
        let slots = invitation.sdp();
        let negotiated = match (slots.active_local, slots.active_remote) {
            (Some(local), Some(remote)) => NegotiatedSdp { local, remote },
            _ => loop {
                let event = self.wait_event(false).await?;
                match event.payload {
                    EventPayload::Invitation(InvitationEvent::SdpUpdate(update)) => {
                        match update.result {
                            Ok(negotiated) => break negotiated,
                            Err(error) => {
                                // An SDP answer implies the ACK arrived.
                                self.incoming_confirmed(cx);
                                return Err(OpInterrupt::SdpFailed { error });
                            }
                        }
                    }
                    EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                        if e.state == InvitationState::Connected {
                            self.incoming_confirmed(cx);
                        }
                    }
                    _ => self.stash.push(event),
                }
            },
        };

        let mut started = self.start_streams(&negotiated).await?;
        while started > 0 || !cx.connected {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidStart) => started -= 1,
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    if e.state == InvitationState::Connected {
                        self.incoming_confirmed(cx);
                    }
                }
                _ => self.stash.push(event),
            }
        }
        while let Some(event) = self.try_event(false)? {
            match event.payload {
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    if e.state == InvitationState::Connected {
                        self.incoming_confirmed(cx);
                    }
                }
                _ => self.stash.push(event),
            }
        }
        Ok(())
    }

    fn incoming_confirmed(&mut self, cx: &mut EstablishCx) {
        if !cx.connected {
            cx.connected = true;
            self.session.notify_transaction(
                Originator::Remote,
                "INVITE",
                200,
                Some(status_reason(200).to_string()),
                Some(true),
            );
        }
    }

    async fn accept_interrupt(&mut self, interrupt: OpInterrupt, _cx: &EstablishCx) {
        let session = self.session.clone();
        let invitation = session.invitation();
        // Whether the dialog got past the early phase decides between a
        // failed-call report and a torn-down-established-call report.
        let early = invitation
            .as_ref()
            .map(|i| matches!(i.state(), InvitationState::Incoming | InvitationState::Early))
            .unwrap_or(true);
        let (code, reason) = if early {
            (0, None)
        } else {
            (200, Some(status_reason(200).to_string()))
        };
        match interrupt {
            OpInterrupt::Ended => self.finish_end().await,
            OpInterrupt::ChannelClosed => session.set_state(SessionState::Terminated),
            // No re-INVITE can arrive during call setup.
            OpInterrupt::PeerProposal => {}
            OpInterrupt::MediaFailed { reason: media_reason } => {
                self.end_all_streams().await;
                self.fail(
                    Originator::Local,
                    code,
                    reason,
                    format!("media stream failed: {}", media_reason),
                )
                .await;
            }
            OpInterrupt::SdpFailed { error } => {
                self.end_all_streams().await;
                self.fail(
                    Originator::Remote,
                    200,
                    Some(status_reason(200).to_string()),
                    format!("SDP negotiation failed: {}", error),
                )
                .await;
            }
            OpInterrupt::Transport { error } => {
                self.end_all_streams().await;
                self.fail(Originator::Local, code, reason, format!("transport error: {}", error))
                    .await;
            }
            OpInterrupt::InvitationFailed(e) => {
                self.unwatch_invitation();
                self.end_all_streams().await;
                session.set_state(SessionState::Terminated);
                if matches!(
                    e.prev_state,
                    Some(InvitationState::Incoming) | Some(InvitationState::Early)
                ) {
                    session.notify_transaction(
                        Originator::Remote,
                        "INVITE",
                        487,
                        Some("Canceled".to_string()),
                        None,
                    );
                    session.notify(SessionNotification::DidFail {
                        originator: Originator::Remote,
                        code: 487,
                        reason: Some("Canceled".to_string()),
                        failure_reason: disconnect_reason(&e),
                    });
                } else if e.prev_state == Some(InvitationState::Connecting)
                    && e.disconnect_reason.as_deref() == Some("missing ACK")
                {
                    session.notify_transaction(
                        Originator::Remote,
                        "INVITE",
                        200,
                        Some(status_reason(200).to_string()),
                        Some(false),
                    );
                    session.notify(SessionNotification::DidFail {
                        originator: Originator::Local,
                        code: 200,
                        reason: Some(status_reason(200).to_string()),
                        failure_reason: disconnect_reason(&e),
                    });
                } else {
                    session.notify(SessionNotification::WillEnd { originator: Originator::Remote });
                    let method = e.method.clone().unwrap_or_else(|| "BYE".to_string());
                    session.notify_transaction(
                        Originator::Remote,
                        &method,
                        200,
                        Some(status_reason(200).to_string()),
                        None,
                    );
                    session.shared.lock().unwrap().end_time = Some(Utc::now());
                    session.notify(SessionNotification::DidEnd {
                        originator: Originator::Remote,
                        end_reason: disconnect_reason(&e),
                    });
                }
            }
        }
    }

    async fn op_reject(&mut self, code: u16) {
        let session = self.session.clone();
        if let Some(proposed) = session.take_proposed() {
            for stream in proposed {
                stream.end().await;
            }
        }
        let Some(invitation) = session.invitation() else {
            session.set_state(SessionState::Terminated);
            return;
        };
        if let Err(e) = invitation.send_response(code, None, Vec::new()).await {
            self.fail(Originator::Local, 0, None, format!("transport error: {}", e)).await;
            return;
        }
        let reason = Some(status_reason(code).to_string());
        match self.wait_for_disconnect().await {
            Some(e) => {
                let ack_received = e.disconnect_reason.as_deref() != Some("missing ACK");
                session.notify_transaction(
                    Originator::Remote,
                    "INVITE",
                    code,
                    reason.clone(),
                    Some(ack_received),
                );
            }
            None => {
                session.notify_transaction(
                    Originator::Remote,
                    "INVITE",
                    code,
                    reason.clone(),
                    Some(false),
                );
            }
        }
        self.unwatch_invitation();
        session.set_state(SessionState::Terminated);
        session.notify(SessionNotification::DidFail {
            originator: Originator::Local,
            code,
            reason,
            failure_reason: "user request".to_string(),
        });
    }

    // ------------------------------------------------------------------
    // peer-initiated re-INVITE

    async fn handle_received_proposal(&mut self) {
        let session = self.session.clone();
        let Some(invitation) = session.invitation() else { return };
        session.set_state(SessionState::ReceivedProposal);

        let slots = invitation.sdp();
        let (proposed_remote, active_remote) = match (slots.proposed_remote, slots.active_remote) {
            (Some(proposed), Some(active)) => (proposed, active),
            _ => {
                let _ = invitation.send_response(200, slots.active_local, Vec::new()).await;
                session.set_state(SessionState::Connected);
                return;
            }
        };

        // A re-INVITE that does not advance the SDP version just refreshes
        // the dialog.
        if proposed_remote.origin.version <= active_remote.origin.version {
            let _ = invitation.send_response(200, invitation.sdp().active_local, Vec::new()).await;
            session.notify_transaction(
                Originator::Remote,
                "INVITE",
                200,
                Some(status_reason(200).to_string()),
                None,
            );
            session.set_state(SessionState::Connected);
            return;
        }

        for stream in session.streams() {
            let index = stream.index().unwrap_or(usize::MAX);
            if !stream.validate_update(&proposed_remote, index) {
                self.answer_488(
                    &invitation,
                    format!("Failed to update media stream index {}", index),
                )
                .await;
                return;
            }
        }
        if !proposed_remote.origin.same_owner(&active_remote.origin) {
            self.answer_488(&invitation, "Difference in contents of o= line".to_string()).await;
            return;
        }

        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for (index, media) in proposed_remote.media.iter().enumerate() {
            match active_remote.media.get(index) {
                None => {
                    added.insert(index);
                }
                Some(active) if media.media_type != active.media_type => {
                    added.insert(index);
                    removed.insert(index);
                }
                Some(active) if media.port == 0 && active.port != 0 => {
                    removed.insert(index);
                }
                _ => {}
            }
        }
        for index in proposed_remote.media.len()..active_remote.media.len() {
            removed.insert(index);
        }

        if !added.is_empty() && !removed.is_empty() {
            self.answer_488(
                &invitation,
                "Both removing and adding media streams is not supported".to_string(),
            )
            .await;
            return;
        }

        if !added.is_empty() {
            let mut new_streams: StreamList = Vec::new();
            for index in added {
                let media = &proposed_remote.media[index];
                if media.port == 0 {
                    continue;
                }
                if let Some(stream) = stream_for_media_line(&proposed_remote, index, &session.config)
                {
                    if stream.validate_incoming(&proposed_remote, index) {
                        stream.set_index(index);
                        new_streams.push(stream);
                    }
                }
            }
            if new_streams.is_empty() {
                self.answer_488(&invitation, "No acceptable media streams".to_string()).await;
                return;
            }
            // A hold that was requested but not yet offered lost the race.
            if session.hold_pending() {
                self.mark_unhold_requested();
                session.notify(SessionNotification::HadProposalFailure {
                    originator: Originator::Local,
                    reason: "received stream proposal".to_string(),
                    streams: Vec::new(),
                });
            }
            session.set_proposed(Some(new_streams.clone()));
            session.notify(SessionNotification::GotProposal {
                originator: Originator::Remote,
                streams: new_streams,
            });
            // Stay in received_proposal until the application decides.
            return;
        }

        // Only removals (or a plain refresh): answer immediately.
        let Some(mut local_sdp) = invitation.sdp().active_local else {
            session.set_state(SessionState::Connected);
            return;
        };
        local_sdp.bump_version();
        let removed_streams: StreamList = session
            .streams()
            .into_iter()
            .filter(|stream| stream.index().map(|i| removed.contains(&i)).unwrap_or(false))
            .collect();
        let prev_held = session.held_by_remote();
        for stream in &removed_streams {
            session.unwatch(stream.id());
            stream.end().await;
            session.streams.lock().unwrap().retain(|s| s.id() != stream.id());
            if let Some(index) = stream.index() {
                if let Some(media) = local_sdp.media.get_mut(index) {
                    media.port = 0;
                }
            }
        }
        for stream in session.streams() {
            if let Some(index) = stream.index() {
                if let Some(media) = local_sdp.media.get_mut(index) {
                    *media = stream.local_media(false);
                }
            }
        }
        if let Err(e) = invitation.send_response(200, Some(local_sdp), Vec::new()).await {
            self.end_all_streams().await;
            self.fail(Originator::Local, 0, None, format!("transport error: {}", e)).await;
            return;
        }
        session.notify_transaction(
            Originator::Remote,
            "INVITE",
            200,
            Some(status_reason(200).to_string()),
            None,
        );

        match self.wait_renegotiation_settled(false, false).await {
            Ok(negotiated) => {
                if let Some(negotiated) = negotiated {
                    for stream in session.streams() {
                        if let Some(index) = stream.index() {
                            let _ =
                                stream.update(&negotiated.local, &negotiated.remote, index).await;
                        }
                    }
                }
                self.report_remote_hold_changes(prev_held);
                if !removed_streams.is_empty() {
                    session.notify(SessionNotification::DidRenegotiateStreams {
                        originator: Originator::Remote,
                        action: StreamAction::Remove,
                        streams: removed_streams,
                    });
                }
                session.set_state(SessionState::Connected);
                self.maybe_send_hold().await;
            }
            Err(interrupt) => self.renegotiation_interrupt(interrupt).await,
        }
    }

    async fn answer_488(&mut self, invitation: &Arc<dyn Invitation>, warning: String) {
        let session = self.session.clone();
        let header = Header::warning(399, session.config.general.user_agent.clone(), warning);
        let _ = invitation.send_response(488, None, vec![header]).await;
        session.set_state(SessionState::Connected);
        session.notify_transaction(
            Originator::Remote,
            "INVITE",
            488,
            Some(status_reason(488).to_string()),
            None,
        );
    }

    /// Wait until a re-INVITE transaction fully settles: one SDP exchange
    /// outcome and the dialog back in its normal sub-state. Local proposals
    /// pass `glare_aborts` so a competing peer offer abandons them.
    async fn wait_renegotiation_settled(
        &mut self,
        glare_aborts: bool,
        report_local_transaction: bool,
    ) -> OpResult<Option<NegotiatedSdp>> {
        let mut negotiated = None;
        let mut got_update = false;
        let mut got_state = false;
        while !got_update || !got_state {
            let event = self.wait_event(glare_aborts).await?;
            match event.payload {
                EventPayload::Invitation(InvitationEvent::SdpUpdate(update)) => {
                    got_update = true;
                    match update.result {
                        Ok(result) => negotiated = Some(result),
                        Err(error) => return Err(OpInterrupt::SdpFailed { error }),
                    }
                }
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    if e.state == InvitationState::Connected
                        && e.sub_state == Some(InvitationSubState::Normal)
                    {
                        got_state = true;
                        if report_local_transaction {
                            self.session.notify_transaction(
                                Originator::Local,
                                "INVITE",
                                e.code,
                                e.reason.clone(),
                                None,
                            );
                        }
                    }
                }
                _ => self.stash.push(event),
            }
        }
        Ok(negotiated)
    }

    fn report_remote_hold_changes(&self, prev_held: BTreeSet<SenderId>) {
        let session = &self.session;
        let now_held = session.held_by_remote();
        if now_held == prev_held {
            return;
        }
        let streams = session.streams();
        let any_held = !now_held.is_empty();
        let partial = any_held
            && streams
                .iter()
                .any(|stream| stream.hold_supported() && !stream.on_hold_by_remote());
        session.notify(SessionNotification::DidChangeHoldState {
            originator: Originator::Remote,
            on_hold: any_held,
            partial,
        });
    }

    // ------------------------------------------------------------------
    // proposal decisions

    async fn op_accept_proposal(&mut self, selected: StreamList) {
        match self.accept_proposal_flow(selected).await {
            Ok(()) => {}
            Err(interrupt) => self.proposal_interrupt(interrupt, Originator::Remote).await,
        }
    }

    async fn accept_proposal_flow(&mut self, selected: StreamList) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .invitation()
            .ok_or(OpInterrupt::Transport { error: "no dialog".to_string() })?;
        let offered = session.take_proposed().unwrap_or_default();
        let mut kept = Vec::new();
        for stream in offered {
            if selected.iter().any(|s| s.id() == stream.id()) {
                session.watch_stream(&stream);
                stream
                    .initialize(session.bus.clone())
                    .await
                    .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
                kept.push(stream);
            } else {
                stream.end().await;
            }
        }
        session.set_proposed(Some(kept.clone()));
        self.wait_initialized(kept.len()).await?;

        let slots = invitation.sdp();
        let (Some(active_local), Some(proposed_remote)) = (slots.active_local, slots.proposed_remote)
        else {
            return Err(OpInterrupt::Transport { error: "no proposed SDP on dialog".to_string() });
        };
        let mut local_sdp = active_local.clone();
        local_sdp.bump_version();
        let mut media_list = Vec::with_capacity(proposed_remote.media.len());
        for (index, media) in proposed_remote.media.iter().enumerate() {
            if let Some(stream) = kept.iter().find(|stream| stream.index() == Some(index)) {
                media_list.push(stream.local_media(false));
            } else if let Some(stream) = session.stream_at(index) {
                media_list.push(stream.local_media(false));
            } else if let Some(current) = active_local.media.get(index) {
                media_list.push(current.clone());
            } else {
                media_list.push(media.rejected());
            }
        }
        local_sdp.media = media_list;
        invitation
            .send_response(200, Some(local_sdp), Vec::new())
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;
        session.notify_transaction(
            Originator::Remote,
            "INVITE",
            200,
            Some(status_reason(200).to_string()),
            None,
        );

        let prev_held = session.held_by_remote();
        let negotiated = self
            .wait_renegotiation_settled(false, false)
            .await?
            .ok_or(OpInterrupt::Transport { error: "renegotiation carried no SDP".to_string() })?;
        for stream in session.streams() {
            if let Some(index) = stream.index() {
                let _ = stream.update(&negotiated.local, &negotiated.remote, index).await;
            }
        }
        self.report_remote_hold_changes(prev_held);

        let mut started = 0;
        for stream in &kept {
            let index = stream.index().unwrap_or(usize::MAX);
            stream
                .start(&negotiated.local, &negotiated.remote, index)
                .await
                .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
            started += 1;
        }
        while started > 0 {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidStart) => started -= 1,
                _ => self.stash.push(event),
            }
        }

        session.set_state(SessionState::Connected);
        session.notify(SessionNotification::GotAcceptProposal {
            originator: Originator::Remote,
            streams: kept.clone(),
        });
        session.streams.lock().unwrap().extend(kept.iter().cloned());
        session.set_proposed(None);
        session.notify(SessionNotification::DidRenegotiateStreams {
            originator: Originator::Remote,
            action: StreamAction::Add,
            streams: kept,
        });
        self.maybe_send_hold().await;
        Ok(())
    }

    async fn op_reject_proposal(&mut self, code: u16) {
        let session = self.session.clone();
        let proposed = session.proposed_streams().unwrap_or_default();
        for stream in &proposed {
            stream.end().await;
        }
        let Some(invitation) = session.invitation() else {
            session.set_proposed(None);
            session.set_state(SessionState::Connected);
            return;
        };
        if let Err(e) = invitation.send_response(code, None, Vec::new()).await {
            self.proposal_interrupt(
                OpInterrupt::Transport { error: e.to_string() },
                Originator::Remote,
            )
            .await;
            return;
        }
        // Give the transaction a moment to settle; the dialog survives either
        // way.
        let wait = Duration::from_secs(session.config.session.disconnect_wait_secs);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.wait_event(false)).await {
                Err(_) => break,
                Ok(Err(interrupt)) => {
                    session.set_proposed(None);
                    self.proposal_interrupt(interrupt, Originator::Remote).await;
                    return;
                }
                Ok(Ok(event)) => match event.payload {
                    EventPayload::Invitation(InvitationEvent::StateChanged(e))
                        if e.state == InvitationState::Connected
                            && e.sub_state == Some(InvitationSubState::Normal) =>
                    {
                        session.notify_transaction(
                            Originator::Remote,
                            "INVITE",
                            code,
                            Some(status_reason(code).to_string()),
                            None,
                        );
                        break;
                    }
                    _ => self.stash.push(event),
                },
            }
        }
        session.set_state(SessionState::Connected);
        session.notify(SessionNotification::GotRejectProposal {
            originator: Originator::Remote,
            code,
            reason: Some(status_reason(code).to_string()),
            streams: proposed,
        });
        session.set_proposed(None);
        self.maybe_send_hold().await;
    }

    /// Shared failure path for mid-dialog proposals; the session itself
    /// survives and returns to `connected`.
    async fn fail_proposal(&mut self, originator: Originator, error: String) {
        let session = self.session.clone();
        let proposed = session.take_proposed().unwrap_or_default();
        for stream in &proposed {
            session.unwatch(stream.id());
            stream.end().await;
        }
        if originator == Originator::Remote {
            if let Some(invitation) = session.invitation() {
                if invitation.sub_state() == Some(InvitationSubState::ReceivedProposal) {
                    let _ = invitation.send_response(500, None, Vec::new()).await;
                    session.notify_transaction(
                        Originator::Remote,
                        "INVITE",
                        500,
                        Some(status_reason(500).to_string()),
                        None,
                    );
                }
            }
        }
        warn!(session = %session.id, %originator, error, "proposal failed");
        session.notify(SessionNotification::HadProposalFailure {
            originator,
            reason: error,
            streams: proposed,
        });
        session.set_state(SessionState::Connected);
    }

    /// Interrupt handling common to every mid-dialog proposal flow.
    async fn proposal_interrupt(&mut self, interrupt: OpInterrupt, originator: Originator) {
        match interrupt {
            OpInterrupt::Ended => self.finish_end().await,
            OpInterrupt::ChannelClosed => self.session.set_state(SessionState::Terminated),
            OpInterrupt::MediaFailed { reason } => {
                self.fail_proposal(originator, format!("media stream failed: {}", reason)).await;
            }
            OpInterrupt::SdpFailed { error } => {
                self.fail_proposal(originator, format!("SDP negotiation failed: {}", error)).await;
            }
            OpInterrupt::Transport { error } => {
                self.fail_proposal(originator, format!("transport error: {}", error)).await;
            }
            OpInterrupt::PeerProposal => {
                self.fail_proposal(Originator::Local, "received stream proposal".to_string())
                    .await;
                // Boxed: processing the winning peer proposal may schedule a
                // deferred hold, which loops back through this handler.
                Box::pin(self.handle_received_proposal()).await;
            }
            OpInterrupt::InvitationFailed(e) => {
                self.fail_proposal(originator, "session ended".to_string()).await;
                self.handle_remote_disconnect(e).await;
            }
        }
    }

    async fn renegotiation_interrupt(&mut self, interrupt: OpInterrupt) {
        match interrupt {
            OpInterrupt::Ended => self.finish_end().await,
            OpInterrupt::ChannelClosed => self.session.set_state(SessionState::Terminated),
            OpInterrupt::InvitationFailed(e) => {
                self.session.set_state(SessionState::Connected);
                self.handle_remote_disconnect(e).await;
            }
            OpInterrupt::MediaFailed { reason } => {
                self.end_all_streams().await;
                self.fail(Originator::Local, 0, None, format!("media stream failed: {}", reason))
                    .await;
            }
            OpInterrupt::SdpFailed { error } => {
                warn!(session = %self.session.id, error, "renegotiation SDP failed");
                self.session.set_state(SessionState::Connected);
            }
            OpInterrupt::Transport { error } => {
                self.end_all_streams().await;
                self.fail(Originator::Local, 0, None, format!("transport error: {}", error)).await;
            }
            // A peer cannot race the answer to its own proposal.
            OpInterrupt::PeerProposal => {}
        }
    }

    // ------------------------------------------------------------------
    // locally-initiated proposals

    async fn op_add_stream(&mut self, stream: Arc<dyn MediaStream>) {
        match self.add_stream_flow(stream).await {
            Ok(()) => {}
            Err(interrupt) => self.proposal_interrupt(interrupt, Originator::Local).await,
        }
    }

    async fn add_stream_flow(&mut self, stream: Arc<dyn MediaStream>) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .invitation()
            .ok_or(OpInterrupt::Transport { error: "no dialog".to_string() })?;
        session.set_proposed(Some(vec![stream.clone()]));
        session.watch_stream(&stream);
        stream
            .initialize(session.bus.clone())
            .await
            .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;

        // A peer re-INVITE arriving before our offer goes out wins the race.
        loop {
            let event = self.wait_event(true).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidInitialize) => break,
                _ => self.stash.push(event),
            }
        }

        let Some(mut local_sdp) = invitation.sdp().active_local else {
            return Err(OpInterrupt::Transport { error: "no active local SDP".to_string() });
        };
        local_sdp.bump_version();
        let index = local_sdp.media.len();
        stream.set_index(index);
        local_sdp.media.push(stream.local_media(true));
        invitation
            .send_reinvite(local_sdp)
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;
        session.notify(SessionNotification::GotProposal {
            originator: Originator::Local,
            streams: vec![stream.clone()],
        });

        let mut negotiated = None;
        let mut answer: Option<(u16, Option<String>)> = None;
        let mut got_update = false;
        let mut got_state = false;
        while !got_update || !got_state {
            let event = self.wait_event(true).await?;
            match event.payload {
                EventPayload::Invitation(InvitationEvent::SdpUpdate(update)) => {
                    got_update = true;
                    match update.result {
                        Ok(result) => negotiated = Some(result),
                        Err(error) => return Err(OpInterrupt::SdpFailed { error }),
                    }
                }
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    if e.state == InvitationState::Connected
                        && e.sub_state == Some(InvitationSubState::Normal)
                    {
                        got_state = true;
                        session.notify_transaction(
                            Originator::Local,
                            "INVITE",
                            e.code,
                            e.reason.clone(),
                            None,
                        );
                        if (200..300).contains(&e.code) {
                            answer = Some((e.code, e.reason.clone()));
                        } else {
                            // The peer declined the whole re-INVITE.
                            self.reject_local_stream(&stream, e.code, e.reason.clone()).await;
                            return Ok(());
                        }
                    }
                }
                _ => self.stash.push(event),
            }
        }

        let negotiated = negotiated
            .ok_or(OpInterrupt::Transport { error: "renegotiation carried no SDP".to_string() })?;
        match negotiated.remote.media.get(index) {
            None => {
                return Err(OpInterrupt::SdpFailed {
                    error: "media missing in answer".to_string(),
                })
            }
            Some(media) if media.port == 0 => {
                let (code, reason) = answer.unwrap_or((200, None));
                self.reject_local_stream(&stream, code, reason).await;
                return Ok(());
            }
            Some(_) => {
                stream
                    .start(&negotiated.local, &negotiated.remote, index)
                    .await
                    .map_err(|e| OpInterrupt::MediaFailed { reason: e.to_string() })?;
            }
        }
        let mut started = 1;
        while started > 0 {
            let event = self.wait_event(false).await?;
            match event.payload {
                EventPayload::Media(MediaStreamEvent::DidStart) => started -= 1,
                _ => self.stash.push(event),
            }
        }

        session.set_state(SessionState::Connected);
        session.notify(SessionNotification::GotAcceptProposal {
            originator: Originator::Local,
            streams: vec![stream.clone()],
        });
        session.streams.lock().unwrap().push(stream.clone());
        session.set_proposed(None);
        session.notify(SessionNotification::DidRenegotiateStreams {
            originator: Originator::Local,
            action: StreamAction::Add,
            streams: vec![stream],
        });
        self.maybe_send_hold().await;
        Ok(())
    }

    /// The peer answered our added media line with a zero port or an error
    /// response: the stream is not joining the session.
    async fn reject_local_stream(
        &mut self,
        stream: &Arc<dyn MediaStream>,
        code: u16,
        reason: Option<String>,
    ) {
        let session = self.session.clone();
        session.unwatch(stream.id());
        stream.end().await;
        let proposed = session.take_proposed().unwrap_or_default();
        session.notify(SessionNotification::GotRejectProposal {
            originator: Originator::Local,
            code,
            reason,
            streams: proposed,
        });
        session.set_state(SessionState::Connected);
        self.maybe_send_hold().await;
    }

    async fn op_remove_stream(&mut self, stream: Arc<dyn MediaStream>) {
        let session = self.session.clone();
        if !session.streams().iter().any(|s| s.id() == stream.id()) {
            session.set_state(SessionState::Connected);
            return;
        }
        match self.remove_stream_flow(&stream).await {
            Ok(()) => {}
            Err(interrupt) => self.proposal_interrupt(interrupt, Originator::Local).await,
        }
    }

    async fn remove_stream_flow(&mut self, stream: &Arc<dyn MediaStream>) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .invitation()
            .ok_or(OpInterrupt::Transport { error: "no dialog".to_string() })?;
        let Some(mut local_sdp) = invitation.sdp().active_local else {
            return Err(OpInterrupt::Transport { error: "no active local SDP".to_string() });
        };
        local_sdp.bump_version();
        if let Some(index) = stream.index() {
            if let Some(media) = local_sdp.media.get_mut(index) {
                media.port = 0;
            }
        }
        invitation
            .send_reinvite(local_sdp)
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;

        let mut got_update = false;
        let mut got_state = false;
        while !got_update || !got_state {
            let event = self.wait_event(true).await?;
            match event.payload {
                EventPayload::Invitation(InvitationEvent::SdpUpdate(_)) => got_update = true,
                EventPayload::Invitation(InvitationEvent::StateChanged(e)) => {
                    if e.state == InvitationState::Connected
                        && e.sub_state == Some(InvitationSubState::Normal)
                    {
                        got_state = true;
                        session.notify_transaction(
                            Originator::Local,
                            "INVITE",
                            e.code,
                            e.reason.clone(),
                            None,
                        );
                    }
                }
                _ => self.stash.push(event),
            }
        }

        session.set_state(SessionState::Connected);
        session.unwatch(stream.id());
        stream.end().await;
        session.streams.lock().unwrap().retain(|s| s.id() != stream.id());
        session.notify(SessionNotification::DidRenegotiateStreams {
            originator: Originator::Local,
            action: StreamAction::Remove,
            streams: vec![stream.clone()],
        });
        self.maybe_send_hold().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // hold / resume

    async fn op_hold(&mut self) {
        let session = self.session.clone();
        match session.state() {
            SessionState::Connected => {
                self.mark_hold_requested();
                self.send_hold_flow().await;
            }
            SessionState::ReceivedProposal | SessionState::AcceptingProposal => {
                // The peer's proposal won the race against the hold request.
                self.mark_unhold_requested();
                session.notify(SessionNotification::HadProposalFailure {
                    originator: Originator::Local,
                    reason: "received stream proposal".to_string(),
                    streams: Vec::new(),
                });
            }
            SessionState::Terminating | SessionState::Terminated => session.clear_hold_pending(),
            _ => {
                // Not established yet: flags are set now, the offer goes out
                // once the session settles.
                self.mark_hold_requested();
            }
        }
    }

    async fn op_unhold(&mut self) {
        let session = self.session.clone();
        self.mark_unhold_requested();
        if session.state() == SessionState::Connected && session.on_hold() {
            self.send_unhold_flow().await;
        }
    }

    /// Re-offer every media line so the regenerated directions carry the hold.
    async fn send_hold_flow(&mut self) {
        let session = self.session.clone();
        if session.on_hold() {
            session.clear_hold_pending();
            return;
        }
        match self.reoffer_all_streams().await {
            Ok(()) => {
                {
                    let mut shared = session.shared.lock().unwrap();
                    shared.on_hold = true;
                    shared.hold_pending = false;
                }
                session.set_state(SessionState::Connected);
                let streams = session.streams();
                let partial = streams
                    .iter()
                    .any(|stream| stream.hold_supported() && !stream.on_hold_by_local());
                session.notify(SessionNotification::DidChangeHoldState {
                    originator: Originator::Local,
                    on_hold: true,
                    partial,
                });
            }
            Err(interrupt) => {
                self.mark_unhold_requested();
                self.proposal_interrupt(interrupt, Originator::Local).await;
            }
        }
    }

    async fn send_unhold_flow(&mut self) {
        let session = self.session.clone();
        match self.reoffer_all_streams().await {
            Ok(()) => {
                session.shared.lock().unwrap().on_hold = false;
                session.set_state(SessionState::Connected);
                session.notify(SessionNotification::DidChangeHoldState {
                    originator: Originator::Local,
                    on_hold: false,
                    partial: false,
                });
            }
            Err(interrupt) => self.proposal_interrupt(interrupt, Originator::Local).await,
        }
    }

    /// Send a re-INVITE regenerating every media line from its stream and
    /// wait for the transaction to settle.
    async fn reoffer_all_streams(&mut self) -> OpResult<()> {
        let session = self.session.clone();
        let invitation = session
            .invitation()
            .ok_or(OpInterrupt::Transport { error: "no dialog".to_string() })?;
        session.set_state(SessionState::SendingProposal);
        let Some(mut local_sdp) = invitation.sdp().active_local else {
            return Err(OpInterrupt::Transport { error: "no active local SDP".to_string() });
        };
        local_sdp.bump_version();
        for stream in session.streams() {
            if let Some(index) = stream.index() {
                if let Some(media) = local_sdp.media.get_mut(index) {
                    *media = stream.local_media(true);
                }
            }
        }
        invitation
            .send_reinvite(local_sdp)
            .await
            .map_err(|e| OpInterrupt::Transport { error: e.to_string() })?;
        let negotiated = self.wait_renegotiation_settled(true, true).await?;
        if let Some(negotiated) = negotiated {
            for stream in session.streams() {
                if let Some(index) = stream.index() {
                    let _ = stream.update(&negotiated.local, &negotiated.remote, index).await;
                }
            }
        }
        Ok(())
    }

    /// Fires a deferred hold once an operation settles back into `connected`.
    async fn maybe_send_hold(&mut self) {
        if self.session.hold_pending() && self.session.state() == SessionState::Connected {
            self.mark_hold_requested();
            self.send_hold_flow().await;
        }
    }

    // ------------------------------------------------------------------
    // termination

    /// The local end path: cancel or BYE, bounded wait for the disconnect.
    async fn finish_end(&mut self) {
        let session = self.session.clone();
        let Some(invitation) = session.invitation() else {
            // Never got signaling off the ground.
            self.end_all_streams().await;
            session.set_state(SessionState::Terminated);
            return;
        };
        if matches!(
            invitation.state(),
            InvitationState::Disconnecting | InvitationState::Disconnected
        ) {
            return;
        }
        session.set_state(SessionState::Terminating);
        if invitation.state() == InvitationState::Connected {
            session.notify(SessionNotification::WillEnd { originator: Originator::Local });
        }
        self.end_all_streams().await;
        let cancelling = invitation.state() != InvitationState::Connected;
        let wait = Duration::from_secs(session.config.session.disconnect_wait_secs);
        if let Err(e) = invitation.end(Some(wait)).await {
            self.unwatch_invitation();
            session.set_state(SessionState::Terminated);
            if cancelling {
                session.notify(SessionNotification::DidFail {
                    originator: Originator::Local,
                    code: 0,
                    reason: None,
                    failure_reason: format!("transport error: {}", e),
                });
            } else {
                session.shared.lock().unwrap().end_time = Some(Utc::now());
                session.notify(SessionNotification::DidEnd {
                    originator: Originator::Local,
                    end_reason: format!("transport error: {}", e),
                });
            }
            return;
        }
        if let Some(e) = self.wait_for_disconnect().await {
            if cancelling {
                session.notify_transaction(
                    Originator::Local,
                    "INVITE",
                    487,
                    Some("Canceled".to_string()),
                    None,
                );
            } else {
                session.notify_transaction(Originator::Local, "BYE", e.code, e.reason.clone(), None);
            }
        }
        self.unwatch_invitation();
        session.set_state(SessionState::Terminated);
        if cancelling {
            session.notify(SessionNotification::DidFail {
                originator: Originator::Local,
                code: 487,
                reason: Some("Canceled".to_string()),
                failure_reason: "user request".to_string(),
            });
        } else {
            session.shared.lock().unwrap().end_time = Some(Utc::now());
            session.notify(SessionNotification::DidEnd {
                originator: Originator::Local,
                end_reason: "user request".to_string(),
            });
        }
    }

    /// Session failure: report, drive the dialog down, terminate.
    async fn fail(
        &mut self,
        originator: Originator,
        code: u16,
        reason: Option<String>,
        error: String,
    ) {
        let session = self.session.clone();
        let invitation = session.invitation();
        let prev_inv_state =
            invitation.as_ref().map(|i| i.state()).unwrap_or(InvitationState::Idle);
        session.set_state(SessionState::Terminating);
        session.set_proposed(None);
        let pre_confirmation = matches!(
            prev_inv_state,
            InvitationState::Idle
                | InvitationState::Incoming
                | InvitationState::Outgoing
                | InvitationState::Early
                | InvitationState::Connecting
        );
        if !pre_confirmation {
            session.notify(SessionNotification::WillEnd { originator });
        }
        if let Some(invitation) = &invitation {
            if !matches!(
                invitation.state(),
                InvitationState::Idle
                    | InvitationState::Disconnecting
                    | InvitationState::Disconnected
            ) {
                let inbound_early = invitation.direction() == CallDirection::Incoming
                    && matches!(
                        invitation.state(),
                        InvitationState::Incoming | InvitationState::Early
                    );
                let sent = if inbound_early {
                    invitation.send_response(500, None, Vec::new()).await
                } else {
                    let wait = Duration::from_secs(session.config.session.disconnect_wait_secs);
                    invitation.end(Some(wait)).await
                };
                if sent.is_ok() {
                    match self.wait_for_disconnect().await {
                        Some(e) => {
                            if matches!(
                                prev_inv_state,
                                InvitationState::Connecting | InvitationState::Connected
                            ) {
                                session.notify_transaction(
                                    Originator::Local,
                                    "BYE",
                                    e.code,
                                    e.reason.clone(),
                                    None,
                                );
                            } else if inbound_early {
                                let ack_received =
                                    e.disconnect_reason.as_deref() != Some("missing ACK");
                                session.notify_transaction(
                                    Originator::Remote,
                                    "INVITE",
                                    500,
                                    Some(status_reason(500).to_string()),
                                    Some(ack_received),
                                );
                            } else if invitation.direction() == CallDirection::Outgoing
                                && matches!(
                                    prev_inv_state,
                                    InvitationState::Outgoing | InvitationState::Early
                                )
                            {
                                session.notify_transaction(
                                    Originator::Local,
                                    "INVITE",
                                    487,
                                    Some("Canceled".to_string()),
                                    None,
                                );
                            }
                        }
                        None => {
                            if matches!(
                                prev_inv_state,
                                InvitationState::Connecting | InvitationState::Connected
                            ) {
                                session.notify_transaction(
                                    Originator::Local,
                                    "BYE",
                                    408,
                                    Some(status_reason(408).to_string()),
                                    None,
                                );
                            }
                        }
                    }
                }
            }
        }
        self.unwatch_invitation();
        session.set_state(SessionState::Terminated);
        let inbound = invitation
            .as_ref()
            .map(|i| i.direction() == CallDirection::Incoming)
            .unwrap_or(false);
        let (code, reason) = if pre_confirmation && inbound && code == 0 {
            (500, Some(status_reason(500).to_string()))
        } else {
            (code, reason)
        };
        session.notify(SessionNotification::DidFail {
            originator,
            code,
            reason,
            failure_reason: error,
        });
    }
}

/// Progress gathered while establishing a call, carried into the failure
/// handlers for accurate reporting.
#[derive(Default)]
struct EstablishCx {
    connected: bool,
    received_code: u16,
    received_reason: Option<String>,
}

fn disconnect_reason(e: &InvitationStateEvent) -> String {
    e.disconnect_reason.clone().unwrap_or_else(|| "disconnected".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Subscription};
    use crate::protocols::sdp::{Attribute, Direction, MediaDescription};
    use crate::streams::{AudioStream, MsrpStream, StreamKind};
    use crate::testing::{
        answer_for, next_lifecycle_notification, test_config, InvitationAction, MockStream,
        ScriptedFactory, ScriptedInvitation,
    };

    struct Established {
        session: Arc<Session>,
        invitation: Arc<ScriptedInvitation>,
        notifications: Subscription,
        config: Arc<CoreConfig>,
    }

    /// Drive an outgoing call to `connected` against a scripted dialog.
    async fn establish(
        config: Arc<CoreConfig>,
        streams: StreamList,
    ) -> Established {
        let bus = EventBus::new();
        let factory = ScriptedFactory::new(bus.clone());
        let invitation = factory.stage_outgoing();
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let session = Session::new(
            bus.clone(),
            config.accounts[0].clone(),
            config.clone(),
            factory,
        );
        session
            .connect(
                SipAddress::new("sip:bob@example.com"),
                vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                streams,
            )
            .await
            .unwrap();

        let offer = match invitation.expect_action().await {
            InvitationAction::InviteSent { request } => request.sdp,
            action => panic!("expected INVITE, got {:?}", action),
        };
        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::NewOutgoing { .. }
        ));
        invitation.fire_state(invitation.state_event(InvitationState::Connecting, 200));
        invitation.fire_sdp_ok(offer.clone(), answer_for(&offer));
        invitation.fire_state(invitation.state_event(InvitationState::Connected, 200));
        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::WillStart
        ));
        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::DidStart { .. }
        ));
        assert_eq!(session.state(), SessionState::Connected);
        Established { session, invitation, notifications, config }
    }

    fn chat_media_line(port: u16) -> MediaDescription {
        let mut media = MediaDescription::new("message", port, "TCP/MSRP");
        media.formats = vec!["*".to_string()];
        media.attributes.push(Attribute::new(
            "path",
            format!("msrp://203.0.113.5:{}/peer;tcp", port),
        ));
        media.attributes.push(Attribute::new("accept-types", "message/cpim text/plain"));
        media
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(transition_allowed(Null, Connecting));
        assert!(transition_allowed(Null, Incoming));
        assert!(transition_allowed(Connecting, Connected));
        assert!(transition_allowed(Connected, ReceivedProposal));
        assert!(transition_allowed(ReceivedProposal, AcceptingProposal));
        assert!(transition_allowed(SendingProposal, Connected));
        assert!(transition_allowed(Incoming, Terminating));
        assert!(transition_allowed(Terminating, Terminated));
        assert!(transition_allowed(Connecting, Terminated));

        assert!(!transition_allowed(Null, Connected));
        assert!(!transition_allowed(Connecting, Incoming));
        assert!(!transition_allowed(Connected, AcceptingProposal));
        assert!(!transition_allowed(Terminated, Connecting));
        assert!(!transition_allowed(Terminated, Terminating));
    }

    #[tokio::test]
    async fn test_operations_guarded_by_state() {
        let bus = EventBus::new();
        let config = test_config();
        let factory = ScriptedFactory::new(bus.clone());
        let session = Session::new(
            bus.clone(),
            config.accounts[0].clone(),
            config.clone(),
            factory,
        );

        let audio: Arc<dyn MediaStream> = MockStream::audio();
        assert!(matches!(
            session.accept(vec![audio.clone()]).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(session.reject(603).await, Err(Error::InvalidState(_))));
        assert!(matches!(
            session.accept_proposal(vec![audio.clone()]).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(session.reject_proposal(488).await, Err(Error::InvalidState(_))));
        assert!(matches!(
            session.add_stream(audio.clone()).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            session.remove_stream(audio.clone()).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            session
                .connect(SipAddress::new("sip:bob@example.com"), Vec::new(), vec![audio.clone()])
                .await,
            Err(Error::Sip(_))
        ));
        assert_eq!(session.state(), SessionState::Null);

        session
            .connect(
                SipAddress::new("sip:bob@example.com"),
                vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                vec![audio.clone()],
            )
            .await
            .unwrap();
        assert!(matches!(
            session
                .connect(
                    SipAddress::new("sip:bob@example.com"),
                    vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                    vec![audio],
                )
                .await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_outbound_call_answered_and_ended_locally() {
        let bus = EventBus::new();
        let config = test_config();
        let factory = ScriptedFactory::new(bus.clone());
        let invitation = factory.stage_outgoing();
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let session = Session::new(
            bus.clone(),
            config.accounts[0].clone(),
            config.clone(),
            factory,
        );
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        session
            .connect(
                SipAddress::new("sip:bob@example.com"),
                vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                vec![audio],
            )
            .await
            .unwrap();

        let offer = match invitation.expect_action().await {
            InvitationAction::InviteSent { request } => {
                assert_eq!(request.to.uri, "sip:bob@example.com");
                request.sdp
            }
            action => panic!("expected INVITE, got {:?}", action),
        };
        assert_eq!(offer.media.len(), 1);
        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::NewOutgoing { .. }
        ));

        invitation.fire_state(invitation.state_event(InvitationState::Early, 180));
        invitation.fire_state(invitation.state_event(InvitationState::Connecting, 200));
        invitation.fire_sdp_ok(offer.clone(), answer_for(&offer));
        invitation.fire_state(invitation.state_event(InvitationState::Connected, 200));

        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::GotRingIndication
        ));
        assert!(matches!(
            next_lifecycle_notification(&mut notifications).await,
            SessionNotification::WillStart
        ));
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::DidStart { streams } => assert_eq!(streams.len(), 1),
            other => panic!("expected DidStart, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.start_time().is_some());

        session.end().await.unwrap();
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::WillEnd { originator } => {
                assert_eq!(originator, Originator::Local)
            }
            other => panic!("expected WillEnd, got {:?}", other),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::DidEnd { originator, end_reason } => {
                assert_eq!(originator, Originator::Local);
                assert_eq!(end_reason, "user request");
            }
            other => panic!("expected DidEnd, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.end_time().is_some());
    }

    #[tokio::test]
    async fn test_hold_then_unhold_round_trip() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;

        est.session.hold().await.unwrap();
        let hold_offer = match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { sdp } => sdp,
            action => panic!("expected re-INVITE, got {:?}", action),
        };
        assert_eq!(hold_offer.media[0].direction(), Direction::SendOnly);
        est.invitation.answer_reinvite(answer_for(&hold_offer), 200);
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidChangeHoldState { originator, on_hold, partial } => {
                assert_eq!(originator, Originator::Local);
                assert!(on_hold);
                assert!(!partial);
            }
            other => panic!("expected DidChangeHoldState, got {:?}", other),
        }
        assert!(est.session.on_hold());
        assert_eq!(est.session.state(), SessionState::Connected);

        est.session.unhold().await.unwrap();
        let resume_offer = match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { sdp } => sdp,
            action => panic!("expected re-INVITE, got {:?}", action),
        };
        assert_eq!(resume_offer.media[0].direction(), Direction::SendRecv);
        est.invitation.answer_reinvite(answer_for(&resume_offer), 200);
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidChangeHoldState { originator, on_hold, partial } => {
                assert_eq!(originator, Originator::Local);
                assert!(!on_hold);
                assert!(!partial);
            }
            other => panic!("expected DidChangeHoldState, got {:?}", other),
        }
        assert!(!est.session.on_hold());
        assert_eq!(est.session.state(), SessionState::Connected);
        assert_eq!(est.session.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_adds_chat_stream() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;

        let mut proposed = est.invitation.sdp().active_remote.unwrap();
        proposed.media.push(chat_media_line(2855));
        proposed.origin.version += 1;
        est.invitation.receive_reinvite(proposed);

        let offered = match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotProposal { originator, streams } => {
                assert_eq!(originator, Originator::Remote);
                streams
            }
            other => panic!("expected GotProposal, got {:?}", other),
        };
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].kind(), StreamKind::Chat);
        assert_eq!(offered[0].index(), Some(1));
        assert_eq!(est.session.state(), SessionState::ReceivedProposal);

        est.session.accept_proposal(offered).await.unwrap();
        match est.invitation.expect_action().await {
            InvitationAction::ResponseSent { code, sdp, .. } => {
                assert_eq!(code, 200);
                assert_eq!(sdp.unwrap().media.len(), 2);
            }
            action => panic!("expected 200 answer, got {:?}", action),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotAcceptProposal { originator, streams } => {
                assert_eq!(originator, Originator::Remote);
                assert_eq!(streams.len(), 1);
            }
            other => panic!("expected GotAcceptProposal, got {:?}", other),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidRenegotiateStreams { originator, action, streams } => {
                assert_eq!(originator, Originator::Remote);
                assert_eq!(action, StreamAction::Add);
                assert_eq!(streams[0].kind(), StreamKind::Chat);
            }
            other => panic!("expected DidRenegotiateStreams, got {:?}", other),
        }
        assert_eq!(est.session.state(), SessionState::Connected);
        let streams = est.session.streams();
        assert_eq!(streams.len(), 2);
        for (position, stream) in streams.iter().enumerate() {
            assert_eq!(stream.index(), Some(position));
        }
    }

    #[tokio::test]
    async fn test_peer_removes_stream() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let chat: Arc<dyn MediaStream> = MsrpStream::chat(&config);
        let mut est = establish(config.clone(), vec![audio, chat]).await;
        assert_eq!(est.session.streams().len(), 2);

        let mut proposed = est.invitation.sdp().active_remote.unwrap();
        proposed.media[1].port = 0;
        proposed.origin.version += 1;
        est.invitation.receive_reinvite(proposed);

        match est.invitation.expect_action().await {
            InvitationAction::ResponseSent { code, sdp, .. } => {
                assert_eq!(code, 200);
                let answer = sdp.unwrap();
                assert_eq!(answer.media.len(), 2);
                assert_eq!(answer.media[1].port, 0);
            }
            action => panic!("expected 200 answer, got {:?}", action),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidRenegotiateStreams { originator, action, streams } => {
                assert_eq!(originator, Originator::Remote);
                assert_eq!(action, StreamAction::Remove);
                assert_eq!(streams.len(), 1);
                assert_eq!(streams[0].kind(), StreamKind::Chat);
            }
            other => panic!("expected DidRenegotiateStreams, got {:?}", other),
        }
        assert_eq!(est.session.state(), SessionState::Connected);
        assert_eq!(est.session.streams().len(), 1);
        assert_eq!(est.session.streams()[0].kind(), StreamKind::Audio);
    }

    #[tokio::test]
    async fn test_remote_hold_is_detected() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;

        let mut proposed = est.invitation.sdp().active_remote.unwrap();
        proposed.media[0].set_direction(Direction::SendOnly);
        proposed.origin.version += 1;
        est.invitation.receive_reinvite(proposed);

        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidChangeHoldState { originator, on_hold, partial } => {
                assert_eq!(originator, Originator::Remote);
                assert!(on_hold);
                assert!(!partial);
            }
            other => panic!("expected DidChangeHoldState, got {:?}", other),
        }
        assert_eq!(est.session.state(), SessionState::Connected);
        assert!(est.session.streams()[0].on_hold_by_remote());
    }

    #[tokio::test]
    async fn test_outbound_sdp_negotiation_failure() {
        let bus = EventBus::new();
        let config = test_config();
        let factory = ScriptedFactory::new(bus.clone());
        let invitation = factory.stage_outgoing();
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let session = Session::new(
            bus.clone(),
            config.accounts[0].clone(),
            config.clone(),
            factory,
        );
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut media_events = bus.subscribe(EventFilter::sender(audio.id()));
        session
            .connect(
                SipAddress::new("sip:bob@example.com"),
                vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                vec![audio],
            )
            .await
            .unwrap();
        let _offer = invitation.expect_action().await;

        invitation.fire_sdp_error("no common codec");

        loop {
            match next_lifecycle_notification(&mut notifications).await {
                SessionNotification::NewOutgoing { .. } => continue,
                SessionNotification::DidFail { originator, failure_reason, .. } => {
                    assert_eq!(originator, Originator::Remote);
                    assert_eq!(failure_reason, "SDP negotiation failed: no common codec");
                    break;
                }
                other => panic!("expected DidFail, got {:?}", other),
            }
        }
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(invitation.state(), InvitationState::Disconnected);

        let mut ended = false;
        while let Some(event) = media_events.try_recv() {
            if matches!(event.payload, EventPayload::Media(MediaStreamEvent::DidEnd)) {
                ended = true;
            }
        }
        assert!(ended, "proposed stream was not ended");
    }

    #[tokio::test]
    async fn test_glare_local_hold_meets_peer_proposal() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;

        est.session.hold().await.unwrap();
        match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { .. } => {}
            action => panic!("expected re-INVITE, got {:?}", action),
        }

        // The peer's own re-INVITE beats our answer.
        let mut proposed = est.invitation.sdp().active_remote.unwrap();
        proposed.media.push(chat_media_line(2855));
        proposed.origin.version += 1;
        est.invitation.receive_reinvite(proposed);

        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::HadProposalFailure { originator, reason, .. } => {
                assert_eq!(originator, Originator::Local);
                assert_eq!(reason, "received stream proposal");
            }
            other => panic!("expected HadProposalFailure, got {:?}", other),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotProposal { originator, streams } => {
                assert_eq!(originator, Originator::Remote);
                assert_eq!(streams.len(), 1);
            }
            other => panic!("expected GotProposal, got {:?}", other),
        }
        assert!(!est.session.on_hold());
        assert_eq!(est.session.state(), SessionState::ReceivedProposal);
    }

    #[tokio::test]
    async fn test_add_then_remove_stream_round_trip() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;
        let baseline_media_count =
            est.invitation.sdp().active_local.unwrap().media.len();

        let chat: Arc<dyn MediaStream> = MsrpStream::chat(&est.config);
        est.session.add_stream(chat.clone()).await.unwrap();
        let add_offer = match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { sdp } => sdp,
            action => panic!("expected re-INVITE, got {:?}", action),
        };
        assert_eq!(add_offer.media.len(), baseline_media_count + 1);
        assert_eq!(chat.index(), Some(baseline_media_count));
        est.invitation.answer_reinvite(answer_for(&add_offer), 200);

        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotProposal { originator, .. } => {
                assert_eq!(originator, Originator::Local)
            }
            other => panic!("expected GotProposal, got {:?}", other),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotAcceptProposal { originator, .. } => {
                assert_eq!(originator, Originator::Local)
            }
            other => panic!("expected GotAcceptProposal, got {:?}", other),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidRenegotiateStreams { action, .. } => {
                assert_eq!(action, StreamAction::Add)
            }
            other => panic!("expected DidRenegotiateStreams, got {:?}", other),
        }
        assert_eq!(est.session.streams().len(), 2);

        est.session.remove_stream(chat.clone()).await.unwrap();
        let remove_offer = match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { sdp } => sdp,
            action => panic!("expected re-INVITE, got {:?}", action),
        };
        assert_eq!(remove_offer.media.len(), baseline_media_count + 1);
        assert_eq!(remove_offer.media[baseline_media_count].port, 0);
        est.invitation.answer_reinvite(answer_for(&remove_offer), 200);

        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::DidRenegotiateStreams { originator, action, streams } => {
                assert_eq!(originator, Originator::Local);
                assert_eq!(action, StreamAction::Remove);
                assert_eq!(streams.len(), 1);
            }
            other => panic!("expected DidRenegotiateStreams, got {:?}", other),
        }
        assert_eq!(est.session.state(), SessionState::Connected);
        let streams = est.session.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].kind(), StreamKind::Audio);
        assert_eq!(streams[0].index(), Some(0));
    }

    #[tokio::test]
    async fn test_peer_declines_added_stream() {
        let config = test_config();
        let audio: Arc<dyn MediaStream> = AudioStream::new(&config);
        let mut est = establish(config.clone(), vec![audio]).await;

        let chat: Arc<dyn MediaStream> = MsrpStream::chat(&est.config);
        est.session.add_stream(chat.clone()).await.unwrap();
        let add_offer = match est.invitation.expect_action().await {
            InvitationAction::ReinviteSent { sdp } => sdp,
            action => panic!("expected re-INVITE, got {:?}", action),
        };
        // The peer answers the new line with a zero port.
        let mut answer = answer_for(&add_offer);
        answer.media.last_mut().unwrap().port = 0;
        est.invitation.answer_reinvite(answer, 200);

        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotProposal { originator, .. } => {
                assert_eq!(originator, Originator::Local)
            }
            other => panic!("expected GotProposal, got {:?}", other),
        }
        match next_lifecycle_notification(&mut est.notifications).await {
            SessionNotification::GotRejectProposal { originator, .. } => {
                assert_eq!(originator, Originator::Local)
            }
            other => panic!("expected GotRejectProposal, got {:?}", other),
        }
        assert_eq!(est.session.state(), SessionState::Connected);
        assert_eq!(est.session.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_during_setup_fails_the_session() {
        let bus = EventBus::new();
        let config = test_config();
        let factory = ScriptedFactory::new(bus.clone());
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let session = Session::new(
            bus.clone(),
            config.accounts[0].clone(),
            config.clone(),
            factory,
        );
        let stream = MockStream::audio();
        stream.fail_on_initialize();
        session
            .connect(
                SipAddress::new("sip:bob@example.com"),
                vec![Route::new("198.51.100.20", 5060, Transport::Udp)],
                vec![stream as Arc<dyn MediaStream>],
            )
            .await
            .unwrap();

        loop {
            match next_lifecycle_notification(&mut notifications).await {
                SessionNotification::NewOutgoing { .. } => continue,
                SessionNotification::DidFail { originator, failure_reason, .. } => {
                    assert_eq!(originator, Originator::Local);
                    assert!(failure_reason.starts_with("media stream failed:"));
                    break;
                }
                other => panic!("expected DidFail, got {:?}", other),
            }
        }
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_media_failure_tears_the_session_down() {
        let config = test_config();
        let stream = MockStream::audio();
        let mut est = establish(config.clone(), vec![stream.clone() as Arc<dyn MediaStream>]).await;

        est.session.bus.publish(Event::new(
            stream.id(),
            EventPayload::Media(MediaStreamEvent::DidFail {
                reason: "rtp timeout".to_string(),
            }),
        ));

        loop {
            match next_lifecycle_notification(&mut est.notifications).await {
                SessionNotification::WillEnd { .. } => continue,
                SessionNotification::DidFail { originator, failure_reason, .. } => {
                    assert_eq!(originator, Originator::Local);
                    assert_eq!(failure_reason, "media stream failed: rtp timeout");
                    break;
                }
                other => panic!("expected DidFail, got {:?}", other),
            }
        }
        assert_eq!(est.session.state(), SessionState::Terminated);
        assert_eq!(est.invitation.state(), InvitationState::Disconnected);
        assert!(est.session.streams().is_empty());
    }
}

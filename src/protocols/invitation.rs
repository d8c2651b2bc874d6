//! SIP INVITE dialog contract
//!
//! The session core does not speak SIP itself: it consumes a dialog primitive
//! provided by the transport engine. This module defines that contract, the
//! [`Invitation`] trait with its operations and negotiated-SDP view, and the
//! typed events a dialog implementation publishes on the bus.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::events::SenderId;
use crate::protocols::sdp::SessionDescription;
use crate::Result;

/// Dialog-level state as reported by the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Idle,
    Incoming,
    Outgoing,
    Early,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Within `Connected`, tracks whether a re-INVITE transaction is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationSubState {
    Normal,
    SentProposal,
    ReceivedProposal,
}

/// Which party drove a transition or transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    Local,
    Remote,
}

impl fmt::Display for Originator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Originator::Local => write!(f, "local"),
            Originator::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
            Transport::Tls => write!(f, "tls"),
        }
    }
}

/// A SIP address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipAddress {
    pub uri: String,
    pub display_name: Option<String>,
}

impl SipAddress {
    pub fn new<S: Into<String>>(uri: S) -> Self {
        Self { uri: uri.into(), display_name: None }
    }

    pub fn with_display_name<U: Into<String>, D: Into<String>>(uri: U, display_name: D) -> Self {
        Self { uri: uri.into(), display_name: Some(display_name.into()) }
    }
}

impl fmt::Display for SipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{}\" <{}>", name, self.uri),
            None => write!(f, "<{}>", self.uri),
        }
    }
}

/// An outbound proxy hop for the initial INVITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
}

impl Route {
    pub fn new<S: Into<String>>(address: S, port: u16, transport: Transport) -> Self {
        Self { address: address.into(), port, transport }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// An extra header to attach to a response, e.g. a Warning explaining a 488.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    pub fn warning<A: Into<String>, T: Into<String>>(code: u16, agent: A, text: T) -> Self {
        Self {
            name: "Warning".to_string(),
            value: format!("{} {} \"{}\"", code, agent.into(), text.into()),
        }
    }
}

/// Everything needed to send the initial INVITE.
#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub from: SipAddress,
    pub to: SipAddress,
    pub route: Route,
    pub contact: SipAddress,
    pub sdp: SessionDescription,
    pub credentials: Option<Credentials>,
}

/// The four SDP slots a dialog tracks during offer/answer.
#[derive(Debug, Clone, Default)]
pub struct SdpNegotiation {
    pub active_local: Option<SessionDescription>,
    pub active_remote: Option<SessionDescription>,
    pub proposed_local: Option<SessionDescription>,
    pub proposed_remote: Option<SessionDescription>,
}

/// Payload of a dialog state change.
#[derive(Debug, Clone)]
pub struct InvitationStateEvent {
    pub state: InvitationState,
    pub sub_state: Option<InvitationSubState>,
    pub prev_state: Option<InvitationState>,
    pub code: u16,
    pub reason: Option<String>,
    pub originator: Originator,
    pub method: Option<String>,
    pub disconnect_reason: Option<String>,
}

impl InvitationStateEvent {
    /// A disconnect that was not locally initiated through `disconnecting`
    /// signals a dialog failure to whatever operation is in flight.
    pub fn is_failure(&self) -> bool {
        self.state == InvitationState::Disconnected
            && self.prev_state != Some(InvitationState::Disconnecting)
    }
}

/// Result of one SDP offer/answer round.
#[derive(Debug, Clone)]
pub struct SdpUpdateEvent {
    pub result: std::result::Result<NegotiatedSdp, String>,
}

#[derive(Debug, Clone)]
pub struct NegotiatedSdp {
    pub local: SessionDescription,
    pub remote: SessionDescription,
}

/// Events published by dialog implementations, with the invitation's id as
/// the bus sender.
#[derive(Clone)]
pub enum InvitationEvent {
    /// A new incoming INVITE with no session owner yet. Carries the dialog
    /// handle so the session manager can answer it and birth a session.
    NewIncoming { invitation: Arc<dyn Invitation> },
    StateChanged(InvitationStateEvent),
    SdpUpdate(SdpUpdateEvent),
}

impl fmt::Debug for InvitationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvitationEvent::NewIncoming { invitation } => f
                .debug_struct("NewIncoming")
                .field("invitation", &invitation.id())
                .finish(),
            InvitationEvent::StateChanged(event) => {
                f.debug_tuple("StateChanged").field(event).finish()
            }
            InvitationEvent::SdpUpdate(event) => {
                f.debug_tuple("SdpUpdate").field(event).finish()
            }
        }
    }
}

/// Operations and attributes of one INVITE dialog. Implemented by the SIP
/// transport engine; the core only drives it.
#[async_trait]
pub trait Invitation: Send + Sync {
    fn id(&self) -> SenderId;
    fn direction(&self) -> CallDirection;
    fn state(&self) -> InvitationState;
    fn sub_state(&self) -> Option<InvitationSubState>;
    fn transport(&self) -> Transport;
    fn sdp(&self) -> SdpNegotiation;
    fn request_uri(&self) -> Option<String>;
    fn local_identity(&self) -> Option<SipAddress>;
    fn remote_identity(&self) -> Option<SipAddress>;
    fn remote_user_agent(&self) -> Option<String>;

    async fn send_invite(&self, request: InviteRequest) -> Result<()>;
    async fn send_response(
        &self,
        code: u16,
        sdp: Option<SessionDescription>,
        extra_headers: Vec<Header>,
    ) -> Result<()>;
    async fn send_reinvite(&self, sdp: SessionDescription) -> Result<()>;
    async fn end(&self, timeout: Option<Duration>) -> Result<()>;
}

/// Creates outgoing dialogs on demand; injected into sessions so the core
/// never reaches for a global engine.
pub trait InvitationFactory: Send + Sync {
    fn create_outgoing(&self) -> Result<Arc<dyn Invitation>>;
}

/// Reason phrase for the status codes the core sends or reports.
pub fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reasons() {
        assert_eq!(status_reason(200), "OK");
        assert_eq!(status_reason(603), "Decline");
        assert_eq!(status_reason(488), "Not Acceptable Here");
        assert_eq!(status_reason(299), "Unknown");
    }

    #[test]
    fn test_warning_header_format() {
        let header = Header::warning(399, "test-agent/1.0", "Failed to update media stream index 1");
        assert_eq!(header.name, "Warning");
        assert_eq!(header.value, "399 test-agent/1.0 \"Failed to update media stream index 1\"");
    }

    #[test]
    fn test_disconnect_failure_classification() {
        let mut event = InvitationStateEvent {
            state: InvitationState::Disconnected,
            sub_state: None,
            prev_state: Some(InvitationState::Connected),
            code: 0,
            reason: None,
            originator: Originator::Remote,
            method: Some("BYE".to_string()),
            disconnect_reason: Some("user request".to_string()),
        };
        assert!(event.is_failure());
        event.prev_state = Some(InvitationState::Disconnecting);
        assert!(!event.is_failure());
    }

    #[test]
    fn test_sip_address_display() {
        let plain = SipAddress::new("sip:alice@example.com");
        assert_eq!(plain.to_string(), "<sip:alice@example.com>");
        let named = SipAddress::with_display_name("sip:alice@example.com", "Alice");
        assert_eq!(named.to_string(), "\"Alice\" <sip:alice@example.com>");
    }
}

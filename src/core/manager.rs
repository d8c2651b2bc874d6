//! Session manager
//!
//! Watches the bus for incoming dialogs without a session owner, matches them
//! against the configured accounts, builds the proposed stream set from the
//! offered SDP and births the session. Also keeps the registry of live
//! sessions, dropping each one once it reports its final outcome.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, CoreConfig};
use crate::core::session::{Session, SessionId, SessionNotification};
use crate::events::{EventBus, EventFilter, EventKind, EventPayload};
use crate::protocols::invitation::{Invitation, InvitationEvent, InvitationFactory};
use crate::streams::stream_for_media_line;
use crate::{Error, Result};

pub struct SessionManager {
    bus: EventBus,
    config: Arc<CoreConfig>,
    factory: Arc<dyn InvitationFactory>,
    sessions: DashMap<SessionId, Arc<Session>>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        bus: EventBus,
        config: Arc<CoreConfig>,
        factory: Arc<dyn InvitationFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            factory,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            watcher: Mutex::new(None),
        })
    }

    /// Start watching for incoming dialogs and session outcomes.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut invitations = self.bus.subscribe(EventFilter::kind(EventKind::Invitation));
        let mut sessions = self.bus.subscribe(EventFilter::kind(EventKind::Session));
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = invitations.recv() => match event {
                        Some(event) => {
                            if let EventPayload::Invitation(InvitationEvent::NewIncoming { invitation }) = event.payload {
                                manager.handle_incoming(invitation).await;
                            }
                        }
                        None => break,
                    },
                    event = sessions.recv() => match event {
                        Some(event) => {
                            if let EventPayload::Session(notification) = &event.payload {
                                if matches!(
                                    notification,
                                    SessionNotification::DidEnd { .. } | SessionNotification::DidFail { .. }
                                ) {
                                    manager.sessions.remove(&event.sender);
                                    debug!(session = %event.sender, "session dropped from registry");
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        *self.watcher.lock().unwrap() = Some(handle);
        info!(accounts = self.config.accounts.len(), "session manager started");
    }

    /// End every live session and stop watching.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
        let live: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in live {
            let _ = session.end().await;
        }
        self.sessions.clear();
        info!("session manager stopped");
    }

    /// Create and register a session for an outgoing call.
    pub fn create_outgoing(&self, account: AccountConfig) -> Result<Arc<Session>> {
        if self.sessions.len() >= self.config.general.max_sessions as usize {
            return Err(Error::not_supported("maximum session count reached"));
        }
        let session = Session::new(
            self.bus.clone(),
            account,
            self.config.clone(),
            self.factory.clone(),
        );
        self.sessions.insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// An incoming INVITE with no owner: answer it or birth a session.
    async fn handle_incoming(&self, invitation: Arc<dyn Invitation>) {
        let request_uri = invitation.request_uri().unwrap_or_default();
        let account = self
            .config
            .accounts
            .iter()
            .find(|account| account.matches_uri(&request_uri))
            .cloned();
        let Some(account) = account else {
            debug!(%request_uri, "no account for incoming call");
            let _ = invitation.send_response(404, None, Vec::new()).await;
            return;
        };
        if self.sessions.len() >= self.config.general.max_sessions as usize {
            warn!(%request_uri, "maximum session count reached, refusing call");
            let _ = invitation.send_response(486, None, Vec::new()).await;
            return;
        }
        if let Err(e) = invitation.send_response(100, None, Vec::new()).await {
            warn!(error = %e, "could not answer incoming INVITE");
            return;
        }

        let mut proposed = Vec::new();
        if let Some(remote_sdp) = invitation.sdp().proposed_remote {
            for index in 0..remote_sdp.media.len() {
                if let Some(stream) = stream_for_media_line(&remote_sdp, index, &self.config) {
                    if stream.validate_incoming(&remote_sdp, index) {
                        stream.set_index(index);
                        proposed.push(stream);
                    }
                }
            }
            if proposed.is_empty() {
                info!(%request_uri, "no acceptable media in incoming call");
                let _ = invitation.send_response(488, None, Vec::new()).await;
                return;
            }
        }

        let session = Session::new(
            self.bus.clone(),
            account,
            self.config.clone(),
            self.factory.clone(),
        );
        self.sessions.insert(session.id(), session.clone());
        session.init_incoming(invitation, proposed);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionState;
    use crate::events::EventKind;
    use crate::protocols::invitation::Originator;
    use crate::protocols::sdp::{MediaDescription, SessionDescription};
    use crate::testing::{
        next_lifecycle_notification, remote_audio_offer, test_config, InvitationAction,
        ScriptedFactory, ScriptedInvitation,
    };
    use std::time::Duration;

    fn setup() -> (EventBus, Arc<CoreConfig>, Arc<SessionManager>) {
        let bus = EventBus::new();
        let config = test_config();
        let factory = ScriptedFactory::new(bus.clone());
        let manager = SessionManager::new(bus.clone(), config.clone(), factory);
        manager.start();
        (bus, config, manager)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_incoming_call_rejected() {
        let (bus, _config, manager) = setup();
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let invitation =
            ScriptedInvitation::incoming(bus.clone(), "sip:alice@example.com", Some(remote_audio_offer()));
        invitation.announce();

        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 100),
            action => panic!("expected 100 Trying, got {:?}", action),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::NewIncoming { streams } => assert_eq!(streams.len(), 1),
            other => panic!("expected NewIncoming, got {:?}", other),
        }
        assert_eq!(manager.session_count(), 1);
        let session = manager.sessions().pop().unwrap();
        assert_eq!(session.state(), SessionState::Incoming);

        session.send_ring_indication().await.unwrap();
        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 180),
            action => panic!("expected 180 Ringing, got {:?}", action),
        }

        session.reject(603).await.unwrap();
        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 603),
            action => panic!("expected 603 Decline, got {:?}", action),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::DidFail { originator, code, reason, failure_reason } => {
                assert_eq!(originator, Originator::Local);
                assert_eq!(code, 603);
                assert_eq!(reason.as_deref(), Some("Decline"));
                assert_eq!(failure_reason, "user request");
            }
            other => panic!("expected DidFail, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Terminated);
        wait_until(|| manager.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_incoming_call_without_account_is_answered_404() {
        let (bus, _config, manager) = setup();
        let invitation =
            ScriptedInvitation::incoming(bus.clone(), "sip:nobody@example.com", Some(remote_audio_offer()));
        invitation.announce();

        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 404),
            action => panic!("expected 404, got {:?}", action),
        }
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_call_without_acceptable_media_is_answered_488() {
        let (bus, _config, manager) = setup();
        let mut offer = SessionDescription::new("203.0.113.5", "peer");
        let mut video = MediaDescription::new("video", 20000, "RTP/AVP");
        video.formats = vec!["96".to_string()];
        offer.media.push(video);
        let invitation =
            ScriptedInvitation::incoming(bus.clone(), "sip:alice@example.com", Some(offer));
        invitation.announce();

        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 100),
            action => panic!("expected 100 Trying, got {:?}", action),
        }
        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 488),
            action => panic!("expected 488, got {:?}", action),
        }
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_call_accepted_then_remote_bye() {
        let (bus, _config, manager) = setup();
        let mut notifications = bus.subscribe(EventFilter::kind(EventKind::Session));
        let invitation =
            ScriptedInvitation::incoming(bus.clone(), "sip:alice@example.com", Some(remote_audio_offer()));
        invitation.announce();

        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, .. } => assert_eq!(code, 100),
            action => panic!("expected 100 Trying, got {:?}", action),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::NewIncoming { streams } => assert_eq!(streams.len(), 1),
            other => panic!("expected NewIncoming, got {:?}", other),
        }
        let session = manager.sessions().pop().unwrap();
        let offered = session.proposed_streams().unwrap();
        session.accept(offered).await.unwrap();

        match invitation.expect_action().await {
            InvitationAction::ResponseSent { code, sdp, .. } => {
                assert_eq!(code, 200);
                let answer = sdp.unwrap();
                assert_eq!(answer.media.len(), 1);
                assert_ne!(answer.media[0].port, 0);
            }
            action => panic!("expected 200 answer, got {:?}", action),
        }
        invitation.fire_state(invitation.state_event(
            crate::protocols::invitation::InvitationState::Connected,
            200,
        ));
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::WillStart => {}
            other => panic!("expected WillStart, got {:?}", other),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::DidStart { streams } => assert_eq!(streams.len(), 1),
            other => panic!("expected DidStart, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.start_time().is_some());

        invitation.remote_bye();
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::WillEnd { originator } => {
                assert_eq!(originator, Originator::Remote)
            }
            other => panic!("expected WillEnd, got {:?}", other),
        }
        match next_lifecycle_notification(&mut notifications).await {
            SessionNotification::DidEnd { originator, end_reason } => {
                assert_eq!(originator, Originator::Remote);
                assert_eq!(end_reason, "user request");
            }
            other => panic!("expected DidEnd, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.end_time().is_some());
        wait_until(|| manager.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_create_outgoing_registers_session() {
        let (_bus, config, manager) = setup();
        let session = manager.create_outgoing(config.accounts[0].clone()).unwrap();
        assert_eq!(manager.session_count(), 1);
        assert!(manager.session(&session.id()).is_some());
        manager.stop().await;
        assert_eq!(manager.session_count(), 0);
    }
}

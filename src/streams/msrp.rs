//! Reference MSRP streams: chat and file transfer
//!
//! Both kinds occupy a `message` media line carried over TCP/MSRP. A file
//! transfer is a chat stream whose media line additionally carries the
//! `file-selector` attribute describing the offered file; an incoming
//! transfer echoes the selector back in its answer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::config::{CoreConfig, PortRange};
use crate::events::{Event, EventBus, EventPayload, SenderId};
use crate::protocols::sdp::{Attribute, MediaDescription, SessionDescription};
use crate::streams::{MediaStream, MediaStreamEvent, StreamKind, StreamState};
use crate::{Error, Result};

#[derive(Debug)]
struct Inner {
    state: StreamState,
    index: Option<usize>,
    bus: Option<EventBus>,
    local_port: u16,
    session_token: String,
    remote_path: Option<String>,
    file_selector: Option<String>,
    on_hold_by_local: bool,
}

#[derive(Debug)]
pub struct MsrpStream {
    id: SenderId,
    kind: StreamKind,
    local_address: String,
    port_range: PortRange,
    inner: Mutex<Inner>,
}

impl MsrpStream {
    pub fn chat(config: &CoreConfig) -> Arc<Self> {
        Self::with_kind(config, StreamKind::Chat)
    }

    pub fn file_transfer(config: &CoreConfig) -> Arc<Self> {
        Self::with_kind(config, StreamKind::FileTransfer)
    }

    fn with_kind(config: &CoreConfig, kind: StreamKind) -> Arc<Self> {
        Arc::new(Self {
            id: SenderId::new(),
            kind,
            local_address: config.general.local_address.clone(),
            port_range: config.media.msrp_port_range.clone(),
            inner: Mutex::new(Inner {
                state: StreamState::New,
                index: None,
                bus: None,
                local_port: 0,
                session_token: format!("{:016x}", rand::random::<u64>()),
                remote_path: None,
                file_selector: None,
                on_hold_by_local: false,
            }),
        })
    }

    /// The file selector offered by the remote party, for file transfers.
    pub fn file_selector(&self) -> Option<String> {
        self.inner.lock().unwrap().file_selector.clone()
    }

    fn allocate_port(&self) -> Result<u16> {
        if self.port_range.min > self.port_range.max {
            return Err(Error::media(format!(
                "no MSRP port available in range {}-{}",
                self.port_range.min, self.port_range.max
            )));
        }
        let slots = (self.port_range.max - self.port_range.min) as u32 + 1;
        Ok(self.port_range.min + (rand::random::<u32>() % slots) as u16)
    }

    fn publish(&self, bus: &EventBus, event: MediaStreamEvent) {
        bus.publish(Event::new(self.id, EventPayload::Media(event)));
    }
}

#[async_trait]
impl MediaStream for MsrpStream {
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
        false
    }

    fn on_hold_by_local(&self) -> bool {
        self.inner.lock().unwrap().on_hold_by_local
    }

    fn on_hold_by_remote(&self) -> bool {
        false
    }

    async fn initialize(&self, bus: EventBus) -> Result<()> {
        let port = match self.allocate_port() {
            Ok(port) => port,
            Err(e) => {
                self.inner.lock().unwrap().state = StreamState::Failed;
                self.publish(&bus, MediaStreamEvent::DidFail { reason: e.to_string() });
                return Err(e);
            }
        };
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != StreamState::New {
                return Err(Error::invalid_state(format!(
                    "cannot initialize {} stream in {:?} state",
                    self.kind, inner.state
                )));
            }
            inner.local_port = port;
            inner.bus = Some(bus.clone());
            inner.state = StreamState::Initialized;
            debug!(stream = %self.id, kind = %self.kind, port, "MSRP stream initialized");
        }
        self.publish(&bus, MediaStreamEvent::DidInitialize);
        Ok(())
    }

    async fn start(
        &self,
        _local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()> {
        let bus = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Initialized {
                return Err(Error::invalid_state(format!(
                    "cannot start {} stream in {:?} state",
                    self.kind, inner.state
                )));
            }
            let media = remote_sdp.media.get(index).ok_or_else(|| {
                Error::sdp(format!("no remote media line at index {}", index))
            })?;
            inner.index = Some(index);
            inner.remote_path = media.attribute_value("path").map(str::to_string);
            if inner.remote_path.is_none() {
                let reason = format!("remote media line {} carries no MSRP path", index);
                inner.state = StreamState::Failed;
                let bus = inner.bus.clone();
                drop(inner);
                if let Some(bus) = bus {
                    self.publish(&bus, MediaStreamEvent::DidFail { reason: reason.clone() });
                }
                return Err(Error::media(reason));
            }
            inner.state = StreamState::Started;
            debug!(stream = %self.id, kind = %self.kind, index,
                remote_path = ?inner.remote_path, "MSRP stream started");
            inner.bus.clone()
        };
        if let Some(bus) = bus {
            self.publish(&bus, MediaStreamEvent::DidStart);
        }
        Ok(())
    }

    async fn update(
        &self,
        _local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(media) = remote_sdp.media.get(index) {
            inner.index = Some(index);
            if let Some(path) = media.attribute_value("path") {
                inner.remote_path = Some(path.to_string());
            }
        }
        Ok(())
    }

    async fn end(&self) {
        let bus = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                StreamState::Ended | StreamState::Failed => return,
                StreamState::New => {
                    inner.state = StreamState::Ended;
                    return;
                }
                StreamState::Initialized | StreamState::Started => {
                    inner.state = StreamState::Ended;
                    inner.bus.clone()
                }
            }
        };
        if let Some(bus) = bus {
            self.publish(&bus, MediaStreamEvent::WillEnd);
            self.publish(&bus, MediaStreamEvent::DidEnd);
        }
    }

    fn hold(&self) {
        self.inner.lock().unwrap().on_hold_by_local = true;
    }

    fn unhold(&self) {
        self.inner.lock().unwrap().on_hold_by_local = false;
    }

    fn local_media(&self, _for_offer: bool) -> MediaDescription {
        let inner = self.inner.lock().unwrap();
        let mut media = MediaDescription::new("message", inner.local_port, "TCP/MSRP");
        media.formats = vec!["*".to_string()];
        media.attributes.push(Attribute::new(
            "path",
            format!(
                "msrp://{}:{}/{};tcp",
                self.local_address, inner.local_port, inner.session_token
            ),
        ));
        media.attributes.push(Attribute::new(
            "accept-types",
            match self.kind {
                StreamKind::FileTransfer => "*".to_string(),
                _ => "message/cpim text/plain".to_string(),
            },
        ));
        if let Some(selector) = &inner.file_selector {
            media.attributes.push(Attribute::new("file-selector", selector.clone()));
        }
        media
    }

    fn validate_incoming(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        let media = match remote_sdp.media.get(index) {
            Some(media) => media,
            None => return false,
        };
        if media.media_type != "message" || !media.transport.contains("MSRP") {
            return false;
        }
        if self.kind == StreamKind::FileTransfer {
            match media.attribute_value("file-selector") {
                Some(selector) => {
                    self.inner.lock().unwrap().file_selector = Some(selector.to_string());
                }
                None => return false,
            }
        }
        true
    }

    fn validate_update(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        remote_sdp
            .media
            .get(index)
            .map(|media| media.port == 0 || media.media_type == "message")
            .unwrap_or(false)
    }
}

//! Reference audio stream over RTP
//!
//! Owns one RTP endpoint: allocates a local port from the configured range,
//! offers the configured codec list and tracks hold state in both directions.
//! The actual packet transport is the RTP layer's business; this stream only
//! negotiates and supervises it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{CoreConfig, PortRange};
use crate::events::{Event, EventBus, EventPayload, SenderId};
use crate::protocols::sdp::{Attribute, MediaDescription, SessionDescription};
use crate::streams::{MediaStream, MediaStreamEvent, StreamKind, StreamState};
use crate::{Error, Result};

/// Static payload type numbers for the codecs the stream can offer.
fn payload_type(codec: &str) -> Option<(u8, &'static str)> {
    match codec {
        "PCMU" => Some((0, "PCMU/8000")),
        "PCMA" => Some((8, "PCMA/8000")),
        "G722" => Some((9, "G722/8000")),
        "telephone-event" => Some((101, "telephone-event/8000")),
        _ => None,
    }
}

#[derive(Debug)]
struct Inner {
    state: StreamState,
    index: Option<usize>,
    bus: Option<EventBus>,
    local_port: u16,
    ssrc: u32,
    remote_address: Option<String>,
    remote_port: u16,
    negotiated_formats: Option<Vec<String>>,
    on_hold_by_local: bool,
    on_hold_by_remote: bool,
}

#[derive(Debug)]
pub struct AudioStream {
    id: SenderId,
    codecs: Vec<String>,
    port_range: PortRange,
    inner: Mutex<Inner>,
}

impl AudioStream {
    pub fn new(config: &CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            id: SenderId::new(),
            codecs: config.media.audio_codecs.clone(),
            port_range: config.media.rtp_port_range.clone(),
            inner: Mutex::new(Inner {
                state: StreamState::New,
                index: None,
                bus: None,
                local_port: 0,
                ssrc: rand::random(),
                remote_address: None,
                remote_port: 0,
                negotiated_formats: None,
                on_hold_by_local: false,
                on_hold_by_remote: false,
            }),
        })
    }

    /// Payload type numbers for the configured codec list, in preference order.
    fn offered_formats(&self) -> Vec<String> {
        self.codecs
            .iter()
            .filter_map(|codec| payload_type(codec))
            .map(|(number, _)| number.to_string())
            .collect()
    }

    fn common_formats(&self, media: &MediaDescription) -> Vec<String> {
        self.offered_formats()
            .into_iter()
            .filter(|format| media.formats.contains(format))
            .collect()
    }

    /// RTP ports are even; the odd sibling is reserved for RTCP.
    fn allocate_port(&self) -> Result<u16> {
        let min = self.port_range.min + (self.port_range.min % 2);
        if min > self.port_range.max {
            return Err(Error::media(format!(
                "no RTP port available in range {}-{}",
                self.port_range.min, self.port_range.max
            )));
        }
        let slots = ((self.port_range.max - min) / 2) as u32 + 1;
        Ok(min + 2 * (rand::random::<u32>() % slots) as u16)
    }

    fn publish(&self, bus: &EventBus, event: MediaStreamEvent) {
        bus.publish(Event::new(self.id, EventPayload::Media(event)));
    }
}

#[async_trait]
impl MediaStream for AudioStream {
    fn id(&self) -> SenderId {
        self.id
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn index(&self) -> Option<usize> {
        self.inner.lock().unwrap().index
    }

    fn set_index(&self, index: usize) {
        self.inner.lock().unwrap().index = Some(index);
    }

    fn hold_supported(&self) -> bool {
        true
    }

    fn on_hold_by_local(&self) -> bool {
        self.inner.lock().unwrap().on_hold_by_local
    }

    fn on_hold_by_remote(&self) -> bool {
        self.inner.lock().unwrap().on_hold_by_remote
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
                    "cannot initialize audio stream in {:?} state",
                    inner.state
                )));
            }
            inner.local_port = port;
            inner.bus = Some(bus.clone());
            inner.state = StreamState::Initialized;
            debug!(stream = %self.id, port, ssrc = inner.ssrc, "audio stream initialized");
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
                    "cannot start audio stream in {:?} state",
                    inner.state
                )));
            }
            let media = remote_sdp.media.get(index).ok_or_else(|| {
                Error::sdp(format!("no remote media line at index {}", index))
            })?;
            inner.index = Some(index);
            inner.remote_port = media.port;
            inner.remote_address = media
                .connection
                .as_ref()
                .or(remote_sdp.connection.as_ref())
                .map(|connection| connection.address.clone());
            inner.on_hold_by_remote = media.direction().is_hold();
            if inner.negotiated_formats.is_none() {
                inner.negotiated_formats = Some(
                    self.offered_formats()
                        .into_iter()
                        .filter(|format| media.formats.contains(format))
                        .collect(),
                );
            }
            inner.state = StreamState::Started;
            debug!(stream = %self.id, index, remote = ?inner.remote_address,
                remote_port = inner.remote_port, "audio stream started");
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
        let media = remote_sdp.media.get(index).ok_or_else(|| {
            Error::sdp(format!("no remote media line at index {}", index))
        })?;
        inner.index = Some(index);
        inner.remote_port = media.port;
        inner.remote_address = media
            .connection
            .as_ref()
            .or(remote_sdp.connection.as_ref())
            .map(|connection| connection.address.clone());
        let was_held = inner.on_hold_by_remote;
        inner.on_hold_by_remote = media.direction().is_hold();
        if was_held != inner.on_hold_by_remote {
            debug!(stream = %self.id, on_hold = inner.on_hold_by_remote,
                "remote hold state changed");
        }
        Ok(())
    }

    async fn end(&self) {
        let (bus, was_live) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                StreamState::Ended | StreamState::Failed => return,
                StreamState::New => {
                    inner.state = StreamState::Ended;
                    return;
                }
                StreamState::Initialized | StreamState::Started => {
                    inner.state = StreamState::Ended;
                    (inner.bus.clone(), true)
                }
            }
        };
        if let (Some(bus), true) = (bus, was_live) {
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

    fn local_media(&self, for_offer: bool) -> MediaDescription {
        let inner = self.inner.lock().unwrap();
        let mut media = MediaDescription::new("audio", inner.local_port, "RTP/AVP");
        media.formats = match (&inner.negotiated_formats, for_offer) {
            // Answers carry only what both sides support.
            (Some(negotiated), false) if !negotiated.is_empty() => negotiated.clone(),
            _ => self.offered_formats(),
        };
        for codec in &self.codecs {
            if let Some((number, rtpmap)) = payload_type(codec) {
                if media.formats.contains(&number.to_string()) {
                    media.attributes.push(Attribute::new("rtpmap", format!("{} {}", number, rtpmap)));
                }
            }
        }
        let direction = match (inner.on_hold_by_local, inner.on_hold_by_remote) {
            (false, false) => crate::protocols::sdp::Direction::SendRecv,
            (true, false) => crate::protocols::sdp::Direction::SendOnly,
            (false, true) => crate::protocols::sdp::Direction::RecvOnly,
            (true, true) => crate::protocols::sdp::Direction::Inactive,
        };
        media.set_direction(direction);
        media
    }

    fn validate_incoming(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        let media = match remote_sdp.media.get(index) {
            Some(media) => media,
            None => return false,
        };
        if media.media_type != "audio" || !media.transport.starts_with("RTP/") {
            return false;
        }
        let common = self.common_formats(media);
        if common.is_empty() {
            warn!(stream = %self.id, index, "no common audio codec with remote offer");
            return false;
        }
        self.inner.lock().unwrap().negotiated_formats = Some(common);
        true
    }

    fn validate_update(&self, remote_sdp: &SessionDescription, index: usize) -> bool {
        remote_sdp
            .media
            .get(index)
            .map(|media| {
                media.media_type == "audio"
                    && (media.port == 0 || !self.common_formats(media).is_empty())
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventKind};
    use crate::protocols::sdp::Direction;

    fn remote_audio_sdp(port: u16, direction: Option<Direction>) -> SessionDescription {
        let mut sdp = SessionDescription::new("203.0.113.9", "peer");
        let mut media = MediaDescription::new("audio", port, "RTP/AVP");
        media.formats = vec!["0".to_string(), "8".to_string()];
        if let Some(direction) = direction {
            media.set_direction(direction);
        }
        sdp.media.push(media);
        sdp
    }

    #[tokio::test]
    async fn test_initialize_allocates_even_port_and_publishes() {
        let bus = EventBus::new();
        let stream = AudioStream::new(&CoreConfig::default());
        let mut sub = bus.subscribe(EventFilter::kind(EventKind::Media));

        stream.initialize(bus.clone()).await.unwrap();

        let media = stream.local_media(true);
        assert_eq!(media.port % 2, 0);
        assert!(media.port >= 50000 && media.port <= 50500);
        let event = sub.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            crate::events::EventPayload::Media(MediaStreamEvent::DidInitialize)
        ));
    }

    #[tokio::test]
    async fn test_start_tracks_remote_hold() {
        let bus = EventBus::new();
        let stream = AudioStream::new(&CoreConfig::default());
        stream.initialize(bus.clone()).await.unwrap();

        let local = SessionDescription::new("192.0.2.1", "local");
        let remote = remote_audio_sdp(40000, Some(Direction::SendOnly));
        stream.start(&local, &remote, 0).await.unwrap();

        assert!(stream.on_hold_by_remote());
        let resumed = remote_audio_sdp(40000, None);
        stream.update(&local, &resumed, 0).await.unwrap();
        assert!(!stream.on_hold_by_remote());
    }

    #[tokio::test]
    async fn test_hold_flags_drive_direction() {
        let stream = AudioStream::new(&CoreConfig::default());
        assert_eq!(stream.local_media(true).direction(), Direction::SendRecv);
        stream.hold();
        assert_eq!(stream.local_media(true).direction(), Direction::SendOnly);
        stream.unhold();
        assert_eq!(stream.local_media(true).direction(), Direction::SendRecv);
    }

    #[test]
    fn test_validate_incoming_requires_common_codec() {
        let stream = AudioStream::new(&CoreConfig::default());
        let mut sdp = remote_audio_sdp(40000, None);
        assert!(stream.validate_incoming(&sdp, 0));

        sdp.media[0].formats = vec!["96".to_string()];
        assert!(!stream.validate_incoming(&sdp, 0));
        assert!(!stream.validate_incoming(&sdp, 5));
    }

    #[tokio::test]
    async fn test_end_publishes_lifecycle_events() {
        let bus = EventBus::new();
        let stream = AudioStream::new(&CoreConfig::default());
        let mut sub = bus.subscribe(EventFilter::sender(stream.id()));
        stream.initialize(bus.clone()).await.unwrap();

        stream.end().await;
        stream.end().await;

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let crate::events::EventPayload::Media(media_event) = event.payload {
                events.push(media_event);
            }
        }
        assert_eq!(events, vec![
            MediaStreamEvent::DidInitialize,
            MediaStreamEvent::WillEnd,
            MediaStreamEvent::DidEnd,
        ]);
    }
}

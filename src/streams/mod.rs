//! Media stream contract and stream construction
//!
//! Every media stream a session coordinates (audio over RTP, chat and file
//! transfer over MSRP, screen sharing) implements [`MediaStream`]: a small
//! state machine that contributes one media line to the local SDP, validates
//! remote descriptions, and reports its lifecycle on the event bus.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CoreConfig;
use crate::events::{EventBus, SenderId};
use crate::protocols::sdp::{MediaDescription, SessionDescription};
use crate::Result;

pub mod audio;
pub mod msrp;

pub use audio::AudioStream;
pub use msrp::MsrpStream;

/// Lifecycle events a stream publishes with its own id as the bus sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStreamEvent {
    DidInitialize,
    DidStart,
    DidFail { reason: String },
    WillEnd,
    DidEnd,
}

/// The concrete stream kinds the factory can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Chat,
    FileTransfer,
    ScreenSharing,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Chat => "chat",
            StreamKind::FileTransfer => "file-transfer",
            StreamKind::ScreenSharing => "screen-sharing",
        }
    }

    /// The SDP media type this kind occupies.
    pub fn media_type(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Chat | StreamKind::FileTransfer => "message",
            StreamKind::ScreenSharing => "application",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal state shared by the reference stream implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    New,
    Initialized,
    Started,
    Ended,
    Failed,
}

/// One media stream of a session.
///
/// The session owns the stream for the duration of the dialog, assigns its
/// `index` (the position of its media line in the local SDP) and drives
/// `initialize`/`start`/`update`/`end`. Completion of the asynchronous steps
/// is reported through [`MediaStreamEvent`]s on the bus, never by return
/// value alone.
#[async_trait]
pub trait MediaStream: Send + Sync + fmt::Debug {
    fn id(&self) -> SenderId;
    fn kind(&self) -> StreamKind;

    fn index(&self) -> Option<usize>;
    fn set_index(&self, index: usize);

    fn hold_supported(&self) -> bool;
    fn on_hold_by_local(&self) -> bool;
    fn on_hold_by_remote(&self) -> bool;

    /// Prepare local resources and publish `DidInitialize` (or `DidFail`).
    async fn initialize(&self, bus: EventBus) -> Result<()>;

    /// Begin media flow against the negotiated descriptions and publish
    /// `DidStart` (or `DidFail`).
    async fn start(
        &self,
        local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()>;

    /// Apply a renegotiated description to an already-started stream.
    async fn update(
        &self,
        local_sdp: &SessionDescription,
        remote_sdp: &SessionDescription,
        index: usize,
    ) -> Result<()>;

    /// Stop the stream, publishing `WillEnd`/`DidEnd` when it was live.
    async fn end(&self);

    fn hold(&self);
    fn unhold(&self);

    /// The media line this stream contributes to the local SDP. The carried
    /// direction attribute is derived from the current hold flags.
    fn local_media(&self, for_offer: bool) -> MediaDescription;

    /// Whether the remote media line at `index` is acceptable as the initial
    /// description for this stream.
    fn validate_incoming(&self, remote_sdp: &SessionDescription, index: usize) -> bool;

    /// Whether a renegotiated remote description keeps this stream viable.
    fn validate_update(&self, remote_sdp: &SessionDescription, index: usize) -> bool;
}

/// Instantiate the stream kind matching a remote media line, or `None` when
/// the line is unsupported and must be answered with a zero port.
pub fn stream_for_media_line(
    remote_sdp: &SessionDescription,
    index: usize,
    config: &CoreConfig,
) -> Option<Arc<dyn MediaStream>> {
    let media = remote_sdp.media.get(index)?;
    if media.port == 0 {
        return None;
    }
    match media.media_type.as_str() {
        "audio" => Some(AudioStream::new(config)),
        "message" if media.has_attribute("file-selector") => Some(MsrpStream::file_transfer(config)),
        "message" => Some(MsrpStream::chat(config)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::sdp::Attribute;

    fn sdp_with(media: Vec<MediaDescription>) -> SessionDescription {
        let mut sdp = SessionDescription::new("198.51.100.1", "test");
        sdp.media = media;
        sdp
    }

    #[test]
    fn test_factory_maps_audio() {
        let mut media = MediaDescription::new("audio", 40000, "RTP/AVP");
        media.formats = vec!["0".to_string()];
        let sdp = sdp_with(vec![media]);
        let stream = stream_for_media_line(&sdp, 0, &CoreConfig::default()).unwrap();
        assert_eq!(stream.kind(), StreamKind::Audio);
    }

    #[test]
    fn test_factory_distinguishes_chat_and_file_transfer() {
        let mut chat = MediaDescription::new("message", 2855, "TCP/MSRP");
        chat.attributes.push(Attribute::new("path", "msrp://198.51.100.1:2855/x;tcp"));
        let mut file = chat.clone();
        file.attributes.push(Attribute::new("file-selector", "name:\"notes.txt\" size:1024"));
        let sdp = sdp_with(vec![chat, file]);

        let config = CoreConfig::default();
        assert_eq!(stream_for_media_line(&sdp, 0, &config).unwrap().kind(), StreamKind::Chat);
        assert_eq!(
            stream_for_media_line(&sdp, 1, &config).unwrap().kind(),
            StreamKind::FileTransfer
        );
    }

    #[test]
    fn test_factory_rejects_zero_port_and_unknown_types() {
        let zero = MediaDescription::new("audio", 0, "RTP/AVP");
        let video = MediaDescription::new("video", 40000, "RTP/AVP");
        let sdp = sdp_with(vec![zero, video]);

        let config = CoreConfig::default();
        assert!(stream_for_media_line(&sdp, 0, &config).is_none());
        assert!(stream_for_media_line(&sdp, 1, &config).is_none());
        assert!(stream_for_media_line(&sdp, 2, &config).is_none());
    }
}

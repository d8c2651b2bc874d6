//! Signaling contracts consumed by the session core

pub mod invitation;
pub mod sdp;

pub use invitation::{Invitation, InvitationEvent, InvitationFactory};
pub use sdp::SessionDescription;
